//! Session tracking for redirected TCP flows

mod table;
mod tuple;

pub use table::{Session, SessionState, SessionTable, DEFAULT_IDLE_TIMEOUT, DEFAULT_LINGER};
pub use tuple::Tuple;
