//! Configuration module for tun-nat
//!
//! # Example
//!
//! ```no_run
//! use tun_nat::config::load_config;
//!
//! let config = load_config("/etc/tun-nat/config.json").unwrap();
//! println!("Portal: {}", config.nat.portal_v4);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, DeviceConfig, IcmpEchoPolicy, LogConfig, NatConfig, UdpMode, MAX_MTU, MIN_MTU,
};
