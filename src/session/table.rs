//! Bijective session table
//!
//! Maps each redirected four-tuple to a session port and back. The session
//! port becomes the source port of the rewritten SYN, so it is what the
//! kernel reports as the peer port when the stub listener accepts.
//!
//! # Lifecycle
//!
//! ```text
//! SYN seen ──► Pending ──accept──► Active ──close──► Lingering ──linger──► evicted
//!                 │                                        ▲
//!                 └──────────── idle timeout ──────────────┘ (evicted directly)
//! ```
//!
//! A port is handed out again only after its entry is evicted, so
//! stragglers of a closed connection still find their tuple during the
//! linger window.
//!
//! # Thread Safety
//!
//! Both directions live behind one `parking_lot::Mutex`, so insertion and
//! eviction update them atomically and readers never observe a half-applied
//! mapping.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use super::Tuple;
use crate::error::SessionError;

/// Default linger window for closed sessions
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// Default idle timeout for sessions that were never accepted
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// SYN redirected, connection not yet accepted
    Pending,
    /// Accepted connection is alive
    Active,
    /// Connection closed, port held until the linger window expires
    Lingering { since: Instant },
}

/// Snapshot of one session
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub port: u16,
    pub tuple: Tuple,
    pub id: u64,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_active: Instant,
}

#[derive(Debug)]
struct Entry {
    tuple: Tuple,
    id: u64,
    state: SessionState,
    created_at: Instant,
    last_active: Instant,
}

impl Entry {
    fn snapshot(&self, port: u16) -> Session {
        Session {
            port,
            tuple: self.tuple,
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }

    fn expired(&self, now: Instant, linger: Duration, idle_timeout: Duration) -> bool {
        match self.state {
            SessionState::Active => false,
            SessionState::Pending => now.saturating_duration_since(self.last_active) >= idle_timeout,
            SessionState::Lingering { since } => now.saturating_duration_since(since) >= linger,
        }
    }
}

#[derive(Debug)]
struct Inner {
    by_tuple: HashMap<Tuple, u16>,
    by_port: HashMap<u16, Entry>,
    cursor: u16,
    next_id: u64,
}

impl Inner {
    fn evict(&mut self, port: u16) -> Option<Entry> {
        let entry = self.by_port.remove(&port)?;
        self.by_tuple.remove(&entry.tuple);
        Some(entry)
    }
}

/// Four-tuple to session-port table
#[derive(Debug)]
pub struct SessionTable {
    inner: Mutex<Inner>,
    min_port: u16,
    max_port: u16,
    reserved: HashSet<u16>,
    linger: Duration,
    idle_timeout: Duration,
}

impl SessionTable {
    /// Create a table drawing ports from `min_port..=max_port`
    ///
    /// Port 0 is never handed out. The first port is chosen at random so
    /// restarts do not immediately reuse the previous run's ports.
    ///
    /// # Example
    ///
    /// ```
    /// use tun_nat::session::{SessionTable, Tuple};
    ///
    /// let table = SessionTable::new(40000, 40009);
    /// let tuple = Tuple::new("10.0.0.2:51000".parse().unwrap(), "1.2.3.4:443".parse().unwrap());
    /// let port = table.new_session(tuple).unwrap();
    /// assert_eq!(table.tuple_of(port), Some(tuple));
    /// ```
    pub fn new(min_port: u16, max_port: u16) -> Self {
        let min_port = min_port.max(1);
        let max_port = max_port.max(min_port);
        let cursor = rand::thread_rng().gen_range(min_port..=max_port);
        Self {
            inner: Mutex::new(Inner {
                by_tuple: HashMap::new(),
                by_port: HashMap::new(),
                cursor,
                next_id: 1,
            }),
            min_port,
            max_port,
            reserved: HashSet::new(),
            linger: DEFAULT_LINGER,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Never hand out `port` (the stub listener's own port)
    #[must_use]
    pub fn with_reserved(mut self, port: u16) -> Self {
        self.reserved.insert(port);
        self
    }

    #[must_use]
    pub const fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of ports this table can hand out
    pub fn capacity(&self) -> usize {
        let span = usize::from(self.max_port - self.min_port) + 1;
        let reserved_in_range = self
            .reserved
            .iter()
            .filter(|p| (self.min_port..=self.max_port).contains(p))
            .count();
        span - reserved_in_range
    }

    /// Session port of `tuple`, refreshing its idle clock
    pub fn port_of(&self, tuple: &Tuple) -> Option<u16> {
        let mut inner = self.inner.lock();
        let port = *inner.by_tuple.get(tuple)?;
        if let Some(entry) = inner.by_port.get_mut(&port) {
            entry.last_active = Instant::now();
        }
        Some(port)
    }

    /// Tuple behind session `port`, refreshing its idle clock
    pub fn tuple_of(&self, port: u16) -> Option<Tuple> {
        let mut inner = self.inner.lock();
        let entry = inner.by_port.get_mut(&port)?;
        entry.last_active = Instant::now();
        Some(entry.tuple)
    }

    /// Allocate a session port for `tuple`
    ///
    /// Returns the existing port if the tuple already has a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Exhausted` when every port in the range is in
    /// use.
    pub fn new_session(&self, tuple: Tuple) -> Result<u16, SessionError> {
        let mut inner = self.inner.lock();
        if let Some(port) = inner.by_tuple.get(&tuple) {
            return Ok(*port);
        }

        let span = u32::from(self.max_port - self.min_port) + 1;
        for _ in 0..span {
            let port = inner.cursor;
            inner.cursor = if port >= self.max_port {
                self.min_port
            } else {
                port + 1
            };
            if self.reserved.contains(&port) || inner.by_port.contains_key(&port) {
                continue;
            }

            let now = Instant::now();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.by_port.insert(
                port,
                Entry {
                    tuple,
                    id,
                    state: SessionState::Pending,
                    created_at: now,
                    last_active: now,
                },
            );
            inner.by_tuple.insert(tuple, port);
            debug!(tuple = %tuple, port, session_id = id, "Session created");
            return Ok(port);
        }

        Err(SessionError::Exhausted {
            in_use: inner.by_port.len(),
        })
    }

    /// Snapshot of session `port`
    pub fn session(&self, port: u16) -> Option<Session> {
        self.inner.lock().by_port.get(&port).map(|e| e.snapshot(port))
    }

    /// Mark session `port` as carrying an accepted connection
    pub fn attach(&self, port: u16) -> Option<Session> {
        let mut inner = self.inner.lock();
        let entry = inner.by_port.get_mut(&port)?;
        entry.state = SessionState::Active;
        entry.last_active = Instant::now();
        Some(entry.snapshot(port))
    }

    /// Start the linger window of session `port`
    ///
    /// Ignored if the port has since been evicted and handed to a different
    /// session, which the `id` check detects.
    pub fn release(&self, port: u16, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.by_port.get_mut(&port) {
            if entry.id == id && entry.state == SessionState::Active {
                entry.state = SessionState::Lingering {
                    since: Instant::now(),
                };
                debug!(tuple = %entry.tuple, port, session_id = id, "Session lingering");
            }
        }
    }

    /// Remove the session of `tuple` immediately
    pub fn evict(&self, tuple: &Tuple) -> Option<u16> {
        let mut inner = self.inner.lock();
        let port = *inner.by_tuple.get(tuple)?;
        inner.evict(port);
        Some(port)
    }

    /// Evict every session whose linger window or idle timeout has passed
    /// at `now`. Returns the number of evicted sessions.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<u16> = inner
            .by_port
            .iter()
            .filter(|(_, e)| e.expired(now, self.linger, self.idle_timeout))
            .map(|(port, _)| *port)
            .collect();

        for port in &expired {
            if let Some(entry) = inner.evict(*port) {
                debug!(tuple = %entry.tuple, port, session_id = entry.id, "Session evicted");
            }
        }
        expired.len()
    }

    /// Drop every session. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.by_port.len();
        inner.by_port.clear();
        inner.by_tuple.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions with an accepted, still-open connection
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .by_port
            .values()
            .filter(|e| e.state == SessionState::Active)
            .count()
    }

    /// Assert both directions agree; test helper
    #[cfg(test)]
    fn assert_bijective(&self) {
        let inner = self.inner.lock();
        assert_eq!(inner.by_tuple.len(), inner.by_port.len());
        for (tuple, port) in &inner.by_tuple {
            assert_eq!(inner.by_port.get(port).map(|e| e.tuple), Some(*tuple));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn tuple(src_port: u16) -> Tuple {
        let src: SocketAddr = format!("10.0.0.2:{src_port}").parse().unwrap();
        Tuple::new(src, "1.2.3.4:443".parse().unwrap())
    }

    #[test]
    fn test_new_session_roundtrip() {
        let table = SessionTable::new(1, 65535);
        let t = tuple(51000);
        let port = table.new_session(t).unwrap();
        assert_ne!(port, 0);
        assert_eq!(table.port_of(&t), Some(port));
        assert_eq!(table.tuple_of(port), Some(t));
        assert_eq!(table.session(port).unwrap().state, SessionState::Pending);
    }

    #[test]
    fn test_new_session_is_idempotent() {
        let table = SessionTable::new(100, 200);
        let t = tuple(1);
        let a = table.new_session(t).unwrap();
        let b = table.new_session(t).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_bijection_under_churn() {
        let table = SessionTable::new(1000, 1063);
        let mut live: Vec<(Tuple, u16)> = Vec::new();
        for round in 0..10u16 {
            for i in 0..40u16 {
                let t = tuple(round * 100 + i);
                if let Ok(port) = table.new_session(t) {
                    live.push((t, port));
                }
            }
            let (evicted, kept): (Vec<_>, Vec<_>) =
                live.drain(..).enumerate().partition(|(i, _)| i % 2 == 0);
            for (_, (t, port)) in evicted {
                assert_eq!(table.evict(&t), Some(port));
            }
            live = kept.into_iter().map(|(_, entry)| entry).collect();
            table.assert_bijective();
            assert_eq!(table.len(), live.len());
        }
        assert!(table.len() <= table.capacity());
    }

    #[test]
    fn test_reserved_and_exhaustion() {
        let table = SessionTable::new(5000, 5003).with_reserved(5001);
        assert_eq!(table.capacity(), 3);

        let mut ports = HashSet::new();
        for i in 0..3 {
            ports.insert(table.new_session(tuple(i)).unwrap());
        }
        assert!(!ports.contains(&5001));
        assert_eq!(ports.len(), 3);

        let err = table.new_session(tuple(99)).unwrap_err();
        assert_eq!(err, SessionError::Exhausted { in_use: 3 });
        table.assert_bijective();
    }

    #[test]
    fn test_port_zero_never_allocated() {
        let table = SessionTable::new(0, 2);
        for i in 0..2 {
            assert_ne!(table.new_session(tuple(i)).unwrap(), 0);
        }
        assert!(table.new_session(tuple(3)).is_err());
    }

    #[test]
    fn test_linger_then_fresh_port() {
        let table = SessionTable::new(7000, 7100).with_linger(Duration::from_millis(50));
        let t = tuple(51000);
        let port = table.new_session(t).unwrap();
        let session = table.attach(port).unwrap();
        assert_eq!(table.active_count(), 1);

        table.release(port, session.id);
        assert!(matches!(
            table.session(port).unwrap().state,
            SessionState::Lingering { .. }
        ));
        // Still reachable during the linger window
        assert_eq!(table.sweep_at(Instant::now()), 0);
        assert_eq!(table.tuple_of(port), Some(t));

        assert_eq!(table.sweep_at(Instant::now() + Duration::from_secs(1)), 1);
        assert_eq!(table.port_of(&t), None);
        assert_eq!(table.tuple_of(port), None);

        let fresh = table.new_session(t).unwrap();
        assert_ne!(fresh, port);
    }

    #[test]
    fn test_release_ignores_stale_id() {
        let table = SessionTable::new(7000, 7100);
        let port = table.new_session(tuple(1)).unwrap();
        let session = table.attach(port).unwrap();
        table.release(port, session.id + 1);
        assert_eq!(table.session(port).unwrap().state, SessionState::Active);
    }

    #[test]
    fn test_pending_idle_timeout() {
        let table = SessionTable::new(7000, 7100).with_idle_timeout(Duration::from_secs(10));
        let pending = table.new_session(tuple(1)).unwrap();
        let active = table.new_session(tuple(2)).unwrap();
        table.attach(active);

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(table.sweep_at(later), 1);
        assert!(table.session(pending).is_none());
        assert!(table.session(active).is_some());
    }

    #[test]
    fn test_clear() {
        let table = SessionTable::new(7000, 7100);
        for i in 0..5 {
            table.new_session(tuple(i)).unwrap();
        }
        assert_eq!(table.clear(), 5);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_allocation_is_injective() {
        let table = Arc::new(SessionTable::new(20000, 29999));
        let handles: Vec<_> = (0..8u16)
            .map(|thread| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..200u16)
                        .map(|i| table.new_session(tuple(thread * 1000 + i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ports = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(ports.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(ports.len(), 1600);
        table.assert_bijective();
    }
}
