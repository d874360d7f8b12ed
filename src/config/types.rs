//! Configuration types for tun-nat
//!
//! Configuration is loaded from JSON files and validated at startup. Every
//! field except the device selection has a default, so `{}` sections are
//! accepted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest MTU an IPv4 host must accept
pub const MIN_MTU: u32 = 576;

/// Largest packet expressible in the IPv4 total length field
pub const MAX_MTU: u32 = 65535;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// NAT engine configuration
    #[serde(default)]
    pub nat: NatConfig,

    /// TUN device selection
    #[serde(default)]
    pub device: DeviceConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nat.validate()?;
        self.device.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            nat: NatConfig::default(),
            device: DeviceConfig {
                fd: None,
                name: Some("tun0".into()),
            },
            log: LogConfig::default(),
        }
    }
}

/// How UDP datagrams reach the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// Each datagram is pushed to `Handler::new_packet` with a reply template
    #[default]
    Push,
    /// Datagrams are queued for `NatUdpSocket::read_from` callers
    Pull,
}

/// Which ICMP echo requests are answered locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IcmpEchoPolicy {
    /// Only requests addressed to the portal
    #[default]
    Portal,
    /// Every echo request, whatever its destination
    All,
    /// Never answer
    Off,
}

/// NAT engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    /// Sentinel address used as the source of redirected segments
    #[serde(default = "default_portal_v4")]
    pub portal_v4: Ipv4Addr,

    /// Local address the kernel delivers redirected segments to
    #[serde(default = "default_gateway_v4")]
    pub gateway_v4: Ipv4Addr,

    /// IPv6 portal sentinel
    #[serde(default = "default_portal_v6")]
    pub portal_v6: Ipv6Addr,

    /// IPv6 gateway address
    #[serde(default = "default_gateway_v6")]
    pub gateway_v6: Ipv6Addr,

    /// Handle IPv6 packets (dropped otherwise)
    #[serde(default = "default_true")]
    pub ipv6_enabled: bool,

    /// Device MTU, also the pump read buffer size
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Stub listener bind address; defaults to a wildcard with an ephemeral port
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Inclusive range session ports are drawn from
    #[serde(default = "default_session_port_range")]
    pub session_port_range: (u16, u16),

    /// How long a closed session keeps its port (milliseconds)
    #[serde(default = "default_tcp_linger_ms")]
    pub tcp_linger_ms: u64,

    /// Idle timeout for sessions that were never accepted (seconds)
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,

    /// Interval of the session sweeper (milliseconds)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// UDP delivery mode
    #[serde(default)]
    pub udp_mode: UdpMode,

    /// Number of reader tasks in pull mode
    #[serde(default = "default_udp_readers")]
    pub udp_readers: usize,

    /// UDP flow idle timeout for the direct handler (seconds)
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,

    /// ICMP echo answering policy
    #[serde(default)]
    pub icmp_echo: IcmpEchoPolicy,

    /// Destinations that are dropped before protocol dispatch
    #[serde(default)]
    pub bypass_ranges: Vec<IpNet>,
}

impl NatConfig {
    /// Validate NAT configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.portal_v4 == self.gateway_v4 {
            return Err(ConfigError::ValidationError(format!(
                "portal_v4 and gateway_v4 must differ (both {})",
                self.portal_v4
            )));
        }

        if self.ipv6_enabled && self.portal_v6 == self.gateway_v6 {
            return Err(ConfigError::ValidationError(format!(
                "portal_v6 and gateway_v6 must differ (both {})",
                self.portal_v6
            )));
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::ValidationError(format!(
                "mtu must be between {MIN_MTU} and {MAX_MTU}, got {}",
                self.mtu
            )));
        }

        let (start, end) = self.session_port_range;
        if start == 0 || start > end {
            return Err(ConfigError::ValidationError(format!(
                "session_port_range must be a non-empty range within 1..=65535, got {start}..={end}"
            )));
        }

        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }

        if self.udp_mode == UdpMode::Pull && self.udp_readers == 0 {
            return Err(ConfigError::ValidationError(
                "udp_readers must be greater than 0 in pull mode".into(),
            ));
        }

        if self.udp_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "udp_timeout_secs must be greater than 0".into(),
            ));
        }

        if let Some(addr) = self.listen_addr {
            if addr.is_ipv6() && !self.ipv6_enabled {
                return Err(ConfigError::ValidationError(format!(
                    "listen_addr {addr} is IPv6 but ipv6_enabled is false"
                )));
            }
        }

        Ok(())
    }

    /// Stub listener bind address
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr.unwrap_or_else(|| {
            if self.ipv6_enabled {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
            } else {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            }
        })
    }

    /// Get linger window as Duration
    #[must_use]
    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.tcp_linger_ms)
    }

    /// Get session idle timeout as Duration
    #[must_use]
    pub const fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Get sweep interval as Duration
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Get UDP flow timeout as Duration
    #[must_use]
    pub const fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            portal_v4: default_portal_v4(),
            gateway_v4: default_gateway_v4(),
            portal_v6: default_portal_v6(),
            gateway_v6: default_gateway_v6(),
            ipv6_enabled: true,
            mtu: default_mtu(),
            listen_addr: None,
            session_port_range: default_session_port_range(),
            tcp_linger_ms: default_tcp_linger_ms(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            udp_mode: UdpMode::Push,
            udp_readers: default_udp_readers(),
            udp_timeout_secs: default_udp_timeout_secs(),
            icmp_echo: IcmpEchoPolicy::Portal,
            bypass_ranges: Vec::new(),
        }
    }
}

/// TUN device selection
///
/// `fd` takes precedence; it is the descriptor handed over by a platform VPN
/// API. `name` opens (or creates) the interface through `/dev/net/tun`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DeviceConfig {
    /// Already-open TUN file descriptor
    #[serde(default)]
    pub fd: Option<i32>,

    /// Interface name to open
    #[serde(default)]
    pub name: Option<String>,
}

impl DeviceConfig {
    /// Validate device configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if neither `fd` nor `name` is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.fd, self.name.as_deref()) {
            (Some(fd), _) if fd < 0 => Err(ConfigError::ValidationError(format!(
                "device.fd must be non-negative, got {fd}"
            ))),
            (None, None) => Err(ConfigError::ValidationError(
                "device.fd or device.name must be set".into(),
            )),
            (None, Some(name)) if name.is_empty() || name.len() >= 16 => {
                Err(ConfigError::ValidationError(format!(
                    "device.name must be 1 to 15 bytes, got {name:?}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "log.format must be \"json\" or \"text\", got {other:?}"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_portal_v4() -> Ipv4Addr {
    Ipv4Addr::new(172, 19, 0, 2)
}

const fn default_gateway_v4() -> Ipv4Addr {
    Ipv4Addr::new(172, 19, 0, 1)
}

const fn default_portal_v6() -> Ipv6Addr {
    Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 2)
}

const fn default_gateway_v6() -> Ipv6Addr {
    Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 1)
}

const fn default_mtu() -> u32 {
    1500
}

const fn default_session_port_range() -> (u16, u16) {
    (1, u16::MAX)
}

const fn default_tcp_linger_ms() -> u64 {
    5000
}

const fn default_session_idle_timeout_secs() -> u64 {
    300
}

const fn default_sweep_interval_ms() -> u64 {
    1000
}

const fn default_udp_readers() -> usize {
    4
}

const fn default_udp_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
