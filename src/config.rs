use clap::Parser;

/// Runtime configuration for the Icom WLAN client core.
///
/// Covers connection parameters plus the health-monitor/reconnect surface
/// from `configure_monitor(...)` (§6). Constructible from CLI args via
/// `RadioConfig::parse()`, or programmatically via `RadioConfig::builder()`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct RadioConfig {
    /// Radio control-session host
    #[arg(long)]
    pub host: String,

    /// Radio control-session port (commonly 50001)
    #[arg(long, default_value_t = 50001)]
    pub port: u16,

    /// Local address to bind sub-session sockets to
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Username presented during login
    #[arg(long)]
    pub username: String,

    /// Password presented during login (or set ICOM_WLAN_PASSWORD)
    #[arg(long, env = "ICOM_WLAN_PASSWORD")]
    pub password: String,

    /// Client name advertised in the Login packet
    #[arg(long, default_value = "icom-wlan-rs")]
    pub client_name: String,

    /// UDP receive buffer size (SO_RCVBUF) for each session socket
    #[arg(long, default_value_t = 256 * 1024)]
    pub recv_buf_size: usize,

    /// Health-monitor poll interval, milliseconds
    #[arg(long, default_value_t = 1000)]
    pub check_interval_ms: u64,

    /// Per-session silence timeout before a session is considered lost, milliseconds
    #[arg(long, default_value_t = 5000)]
    pub session_timeout_ms: u64,

    /// Whether to automatically reconnect after connection loss
    #[arg(long, default_value_t = true)]
    pub auto_reconnect: bool,

    /// Maximum reconnect attempts (0 = infinite)
    #[arg(long, default_value_t = 0)]
    pub max_reconnect_attempts: u32,

    /// Base reconnect backoff delay, milliseconds
    #[arg(long, default_value_t = 2000)]
    pub reconnect_base_delay_ms: u64,

    /// Maximum reconnect backoff delay, milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Outbound audio volume multiplier applied to float32 samples
    #[arg(long, default_value_t = 1.0)]
    pub audio_volume: f32,

    /// Overall connect-attempt timeout, milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub connect_timeout_ms: u64,

    /// CI-V + Audio sub-session bring-up timeout, milliseconds (started once login succeeds)
    #[arg(long, default_value_t = 10_000)]
    pub subsession_timeout_ms: u64,
}

impl RadioConfig {
    pub fn builder() -> RadioConfigBuilder {
        RadioConfigBuilder::default()
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_reconnect_attempts(&self) -> Option<u32> {
        if self.max_reconnect_attempts == 0 {
            None
        } else {
            Some(self.max_reconnect_attempts)
        }
    }
}

/// Programmatic builder for embedding this core outside a CLI binary.
#[derive(Debug, Clone)]
pub struct RadioConfigBuilder {
    host: String,
    port: u16,
    bind_host: String,
    username: String,
    password: String,
    client_name: String,
    recv_buf_size: usize,
    check_interval_ms: u64,
    session_timeout_ms: u64,
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    reconnect_base_delay_ms: u64,
    reconnect_max_delay_ms: u64,
    audio_volume: f32,
    connect_timeout_ms: u64,
    subsession_timeout_ms: u64,
}

impl Default for RadioConfigBuilder {
    fn default() -> Self {
        RadioConfigBuilder {
            host: String::new(),
            port: 50001,
            bind_host: "0.0.0.0".to_string(),
            username: String::new(),
            password: String::new(),
            client_name: "icom-wlan-rs".to_string(),
            recv_buf_size: 256 * 1024,
            check_interval_ms: 1000,
            session_timeout_ms: 5000,
            auto_reconnect: true,
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: 2000,
            reconnect_max_delay_ms: 30_000,
            audio_volume: 1.0,
            connect_timeout_ms: 30_000,
            subsession_timeout_ms: 10_000,
        }
    }
}

macro_rules! builder_field {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, v: $ty) -> Self {
            self.$name = v;
            self
        }
    };
}

impl RadioConfigBuilder {
    builder_field!(host, String);
    builder_field!(port, u16);
    builder_field!(bind_host, String);
    builder_field!(username, String);
    builder_field!(password, String);
    builder_field!(client_name, String);
    builder_field!(recv_buf_size, usize);
    builder_field!(check_interval_ms, u64);
    builder_field!(session_timeout_ms, u64);
    builder_field!(auto_reconnect, bool);
    builder_field!(max_reconnect_attempts, u32);
    builder_field!(reconnect_base_delay_ms, u64);
    builder_field!(reconnect_max_delay_ms, u64);
    builder_field!(audio_volume, f32);
    builder_field!(connect_timeout_ms, u64);
    builder_field!(subsession_timeout_ms, u64);

    pub fn build(self) -> RadioConfig {
        RadioConfig {
            host: self.host,
            port: self.port,
            bind_host: self.bind_host,
            username: self.username,
            password: self.password,
            client_name: self.client_name,
            recv_buf_size: self.recv_buf_size,
            check_interval_ms: self.check_interval_ms,
            session_timeout_ms: self.session_timeout_ms,
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            reconnect_max_delay_ms: self.reconnect_max_delay_ms,
            audio_volume: self.audio_volume,
            connect_timeout_ms: self.connect_timeout_ms,
            subsession_timeout_ms: self.subsession_timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_sane_defaults() {
        let cfg = RadioConfig::builder().host("192.168.1.50".to_string()).username("icom".to_string()).build();
        assert_eq!(cfg.control_addr(), "192.168.1.50:50001");
        assert_eq!(cfg.max_reconnect_attempts(), None);
        assert!(cfg.auto_reconnect);
    }

    #[test]
    fn zero_max_attempts_means_infinite() {
        let cfg = RadioConfig::builder().max_reconnect_attempts(0).build();
        assert_eq!(cfg.max_reconnect_attempts(), None);
        let cfg = RadioConfig::builder().max_reconnect_attempts(5).build();
        assert_eq!(cfg.max_reconnect_attempts(), Some(5));
    }
}
