use std::time::Duration;

use clap::Parser;

pub const DEFAULT_PORT: u16 = 8000;

/// Realtime chat and document collaboration server
#[derive(Parser, Clone, Debug)]
#[command(name = "roomwire", version, about = "Realtime chat and document room server")]
pub struct Config {
    /// Bind address
    #[arg(long, env = "ROOMWIRE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port to listen on
    #[arg(long, env = "ROOMWIRE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Seconds between keepalive pings
    #[arg(
        long,
        env = "ROOMWIRE_PING_INTERVAL_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the connection
    #[arg(
        long,
        env = "ROOMWIRE_PONG_TIMEOUT_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub pong_timeout_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, env = "ROOMWIRE_DEBUG")]
    pub debug: bool,

    /// Enable structured JSON logging
    #[arg(long, env = "ROOMWIRE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn default_log_level(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["roomwire"]).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:8000");
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.pong_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_log_level(), "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "roomwire",
            "--bind-address",
            "127.0.0.1",
            "--port",
            "9100",
            "--ping-interval-secs",
            "5",
            "--debug",
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:9100");
        assert_eq!(config.ping_interval(), Duration::from_secs(5));
        assert_eq!(config.default_log_level(), "debug");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::try_parse_from(["roomwire", "--port", "70000"]).is_err());
        assert!(Config::try_parse_from(["roomwire", "--ping-interval-secs", "0"]).is_err());
    }
}
