use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// Redis URL shared by the connection registry and the event relay.
    /// Without it, connections are tracked in process memory and no relay runs.
    #[arg(long, env)]
    redis_url: Option<String>,

    /// Prefix for every connection registry key
    #[arg(long, env, default_value = "sse")]
    pub registry_key_prefix: String,

    /// Redis pub/sub channel carrying domain events between processes
    #[arg(long, env, default_value = "event-bus")]
    pub event_bus_channel: String,

    /// Endpoint returning a principal's authorization snapshot for a bearer token
    #[arg(
        long,
        env,
        default_value = "http://localhost:8080/api/v1/events/authorize"
    )]
    pub permission_service_url: String,

    /// Seconds between keep-alive frames (also renews registry liveness)
    #[arg(long, env, default_value_t = 15)]
    pub heartbeat_interval_secs: u64,

    /// Seconds between authorization refreshes of every open stream
    #[arg(long, env, default_value_t = 60)]
    pub auth_refresh_interval_secs: u64,

    /// Seconds a registry entry survives without a heartbeat
    #[arg(long, env, default_value_t = 60)]
    pub connection_ttl_secs: u64,

    /// Frames buffered per stream before new frames are dropped
    #[arg(long, env, default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Concurrent streams allowed per principal across all processes (0 disables the limit)
    #[arg(long, env, default_value_t = 10)]
    pub max_connections_per_principal: usize,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets
    /// displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new([
            "OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE",
        ])
        .map(|s| s.parse::<LevelFilter>().unwrap()),
    )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn set_redis_url(mut self, redis_url: String) -> Self {
        self.redis_url = Some(redis_url);
        self
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn auth_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.auth_refresh_interval_secs.max(1))
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs.max(1))
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["event_gateway"];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);

        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.auth_refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.connection_ttl(), Duration::from_secs(60));
        assert_eq!(config.outbound_buffer, 64);
        assert_eq!(config.max_connections_per_principal, 10);
        assert_eq!(config.registry_key_prefix, "sse");
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn test_redis_url_is_optional() {
        let config = parse(&[]);
        let config = if std::env::var("REDIS_URL").is_ok() {
            config
        } else {
            assert!(config.redis_url().is_none());
            config.set_redis_url("redis://127.0.0.1:6379".to_string())
        };

        assert!(config.redis_url().is_some());
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = parse(&["--heartbeat-interval-secs", "0", "--connection-ttl-secs", "0"]);

        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.connection_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_allowed_origins_are_comma_separated() {
        let config = parse(&["--allowed-origins", "https://a.example,https://b.example"]);

        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_runtime_env_parses_case_insensitively() {
        assert_eq!("PRODUCTION".parse::<RustEnv>(), Ok(RustEnv::Production));
        assert_eq!("staging".parse::<RustEnv>(), Ok(RustEnv::Staging));
        assert_eq!("qa".parse::<RustEnv>(), Err(RustEnvParseError));
        assert!(parse(&["--runtime-env", "production"]).is_production());
    }
}
