use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::packet::ConnectReturnCode;
use crate::core::topics::WildcardPolicy;

/// Default file looked up by `blipmqtt start`.
pub const DEFAULT_CONFIG_PATH: &str = "blipmqtt.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    /// Frames announcing more than this many bytes end the connection.
    pub max_packet_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".to_string(),
            max_connections: 1024,
            connect_timeout_ms: 10_000,
            max_packet_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub max_queued_packets: usize,
    pub ack_timeout_ms: u64,
    pub idle_poll_ms: u64,
    /// Multiplier applied to the client's keep-alive before it is dropped.
    pub keep_alive_grace: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queued_packets: 1000,
            ack_timeout_ms: 10_000,
            idle_poll_ms: 100,
            keep_alive_grace: 1.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub send_tries: u32,
    pub send_delay_ms: u64,
    pub recv_tries: u32,
    pub recv_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            send_tries: 5,
            send_delay_ms: 450,
            recv_tries: 10,
            recv_delay_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TopicsConfig {
    /// Accept a filter that is exactly `+`.
    pub allow_bare_single_level: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub allow_anonymous: bool,
    pub users: Vec<UserCredentials>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub topics: TopicsConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Loads configuration from an optional file path and environment
    /// variables.
    ///
    /// Precedence: built-in defaults, then the file (`path`, else
    /// `BLIPMQTT_CONFIG`), then environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let effective_path = path
            .map(str::to_string)
            .or_else(|| env::var("BLIPMQTT_CONFIG").ok());

        let mut config = match effective_path {
            Some(p) => load_config(p)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `BLIPMQTT_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BLIPMQTT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("BLIPMQTT_MAX_CONNECTIONS") {
            self.server.max_connections = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("BLIPMQTT_MAX_CONNECTIONS: {e}")))?;
        }
        Ok(())
    }

    pub fn wildcard_policy(&self) -> WildcardPolicy {
        if self.topics.allow_bare_single_level {
            WildcardPolicy::Lenient
        } else {
            WildcardPolicy::Strict
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.server.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.session.ack_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.session.idle_poll_ms.max(1))
    }

    /// Whether a CONNECT carrying these credentials may proceed; `Err` holds
    /// the refusal code.
    pub fn check_credentials(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<(), ConnectReturnCode> {
        let Some(username) = username else {
            return if self.auth.allow_anonymous {
                Ok(())
            } else {
                Err(ConnectReturnCode::NotAuthorized)
            };
        };
        if self.auth.users.is_empty() {
            return Ok(());
        }
        let known = self.auth.users.iter().any(|user| {
            user.username == username && Some(user.password.as_bytes()) == password
        });
        if known {
            Ok(())
        } else {
            Err(ConnectReturnCode::BadCredentials)
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind_addr = "127.0.0.1:1884"

            [session]
            ack_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:1884");
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.ack_timeout(), Duration::from_millis(2500));
        assert_eq!(config.session.keep_alive_grace, 1.5);
        assert_eq!(config.retry.send_tries, 5);
        assert_eq!(config.retry.recv_delay_ms, 500);
        assert_eq!(config.wildcard_policy(), WildcardPolicy::Strict);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                "BLIPMQTT_BIND_ADDR" => Some("10.0.0.1:1883".into()),
                "BLIPMQTT_MAX_CONNECTIONS" => Some("8".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.bind_addr, "10.0.0.1:1883");
        assert_eq!(config.server.max_connections, 8);

        let err = config
            .apply_overrides(|key| (key == "BLIPMQTT_MAX_CONNECTIONS").then(|| "many".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn credentials() {
        let mut config: Config = toml::from_str(
            r#"
            [auth]
            allow_anonymous = false
            users = [{ username = "alice", password = "s3cret" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.check_credentials(Some("alice"), Some(b"s3cret")), Ok(()));
        assert_eq!(
            config.check_credentials(Some("alice"), Some(b"nope")),
            Err(ConnectReturnCode::BadCredentials)
        );
        assert_eq!(
            config.check_credentials(None, None),
            Err(ConnectReturnCode::NotAuthorized)
        );

        config.auth = AuthConfig::default();
        assert_eq!(config.check_credentials(None, None), Ok(()));
        assert_eq!(config.check_credentials(Some("anyone"), None), Ok(()));
    }
}
