//! Configuration loading.
//!
//! One TOML file describes the server identity, listeners, timeouts, and
//! the operator, peer-link, and user-rule tables. A SIGHUP re-reads the
//! file; live sessions are never touched by a reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::state::ident::is_valid_sid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub listen: ListenConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub opers: Vec<OperBlock>,
    #[serde(default)]
    pub links: Vec<LinkBlock>,
    #[serde(default)]
    pub users: Vec<UserRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Our server name as shown on the network, e.g. `irc.example.org`.
    pub name: String,
    /// One-line server description.
    #[serde(default = "default_description")]
    pub description: String,
    /// Our TS6 SID.
    pub sid: String,
    /// Message of the day, either inline text or a file path.
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default)]
    pub motd_file: Option<PathBuf>,
    #[serde(default = "default_max_nick_length")]
    pub max_nick_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// TLS listener; requires `certificate_file` and `key_file`.
    #[serde(default)]
    pub tls_port: Option<u16>,
    #[serde(default)]
    pub certificate_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Seconds of idle before a session is PINGed.
    #[serde(default = "default_ping_time")]
    pub ping_time: u64,
    /// Seconds of idle before a session is disconnected.
    #[serde(default = "default_dead_time")]
    pub dead_time: u64,
    /// Seconds between outbound connect attempts to unlinked peers.
    #[serde(default = "default_connect_attempt_time")]
    pub connect_attempt_time: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            ping_time: default_ping_time(),
            dead_time: default_dead_time(),
            connect_attempt_time: default_connect_attempt_time(),
        }
    }
}

impl TimeoutsConfig {
    pub fn ping(&self) -> Duration {
        Duration::from_secs(self.ping_time)
    }

    pub fn dead(&self) -> Duration {
        Duration::from_secs(self.dead_time)
    }

    pub fn connect_attempt(&self) -> Duration {
        Duration::from_secs(self.connect_attempt_time)
    }
}

/// An operator account for the OPER command.
#[derive(Debug, Clone, Deserialize)]
pub struct OperBlock {
    pub name: String,
    pub password: String,
}

/// A peer we may link with, inbound or outbound.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkBlock {
    /// The peer's server name; the authoritative key for the table.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub tls: bool,
}

/// A registration rewrite rule. The first rule matching a new user's
/// user@host applies; it may spoof the hostname and/or exempt the user
/// from flood limits.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRule {
    pub user_mask: String,
    pub host_mask: String,
    #[serde(default)]
    pub spoof_host: Option<String>,
    #[serde(default)]
    pub flood_exempt: bool,
}

fn default_description() -> String {
    "petreld".to_string()
}

fn default_max_nick_length() -> usize {
    9
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    6667
}

fn default_ping_time() -> u64 {
    120
}

fn default_dead_time() -> u64 {
    240
}

fn default_connect_attempt_time() -> u64 {
    60
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.is_empty() {
            return Err(ConfigError::Invalid("server.name must be set".into()));
        }
        if !is_valid_sid(&self.server.sid) {
            return Err(ConfigError::Invalid(format!(
                "server.sid {:?} is not a valid SID",
                self.server.sid
            )));
        }
        if self.server.max_nick_length == 0 || self.server.max_nick_length > 32 {
            return Err(ConfigError::Invalid(
                "server.max_nick_length must be between 1 and 32".into(),
            ));
        }
        if self.listen.tls_port.is_some()
            && (self.listen.certificate_file.is_none() || self.listen.key_file.is_none())
        {
            return Err(ConfigError::Invalid(
                "listen.tls_port requires certificate_file and key_file".into(),
            ));
        }
        for link in &self.links {
            if link.name == self.server.name {
                return Err(ConfigError::Invalid(format!(
                    "link {:?} has our own server name",
                    link.name
                )));
            }
        }
        let mut names: Vec<&str> = self.links.iter().map(|l| l.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid("duplicate link names".into()));
        }
        Ok(())
    }

    pub fn link(&self, name: &str) -> Option<&LinkBlock> {
        self.links.iter().find(|l| l.name == name)
    }

    /// The MOTD body, if configured: inline text wins over the file.
    pub fn motd_text(&self) -> Option<String> {
        if let Some(text) = &self.server.motd {
            return Some(text.clone());
        }
        let path = self.server.motd_file.as_ref()?;
        std::fs::read_to_string(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(s).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
        [server]
        name = "irc.example.org"
        sid = "001"

        [listen]
        port = 6667
    "#;

    #[test]
    fn minimal_config_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.server.max_nick_length, 9);
        assert_eq!(config.timeouts.ping_time, 120);
        assert!(config.links.is_empty());
    }

    #[test]
    fn bad_sid_rejected() {
        let bad = MINIMAL.replace("\"001\"", "\"ABC\"");
        assert!(matches!(parse(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn links_and_opers() {
        let config = parse(
            r#"
            [server]
            name = "irc.example.org"
            sid = "001"

            [listen]
            port = 6667

            [[opers]]
            name = "alice"
            password = "sekrit"

            [[links]]
            name = "irc2.example.org"
            host = "127.0.0.1"
            port = 6668
            password = "linkpass"
            tls = false

            [[users]]
            user_mask = "*"
            host_mask = "10.*"
            spoof_host = "staff.example.org"
            flood_exempt = true
            "#,
        )
        .unwrap();
        assert!(config.link("irc2.example.org").is_some());
        assert!(config.link("nope").is_none());
        assert_eq!(config.opers.len(), 1);
        assert_eq!(config.users[0].spoof_host.as_deref(), Some("staff.example.org"));
    }

    #[test]
    fn duplicate_links_rejected() {
        let dup = format!(
            "{}\n{}\n{}",
            MINIMAL,
            "[[links]]\nname = \"x\"\nhost = \"h\"\nport = 1\npassword = \"p\"",
            "[[links]]\nname = \"x\"\nhost = \"h\"\nport = 2\npassword = \"p\"",
        );
        assert!(matches!(parse(&dup), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn tls_listener_requires_cert_material() {
        let tls = MINIMAL.replace("port = 6667", "port = 6667\ntls_port = 6697");
        assert!(matches!(parse(&tls), Err(ConfigError::Invalid(_))));
    }
}
