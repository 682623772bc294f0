// src/config.rs

//! Operator configuration: loading, defaulting, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// A raw representation of the config file before defaulting and validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_homeserver_url")]
    homeserver_url: String,
    access_token: String,
    #[serde(default = "default_self_user_id")]
    self_user_id: String,
    #[serde(default = "default_self_server")]
    self_server: String,
    management_room: String,
    #[serde(default)]
    policy_rooms: Vec<String>,
    #[serde(default)]
    protected_rooms: Vec<String>,
    #[serde(default)]
    protection: ProtectionSettings,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_homeserver_url() -> String {
    "https://matrix.example.org".to_string()
}
fn default_self_user_id() -> String {
    "@warden:matrix.example.org".to_string()
}
fn default_self_server() -> String {
    "matrix.example.org".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The knobs an operator can set in `config.toml`, plus the fields a real
/// deployment needs to resolve `self_server` for the self-protection
/// invariant enforced when compiling a server ACL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionSettings {
    /// Case-insensitive reason globs that trigger auto-redaction on ban.
    #[serde(default)]
    pub automatically_redact_for_reasons: Vec<String>,
    /// Use the joined-members path instead of full state for ban projection.
    #[serde(default)]
    pub faster_membership_checks: bool,
    /// Log-only mode; no state writes, bans, or redactions are performed.
    #[serde(default)]
    pub no_op: bool,
    /// Emit additional diagnostics to the management room.
    #[serde(default)]
    pub verbose_logging: bool,
    /// Require an explicit confirmation flag for bans containing `*` or `?`.
    #[serde(default = "default_true")]
    pub confirm_wildcard_ban: bool,
    /// Treat every joined non-policy room as protected.
    #[serde(default)]
    pub protect_all_joined_rooms: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProtectionSettings {
    fn default() -> Self {
        Self {
            automatically_redact_for_reasons: Vec::new(),
            faster_membership_checks: false,
            no_op: false,
            verbose_logging: false,
            confirm_wildcard_ban: default_true(),
            protect_all_joined_rooms: false,
        }
    }
}

/// The final, validated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub homeserver_url: String,
    pub access_token: String,
    pub self_user_id: String,
    pub self_server: String,
    pub management_room: String,
    /// Initial watch set, persisted thereafter as
    /// `org.matrix.mjolnir.watched_lists` operator account data.
    pub policy_rooms: Vec<String>,
    /// Initial protect set; ignored for rooms already covered by
    /// `protect_all_joined_rooms`.
    pub protected_rooms: Vec<String>,
    pub protection: ProtectionSettings,
    pub log_level: String,
}

impl Config {
    /// Reads and parses a TOML file, applying defaults and then validating.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let config = Config {
            homeserver_url: raw.homeserver_url,
            access_token: raw.access_token,
            self_user_id: raw.self_user_id,
            self_server: raw.self_server,
            management_room: raw.management_room,
            policy_rooms: raw.policy_rooms,
            protected_rooms: raw.protected_rooms,
            protection: raw.protection,
            log_level: raw.log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.access_token.trim().is_empty() {
            return Err(anyhow!("access_token cannot be empty"));
        }
        if self.management_room.trim().is_empty() {
            return Err(anyhow!("management_room cannot be empty"));
        }
        if self.self_server.trim().is_empty() {
            return Err(anyhow!("self_server cannot be empty"));
        }
        if !self.self_user_id.contains(':') {
            return Err(anyhow!("self_user_id must be a fully-qualified mxid"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            access_token = "syt_example"
            management_room = "!mgmt:example.org"
            "#
        )
        .unwrap();
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.management_room, "!mgmt:example.org");
        assert!(!config.protection.faster_membership_checks);
        assert!(config.protection.confirm_wildcard_ban);
    }

    #[test]
    fn rejects_empty_access_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"management_room = "!mgmt:example.org""#).unwrap();
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }
}
