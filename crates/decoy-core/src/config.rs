//! Manager configuration: the TOML root aggregate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{BotAccount, BotTimings, ServerSpec};

/// Root configuration aggregate.
///
/// Owns the joiner executable path, the target servers, the global account
/// list, and the default timing policy applied when a server does not set
/// its own.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    /// Path to the external joiner executable.
    pub joiner_bin: PathBuf,
    /// Target servers to keep populated.
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    /// Accounts not bound to any particular server roster.
    #[serde(default)]
    pub accounts: Vec<BotAccount>,
    /// Default timing policy for new servers.
    #[serde(default)]
    pub defaults: BotTimings,
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration back to a TOML file.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The pooled identities, deduplicated by username.
    ///
    /// Server rosters are eligibility policy, not pool members; only the
    /// global account list feeds the pool.
    pub fn pooled_accounts(&self) -> Vec<BotAccount> {
        let mut seen: HashMap<&str, &BotAccount> = HashMap::new();
        for account in &self.accounts {
            seen.entry(account.username.as_str()).or_insert(account);
        }
        let mut accounts: Vec<BotAccount> = seen.into_values().cloned().collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        accounts
    }

    /// Find a server by its `address:port` key.
    pub fn server(&self, key: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|s| s.key() == key)
    }

    /// Find a server by key, mutably.
    pub fn server_mut(&mut self, key: &str) -> Option<&mut ServerSpec> {
        self.servers.iter_mut().find(|s| s.key() == key)
    }
}

/// Parse an accounts file of `username:password` lines.
///
/// Blank lines are skipped. An empty file or a line without a `:` separator
/// is a configuration error surfaced to the caller; nothing here touches
/// the scheduler.
pub fn parse_accounts(content: &str) -> ConfigResult<Vec<BotAccount>> {
    let mut accounts = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (username, password) = line
            .split_once(':')
            .ok_or(ConfigError::MalformedAccountLine { line: idx + 1 })?;
        if username.is_empty() {
            return Err(ConfigError::MalformedAccountLine { line: idx + 1 });
        }
        accounts.push(BotAccount::new(username, password));
    }
    if accounts.is_empty() {
        return Err(ConfigError::EmptyAccountsFile);
    }
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ManagerConfig {
        ManagerConfig {
            joiner_bin: PathBuf::from("/opt/decoy/joiner"),
            servers: vec![ServerSpec {
                address: "198.51.100.7".into(),
                port: 28015,
                display_name: "Main".into(),
                timings: BotTimings::default(),
                accounts: vec![BotAccount::new("alice", "pw1")],
            }],
            accounts: vec![
                BotAccount::new("bob", "pw2"),
                BotAccount::new("alice", "other"),
            ],
            defaults: BotTimings::default(),
        }
    }

    #[test]
    fn toml_round_trip() {
        let config = sample_config();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decoy.toml");

        config.save_to(&path).unwrap();
        let loaded = ManagerConfig::from_file(&path).unwrap();

        assert_eq!(loaded.joiner_bin, config.joiner_bin);
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.servers[0].key(), "198.51.100.7:28015");
        assert_eq!(loaded.accounts.len(), 2);
    }

    #[test]
    fn pooled_accounts_dedupes_by_username() {
        let config = sample_config();
        let pooled = config.pooled_accounts();
        // Roster entries do not join the pool; "alice" on the roster does
        // not duplicate the global "alice".
        assert_eq!(pooled.len(), 2);
        assert!(pooled.iter().any(|a| a.username == "alice"));
        assert!(pooled.iter().any(|a| a.username == "bob"));
    }

    #[test]
    fn server_lookup_by_key() {
        let mut config = sample_config();
        assert!(config.server("198.51.100.7:28015").is_some());
        assert!(config.server("198.51.100.7:28016").is_none());

        config.server_mut("198.51.100.7:28015").unwrap().display_name = "Renamed".into();
        assert_eq!(config.servers[0].display_name, "Renamed");
    }

    #[test]
    fn parse_accounts_happy_path() {
        let accounts = parse_accounts("alice:pw1\n\nbob:pw:with:colons\n").unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0], BotAccount::new("alice", "pw1"));
        // Only the first `:` separates username from password.
        assert_eq!(accounts[1], BotAccount::new("bob", "pw:with:colons"));
    }

    #[test]
    fn parse_accounts_rejects_empty_file() {
        assert!(matches!(
            parse_accounts("\n\n"),
            Err(ConfigError::EmptyAccountsFile)
        ));
    }

    #[test]
    fn parse_accounts_reports_malformed_line() {
        let err = parse_accounts("alice:pw\nnocolon\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedAccountLine { line: 2 }));
    }
}
