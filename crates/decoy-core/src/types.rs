//! Domain types for the decoy fleet.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Credentials for one automatable player slot.
///
/// The username is the unique key: two accounts with the same username are
/// the same identity as far as the pool is concerned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotAccount {
    pub username: String,
    pub password: String,
}

impl BotAccount {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Inclusive integer-second ranges the jittered delays are drawn from.
///
/// `enter` gates how soon a freshly assigned bot connects, `exit` how soon
/// a scheduled disconnect fires, and `reconnect` is the grace period a
/// forced removal waits before the identity is considered reusable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BotTimings {
    pub enter_min: u64,
    pub enter_max: u64,
    pub exit_min: u64,
    pub exit_max: u64,
    pub reconnect_min: u64,
    pub reconnect_max: u64,
}

impl Default for BotTimings {
    fn default() -> Self {
        Self {
            enter_min: 1,
            enter_max: 30,
            exit_min: 60,
            exit_max: 300,
            reconnect_min: 5,
            reconnect_max: 15,
        }
    }
}

impl BotTimings {
    /// Random delay in `[enter_min, enter_max]` seconds.
    pub fn enter_delay(&self) -> Duration {
        jitter_secs(self.enter_min, self.enter_max)
    }

    /// Random delay in `[exit_min, exit_max]` seconds.
    pub fn exit_delay(&self) -> Duration {
        jitter_secs(self.exit_min, self.exit_max)
    }

    /// Random delay in `[reconnect_min, reconnect_max]` seconds.
    pub fn reconnect_delay(&self) -> Duration {
        jitter_secs(self.reconnect_min, self.reconnect_max)
    }
}

/// Uniform random duration in `[min, max]` whole seconds.
///
/// A reversed range is treated as the single point `min`.
fn jitter_secs(min: u64, max: u64) -> Duration {
    let secs = if min >= max {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    };
    Duration::from_secs(secs)
}

/// A target game server plus its capacity-and-timing policy.
///
/// The roster is the list of accounts eligible for this server; its length
/// is the server's capacity. Assignment itself draws from the shared pool,
/// so a bot may end up on a server whose roster does not list it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSpec {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub timings: BotTimings,
    #[serde(default)]
    pub accounts: Vec<BotAccount>,
}

impl ServerSpec {
    /// Stable identity of this server: `address:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Maximum number of bots this server accepts.
    pub fn capacity(&self) -> usize {
        self.accounts.len()
    }

    /// Name used in logs: the display name when set, the key otherwise.
    pub fn label(&self) -> String {
        if self.display_name.is_empty() {
            self.key()
        } else {
            self.display_name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_range() {
        let timings = BotTimings {
            enter_min: 2,
            enter_max: 5,
            ..BotTimings::default()
        };
        for _ in 0..100 {
            let d = timings.enter_delay();
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn jitter_degenerate_range_is_min() {
        assert_eq!(jitter_secs(7, 7), Duration::from_secs(7));
        assert_eq!(jitter_secs(9, 3), Duration::from_secs(9));
    }

    #[test]
    fn server_key_and_capacity() {
        let spec = ServerSpec {
            address: "198.51.100.7".into(),
            port: 28015,
            display_name: String::new(),
            timings: BotTimings::default(),
            accounts: vec![
                BotAccount::new("a", "1"),
                BotAccount::new("b", "2"),
            ],
        };
        assert_eq!(spec.key(), "198.51.100.7:28015");
        assert_eq!(spec.capacity(), 2);
        assert_eq!(spec.label(), "198.51.100.7:28015");
    }
}
