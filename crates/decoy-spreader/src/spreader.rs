//! The spread scheduler: the 1-second allocator tick and the stop/reclaim
//! protocol.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use decoy_core::ManagerConfig;
use decoy_joiner::{DelayedTask, PlayerJoiner};

use crate::error::{SpreaderError, SpreaderResult};
use crate::pool::AccountPool;
use crate::unit::ServerUnit;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Top-level coordinator: reconciles the server set, ticks the greedy fill,
/// and owns the stop/reclaim protocol.
///
/// Explicitly constructed and passed by reference from the composition
/// root; there is no global instance.
#[derive(Debug, Clone)]
pub struct Spreader {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pool: AccountPool,
    units: Mutex<HashMap<String, Arc<ServerUnit>>>,
    joiner_bin: Mutex<PathBuf>,
    running: AtomicBool,
    /// The repeating 1 s tick. Armed once on first start and left armed
    /// across stop/start; the tick itself checks `running`.
    tick_task: Mutex<Option<DelayedTask>>,
}

impl Spreader {
    pub fn new(joiner_bin: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: AccountPool::new(),
                units: Mutex::new(HashMap::new()),
                joiner_bin: Mutex::new(joiner_bin),
                running: AtomicBool::new(false),
                tick_task: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &AccountPool {
        &self.inner.pool
    }

    /// The unit for a server key, if one is live.
    pub fn unit(&self, key: &str) -> Option<Arc<ServerUnit>> {
        self.inner.units.lock().unwrap().get(key).cloned()
    }

    /// All live units, in stable key order.
    pub fn units(&self) -> Vec<Arc<ServerUnit>> {
        self.inner.sorted_units()
    }

    /// Start spreading. Idempotent; arms the repeating tick on first call.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tick_task = self.inner.tick_task.lock().unwrap();
        if tick_task.is_none() {
            let inner = self.inner.clone();
            *tick_task = Some(DelayedTask::repeating(TICK_PERIOD, move || {
                let inner = inner.clone();
                async move {
                    inner.tick();
                }
            }));
        }
        info!("spreader started");
    }

    /// Stop spreading and reclaim every assigned identity.
    ///
    /// Fire-and-forget per worker: each reclaimed identity returns to the
    /// pool after its own grace delay. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let units = self.inner.sorted_units();
        for unit in units {
            for (joiner, grace) in unit.drain() {
                self.inner.release_after(joiner, grace);
            }
        }
        info!("spreader stopped, reclaim in progress");
    }

    /// Reconcile the live unit set and the pool against configuration.
    ///
    /// New servers get units; units whose server disappeared are removed,
    /// cascading a reclaim of their assigned workers. Identities revoked
    /// while taken are force-reclaimed wherever they are assigned.
    pub fn on_config_changed(&self, config: &ManagerConfig) {
        *self.inner.joiner_bin.lock().unwrap() = config.joiner_bin.clone();

        let (added, removed) = {
            let mut units = self.inner.units.lock().unwrap();
            let mut added = 0usize;
            for spec in &config.servers {
                let key = spec.key();
                if !units.contains_key(&key) {
                    let unit = Arc::new(ServerUnit::new(spec.clone(), config.joiner_bin.clone()));
                    units.insert(key, unit);
                    added += 1;
                }
            }

            let configured: Vec<String> = config.servers.iter().map(|s| s.key()).collect();
            let stale: Vec<String> = units
                .keys()
                .filter(|k| !configured.contains(k))
                .cloned()
                .collect();
            let removed: Vec<Arc<ServerUnit>> = stale
                .iter()
                .filter_map(|k| units.remove(k))
                .collect();
            (added, removed)
        };

        for unit in &removed {
            info!(server = %unit.spec().label(), "server removed, reclaiming bots");
            for (joiner, grace) in unit.drain() {
                self.inner.release_after(joiner, grace);
            }
        }

        let revoked = self.inner.pool.reconcile(&config.pooled_accounts());
        for username in revoked {
            if let Some((unit, joiner)) = self.inner.find_player(&username) {
                info!(account = %username, "account revoked, reclaiming");
                if let Some(grace) = unit.remove_player(&joiner) {
                    self.inner.release_after(joiner, grace);
                }
            }
        }

        debug!(added, removed = removed.len(), "configuration reconciled");
    }

    /// Remove one server by key, reclaiming its assigned workers.
    pub fn remove_server(&self, key: &str) -> SpreaderResult<()> {
        let unit = self
            .inner
            .units
            .lock()
            .unwrap()
            .remove(key)
            .ok_or_else(|| SpreaderError::ServerNotFound(key.to_string()))?;

        info!(server = %unit.spec().label(), "server removed, reclaiming bots");
        for (joiner, grace) in unit.drain() {
            self.inner.release_after(joiner, grace);
        }
        Ok(())
    }

    /// Manual out-of-band removal of one worker.
    ///
    /// Bookkeeping is synchronous: the identity is back in the pool when
    /// this returns; the process teardown still runs in the background.
    pub fn push_player(&self, joiner: &PlayerJoiner) -> SpreaderResult<()> {
        let username = joiner.account().username.clone();
        let (unit, joiner) = self
            .inner
            .find_player(&username)
            .ok_or(SpreaderError::PlayerNotAssigned(username))?;

        unit.remove_player(&joiner);
        self.inner.pool.release(joiner.account());
        Ok(())
    }
}

impl Inner {
    /// One allocation pass: greedy single-pass fill, no rebalancing.
    fn tick(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let units = self.sorted_units();
        // Fast exit: nothing to do, skip the pool entirely.
        if units.iter().all(|u| u.is_full()) {
            return;
        }

        for unit in units {
            while !unit.is_full() {
                let Some(account) = self.pool.acquire() else {
                    return;
                };
                if unit.assign(account.clone()).is_none() {
                    self.pool.release(&account);
                    break;
                }
            }
        }
    }

    /// Units in stable key order.
    fn sorted_units(&self) -> Vec<Arc<ServerUnit>> {
        let units = self.units.lock().unwrap();
        let mut sorted: Vec<Arc<ServerUnit>> = units.values().cloned().collect();
        sorted.sort_by_key(|u| u.key());
        sorted
    }

    /// Locate an assigned lifecycle by username.
    fn find_player(&self, username: &str) -> Option<(Arc<ServerUnit>, PlayerJoiner)> {
        let units = self.units.lock().unwrap();
        for unit in units.values() {
            if let Some(joiner) = unit
                .players()
                .into_iter()
                .find(|j| j.account().username == username)
            {
                return Some((unit.clone(), joiner));
            }
        }
        None
    }

    /// Return `joiner`'s identity to the pool once its grace delay has
    /// elapsed. Fire-and-forget; the task outlives any caller.
    fn release_after(self: &Arc<Self>, joiner: PlayerJoiner, grace: Duration) {
        let inner = self.clone();
        let _task = DelayedTask::once(grace, async move {
            debug!(account = %joiner.account().username, "reclaim grace elapsed");
            inner.pool.release(joiner.account());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decoy_core::{BotAccount, BotTimings, ServerSpec};

    fn slow_timings() -> BotTimings {
        BotTimings {
            enter_min: 1000,
            enter_max: 2000,
            exit_min: 1000,
            exit_max: 2000,
            reconnect_min: 5,
            reconnect_max: 10,
        }
    }

    fn server(port: u16, capacity: usize) -> ServerSpec {
        ServerSpec {
            address: "198.51.100.7".into(),
            port,
            display_name: format!("srv-{port}"),
            timings: slow_timings(),
            accounts: (0..capacity)
                .map(|i| BotAccount::new(format!("roster-{port}-{i}"), "pw"))
                .collect(),
        }
    }

    fn config(servers: Vec<ServerSpec>, pool_size: usize) -> ManagerConfig {
        ManagerConfig {
            joiner_bin: PathBuf::from("/nonexistent/joiner"),
            servers,
            accounts: (0..pool_size)
                .map(|i| BotAccount::new(format!("bot{i}"), "pw"))
                .collect(),
            defaults: BotTimings::default(),
        }
    }

    fn assigned_counts(spreader: &Spreader) -> Vec<usize> {
        spreader
            .units()
            .iter()
            .map(|u| u.assigned_count())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn tick_converges_greedily() {
        let cfg = config(vec![server(28015, 2), server(28016, 2), server(28017, 2)], 5);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();

        spreader.inner.tick();

        // Greedy fill in key order: 2 + 2 + 1, pool exhausted.
        assert_eq!(assigned_counts(&spreader), vec![2, 2, 1]);
        assert_eq!(spreader.pool().free_count(), 0);
        assert_eq!(spreader.pool().taken_count(), 5);

        // Second tick with no state change assigns nothing.
        spreader.inner.tick();
        assert_eq!(assigned_counts(&spreader), vec![2, 2, 1]);
        assert_eq!(spreader.pool().taken_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_noop_when_not_running() {
        let cfg = config(vec![server(28015, 2)], 2);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);

        spreader.inner.tick();
        assert_eq!(assigned_counts(&spreader), vec![0]);
        assert_eq!(spreader.pool().free_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_drives_the_tick() {
        let cfg = config(vec![server(28015, 2)], 2);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();

        // Let the tick task install its interval before moving the clock.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;

        assert_eq!(assigned_counts(&spreader), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let cfg = config(vec![server(28015, 1)], 1);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);

        spreader.start();
        spreader.start();
        assert!(spreader.is_running());

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert_eq!(assigned_counts(&spreader), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_reclaims_every_identity() {
        let cfg = config(vec![server(28015, 2), server(28016, 2)], 4);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();
        spreader.inner.tick();
        assert_eq!(spreader.pool().taken_count(), 4);

        spreader.stop();
        assert!(!spreader.is_running());
        assert_eq!(assigned_counts(&spreader), vec![0, 0]);

        // Let the reclaim tasks register their timers before moving the
        // clock.
        tokio::task::yield_now().await;
        // Identities come back one grace delay at a time.
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(spreader.pool().free_count(), 4);
        assert_eq!(spreader.pool().taken_count(), 0);

        // Second stop is a no-op: no double release, no panic.
        spreader.stop();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(spreader.pool().free_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_spreader_does_not_refill() {
        let cfg = config(vec![server(28015, 1)], 1);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();
        spreader.inner.tick();

        spreader.stop();
        // Let the reclaim task register its timer before moving the clock.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;

        // The tick stays armed but allocates nothing while stopped.
        assert_eq!(assigned_counts(&spreader), vec![0]);
        assert_eq!(spreader.pool().free_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_player_releases_synchronously() {
        let cfg = config(vec![server(28015, 1), server(28016, 1)], 1);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();
        spreader.inner.tick();

        let unit = spreader.unit("198.51.100.7:28015").unwrap();
        let joiner = unit.players().into_iter().next().unwrap();

        spreader.push_player(&joiner).unwrap();
        assert_eq!(spreader.pool().free_count(), 1);
        assert_eq!(unit.assigned_count(), 0);

        // Next tick reassigns the identity to some under-capacity unit.
        spreader.inner.tick();
        assert_eq!(spreader.pool().taken_count(), 1);
        assert_eq!(
            assigned_counts(&spreader).iter().sum::<usize>(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_player_unknown_is_an_error() {
        let cfg = config(vec![server(28015, 1)], 1);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);

        let stray = PlayerJoiner::new(
            BotAccount::new("stray", "pw"),
            server(28015, 1),
            cfg.joiner_bin.clone(),
        );
        assert!(matches!(
            spreader.push_player(&stray),
            Err(SpreaderError::PlayerNotAssigned(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_server_reclaims_its_workers() {
        let cfg = config(vec![server(28015, 2), server(28016, 1)], 3);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();
        spreader.inner.tick();
        assert_eq!(assigned_counts(&spreader), vec![2, 1]);

        let mut smaller = cfg.clone();
        smaller.servers.remove(0);
        spreader.on_config_changed(&smaller);

        assert_eq!(spreader.units().len(), 1);
        assert!(spreader.unit("198.51.100.7:28015").is_none());

        // Let the reclaim tasks register their timers before moving the
        // clock.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        // Both workers of the removed server are free again.
        assert_eq!(spreader.pool().free_count(), 2);
        assert_eq!(spreader.pool().taken_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_server_unknown_is_an_error() {
        let spreader = Spreader::new(PathBuf::from("/nonexistent/joiner"));
        assert!(matches!(
            spreader.remove_server("10.0.0.1:1"),
            Err(SpreaderError::ServerNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_taken_identity_is_reclaimed_and_dropped() {
        let cfg = config(vec![server(28015, 2)], 2);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();
        spreader.inner.tick();
        assert_eq!(spreader.pool().taken_count(), 2);

        let mut smaller = cfg.clone();
        let gone = smaller.accounts.remove(0);
        spreader.on_config_changed(&smaller);

        // Let the reclaim task register its timer before moving the clock.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;

        // The revoked identity is neither free nor taken; the other one
        // is still assigned.
        assert!(!spreader.pool().is_free(&gone.username));
        assert!(!spreader.pool().is_taken(&gone.username));
        assert_eq!(spreader.pool().taken_count(), 1);
        assert_eq!(assigned_counts(&spreader), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn released_worker_can_move_to_another_unit() {
        let cfg = config(vec![server(28015, 1), server(28016, 1)], 2);
        let spreader = Spreader::new(cfg.joiner_bin.clone());
        spreader.on_config_changed(&cfg);
        spreader.start();
        spreader.inner.tick();
        assert_eq!(assigned_counts(&spreader), vec![1, 1]);

        // Free a slot on the second unit, then remove a worker from the
        // first; on the next tick it may land on either open slot.
        let second = spreader.unit("198.51.100.7:28016").unwrap();
        let departing = second.players().into_iter().next().unwrap();
        spreader.push_player(&departing).unwrap();

        spreader.inner.tick();
        assert_eq!(assigned_counts(&spreader).iter().sum::<usize>(), 2);
        assert_eq!(spreader.pool().free_count(), 0);
    }
}
