//! Per-server capacity unit: assigned lifecycles and live stats.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use decoy_core::{BotAccount, ServerSpec};
use decoy_joiner::{ConnectionState, PlayerJoiner};

/// Live stats for one server, pushed on every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Lifecycles currently in `Playing`. Not merely "assigned".
    pub active: usize,
}

/// Stats bookkeeping for one assigned lifecycle, shared between its
/// watcher and the unit. All mutation happens under the one lock, so the
/// watcher and a concurrent detach can never both account for the same
/// Playing edge.
#[derive(Debug, Default)]
struct Counted {
    /// Currently counted in `active`.
    playing: bool,
    /// The lifecycle has been detached; the watcher must not touch the
    /// stats channel anymore.
    detached: bool,
}

/// One assigned lifecycle plus its stats watcher.
struct Assigned {
    joiner: PlayerJoiner,
    /// Background task folding state events into the stats channel.
    watcher: JoinHandle<()>,
    counted: Arc<Mutex<Counted>>,
}

/// Capacity bookkeeping for one target server.
///
/// Capacity is the server's roster length; the unit is full when as many
/// lifecycles are assigned as the roster has entries. The allocator never
/// assigns beyond that.
pub struct ServerUnit {
    spec: ServerSpec,
    joiner_bin: PathBuf,
    players: Mutex<Vec<Assigned>>,
    stats_tx: watch::Sender<ServerStats>,
}

impl ServerUnit {
    pub fn new(spec: ServerSpec, joiner_bin: PathBuf) -> Self {
        let (stats_tx, _) = watch::channel(ServerStats::default());
        Self {
            spec,
            joiner_bin,
            players: Mutex::new(Vec::new()),
            stats_tx,
        }
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn key(&self) -> String {
        self.spec.key()
    }

    /// True iff no roster slot remains unassigned.
    pub fn is_full(&self) -> bool {
        self.players.lock().unwrap().len() >= self.spec.capacity()
    }

    pub fn assigned_count(&self) -> usize {
        self.players.lock().unwrap().len()
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> ServerStats {
        *self.stats_tx.borrow()
    }

    /// Subscribe to stats changes. Push-based; receivers see every send.
    pub fn subscribe_stats(&self) -> watch::Receiver<ServerStats> {
        self.stats_tx.subscribe()
    }

    /// Assigned lifecycles, in assignment order.
    pub fn players(&self) -> Vec<PlayerJoiner> {
        self.players
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.joiner.clone())
            .collect()
    }

    /// Create and start a lifecycle for `account` on this server.
    ///
    /// Assigning onto a full unit is a scheduling bug: loud in debug
    /// builds, `None` in production.
    pub fn assign(&self, account: BotAccount) -> Option<PlayerJoiner> {
        let mut players = self.players.lock().unwrap();
        if players.len() >= self.spec.capacity() {
            debug_assert!(false, "assign onto full unit {}", self.key());
            warn!(server = %self.spec.label(), "assign onto full unit ignored");
            return None;
        }

        let joiner = PlayerJoiner::new(account.clone(), self.spec.clone(), self.joiner_bin.clone());
        let counted = Arc::new(Mutex::new(Counted::default()));
        let watcher = tokio::spawn(watch_states(
            joiner.subscribe(),
            self.stats_tx.clone(),
            counted.clone(),
        ));

        debug!(
            account = %account.username,
            server = %self.spec.label(),
            "bot assigned"
        );
        joiner.connect_with_jittered_delay();

        players.push(Assigned {
            joiner: joiner.clone(),
            watcher,
            counted,
        });
        Some(joiner)
    }

    /// Remove a lifecycle from the assigned set and stop its timers.
    ///
    /// Does not touch the pool; the caller decides when (and whether) the
    /// identity becomes reusable.
    pub fn unassign(&self, joiner: &PlayerJoiner) -> bool {
        match self.detach(joiner) {
            Some(assigned) => {
                assigned.joiner.cancel_timers();
                true
            }
            None => false,
        }
    }

    /// Forced removal: detach, terminate, and return the grace delay after
    /// which the identity may be considered reusable. `None` if the
    /// lifecycle is not assigned here.
    pub fn remove_player(&self, joiner: &PlayerJoiner) -> Option<Duration> {
        let assigned = self.detach(joiner)?;
        Some(assigned.joiner.kick())
    }

    /// Forcibly remove every assigned lifecycle, returning each with its
    /// grace delay. Used by the stop/reclaim protocol.
    pub fn drain(&self) -> Vec<(PlayerJoiner, Duration)> {
        let drained: Vec<Assigned> = self.players.lock().unwrap().drain(..).collect();
        drained
            .into_iter()
            .map(|assigned| {
                self.settle(&assigned);
                let grace = assigned.joiner.kick();
                (assigned.joiner, grace)
            })
            .collect()
    }

    /// Pull one lifecycle out of the assigned set and settle its stats.
    fn detach(&self, joiner: &PlayerJoiner) -> Option<Assigned> {
        let mut players = self.players.lock().unwrap();
        let idx = players
            .iter()
            .position(|a| a.joiner.account().username == joiner.account().username)?;
        let assigned = players.remove(idx);
        drop(players);
        self.settle(&assigned);
        Some(assigned)
    }

    /// Stop the watcher and take the lifecycle out of the active count if
    /// it was in it. Marking the bookkeeping detached under the lock makes
    /// this exactly-once against the watcher's own updates: an abort that
    /// lands late cannot let the watcher count a straggling event.
    fn settle(&self, assigned: &Assigned) {
        assigned.watcher.abort();
        let mut counted = assigned.counted.lock().unwrap();
        counted.detached = true;
        if counted.playing {
            counted.playing = false;
            self.stats_tx.send_modify(|s| s.active = s.active.saturating_sub(1));
        }
    }
}

impl std::fmt::Debug for ServerUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerUnit")
            .field("key", &self.spec.key())
            .field("capacity", &self.spec.capacity())
            .field("assigned", &self.assigned_count())
            .finish()
    }
}

/// Fold one lifecycle's state events into the unit stats.
///
/// `active` counts Playing lifecycles only: increment on the edge into
/// Playing, decrement on the edge out of it.
async fn watch_states(
    mut events: broadcast::Receiver<decoy_joiner::StateEvent>,
    stats_tx: watch::Sender<ServerStats>,
    counted: Arc<Mutex<Counted>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let playing = event.state == ConnectionState::Playing;
                let mut counted = counted.lock().unwrap();
                if counted.detached {
                    break;
                }
                if playing && !counted.playing {
                    counted.playing = true;
                    stats_tx.send_modify(|s| s.active += 1);
                } else if !playing && counted.playing {
                    counted.playing = false;
                    stats_tx.send_modify(|s| s.active = s.active.saturating_sub(1));
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "stats watcher lagged behind state events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
