//! The per-bot connection lifecycle.
//!
//! A `PlayerJoiner` owns one (account, server) pair and drives it through
//! connect/play/disconnect by supervising the external joiner process.
//! All waiting is expressed as timer slots; the only long-lived execution
//! context is the runner task that lives for one process invocation.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use decoy_core::{BotAccount, ServerSpec};

use crate::output::{parse_line, JoinerSignal};
use crate::timer::TimerSlot;

/// Backoff used when a connect fires while the previous invocation has not
/// finished tearing down yet.
const IN_FLIGHT_RETRY: Duration = Duration::from_millis(100);

/// Capacity of the state-event channel; slow subscribers lag, they never
/// block the lifecycle.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Connection phases of one joiner invocation.
///
/// `Disconnected` is both the initial and the terminal state; a lifecycle
/// can be re-armed from it with a new connect request. The intermediate
/// phases are driven by the joiner's own output, not by local logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ConnectingToSteam,
    LaunchingRust,
    Joining,
    Playing,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::ConnectingToSteam => "connecting to steam",
            ConnectionState::LaunchingRust => "launching rust",
            ConnectionState::Joining => "joining",
            ConnectionState::Playing => "playing",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// One state change, as published on the lifecycle's event channel.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub state: ConnectionState,
    /// Best-effort reason on transitions into `Disconnected`.
    pub reason: Option<String>,
}

/// The connection lifecycle for one (account, server) pair.
#[derive(Debug, Clone)]
pub struct PlayerJoiner {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    account: BotAccount,
    server: ServerSpec,
    joiner_bin: PathBuf,
    state: Mutex<ConnectionState>,
    /// Server name as the joiner observed it in the connected marker.
    observed_name: Mutex<Option<String>>,
    /// A joiner invocation is in flight (launch through process exit).
    in_flight: AtomicBool,
    /// Set once the lifecycle has been kicked. A retired lifecycle never
    /// launches another invocation, even if a connect firing slipped past
    /// the timer cancellation.
    retired: AtomicBool,
    /// Kill signal for the current invocation, if one is running.
    kill_tx: Mutex<Option<watch::Sender<bool>>>,
    connect_slot: TimerSlot,
    disconnect_slot: TimerSlot,
    events: broadcast::Sender<StateEvent>,
}

impl PlayerJoiner {
    pub fn new(account: BotAccount, server: ServerSpec, joiner_bin: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                account,
                server,
                joiner_bin,
                state: Mutex::new(ConnectionState::Disconnected),
                observed_name: Mutex::new(None),
                in_flight: AtomicBool::new(false),
                retired: AtomicBool::new(false),
                kill_tx: Mutex::new(None),
                connect_slot: TimerSlot::new(),
                disconnect_slot: TimerSlot::new(),
                events,
            }),
        }
    }

    pub fn account(&self) -> &BotAccount {
        &self.inner.account
    }

    pub fn server(&self) -> &ServerSpec {
        &self.inner.server
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Server name captured from the connected marker, if any.
    pub fn observed_server_name(&self) -> Option<String> {
        self.inner.observed_name.lock().unwrap().clone()
    }

    /// Subscribe to state changes. Every transition is published; slow
    /// receivers lag rather than block the lifecycle.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    /// Schedule a connect after `delay`, superseding any pending connect.
    pub fn connect_with_delay(&self, delay: Duration) {
        self.inner.schedule_connect(delay);
    }

    /// Schedule a connect after a random delay from the enter range.
    pub fn connect_with_jittered_delay(&self) {
        let delay = self.inner.server.timings.enter_delay();
        self.inner.schedule_connect(delay);
    }

    /// Schedule a disconnect after `delay`, superseding any pending
    /// disconnect.
    pub fn disconnect_with_delay(&self, delay: Duration) {
        self.inner.schedule_disconnect(delay);
    }

    /// Schedule a disconnect after a random delay from the exit range.
    pub fn disconnect_with_jittered_delay(&self) {
        let delay = self.inner.server.timings.exit_delay();
        self.inner.schedule_disconnect(delay);
    }

    /// Forced removal: retire the lifecycle, cancel everything pending,
    /// terminate the current invocation, and return the grace delay after
    /// which the identity may be considered reusable.
    ///
    /// A kicked lifecycle can never launch a connector again; the owning
    /// unit creates a fresh lifecycle when the identity comes back.
    pub fn kick(&self) -> Duration {
        self.inner.retired.store(true, Ordering::SeqCst);
        self.inner.connect_slot.cancel();
        self.inner.disconnect_slot.cancel();
        // Kill regardless of state: an invocation between spawn and its
        // first state transition must not outlive the kick.
        self.inner.terminate();
        self.inner.server.timings.reconnect_delay()
    }

    /// Whether a connect is currently scheduled.
    pub fn connect_pending(&self) -> bool {
        self.inner.connect_slot.is_pending()
    }

    /// Cancel both pending timers without touching a running invocation.
    pub fn cancel_timers(&self) {
        self.inner.connect_slot.cancel();
        self.inner.disconnect_slot.cancel();
    }

    /// Feed one parsed output signal into the state machine.
    ///
    /// This is the seam between process plumbing and transition logic; the
    /// output pumps call it, and tests can drive the lifecycle through it
    /// directly.
    pub fn apply(&self, signal: &JoinerSignal) {
        self.inner.apply(signal);
    }
}

impl Inner {
    /// Install (or replace) the pending connect timer.
    fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        let inner = self.clone();
        self.connect_slot.replace(delay, async move {
            inner.try_connect();
        });
    }

    /// Connect-timer firing: start an invocation, unless one is still in
    /// flight, in which case re-arm with a short fixed backoff. This guards
    /// against launching twice while a previous teardown is finishing.
    fn try_connect(self: &Arc<Self>) {
        if self.retired.load(Ordering::SeqCst) {
            debug!(
                account = %self.account.username,
                "lifecycle retired, connect dropped"
            );
            return;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                account = %self.account.username,
                "joiner still in flight, deferring connect"
            );
            self.schedule_connect(IN_FLIGHT_RETRY);
            return;
        }
        tokio::spawn(self.clone().run_joiner());
    }

    /// Install (or replace) the pending disconnect timer.
    fn schedule_disconnect(self: &Arc<Self>, delay: Duration) {
        let inner = self.clone();
        self.disconnect_slot.replace(delay, async move {
            inner.disconnect_now();
        });
    }

    /// Terminate the current invocation if one is connected.
    ///
    /// No-op when already disconnected or when the process has exited on
    /// its own — the disconnect path must be idempotent.
    fn disconnect_now(&self) {
        if *self.state.lock().unwrap() == ConnectionState::Disconnected {
            return;
        }
        self.terminate();
    }

    /// Send the kill signal for the current invocation, if one is running,
    /// no matter how far it has progressed.
    fn terminate(&self) {
        if let Some(tx) = self.kill_tx.lock().unwrap().as_ref() {
            let _ = tx.send(true);
        }
    }

    /// One joiner invocation: spawn the process, pump its output, wait for
    /// exit (or a kill request), then settle back into `Disconnected`.
    async fn run_joiner(self: Arc<Self>) {
        let (kill_tx, mut kill_rx) = watch::channel(false);
        *self.kill_tx.lock().unwrap() = Some(kill_tx);

        // The kill signal is installed; a kick from here on reaches this
        // invocation. A kick that landed earlier is caught right now.
        if self.retired.load(Ordering::SeqCst) {
            self.kill_tx.lock().unwrap().take();
            self.in_flight.store(false, Ordering::SeqCst);
            return;
        }

        let mut cmd = Command::new(&self.joiner_bin);
        cmd.args(self.joiner_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.joiner_bin.parent() {
            if !dir.as_os_str().is_empty() {
                cmd.current_dir(dir);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    account = %self.account.username,
                    joiner = %self.joiner_bin.display(),
                    error = %e,
                    "failed to spawn joiner"
                );
                self.kill_tx.lock().unwrap().take();
                self.set_state(
                    ConnectionState::Disconnected,
                    Some(format!("spawn failed: {e}")),
                );
                self.in_flight.store(false, Ordering::SeqCst);
                return;
            }
        };

        self.set_state(ConnectionState::ConnectingToSteam, None);

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(self.clone().pump_output(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(self.clone().pump_output(stderr, "stderr")));
        }

        loop {
            tokio::select! {
                _ = child.wait() => break,
                _ = kill_rx.changed() => {
                    debug!(account = %self.account.username, "killing joiner process");
                    // kill() also reaps; the next wait() returns immediately.
                    if let Err(e) = child.kill().await {
                        debug!(account = %self.account.username, error = %e, "kill failed");
                    }
                }
            }
        }

        // Drain buffered output before settling the final state.
        for pump in pumps {
            let _ = pump.await;
        }

        self.kill_tx.lock().unwrap().take();
        self.set_state(ConnectionState::Disconnected, Some("Quitting".to_string()));
        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Forward joiner output to the log and feed recognized markers into
    /// the state machine.
    async fn pump_output<R>(self: Arc<Self>, reader: R, stream: &'static str)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(
                account = %self.account.username,
                stream,
                line = %line,
                "joiner output"
            );
            if let Some(signal) = parse_line(&line) {
                self.apply(&signal);
            }
        }
    }

    fn apply(&self, signal: &JoinerSignal) {
        match signal {
            JoinerSignal::Connected(name) => {
                *self.observed_name.lock().unwrap() = Some(name.clone());
                self.set_state(ConnectionState::Playing, None);
            }
            JoinerSignal::AttemptFailed => {
                self.set_state(
                    ConnectionState::Disconnected,
                    Some("Connection Attempt Failed".to_string()),
                );
            }
            JoinerSignal::Restarting => {
                self.set_state(
                    ConnectionState::Disconnected,
                    Some("Server Restarting".to_string()),
                );
            }
        }
    }

    /// Apply a state transition. Same-state writes are dropped so every
    /// published event is a real change.
    fn set_state(&self, new: ConnectionState, reason: Option<String>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == new {
                return;
            }
            *state = new;
        }

        match new {
            ConnectionState::Playing => info!(
                account = %self.account.username,
                server = %self.server.label(),
                "connected"
            ),
            ConnectionState::Disconnected => info!(
                account = %self.account.username,
                server = %self.server.label(),
                reason = reason.as_deref().unwrap_or("unknown"),
                "disconnected"
            ),
            _ => debug!(
                account = %self.account.username,
                state = %new,
                "state change"
            ),
        }

        // Nobody listening is fine.
        let _ = self.events.send(StateEvent { state: new, reason });
    }

    /// Positional arguments for the joiner executable:
    /// `username password address port "" -pid <manager pid>` plus `-hide`
    /// in release builds.
    fn joiner_args(&self) -> Vec<String> {
        let mut args = vec![
            self.account.username.clone(),
            self.account.password.clone(),
            self.server.address.clone(),
            self.server.port.to_string(),
            String::new(),
            "-pid".to_string(),
            std::process::id().to_string(),
        ];
        if !cfg!(debug_assertions) {
            args.push("-hide".to_string());
        }
        args
    }
}
