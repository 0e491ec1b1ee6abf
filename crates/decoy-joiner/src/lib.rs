//! decoy-joiner — the per-bot connection lifecycle.
//!
//! One `PlayerJoiner` drives one (account, server) pair through the
//! connect/play/disconnect cycle by supervising an external joiner
//! process and reacting to its line-oriented output:
//!
//! ```text
//! PlayerJoiner
//!   ├── TimerSlot (connect)     — at most one pending connect delay
//!   ├── TimerSlot (disconnect)  — at most one pending disconnect delay
//!   └── runner task (per invocation)
//!       ├── stdout/stderr pumps → parse_line → apply(signal)
//!       └── child.wait / kill signal
//! ```
//!
//! The `timer` module is the foundation for all timing in the system and
//! `output` is the narrow adapter that keeps the state machine testable
//! without a real process.

pub mod error;
pub mod joiner;
pub mod output;
pub mod probe;
pub mod timer;

pub use error::{JoinerError, JoinerResult};
pub use joiner::{ConnectionState, PlayerJoiner, StateEvent};
pub use output::{parse_line, JoinerSignal};
pub use probe::probe_server;
pub use timer::{DelayedTask, TimerSlot};
