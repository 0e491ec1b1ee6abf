//! decoy-spreader — converging the account pool onto the server set.
//!
//! ```text
//! Spreader (1 s tick)
//!   ├── AccountPool            — free/taken identity bookkeeping
//!   └── ServerUnit (per server)
//!       ├── assigned PlayerJoiners (≤ capacity)
//!       └── ServerStats watch channel (push-based)
//! ```
//!
//! The tick is a greedy single-pass fill: under-capacity units pull free
//! identities from the pool until they are full or the pool runs dry.
//! Workers never migrate between units; they only return to the pool
//! through an explicit removal, each with its own grace delay.

pub mod error;
pub mod pool;
pub mod spreader;
pub mod unit;

pub use error::{SpreaderError, SpreaderResult};
pub use pool::AccountPool;
pub use spreader::Spreader;
pub use unit::{ServerStats, ServerUnit};
