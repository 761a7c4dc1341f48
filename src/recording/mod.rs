//! Recording sessions: entry assembly and lifecycle

mod assembler;
mod entry;
mod session;

pub use assembler::{duration_ms, prepare, PreparedExchange, Sequencer};
pub use entry::{
    compact_timestamp, default_scenario_name, iso_timestamp, Entry, RequestRecord, ResponseRecord,
    SessionRecord,
};
pub use session::{SessionController, SessionOptions, SessionState, StopReport};

/// Default number of exchanges assembled concurrently
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Default grace period for in-flight exchanges on stop
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2000;
