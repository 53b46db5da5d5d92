//! Agent runtime: the [`Harness`] loop and its supporting modules.
//!
//! - [`harness::Harness`]: the bounded tool-use loop. Start here.
//! - [`config::HarnessConfig`]: model, limits, timeouts, and the
//!   `[compaction]` table.
//! - [`events`]: [`EventHandler`] trait and [`LoopEvent`] enum for
//!   observing the loop. Includes [`LoggingHandler`],
//!   [`CompositeEventHandler`], and [`FnEventHandler`].
//! - [`session`]: [`Session`], [`SessionHandle`], and the [`MessageStore`].
//! - [`persistence`]: the [`MessagePersistence`] boundary and its in-memory
//!   and JSON-file backends.

pub mod config;
pub mod events;
pub mod execution;
pub mod harness;
pub mod persistence;
pub mod session;

// Re-export commonly used items at the module level.
pub use config::{CompactionConfig, HarnessConfig};
pub use events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, LoopEvent, NoopHandler,
    RunOutcome,
};
pub use harness::Harness;
pub use persistence::{InMemoryPersistence, JsonFilePersistence, MessagePersistence};
pub use session::{MessageStore, Session, SessionHandle, SessionLease};
