//! Wire-level building blocks: decoding, retry decisions, transport, and usage.
//!
//! These modules handle everything between the
//! [`StreamSession`](crate::session::StreamSession) loop and the emitter:
//!
//! - [`decoder`]: incremental parser for blank-line-terminated `data:`
//!   records. Produces [`TaggedEvent`](decoder::TaggedEvent) values and
//!   survives records split across network reads.
//! - [`retry`]: failure classification (`529`, "overloaded", gateway timeout
//!   markers) and the stateless [`ReconnectPolicy`] with exponential backoff.
//! - [`transport`]: the [`Transport`](transport::Transport) /
//!   [`Connection`](transport::Connection) seam and the reqwest-backed
//!   [`HttpTransport`](transport::HttpTransport).
//! - [`usage`]: per-run [`Usage`](usage::Usage), process-wide
//!   [`UsageTotals`](usage::UsageTotals), the persistent [`UsageStore`] and the
//!   [`UsageAggregator`] that feeds it.

pub mod decoder;
pub mod retry;
pub mod transport;
pub mod usage;

// Re-export commonly used items at the module level.
pub use decoder::{Event, EventDecoder, TaggedEvent};
pub use retry::{Decision, Failure, FailureKind, ReconnectPolicy};
pub use transport::{Connection, HttpTransport, Transport, TransportError};
pub use usage::{Usage, UsageAggregator, UsageStore, UsageTotals};
