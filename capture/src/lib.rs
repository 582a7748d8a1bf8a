//! Live profiling-trace capture and reconstruction.
//!
//! A [`session::Session`] speaks the wire protocol to an instrumented
//! client: handshake, lz4 block stream, and the credit-limited query
//! channel. Decoded records flow through [`dispatch::Ingest`], which
//! rebuilds the trace as a [`model::TraceModel`] readable mid-capture
//! through a [`session::CaptureHandle`]. Finished captures round-trip
//! through the versioned file format in [`capfile`].

pub mod block;
pub mod capfile;
pub mod dispatch;
pub mod error;
pub mod interner;
pub mod model;
pub mod query;
pub mod session;
pub mod stats;
pub mod transport;

pub use dispatch::{Ingest, MemFreePolicy};
pub use error::{CaptureError, Result, StreamFailure};
pub use model::TraceModel;
pub use session::{CaptureHandle, Connect, Session, SessionConfig, SessionOutcome};
pub use stats::{build_statistics, Statistics};
pub use transport::Transport;
