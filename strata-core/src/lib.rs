#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod error;

pub use error::{Result, StrataError};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Fragment size used when splitting an oversized packet body.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE / 2;

/// Period of the pending-request timeout sweep.
pub const REQUEST_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Fallback deadline for synchronous requests that carry no timeout of their own.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Delay between outbound reconnect attempts.
pub const RECONNECT_INTERVAL_MS: u64 = 3_000;
