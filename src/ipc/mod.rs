//! IPC envelopes and newline-delimited JSON framing shared by the CLI,
//! daemon, and worker processes (spec.md §4.5, §6.5).

pub mod client;
pub mod protocol;
pub mod transport;

pub use protocol::{ClientRequest, ClientResponse, IpcError, ResponseStatus, WorkerReady, WorkerRequest, WorkerResponse};
pub use transport::{FramedReader, FramedWriter, IpcTransportError, MAX_FRAME_SIZE};

/// CLI→daemon request timeout (spec.md §4.5), overridable via
/// `BDG_REQUEST_TIMEOUT_MS`.
pub const CLIENT_REQUEST_TIMEOUT_MS: u64 = 45_000;

/// Default daemon→worker forwarded request timeout (spec.md §4.5). Specific
/// commands may use a shorter deadline (e.g. `peek`/`details` at 5s,
/// `start_session` at 10s).
pub const WORKER_REQUEST_TIMEOUT_MS: u64 = 10_000;
