use std::time::Duration;

/// SCTP port to use by default.
pub const DEFAULT_SCTP_PORT: u16 = 5000;

/// Remote max message size if not specified in the SDP.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;

/// Local max message size.
pub const LOCAL_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Minimum number of workers for the runtime driving the transport stack.
pub const THREADPOOL_SIZE: usize = 4;

/// Timeout for a single TCP connect attempt.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer chunk size for transport reader tasks.
pub(crate) const RECV_CHUNK_SIZE: usize = 8192;
