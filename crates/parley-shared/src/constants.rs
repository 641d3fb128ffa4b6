/// Protocol version advertised by the client.
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Default number of messages fetched per history page.
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 30;

/// Upper bound accepted for a single history page.
pub const MAX_HISTORY_PAGE_SIZE: usize = 200;

/// Default bound on a single transport round trip, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Maximum file size accepted for a file send (25 MiB).
pub const MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;

/// Maximum text body length, in characters.
pub const MAX_TEXT_LENGTH: usize = 5_000;

/// Buffer size of a per-channel inbound event subscription.
pub const DEFAULT_EVENT_BUFFER: usize = 256;
