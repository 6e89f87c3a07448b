/// Upstream statuses worth re-sending a request for.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[500, 502, 503, 504];

/// Upstream timeouts, in seconds
pub const STREAM_TIMEOUT_SECS: u64 = 70;
pub const CHAT_TIMEOUT_SECS: u64 = 50;
pub const SEARCH_TIMEOUT_SECS: u64 = 10;
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Bound on how long a relay waits for the persistence summary.
pub const RENDEZVOUS_TIMEOUT_SECS: u64 = 30;

/// Outbound frame buffer between the relay task and the client body.
pub const RELAY_CHANNEL_CAPACITY: usize = 100;

/// Upper bound on unparsed upstream bytes held by the frame codec.
pub const MAX_FRAME_BUFFER_BYTES: usize = 16 * 1024 * 1024;

/// Context window
pub const CONTEXT_WINDOW_MESSAGES: i64 = 12;
pub const CONTEXT_WINDOW_MINUTES: i64 = 2;

/// Pagination
pub const DEFAULT_PAGE_LIMIT: i64 = 10;
pub const MAX_PAGE_LIMIT: i64 = 30;

/// Staged recipe profiles hold at most this many values.
pub const MAX_RECIPE_STEPS: usize = 8;

/// Generic messages surfaced to clients in terminal error frames
pub const DECODE_ERROR_MESSAGE: &str = "Failed to decode JSON";
pub const TIMEOUT_ERROR_MESSAGE: &str = "Request timed out. Please try again later.";
pub const PERSIST_TIMEOUT_MESSAGE: &str = "Timed out waiting for the response to be saved";
pub const PERSIST_FAILED_MESSAGE: &str = "The response could not be saved";

/// Machine type sent upstream when the client does not name one.
pub const DEFAULT_MACHINE_TYPE: &str = "default";

pub const TCG_APP_VERSION: &str = "tcg";

/// Bucket the image search service reads query images from.
pub const SEARCH_IMAGE_BUCKET: &str = "zbot-image-input-v1";
pub const DEFAULT_SEARCH_TOP_K: i64 = 1;

/// Database defaults
pub const DB_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DB_MAX_CONNECTIONS: u32 = 8;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
