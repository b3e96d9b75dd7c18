/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum length of a member or context name in bytes
pub const MAX_NAME_LEN: usize = 256;

/// Maximum payload of a single talk message in bytes (60 KiB)
pub const MAX_TALK_CHUNK: usize = 60 * 1024;

/// Default talk chunk size used when splitting outbound discourse data
pub const DEFAULT_TALK_CHUNK: usize = 4 * 1024;

/// Default discourse subscription window in seconds
pub const DEFAULT_DISCOURSE_WINDOW_SECS: u64 = 10;

/// Seconds before expiry at which a kept-alive subscription is renewed
pub const DEFAULT_KEEP_ALIVE_MARGIN_SECS: u64 = 2;

/// Record label prefixes per context type
pub const LABEL_PREFIX_CHAT: &str = "chat";
pub const LABEL_PREFIX_CONTACT: &str = "contact";
pub const LABEL_PREFIX_GROUP: &str = "group";
