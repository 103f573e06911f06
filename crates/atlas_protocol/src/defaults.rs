//! Canonical default values shared by the engine, server and CLI.

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_FILE: &str = "atlas.sqlite3";
pub const DEFAULT_CARDS_DIR: &str = "cards";

/// Per-backend call timeout applied uniformly within one dispatch.
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_FAITHFULNESS_WEIGHT: f64 = 0.5;
pub const DEFAULT_PII_WEIGHT: f64 = 0.3;
pub const DEFAULT_DEPTH_WEIGHT: f64 = 0.2;
/// Word count at which the depth heuristic saturates.
pub const DEFAULT_DEPTH_TARGET_WORDS: usize = 200;

pub const DEFAULT_MASK_TOKEN: &str = "[REDACTED]";
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 60;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const CANCELLED_BY_CALLER_MESSAGE: &str = "Cancelled by caller";
pub const NO_VIABLE_CANDIDATE_MESSAGE: &str = "no viable candidate";
