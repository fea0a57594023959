//! Constants for tollgate
//!
//! Default values shared by configuration, the guard and the HTTP glue.

use std::time::Duration;

// ============================================================================
// KEYS
// ============================================================================

/// Default namespace for rate limit counters and windows.
pub const DEFAULT_RATE_KEY_PREFIX: &str = "tollgate:rl";

/// Default namespace for idempotency records and locks.
pub const DEFAULT_IDEMPOTENCY_KEY_PREFIX: &str = "tollgate:idem";

/// Maximum length of a key namespace prefix.
pub const MAX_KEY_PREFIX_LEN: usize = 64;

/// Number of hex characters of the SHA-256 digest kept in a scoped key.
pub const SCOPED_DIGEST_HEX_LEN: usize = 32;

/// Identity used for per-caller scoping when no caller is known.
pub const ANONYMOUS_CALLER: &str = "anon";

// ============================================================================
// IDEMPOTENCY
// ============================================================================

/// Header carrying the client-supplied idempotency key.
pub const DEFAULT_IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Response header set on replayed responses.
pub const IDEMPOTENCY_REPLAY_HEADER: &str = "X-Idempotency-Replay";

/// Default time a completed result is kept for replay (24 hours).
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time an in-flight lock may outlive a crashed holder.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Methods that are deduplicated unless configured otherwise.
pub const DEFAULT_IDEMPOTENT_METHODS: &[&str] = &["POST", "PATCH"];

// ============================================================================
// STORE
// ============================================================================

/// Interval between sweeps of expired entries in the in-memory store.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on a single round trip to a shared store.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);
