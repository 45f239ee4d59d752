//! Retry manager with linear backoff
//!
//! Bounded auto-retry for transient failures of idempotent tools:
//! - Max attempts: 3 re-invocations by default
//! - Delay: base × attempt number, capped
//! - Stops at the first successful attempt
//! - Stops early when a retry fails with a non-transient error

use crate::config::RetryConfig;
use crate::tools::types::{ToolResult, ToolSchema};
use regex::RegexSet;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::sleep;

/// Maximum number of retry attempts
pub const MAX_RETRIES: u32 = 3;

/// Base delay for linear backoff
const BASE_DELAY_MS: u64 = 500;

/// Maximum delay cap
const MAX_DELAY_MS: u64 = 5000;

/// Error wording that indicates a temporary external condition
const TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)database (is )?locked",
    r"(?i)\block(ed)?\b.*\b(held|busy|contention|timeout)",
    r"(?i)resource (is )?(temporarily )?(busy|unavailable)",
    r"(?i)temporar(il)?y unavailable",
    r"(?i)service unavailable",
    r"(?i)\b(429|502|503|504)\b",
    r"(?i)too many requests",
    r"(?i)rate limit",
    r"(?i)connection (was )?(reset|aborted|closed)",
    r"(?i)broken pipe",
    r"(?i)\beagain\b",
    r"(?i)try again",
    r"(?i)timed? ?out",
    r"(?i)deadline exceeded",
];

fn transient_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        // Patterns are compile-time constants covered by tests
        RegexSet::new(TRANSIENT_PATTERNS).unwrap_or_else(|_| RegexSet::empty())
    })
}

/// Whether an error message matches the transient pattern list
pub fn is_transient_error(message: &str) -> bool {
    transient_set().is_match(message)
}

/// What the retry loop did
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// Final result (the last attempt's, or the first successful one)
    pub result: ToolResult,

    /// Number of re-invocations performed
    pub attempts: u32,

    pub succeeded: bool,
}

/// Retry manager with linear backoff
#[derive(Debug, Clone)]
pub struct RetryManager {
    /// Maximum retry attempts
    max_retries: u32,

    /// Base delay in milliseconds
    base_delay_ms: u64,

    /// Maximum delay cap in milliseconds
    max_delay_ms: u64,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryManager {
    /// Create new retry manager with default settings
    pub fn new() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
        }
    }

    /// Create retry manager with custom settings
    pub fn with_config(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms: MAX_DELAY_MS.max(base_delay_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Whether a failed result may be retried at all
    ///
    /// Only read-only tools outside side-effecting categories qualify, and
    /// only for transient wording. Timeouts are never retried.
    pub fn is_eligible(&self, schema: &ToolSchema, result: &ToolResult) -> bool {
        if self.max_retries == 0 || result.success() || !schema.is_retry_candidate() {
            return false;
        }
        let status = result.status().to_ascii_lowercase();
        if status == "timeout" || status == "timed_out" {
            return false;
        }
        result.error().map(is_transient_error).unwrap_or(false)
    }

    /// Re-invoke an operation until it succeeds, the ceiling is reached, or
    /// a retry fails for a non-transient reason
    ///
    /// `initial` is the failed result that triggered the retry; the closure
    /// receives the 1-based attempt number.
    pub async fn retry<F, Fut>(&self, initial: ToolResult, mut operation: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = ToolResult>,
    {
        let mut last = initial;
        let mut attempt = 0;

        while attempt < self.max_retries {
            attempt += 1;

            let delay = self.calculate_delay(attempt);
            tracing::debug!(
                tool = %last.tool(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure"
            );
            sleep(delay).await;

            let result = operation(attempt).await;
            if result.success() {
                return RetryOutcome {
                    result,
                    attempts: attempt,
                    succeeded: true,
                };
            }

            let still_transient = result.error().map(is_transient_error).unwrap_or(false);
            last = result;
            if !still_transient {
                break;
            }
        }

        RetryOutcome {
            result: last,
            attempts: attempt,
            succeeded: false,
        }
    }

    /// Calculate delay for given attempt number
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let linear_delay = self.base_delay_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(linear_delay.min(self.max_delay_ms))
    }

    /// Calculate total maximum wait time
    pub fn max_total_wait_time(&self) -> Duration {
        (1..=self.max_retries)
            .map(|attempt| self.calculate_delay(attempt))
            .sum()
    }

    /// Get max retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
