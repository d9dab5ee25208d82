//! Retry and error recovery utilities for RPC calls and transaction submission
//!
//! Provides exponential backoff, gas bumping, and classification of node /
//! contract error strings into recoverable and terminal classes.

use std::time::Duration;

use crate::error::ChainError;

/// Retry configuration shared by the listener and the writer
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Gas price bump percentage per underpriced retry
    pub gas_bump_percent: u32,
    /// Maximum gas price multiplier (e.g., 3 = 3x original)
    pub max_gas_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            gas_bump_percent: 20, // 20% gas increase per retry
            max_gas_multiplier: 3.0,
        }
    }
}

impl RetryConfig {
    /// Retry policy with a fixed attempt budget and base interval
    pub fn with_limit(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: initial_backoff.max(Duration::from_secs(60)),
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Calculate gas price for a given attempt
    pub fn gas_price_for_attempt(&self, base_gas_price: u128, attempt: u32) -> u128 {
        if attempt == 0 {
            return base_gas_price;
        }

        let multiplier = 1.0 + (self.gas_bump_percent as f64 / 100.0) * (attempt as f64);
        let capped_multiplier = multiplier.min(self.max_gas_multiplier);

        (base_gas_price as f64 * capped_multiplier) as u128
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues)
    Transient,
    /// Transaction underpriced - retry with higher gas
    Underpriced,
    /// Nonce consumed by a concurrent or earlier transaction - refresh and retry
    NonceTooLow,
    /// Nonce too high - wait for pending transactions
    NonceTooHigh,
    /// Proposal no longer actionable, or the account cannot pay - do not retry
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

impl ErrorClass {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Underpriced => "underpriced",
            ErrorClass::NonceTooLow => "nonce_too_low",
            ErrorClass::NonceTooHigh => "nonce_too_high",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Transient errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    // Gas price errors
    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    // Nonce errors
    if error_lower.contains("nonce too low")
        || error_lower.contains("already known")
        || error_lower.contains("already been processed")
    {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooHigh;
    }

    // Permanent errors, including bridge contract reverts for stale proposals
    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("proposal already passed")
        || error_lower.contains("proposal already executed")
        || error_lower.contains("proposal already cancelled")
        || error_lower.contains("relayer already voted")
        || error_lower.contains("must have passed status")
        || error_lower.contains("doesn't have relayer role")
        || error_lower.contains("not mapped to handler")
        || error_lower.contains("data doesn't match datahash")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Classify a runtime error for retry decisions
pub fn classify(error: &ChainError) -> ErrorClass {
    match error {
        ChainError::Rpc(msg) | ChainError::Submission(msg) => classify_error(msg),
        ChainError::Closed => ErrorClass::Permanent,
        ChainError::Decode(_) | ChainError::Config(_) | ChainError::Keystore(_) => {
            ErrorClass::Permanent
        }
        _ => ErrorClass::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_with_limit() {
        let config = RetryConfig::with_limit(3, Duration::from_millis(10));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(10));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(20));
    }

    #[test]
    fn test_gas_bump() {
        let config = RetryConfig::default();
        let base = 1_000_000_000u128; // 1 gwei

        assert_eq!(config.gas_price_for_attempt(base, 0), base);
        assert_eq!(config.gas_price_for_attempt(base, 1), 1_200_000_000); // +20%
        assert_eq!(config.gas_price_for_attempt(base, 2), 1_400_000_000); // +40%
        assert_eq!(config.gas_price_for_attempt(base, 10), 3_000_000_000); // capped at 3x
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Underpriced
        );
        assert_eq!(classify_error("nonce too low"), ErrorClass::NonceTooLow);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_bridge_reverts_are_permanent() {
        for msg in [
            "proposal already passed/executed/cancelled",
            "relayer already voted",
            "Proposal must have Passed status",
            "sender doesn't have relayer role",
            "insufficient funds for gas * price + value",
        ] {
            assert_eq!(classify_error(msg), ErrorClass::Permanent, "{}", msg);
            assert!(!classify_error(msg).is_recoverable());
        }
    }

    #[test]
    fn test_nonce_races_are_recoverable() {
        assert!(classify_error("nonce too low").is_recoverable());
        assert!(classify_error("nonce too high").is_recoverable());
        assert!(classify_error("already known").is_recoverable());
    }

    #[test]
    fn test_classify_chain_error() {
        assert_eq!(
            classify(&ChainError::Rpc("request timed out".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ChainError::Submission("execution reverted".into())),
            ErrorClass::Permanent
        );
        assert_eq!(classify(&ChainError::Closed), ErrorClass::Permanent);
    }
}
