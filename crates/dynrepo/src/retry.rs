//! Retry with backoff for transient database failures
//!
//! The policy is read once from [`RetrySettings`] and cached by the
//! repository. Each attempt gets a fresh command and connection lease from
//! the caller-supplied closure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetrySettings;
use crate::error::{Error, ErrorCategory, Result};

/// Predicate deciding whether an error is worth another attempt
pub type TransientClassifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry behavior
#[derive(Clone)]
pub struct RetryPolicy {
    /// Whether failed attempts are retried at all
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Double the delay on every retry instead of keeping it constant
    pub exponential: bool,
    classifier: Option<TransientClassifier>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("enabled", &self.enabled)
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential", &self.exponential)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            exponential: settings.exponential,
            classifier: None,
        }
    }

    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Install a custom transient-error predicate
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Retries allowed after the first attempt
    pub fn effective_retries(&self) -> u32 {
        if self.enabled {
            self.max_retries
        } else {
            0
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        if !self.exponential {
            return self.base_delay.min(self.max_delay);
        }
        // cap the exponent so the shift cannot overflow
        let factor = 1u32 << (attempt - 1).min(20);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether an error should be retried
    pub fn is_transient(&self, error: &Error) -> bool {
        if let Some(classifier) = &self.classifier {
            if classifier(error) {
                return true;
            }
        }
        error.is_retriable() || error.category() == ErrorCategory::Timeout
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyEngine {
    policy: RetryPolicy,
}

impl RetryPolicyEngine {
    /// Create an engine for a policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Policy in effect
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds, fails permanently or retries run out.
    ///
    /// The closure receives the 1-based attempt number. `max_retries`
    /// overrides the policy when set (zero inside an ambient transaction).
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancellation: &CancellationToken,
        max_retries: Option<u32>,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = max_retries.unwrap_or_else(|| self.policy.effective_retries());
        let mut attempt_number = 0u32;

        loop {
            if cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt_number += 1;

            let error = match attempt(attempt_number).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let retries_used = attempt_number - 1;
            if retries_used >= max_retries || !self.policy.is_transient(&error) {
                return Err(error);
            }

            let delay = self.policy.delay_for_attempt(attempt_number);
            warn!(
                operation,
                attempt = attempt_number,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );

            tokio::select! {
                _ = cancellation.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
