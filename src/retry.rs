//! Bounded resubmission of operations that failed with a retryable code.

use std::time::Duration;

use tracing::warn;

use crate::config::OperationConfig;
use crate::error::{LdapError, LdapResult};
use crate::executor::OperationExecutor;
use crate::request::{Payload, Request, Response};
use crate::session::DirectorySession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

impl From<&OperationConfig> for RetryPolicy {
    fn from(config: &OperationConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.unwrap_or(1).max(1),
            delay: Duration::from_millis(config.retry_delay_ms.unwrap_or(0)),
        }
    }
}

/// Executes `request`, resubmitting it while the executor reports
/// [`LdapError::Retryable`] and attempts remain. Any other error returns
/// immediately.
pub async fn execute_with_retry(
    executor: &OperationExecutor,
    session: &mut dyn DirectorySession,
    request: &Request,
    policy: &RetryPolicy,
) -> LdapResult<Response<Payload>> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match executor.execute(session, request).await {
            Err(e @ LdapError::Retryable { .. }) if attempt < max_attempts => {
                warn!(
                    "{} {} attempt {}/{} failed: {}; retrying in {:?}",
                    request.operation.name(),
                    request.operation.dn(),
                    attempt,
                    max_attempts,
                    e,
                    policy.delay
                );
                attempt += 1;
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            result => return result,
        }
    }
}
