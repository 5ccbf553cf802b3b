// The oracle port: the one capability the engine needs from the outside
// world. Implementations wrap a transport (socket, HTTP, or an in-process
// simulation) and classify raw responses into signals before the engine
// ever sees them.
//
// Deliberately key-free: neither trait has anywhere to put key material, so
// the engine cannot receive any.
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::TransportError;
use crate::signal::{Magnitude, Validity};

/// A padding oracle: submit a forged ciphertext, learn which validation
/// stage it failed (if any).
pub trait ValidityOracle: Sync {
    fn query(
        &self,
        ciphertext: &[u8],
    ) -> impl Future<Output = Result<Validity, TransportError>> + Send;
}

/// A length/timing oracle: submit a probe payload, learn a scalar that
/// correlates with how well it compresses against the secret.
pub trait MagnitudeOracle: Sync {
    fn query(&self, payload: &[u8]) -> impl Future<Output = Result<Magnitude, TransportError>> + Send;
}

/// Per-query behaviour shared by both strategies: timeout, bounded retry
/// with doubling backoff, and how many queries a sweep keeps in flight.
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub sweep_width: usize,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff: Duration::from_millis(50),
            sweep_width: 32,
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Run one query under the policy. Exhausted retries yield `None`: a guess
/// the oracle never answered is a non-success guess, not a fatal error.
pub(crate) async fn with_retry<T, F, Fut>(policy: &QueryPolicy, mut attempt_fn: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut delay = policy.backoff;
    for attempt in 0..=policy.max_retries {
        match tokio::time::timeout(policy.timeout, attempt_fn()).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => debug!(attempt, error = %err, "oracle query failed"),
            Err(_) => debug!(attempt, timeout = ?policy.timeout, "oracle query timed out"),
        }
        if attempt < policy.max_retries {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }
    None
}
