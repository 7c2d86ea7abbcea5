//! Timing-privacy countermeasures.
//!
//! Sensitive operations (token issuance, casting, revealing) can leak voter
//! identity through timing correlation. When enabled, the service pads them
//! with random delays, normalizes their total duration, and batches token
//! issuance behind a shuffle so input order never maps to output order.

use crate::*;

use rand::seq::SliceRandom;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Suspend for a uniform random delay in `[min_delay_ms, max_delay_ms]`.
/// No-op when privacy is disabled.
pub async fn random_delay(config: &PrivacyConfig) {
    if !config.enabled || config.max_delay_ms == 0 {
        return;
    }
    let delay = rand::thread_rng().gen_range(config.min_delay_ms, config.max_delay_ms + 1);
    sleep(Duration::from_millis(delay)).await;
}

/// Run an operation and sleep out the shortfall so its total duration is at
/// least `target_ms`. A target of `0` disables normalization.
pub async fn normalize_response<F, T>(target_ms: u64, operation: F) -> T
where
    F: Future<Output = T>,
{
    if target_ms == 0 {
        return operation.await;
    }
    let started = Instant::now();
    let output = operation.await;
    let elapsed = started.elapsed().as_millis() as u64;
    if elapsed < target_ms {
        sleep(Duration::from_millis(target_ms - elapsed)).await;
    }
    output
}

struct BatchItem {
    blinded_b64: String,
    respond: oneshot::Sender<Result<EligibilityToken, Error>>,
}

/// Batches token issuance requests.
///
/// Requests queue until `max_batch_size` accumulate or `batch_interval_ms`
/// elapses since the first one, then the whole batch is Fisher-Yates
/// shuffled before being forwarded to the issuer, decorrelating arrival
/// order from issuance order.
pub struct TokenBatcher {
    queue: mpsc::Sender<BatchItem>,
}

impl TokenBatcher {
    pub fn spawn<I: Issuer + 'static>(issuer: Arc<I>, config: PrivacyConfig) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        let (queue, mut incoming) = mpsc::channel::<BatchItem>(max_batch_size * 4);

        tokio::spawn(async move {
            loop {
                // The window opens on the first queued request.
                let first = match incoming.recv().await {
                    Some(item) => item,
                    None => return,
                };
                let mut pending = vec![first];

                let window = sleep(Duration::from_millis(config.batch_interval_ms));
                tokio::pin!(window);
                while pending.len() < max_batch_size {
                    tokio::select! {
                        item = incoming.recv() => match item {
                            Some(item) => pending.push(item),
                            None => break,
                        },
                        _ = &mut window => break,
                    }
                }

                debug!(batch_size = pending.len(), "flushing token batch");
                pending.shuffle(&mut rand::thread_rng());
                for item in pending {
                    let result = issuer.issue(&item.blinded_b64).await;
                    // A dropped receiver means the caller went away mid-batch
                    let _ = item.respond.send(result);
                }
            }
        });

        TokenBatcher { queue }
    }

    pub async fn request(&self, blinded_element_b64: String) -> Result<EligibilityToken, Error> {
        let (respond, receive) = oneshot::channel();
        self.queue
            .send(BatchItem {
                blinded_b64: blinded_element_b64,
                respond,
            })
            .await
            .map_err(|_| Error::IssuerUnavailable("token batcher has stopped".to_string()))?;
        receive
            .await
            .map_err(|_| Error::IssuerUnavailable("token batcher dropped the request".to_string()))?
    }
}
