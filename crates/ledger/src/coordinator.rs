//! Atomic execution of units of work with retry on transient conflicts.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use ledger_store::{Transaction, TransactionalStore};

use crate::error::{LedgerError, Result};

/// One logical operation, run against a single open transaction.
///
/// `run` may be called more than once when the coordinator retries, so it
/// must not consume its inputs.
#[async_trait]
pub trait UnitOfWork<S: TransactionalStore>: Send + Sync {
    type Output: Send;

    async fn run(&self, store: &S, tx: &mut S::Tx) -> Result<Self::Output>;
}

/// How often, and how patiently, transient conflicts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Backoff step; attempt `n` waits `n * base_delay` before the next one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(25))
    }
}

/// Wraps units of work in store transactions.
///
/// Work never sees anything but `&mut S::Tx`, so nested transactions
/// cannot be opened from inside it; everything a unit touches commits or
/// aborts together.
#[derive(Clone)]
pub struct TransactionCoordinator<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: TransactionalStore> TransactionCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self::with_retry_policy(store, RetryPolicy::default())
    }

    pub fn with_retry_policy(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs `work` in one transaction: commit on success, rollback on any
    /// error. The original error is returned even if the rollback fails.
    pub async fn run_atomic<W>(&self, work: &W) -> Result<W::Output>
    where
        W: UnitOfWork<S>,
    {
        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let tx_id = tx.id();

        match work.run(&self.store, &mut tx).await {
            Ok(output) => {
                if let Err(e) = self.store.commit(tx).await {
                    tracing::warn!(tx = %tx_id, error = %e, "commit failed");
                    metrics::counter!("ledger_transactions_total", "outcome" => "aborted")
                        .increment(1);
                    return Err(e.into());
                }

                metrics::counter!("ledger_transactions_total", "outcome" => "committed")
                    .increment(1);
                metrics::histogram!("ledger_transaction_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                tracing::info!(tx = %tx_id, "transaction committed");
                Ok(output)
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    tracing::warn!(tx = %tx_id, error = %rollback_err, "rollback failed");
                }
                metrics::counter!("ledger_transactions_total", "outcome" => "aborted")
                    .increment(1);
                tracing::warn!(tx = %tx_id, error = %err, "transaction aborted");
                Err(err)
            }
        }
    }

    /// Runs `work` atomically, retrying transient conflicts with linear
    /// backoff. Non-transient errors propagate immediately.
    pub async fn run_with_retry<W>(&self, work: &W) -> Result<W::Output>
    where
        W: UnitOfWork<S>,
    {
        let max_attempts = self.retry.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.run_atomic(work).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        metrics::counter!("ledger_transactions_total", "outcome" => "exhausted")
                            .increment(1);
                        return Err(LedgerError::TransactionRetriesExhausted {
                            attempts: attempt,
                            last_error: Box::new(err),
                        });
                    }

                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient conflict, retrying"
                    );
                    metrics::counter!("ledger_transaction_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
