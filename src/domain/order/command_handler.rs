use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::event_sourcing::core::{Aggregate, AggregateId};
use crate::event_sourcing::store::Repository;
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

use super::aggregate::OrderAggregate;
use super::commands::OrderCommand;
use super::errors::OrderError;

// ============================================================================
// Order Command Handler
// ============================================================================
//
// Orchestrates: Rehydrate → Command → Events → Commit
//
// A concurrency conflict means another writer got there first; the whole
// cycle is rerun against the fresh stream. Business rule violations are
// returned as-is.
//
// ============================================================================

pub struct OrderCommandHandler {
    repository: Arc<Repository<OrderAggregate>>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl OrderCommandHandler {
    pub fn new(repository: Arc<Repository<OrderAggregate>>) -> Self {
        Self {
            repository,
            retry: RetryConfig::default(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle a command and persist resulting events. Returns the new version.
    pub async fn handle(
        &self,
        aggregate_id: &AggregateId,
        command: OrderCommand,
        correlation_id: Uuid,
    ) -> Result<u64, OrderError> {
        let command = &command;
        let attempts = &AtomicU32::new(0);
        let result = retry_on_transient(self.retry.clone(), |attempt| async move {
            attempts.store(attempt, Ordering::Relaxed);
            if attempt > 1 {
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry_attempt("order_command", attempt);
                }
            }
            self.try_handle(aggregate_id, command, correlation_id).await
        })
        .await;

        let retried = attempts.load(Ordering::Relaxed) > 1;
        match result {
            RetryResult::Success(version) => {
                if retried {
                    self.record_outcome(true);
                }
                Ok(version)
            }
            RetryResult::Failed(e) => {
                self.record_outcome(false);
                Err(e)
            }
            RetryResult::PermanentFailure(e) => Err(e),
        }
    }

    /// Current state of an order.
    pub async fn load(&self, aggregate_id: &AggregateId) -> Result<OrderAggregate, OrderError> {
        Ok(self.repository.rehydrate(aggregate_id).await?.into_state())
    }

    async fn try_handle(
        &self,
        aggregate_id: &AggregateId,
        command: &OrderCommand,
        correlation_id: Uuid,
    ) -> Result<u64, OrderError> {
        let mut state = self.repository.rehydrate(aggregate_id).await?;
        let events = state.state().handle_command(command)?;

        let version = self
            .repository
            .commit(&mut state, aggregate_id, events, correlation_id)
            .await?;

        tracing::info!(
            aggregate_id = %aggregate_id,
            command = command.name(),
            version = version,
            status = ?state.state().status,
            "Order command handled"
        );

        Ok(version)
    }

    fn record_outcome(&self, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_retry_outcome("order_command", success);
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
