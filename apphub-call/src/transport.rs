//! Signal transport boundary
//!
//! The backend exposes the signal log as an append operation plus a
//! change-notification stream filtered by receiver. [`InMemorySignalLog`]
//! implements the same contract in process; [`RetryingTransport`] wraps any
//! transport with exponential backoff on `send`.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::{CallError, Result};
use crate::signal::{OutboundSignal, SignalRecord};
use crate::types::UserId;

/// Records appended for one receiver, in append order
pub type SignalSubscription = mpsc::Receiver<SignalRecord>;

/// Durable append-only signal log
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Append a signal addressed to `signal.receiver_id`
    async fn send(&self, signal: OutboundSignal) -> Result<()>;

    /// Deliver every record appended for `receiver_id` from now on
    async fn subscribe(&self, receiver_id: &UserId) -> Result<SignalSubscription>;
}

/// In-process signal log with receiver-filtered subscriptions
pub struct InMemorySignalLog {
    records: RwLock<Vec<SignalRecord>>,
    subscribers: DashMap<UserId, Vec<mpsc::Sender<SignalRecord>>>,
    buffer: usize,
}

impl InMemorySignalLog {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Append a raw row, as another client of the backend would
    ///
    /// Delivery never waits on a subscriber. A subscriber whose buffer is
    /// full misses the notification; the row stays in the log.
    pub async fn append(&self, record: SignalRecord) -> Result<()> {
        self.records.write().push(record.clone());

        let Some(mut entry) = self.subscribers.get_mut(&record.receiver_id) else {
            return Ok(());
        };
        entry.retain(|tx| match tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    receiver_id = %record.receiver_id,
                    signal_type = %record.signal_type,
                    "Subscriber buffer full, dropping delivery"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(receiver_id = %record.receiver_id, "Subscriber dropped, removing");
                false
            }
        });

        Ok(())
    }

    /// Every record appended so far
    #[must_use]
    pub fn records(&self) -> Vec<SignalRecord> {
        self.records.read().clone()
    }

    /// Records addressed to one receiver
    #[must_use]
    pub fn records_for(&self, receiver_id: &UserId) -> Vec<SignalRecord> {
        self.records
            .read()
            .iter()
            .filter(|record| &record.receiver_id == receiver_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for InMemorySignalLog {
    fn default() -> Self {
        Self::new(TransportConfig::default().subscription_buffer)
    }
}

#[async_trait]
impl SignalTransport for InMemorySignalLog {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        let record = signal.into_record()?;
        self.append(record).await
    }

    async fn subscribe(&self, receiver_id: &UserId) -> Result<SignalSubscription> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .entry(receiver_id.clone())
            .or_default()
            .push(tx);
        debug!(receiver_id = %receiver_id, "Signal subscription opened");
        Ok(rx)
    }
}

/// Transport decorator retrying failed appends with exponential backoff
pub struct RetryingTransport {
    inner: Arc<dyn SignalTransport>,
    config: TransportConfig,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn SignalTransport>, config: TransportConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl SignalTransport for RetryingTransport {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.send_retry_min_delay_ms))
            .with_max_delay(Duration::from_millis(self.config.send_retry_max_delay_ms))
            .with_max_times(self.config.send_retry_attempts)
            .with_jitter()
            .build();

        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(backoff) {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            match self.inner.send(signal.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        receiver_id = %signal.receiver_id,
                        signal_type = %signal.signal.kind(),
                        error = %e,
                        "Signal append failed, retrying"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CallError::Transport("retry exhausted".to_string())))
    }

    async fn subscribe(&self, receiver_id: &UserId) -> Result<SignalSubscription> {
        self.inner.subscribe(receiver_id).await
    }
}
