use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::{SinkError, StoreError};
use super::event::AbsoluteEvent;
use super::hooks::{NetworkControl, Notifier};

const STOP_POLL: Duration = Duration::from_millis(100);

/// A time series store that events can be written to
pub trait EventStore {
    /// (Re)establish the connection
    fn connect(&mut self) -> Result<(), StoreError>;
    /// Cheap liveness check of the current connection
    fn is_alive(&mut self) -> bool;
    /// Insert all rows in a single statement
    fn insert_events(&mut self, table: &str, rows: &[AbsoluteEvent]) -> Result<(), StoreError>;
}

/// Bounded retries suit a foreground run with an operator watching. An unattended
/// collector retries until it is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryMode {
    Bounded,
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub mode: RetryMode,
    pub max_attempts: u32,
    pub delay: Duration,
    pub alert_after: u32,
}

/// Batched writer around an [`EventStore`] with reconnect and retry.
///
/// Connection failures are retried with a fixed delay. After `alert_after` consecutive
/// failures the notifier fires, once per outage; the outage ends at the next success.
/// Before each retry the network is checked and reset if it looks down. A batch is always
/// retried whole. Rejections are never retried.
pub struct ResilientSink<S: EventStore> {
    store: S,
    policy: RetryPolicy,
    notifier: Box<dyn Notifier>,
    network: Box<dyn NetworkControl>,
    stop: Arc<AtomicBool>,
    connected: bool,
    consecutive_failures: u32,
    alerted: bool,
}

impl<S: EventStore> ResilientSink<S> {
    pub fn new(
        store: S,
        policy: RetryPolicy,
        notifier: Box<dyn Notifier>,
        network: Box<dyn NetworkControl>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            policy,
            notifier,
            network,
            stop,
            connected: false,
            consecutive_failures: 0,
            alerted: false,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Make sure there is a live connection, reconnecting with retries if needed
    pub fn ensure_connected(&mut self) -> Result<(), SinkError> {
        if self.connected && self.store.is_alive() {
            return Ok(());
        }
        self.connected = false;
        self.with_retry("connect", &mut |_| Ok(()))
    }

    /// Write one batch of rows to a table
    pub fn write_batch(&mut self, table: &str, rows: &[AbsoluteEvent]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_retry(table, &mut |store| store.insert_events(table, rows))
    }

    fn attempt(
        &mut self,
        op: &mut dyn FnMut(&mut S) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if !self.connected {
            self.store.connect()?;
            self.connected = true;
        }
        op(&mut self.store)
    }

    fn with_retry(
        &mut self,
        what: &str,
        op: &mut dyn FnMut(&mut S) -> Result<(), StoreError>,
    ) -> Result<(), SinkError> {
        let mut attempts: u32 = 0;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(SinkError::Interrupted);
            }
            attempts += 1;
            let reason = match self.attempt(op) {
                Ok(()) => {
                    self.recovered();
                    return Ok(());
                }
                Err(StoreError::Rejected(reason)) => {
                    self.recovered();
                    spdlog::error!("Store rejected {what}: {reason}");
                    return Err(SinkError::Rejected(reason));
                }
                Err(StoreError::Unavailable(reason)) => reason,
            };

            self.connected = false;
            self.consecutive_failures += 1;
            spdlog::warn!(
                "Store unavailable during {what} (attempt {attempts}, {} consecutive failures): {reason}",
                self.consecutive_failures
            );
            if self.consecutive_failures >= self.policy.alert_after && !self.alerted {
                self.alerted = true;
                self.notifier.alert(&format!(
                    "Event store unreachable after {} consecutive attempts: {reason}",
                    self.consecutive_failures
                ));
            }
            if self.policy.mode == RetryMode::Bounded && attempts >= self.policy.max_attempts {
                return Err(SinkError::Unavailable {
                    attempts,
                    last: reason,
                });
            }
            if !self.network.is_online() {
                self.network.reset();
            }
            self.pause()?;
        }
    }

    fn recovered(&mut self) {
        if self.consecutive_failures > 0 {
            spdlog::info!(
                "Store reachable again after {} failed attempts",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.alerted = false;
    }

    /// Wait out the retry delay, waking up to honour a stop request
    fn pause(&self) -> Result<(), SinkError> {
        let deadline = Instant::now() + self.policy.delay;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(SinkError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}
