pub mod availability;
pub mod calendar;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod recurrence;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use calendar::Calendar;
pub use conflict::{first_blocking, first_conflict, has_conflict};
pub use error::EngineError;
pub use recurrence::{Frequency, RecurrenceParseError, RecurrenceRule};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::compactor::run_compactor;
use crate::config::EngineConfig;
use crate::directory::{Directory, EntityRef};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{COMMIT_RETRIES_TOTAL, SCHEDULE_DURATION_SECONDS, SCHEDULE_TOTAL};
use crate::store::{MemoryStore, Store, StoreError, Transaction};

/// The scheduling engine: validates requests, resolves availability and
/// reserves time through a [`Store`] transaction.
pub struct Engine {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    notify: Arc<NotifyHub>,
    calendar: Calendar,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>, config: EngineConfig) -> Self {
        Self {
            store,
            directory,
            notify: Arc::new(NotifyHub::new()),
            calendar: Calendar::new(config.timezone),
            config,
        }
    }

    /// Engine over a [`MemoryStore`]: WAL-backed when `config.data_dir` is set
    /// (with a background compactor), volatile otherwise. Must run inside a
    /// tokio runtime.
    pub fn open(config: EngineConfig, directory: Arc<dyn Directory>) -> Result<Self, EngineError> {
        let store: Arc<dyn Store> = match config.wal_path() {
            Some(path) => {
                let store = Arc::new(MemoryStore::open(&path)?);
                if config.compact_threshold > 0 {
                    tokio::spawn(run_compactor(
                        Arc::downgrade(&store),
                        config.compact_threshold,
                        config.compact_interval,
                    ));
                }
                store
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(store, directory, config))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Committed changes on `subject`, delivered after each commit.
    pub fn subscribe(&self, subject: Subject) -> broadcast::Receiver<Event> {
        self.notify.subscribe(subject)
    }

    /// `entity` must exist and belong to `business_id`.
    pub(super) async fn ensure_owned(&self, entity: EntityRef, business_id: Ulid) -> Result<(), EngineError> {
        match self.directory.business_of(entity).await {
            Some(owner) if owner == business_id => Ok(()),
            Some(_) => Err(EngineError::validation(format!(
                "{} {} does not belong to business {business_id}",
                entity.kind(),
                entity.id()
            ))),
            None => Err(EngineError::validation(format!(
                "unknown {} {}",
                entity.kind(),
                entity.id()
            ))),
        }
    }

    /// Availability gate, evaluated under the transaction's subject lock.
    pub(super) async fn check_available(
        &self,
        tx: &mut dyn Transaction,
        booking: &Booking,
    ) -> Result<(), EngineError> {
        let Subject::Staff(staff_id) = booking.subject else {
            return Ok(());
        };
        let exceptions = tx.exceptions(staff_id, booking.span).await?;
        let hours = tx.working_hours(staff_id).await?;
        let unavailable =
            availability::unavailable_intervals(&self.calendar, &exceptions, hours.as_ref(), &booking.span);
        if let Some(blocked) = first_blocking(&booking.span, &unavailable) {
            debug!(subject = %booking.subject, span = %booking.span, %blocked, "rejected: unavailable");
            return Err(EngineError::Unavailable {
                subject: booking.subject,
                blocked,
            });
        }
        Ok(())
    }

    /// Conflict gate against the subject's other active bookings.
    pub(super) async fn check_no_conflict(
        &self,
        tx: &mut dyn Transaction,
        booking: &Booking,
    ) -> Result<(), EngineError> {
        let existing = tx.query_overlapping(booking.subject, booking.span, true).await?;
        if let Some(other) = first_conflict(&booking.span, &existing, Some(booking.id)) {
            debug!(subject = %booking.subject, span = %booking.span, with = %other.id, "rejected: conflict");
            return Err(EngineError::Conflict { with: Some(other.id) });
        }
        Ok(())
    }

    /// Run `attempt` until it stops failing with a store serialization failure,
    /// at most `max_commit_retries` extra times, and record the outcome.
    pub(super) async fn with_retries<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let started = Instant::now();
        let mut retries = 0;
        let result = loop {
            match attempt().await {
                Err(EngineError::Store(StoreError::SerializationFailure))
                    if retries < self.config.max_commit_retries =>
                {
                    retries += 1;
                    metrics::counter!(COMMIT_RETRIES_TOTAL).increment(1);
                    warn!(op, retries, "serialization failure, retrying");
                }
                Err(EngineError::Store(StoreError::SerializationFailure)) => {
                    warn!(op, retries, "serialization failures exhausted retries");
                    break Err(EngineError::Conflict { with: None });
                }
                other => break other,
            }
        };
        record_outcome(op, &result, started);
        result
    }
}

pub(super) fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>, started: Instant) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    };
    metrics::counter!(SCHEDULE_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    metrics::histogram!(SCHEDULE_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}
