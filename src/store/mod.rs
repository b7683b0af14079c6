//! Persistence seam. The engine talks to storage only through [`Store`] and
//! [`Transaction`]; [`MemoryStore`] is the shipped implementation.

mod memory;
mod writer;

pub use memory::{MemoryStore, MemoryTransaction};

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no such record: {0}")]
    NotFound(Ulid),
    #[error("record {0} already exists")]
    AlreadyExists(Ulid),
    #[error("invalid record: {0}")]
    Invalid(String),
    /// The write would leave two overlapping active bookings on one subject.
    /// Carries the id of the booking already holding the time.
    #[error("exclusion constraint violated by booking {0}")]
    ExclusionViolation(Ulid),
    /// The store aborted the transaction because of a concurrent write.
    /// Safe to retry from scratch.
    #[error("serialization failure")]
    SerializationFailure,
    #[error("{0} is not locked by this transaction")]
    NotLocked(Subject),
    #[error("WAL error: {0}")]
    Wal(String),
}

/// A unit of work over a fixed set of subjects.
///
/// Changes are visible to the transaction immediately and to everyone else after
/// [`commit`](Transaction::commit). Dropping a transaction without committing
/// rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Booking by id, tombstoned or not. Must belong to a locked subject.
    async fn get(&mut self, id: Ulid) -> Result<Booking, StoreError>;

    /// Bookings on `subject` overlapping `span`, ascending by start.
    async fn query_overlapping(
        &mut self,
        subject: Subject,
        span: Span,
        active_only: bool,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Active exceptions of a locked staff subject that may block `span`.
    async fn exceptions(&mut self, staff_id: Ulid, span: Span) -> Result<Vec<AvailabilityException>, StoreError>;

    async fn working_hours(&mut self, staff_id: Ulid) -> Result<Option<WeeklyHours>, StoreError>;

    async fn insert(&mut self, booking: Booking) -> Result<(), StoreError>;

    async fn update_fields(
        &mut self,
        id: Ulid,
        changes: &BookingChanges,
        actor: Option<Ulid>,
        at: Ms,
    ) -> Result<Booking, StoreError>;

    async fn soft_delete(&mut self, id: Ulid, actor: Option<Ulid>, at: Ms) -> Result<Booking, StoreError>;

    /// Make the changes durable. Returns the events written, in order.
    async fn commit(&mut self) -> Result<Vec<Event>, StoreError>;

    async fn rollback(&mut self);
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Start a transaction holding exclusive locks on `subjects`.
    async fn begin(&self, subjects: &[Subject]) -> Result<Box<dyn Transaction>, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError>;

    /// Bookings on `subject` overlapping `span`, ascending by start.
    async fn query_bookings(
        &self,
        subject: Subject,
        span: Span,
        active_only: bool,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn list_bookings(&self, query: &BookingQuery) -> Result<Vec<Booking>, StoreError>;

    async fn insert_exception(&self, exception: AvailabilityException) -> Result<(), StoreError>;

    async fn get_exception(&self, id: Ulid) -> Result<AvailabilityException, StoreError>;

    /// Overwrite an existing exception with new field values.
    async fn replace_exception(&self, exception: AvailabilityException) -> Result<(), StoreError>;

    async fn soft_delete_exception(
        &self,
        id: Ulid,
        actor: Option<Ulid>,
        at: Ms,
    ) -> Result<AvailabilityException, StoreError>;

    /// Exceptions of `staff_id` that may block `span`: those whose stored span
    /// overlaps it, plus every recurring exception anchored before `span.end`.
    async fn query_exceptions(
        &self,
        staff_id: Ulid,
        span: Span,
        active_only: bool,
    ) -> Result<Vec<AvailabilityException>, StoreError>;

    async fn list_exceptions(&self, query: &ExceptionQuery) -> Result<Vec<AvailabilityException>, StoreError>;

    async fn working_hours(&self, staff_id: Ulid) -> Result<Option<WeeklyHours>, StoreError>;

    async fn set_working_hours(&self, staff_id: Ulid, hours: Option<WeeklyHours>) -> Result<(), StoreError>;
}
