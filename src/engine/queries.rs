use ulid::Ulid;

use crate::limits::{MAX_QUERY_WINDOW_MS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::availability::{self, free_slots};
use super::conflict::{has_conflict, validate_span};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.store.get_booking(id).await?;
        if booking.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(booking)
    }

    pub async fn get_exception(&self, id: Ulid) -> Result<AvailabilityException, EngineError> {
        let exception = self.store.get_exception(id).await?;
        if exception.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(exception)
    }

    /// True iff a booking for `[start, end)` on `subject` would pass both the
    /// availability and the conflict gate right now.
    pub async fn check_availability(&self, subject: Subject, start: Ms, end: Ms) -> Result<bool, EngineError> {
        let span = Span::checked(start, end)
            .ok_or_else(|| EngineError::validation("start must be before end"))?;
        validate_span(&span)?;

        let unavailable = self.subject_unavailable(subject, span).await?;
        if has_conflict(&span, &unavailable) {
            return Ok(false);
        }
        let busy = self.store.query_bookings(subject, span, true).await?;
        Ok(busy.is_empty())
    }

    /// Merged, sorted spans inside `[start, end)` where `staff_id` cannot be
    /// booked: expanded exceptions plus time outside working hours.
    pub async fn unavailable_intervals(&self, staff_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        let query = query_window(start, end)?;
        self.subject_unavailable(Subject::Staff(staff_id), query).await
    }

    /// Free gaps of at least `min_duration` inside `[start, end)`.
    pub async fn available_slots(
        &self,
        subject: Subject,
        start: Ms,
        end: Ms,
        min_duration: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let query = query_window(start, end)?;
        if min_duration < 0 {
            return Err(EngineError::validation("minimum duration cannot be negative"));
        }
        let unavailable = self.subject_unavailable(subject, query).await?;
        let busy: Vec<Span> = self
            .store
            .query_bookings(subject, query, true)
            .await?
            .into_iter()
            .map(|b| b.span)
            .collect();
        Ok(free_slots(&query, &unavailable, &busy, min_duration))
    }

    pub async fn list_by_staff_and_range(
        &self,
        staff_id: Ulid,
        start: Ms,
        end: Ms,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings(BookingScope::Staff(staff_id), start, end, page, include_deleted)
            .await
    }

    pub async fn list_by_resource_and_range(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings(BookingScope::Resource(resource_id), start, end, page, include_deleted)
            .await
    }

    pub async fn list_by_business_and_range(
        &self,
        business_id: Ulid,
        start: Ms,
        end: Ms,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings(BookingScope::Business(business_id), start, end, page, include_deleted)
            .await
    }

    pub async fn list_by_client_and_range(
        &self,
        client_id: Ulid,
        start: Ms,
        end: Ms,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings(BookingScope::Client(client_id), start, end, page, include_deleted)
            .await
    }

    /// Exceptions of `staff_id` whose stored span overlaps `[start, end)`,
    /// plus recurring ones anchored before `end`.
    pub async fn list_exceptions_by_staff_and_range(
        &self,
        staff_id: Ulid,
        start: Ms,
        end: Ms,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<AvailabilityException>, EngineError> {
        let span = query_window(start, end)?;
        let (offset, limit) = self.page_bounds(page);
        Ok(self
            .store
            .list_exceptions(&ExceptionQuery {
                scope: ExceptionScope::Staff(staff_id),
                span,
                include_deleted,
                offset,
                limit,
            })
            .await?)
    }

    async fn list_bookings(
        &self,
        scope: BookingScope,
        start: Ms,
        end: Ms,
        page: Page,
        include_deleted: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        let span = query_window(start, end)?;
        let (offset, limit) = self.page_bounds(page);
        Ok(self
            .store
            .list_bookings(&BookingQuery {
                scope,
                span,
                include_deleted,
                offset,
                limit,
            })
            .await?)
    }

    /// Resources have no exceptions or working hours.
    async fn subject_unavailable(&self, subject: Subject, query: Span) -> Result<Vec<Span>, EngineError> {
        let Subject::Staff(staff_id) = subject else {
            return Ok(Vec::new());
        };
        let exceptions = self.store.query_exceptions(staff_id, query, true).await?;
        let hours = self.store.working_hours(staff_id).await?;
        Ok(availability::unavailable_intervals(
            &self.calendar,
            &exceptions,
            hours.as_ref(),
            &query,
        ))
    }

    /// Page 0 is treated as page 1; a zero size means the configured default.
    fn page_bounds(&self, page: Page) -> (usize, usize) {
        let size = match page.page_size {
            0 => self.config.default_page_size,
            n => n.min(self.config.max_page_size),
        } as usize;
        let index = page.page.max(1) as usize - 1;
        (index.saturating_mul(size), size)
    }
}

fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end)
        .ok_or_else(|| EngineError::validation("start must be before end"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::validation("timestamp out of range"));
    }
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::validation("query window too wide"));
    }
    Ok(span)
}
