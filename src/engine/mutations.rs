use std::collections::HashSet;
use std::time::Instant;

use tracing::info;
use ulid::Ulid;

use crate::directory::EntityRef;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_batch_overlaps, now_ms, validate_span};
use super::recurrence::RecurrenceRule;
use super::{record_outcome, Engine, EngineError};

impl Engine {
    // ── Bookings ─────────────────────────────────────────────────

    /// Reserve a span on a staff member or resource.
    ///
    /// Fails with `Unavailable` when the span touches an exception or falls
    /// outside working hours, and with `Conflict` when another active booking
    /// on the same subject overlaps it.
    pub async fn schedule(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let request = &request;
        self.with_retries("schedule", move || self.schedule_once(request))
            .await
    }

    async fn schedule_once(&self, request: &BookingRequest) -> Result<Booking, EngineError> {
        let booking = self.prepare_booking(request, &[], now_ms()).await?;

        let mut tx = self.store.begin(&[booking.subject]).await?;
        self.check_available(tx.as_mut(), &booking).await?;
        self.check_no_conflict(tx.as_mut(), &booking).await?;
        tx.insert(booking.clone()).await?;
        let events = tx.commit().await?;

        self.notify.send_all(&events);
        info!(id = %booking.id, subject = %booking.subject, span = %booking.span, "booking scheduled");
        Ok(booking)
    }

    /// Schedule several bookings atomically: either all are committed or none.
    /// A resource booking may reference an appointment created earlier in the
    /// same batch.
    pub async fn schedule_batch(&self, requests: Vec<BookingRequest>) -> Result<Vec<Booking>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::validation(format!(
                "batch holds {} bookings, limit is {MAX_BATCH_SIZE}",
                requests.len()
            )));
        }
        let requests = &requests;
        self.with_retries("schedule_batch", move || self.schedule_batch_once(requests))
            .await
    }

    async fn schedule_batch_once(&self, requests: &[BookingRequest]) -> Result<Vec<Booking>, EngineError> {
        let now = now_ms();
        let mut bookings: Vec<Booking> = Vec::with_capacity(requests.len());
        for request in requests {
            let booking = self.prepare_booking(request, &bookings, now).await?;
            if bookings.iter().any(|b| b.id == booking.id) {
                return Err(EngineError::validation(format!(
                    "id {} appears twice in the batch",
                    booking.id
                )));
            }
            bookings.push(booking);
        }
        check_batch_overlaps(&bookings)?;

        let subjects: Vec<Subject> = bookings.iter().map(|b| b.subject).collect();
        let mut tx = self.store.begin(&subjects).await?;
        for booking in &bookings {
            self.check_available(tx.as_mut(), booking).await?;
            self.check_no_conflict(tx.as_mut(), booking).await?;
            tx.insert(booking.clone()).await?;
        }
        let events = tx.commit().await?;

        self.notify.send_all(&events);
        info!(count = bookings.len(), "booking batch scheduled");
        Ok(bookings)
    }

    /// Change the time, status, client, service or notes of a booking.
    ///
    /// A booking in a terminal status accepts note changes only. Moving an
    /// active booking re-runs the availability and conflict checks, ignoring
    /// the booking's own current slot.
    pub async fn update_booking(
        &self,
        id: Ulid,
        changes: BookingChanges,
        actor: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let changes = &changes;
        self.with_retries("update_booking", move || self.update_once(id, changes, actor))
            .await
    }

    /// Release a booking's slot. Cancelling a cancelled booking succeeds again.
    pub async fn cancel_booking(&self, id: Ulid, actor: Option<Ulid>) -> Result<Booking, EngineError> {
        let changes = &BookingChanges::status(BookingStatus::Cancelled);
        self.with_retries("cancel_booking", move || self.update_once(id, changes, actor))
            .await
    }

    async fn update_once(
        &self,
        id: Ulid,
        changes: &BookingChanges,
        actor: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let snapshot = self.store.get_booking(id).await?;
        if snapshot.deleted {
            return Err(EngineError::NotFound(id));
        }
        if let Some(notes) = &changes.notes {
            validate_notes(notes)?;
        }
        if let Some(client_id) = changes.client_id {
            self.ensure_owned(EntityRef::Client(client_id), snapshot.business_id).await?;
        }
        if let Some(service_id) = changes.service_id {
            self.ensure_owned(EntityRef::Service(service_id), snapshot.business_id).await?;
        }

        let mut tx = self.store.begin(&[snapshot.subject]).await?;
        let current = tx.get(id).await?;
        if current.deleted {
            return Err(EngineError::NotFound(id));
        }

        let mut candidate = current.clone();
        candidate.apply(changes);

        if !current.status.can_transition_to(candidate.status) {
            return Err(EngineError::validation(format!(
                "booking {id} is {} and cannot become {}",
                current.status, candidate.status
            )));
        }
        if current.status.is_terminal() {
            let mut notes_only = current.clone();
            notes_only.notes = candidate.notes.clone();
            if candidate != notes_only {
                return Err(EngineError::validation(format!(
                    "booking {id} is {}; only its notes can change",
                    current.status
                )));
            }
        }

        if candidate.span != current.span {
            let span = Span::checked(candidate.span.start, candidate.span.end)
                .ok_or_else(|| EngineError::validation("start must be before end"))?;
            validate_span(&span)?;
        }

        if candidate.is_active() {
            if candidate.span != current.span {
                self.check_available(tx.as_mut(), &candidate).await?;
            }
            self.check_no_conflict(tx.as_mut(), &candidate).await?;
        }

        let updated = tx.update_fields(id, changes, actor, now_ms()).await?;
        let events = tx.commit().await?;

        self.notify.send_all(&events);
        info!(%id, status = %updated.status, span = %updated.span, "booking updated");
        Ok(updated)
    }

    /// Tombstone a booking. It stops taking part in conflict checks at once.
    pub async fn delete_booking(&self, id: Ulid, actor: Option<Ulid>) -> Result<Booking, EngineError> {
        self.with_retries("delete_booking", move || self.delete_once(id, actor))
            .await
    }

    async fn delete_once(&self, id: Ulid, actor: Option<Ulid>) -> Result<Booking, EngineError> {
        let snapshot = self.store.get_booking(id).await?;
        if snapshot.deleted {
            return Err(EngineError::NotFound(id));
        }

        let mut tx = self.store.begin(&[snapshot.subject]).await?;
        if tx.get(id).await?.deleted {
            return Err(EngineError::NotFound(id));
        }
        let deleted = tx.soft_delete(id, actor, now_ms()).await?;
        let events = tx.commit().await?;

        self.notify.send_all(&events);
        info!(%id, "booking deleted");
        Ok(deleted)
    }

    /// Validate a request and turn it into the booking to insert. `pending`
    /// holds earlier bookings of the same batch.
    async fn prepare_booking(
        &self,
        request: &BookingRequest,
        pending: &[Booking],
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let span = Span::checked(request.start, request.end)
            .ok_or_else(|| EngineError::validation("start must be before end"))?;
        validate_span(&span)?;
        if request.status.is_terminal() {
            return Err(EngineError::validation(format!(
                "a new booking cannot start out {}",
                request.status
            )));
        }
        if let Some(notes) = &request.notes {
            validate_notes(notes)?;
        }

        self.ensure_owned(request.subject.into(), request.business_id).await?;
        if let Some(client_id) = request.client_id {
            self.ensure_owned(EntityRef::Client(client_id), request.business_id).await?;
        }
        if let Some(service_id) = request.service_id {
            self.ensure_owned(EntityRef::Service(service_id), request.business_id).await?;
        }
        if let Some(appointment_id) = request.appointment_id {
            if request.subject.is_staff() {
                return Err(EngineError::validation(
                    "only resource bookings can reference an appointment",
                ));
            }
            self.ensure_appointment(appointment_id, request.business_id, pending)
                .await?;
        }

        Ok(Booking {
            id: request.id.unwrap_or_else(Ulid::new),
            business_id: request.business_id,
            subject: request.subject,
            client_id: request.client_id,
            service_id: request.service_id,
            appointment_id: request.appointment_id,
            span,
            status: request.status,
            notes: request.notes.clone(),
            deleted: false,
            audit: AuditInfo::created(request.actor, now),
        })
    }

    async fn ensure_appointment(
        &self,
        appointment_id: Ulid,
        business_id: Ulid,
        pending: &[Booking],
    ) -> Result<(), EngineError> {
        let appointment = match pending.iter().find(|b| b.id == appointment_id) {
            Some(b) => b.clone(),
            None => match self.store.get_booking(appointment_id).await {
                Ok(b) => b,
                Err(crate::store::StoreError::NotFound(_)) => {
                    return Err(EngineError::validation(format!(
                        "unknown appointment {appointment_id}"
                    )));
                }
                Err(e) => return Err(e.into()),
            },
        };
        if appointment.deleted || !appointment.subject.is_staff() {
            return Err(EngineError::validation(format!(
                "unknown appointment {appointment_id}"
            )));
        }
        if appointment.business_id != business_id {
            return Err(EngineError::validation(format!(
                "appointment {appointment_id} does not belong to business {business_id}"
            )));
        }
        Ok(())
    }

    // ── Availability exceptions ──────────────────────────────────

    /// Block time on a staff member's calendar. Existing bookings inside the
    /// blocked time are left alone.
    pub async fn create_availability_exception(
        &self,
        input: ExceptionInput,
    ) -> Result<AvailabilityException, EngineError> {
        let started = Instant::now();
        let result = self.create_exception_once(input).await;
        record_outcome("create_exception", &result, started);
        result
    }

    async fn create_exception_once(&self, input: ExceptionInput) -> Result<AvailabilityException, EngineError> {
        self.ensure_owned(EntityRef::Staff(input.staff_id), input.business_id)
            .await?;
        let (span, recurrence) = self.shape_exception(
            input.start,
            input.end,
            input.is_full_day,
            input.is_recurring,
            input.recurrence_rule.as_deref(),
        )?;
        if let Some(notes) = &input.notes {
            validate_notes(notes)?;
        }

        let exception = AvailabilityException {
            id: input.id.unwrap_or_else(Ulid::new),
            business_id: input.business_id,
            staff_id: input.staff_id,
            kind: input.kind,
            span,
            is_full_day: input.is_full_day,
            recurrence,
            notes: input.notes,
            deleted: false,
            audit: AuditInfo::created(input.actor, now_ms()),
        };
        self.store.insert_exception(exception.clone()).await?;
        self.log_displaced(&exception).await;

        self.notify.send(&Event::ExceptionWritten(exception.clone()));
        info!(id = %exception.id, staff = %exception.staff_id, kind = exception.kind.as_str(), span = %exception.span, "exception created");
        Ok(exception)
    }

    /// Change an exception. Unset fields keep their current values; the
    /// recurrence rule is kept while the exception stays recurring.
    pub async fn update_availability_exception(
        &self,
        id: Ulid,
        changes: ExceptionChanges,
        actor: Option<Ulid>,
    ) -> Result<AvailabilityException, EngineError> {
        let started = Instant::now();
        let result = self.update_exception_once(id, changes, actor).await;
        record_outcome("update_exception", &result, started);
        result
    }

    async fn update_exception_once(
        &self,
        id: Ulid,
        changes: ExceptionChanges,
        actor: Option<Ulid>,
    ) -> Result<AvailabilityException, EngineError> {
        let current = self.store.get_exception(id).await?;
        if current.deleted {
            return Err(EngineError::NotFound(id));
        }

        let is_full_day = changes.is_full_day.unwrap_or(current.is_full_day);
        let is_recurring = changes.is_recurring.unwrap_or(current.is_recurring());
        let rule = changes.recurrence_rule.clone().or_else(|| {
            if is_recurring {
                current.recurrence.as_ref().map(RecurrenceRule::to_string)
            } else {
                None
            }
        });
        let (span, recurrence) = self.shape_exception(
            changes.start.unwrap_or(current.span.start),
            changes.end.unwrap_or(current.span.end),
            is_full_day,
            is_recurring,
            rule.as_deref(),
        )?;
        if let Some(notes) = &changes.notes {
            validate_notes(notes)?;
        }

        let mut updated = current;
        updated.kind = changes.kind.unwrap_or(updated.kind);
        updated.span = span;
        updated.is_full_day = is_full_day;
        updated.recurrence = recurrence;
        if changes.notes.is_some() {
            updated.notes = changes.notes;
        }
        updated.audit.touch(actor, now_ms());

        self.store.replace_exception(updated.clone()).await?;
        self.log_displaced(&updated).await;

        self.notify.send(&Event::ExceptionWritten(updated.clone()));
        info!(%id, span = %updated.span, "exception updated");
        Ok(updated)
    }

    /// Tombstone an exception; the time it blocked becomes bookable again.
    pub async fn delete_availability_exception(
        &self,
        id: Ulid,
        actor: Option<Ulid>,
    ) -> Result<AvailabilityException, EngineError> {
        let started = Instant::now();
        let result = self.delete_exception_once(id, actor).await;
        record_outcome("delete_exception", &result, started);
        result
    }

    async fn delete_exception_once(
        &self,
        id: Ulid,
        actor: Option<Ulid>,
    ) -> Result<AvailabilityException, EngineError> {
        if self.store.get_exception(id).await?.deleted {
            return Err(EngineError::NotFound(id));
        }
        let deleted = self.store.soft_delete_exception(id, actor, now_ms()).await?;
        self.notify.send(&Event::ExceptionWritten(deleted.clone()));
        info!(%id, "exception deleted");
        Ok(deleted)
    }

    /// Validated stored span and parsed rule of an exception.
    ///
    /// Full-day exceptions are stored as the whole local day of `start`; their
    /// `end` is ignored. Rules are anchored on that same local date.
    fn shape_exception(
        &self,
        start: Ms,
        end: Ms,
        is_full_day: bool,
        is_recurring: bool,
        rule: Option<&str>,
    ) -> Result<(Span, Option<RecurrenceRule>), EngineError> {
        let span = if is_full_day {
            if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
                return Err(EngineError::validation("timestamp out of range"));
            }
            self.calendar.day_span(self.calendar.local_date(start))
        } else {
            let span = Span::checked(start, end)
                .ok_or_else(|| EngineError::validation("start must be before end"))?;
            validate_span(&span)?;
            span
        };

        let anchor = self.calendar.local_date(span.start);
        let recurrence = match (is_recurring, rule.filter(|r| !r.trim().is_empty())) {
            (true, Some(text)) => Some(RecurrenceRule::parse(text, anchor)?),
            (true, None) => {
                return Err(EngineError::validation("recurring exception needs a recurrence rule"));
            }
            (false, Some(_)) => {
                return Err(EngineError::validation(
                    "recurrence rule given for a non-recurring exception",
                ));
            }
            (false, None) => None,
        };
        Ok((span, recurrence))
    }

    async fn log_displaced(&self, exception: &AvailabilityException) {
        if exception.is_recurring() {
            return;
        }
        if let Ok(bookings) = self
            .store
            .query_bookings(Subject::Staff(exception.staff_id), exception.span, true)
            .await
            && !bookings.is_empty()
        {
            info!(
                id = %exception.id,
                staff = %exception.staff_id,
                bookings = bookings.len(),
                "exception covers existing bookings"
            );
        }
    }

    // ── Working hours ────────────────────────────────────────────

    /// Replace a staff member's weekly hours. `None` removes the restriction.
    pub async fn set_working_hours(
        &self,
        business_id: Ulid,
        staff_id: Ulid,
        hours: Option<WeeklyHours>,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.set_hours_once(business_id, staff_id, hours).await;
        record_outcome("set_working_hours", &result, started);
        result
    }

    async fn set_hours_once(
        &self,
        business_id: Ulid,
        staff_id: Ulid,
        hours: Option<WeeklyHours>,
    ) -> Result<(), EngineError> {
        self.ensure_owned(EntityRef::Staff(staff_id), business_id).await?;
        if let Some(hours) = &hours {
            validate_hours(hours)?;
        }
        self.store.set_working_hours(staff_id, hours.clone()).await?;
        self.notify.send(&Event::WorkingHoursSet { staff_id, hours });
        info!(staff = %staff_id, "working hours set");
        Ok(())
    }
}

fn validate_notes(notes: &str) -> Result<(), EngineError> {
    if notes.len() > MAX_NOTES_LEN {
        return Err(EngineError::validation(format!(
            "notes exceed {MAX_NOTES_LEN} bytes"
        )));
    }
    Ok(())
}

fn validate_hours(hours: &WeeklyHours) -> Result<(), EngineError> {
    if hours.windows.len() > MAX_WINDOWS_PER_WEEK {
        return Err(EngineError::validation(format!(
            "at most {MAX_WINDOWS_PER_WEEK} windows per week"
        )));
    }
    if let Some(w) = hours.windows.iter().find(|w| w.open >= w.close) {
        return Err(EngineError::validation(format!(
            "window on {} opens at {} but closes at {}",
            w.weekday, w.open, w.close
        )));
    }
    let days: HashSet<_> = hours.windows.iter().map(|w| w.weekday).collect();
    for day in days {
        let mut windows: Vec<&WorkWindow> = hours.windows_on(day).collect();
        windows.sort_by_key(|w| w.open);
        if windows.windows(2).any(|pair| pair[1].open < pair[0].close) {
            return Err(EngineError::validation(format!(
                "overlapping windows on {day}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn hours_validation() {
        let ok = WeeklyHours::new(vec![
            WorkWindow { weekday: Weekday::Mon, open: t(9, 0), close: t(12, 0) },
            WorkWindow { weekday: Weekday::Mon, open: t(12, 0), close: t(17, 0) },
            WorkWindow { weekday: Weekday::Tue, open: t(9, 0), close: t(17, 0) },
        ]);
        assert!(validate_hours(&ok).is_ok());

        let inverted = WeeklyHours::new(vec![WorkWindow {
            weekday: Weekday::Mon,
            open: t(17, 0),
            close: t(9, 0),
        }]);
        assert!(validate_hours(&inverted).unwrap_err().is_validation());

        let overlapping = WeeklyHours::new(vec![
            WorkWindow { weekday: Weekday::Wed, open: t(9, 0), close: t(13, 0) },
            WorkWindow { weekday: Weekday::Wed, open: t(12, 30), close: t(17, 0) },
        ]);
        assert!(validate_hours(&overlapping).is_err());

        let too_many = WeeklyHours::uniform(&[Weekday::Fri; MAX_WINDOWS_PER_WEEK + 1], t(9, 0), t(10, 0));
        assert!(validate_hours(&too_many).is_err());
    }

    #[test]
    fn notes_limit() {
        assert!(validate_notes(&"x".repeat(MAX_NOTES_LEN)).is_ok());
        assert!(validate_notes(&"x".repeat(MAX_NOTES_LEN + 1)).is_err());
    }
}
