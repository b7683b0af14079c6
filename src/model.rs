use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::recurrence::RecurrenceRule;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but rejects empty or inverted bounds instead of asserting.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The part of `self` inside `window`, if any.
    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        Span::checked(self.start.max(window.start), self.end.min(window.end))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Whose calendar a booking occupies. Conflicts are only ever checked within one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Staff(Ulid),
    Resource(Ulid),
}

impl Subject {
    pub fn id(&self) -> Ulid {
        match self {
            Subject::Staff(id) | Subject::Resource(id) => *id,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, Subject::Staff(_))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Staff(id) => write!(f, "staff:{id}"),
            Subject::Resource(id) => write!(f, "resource:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    #[default]
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    /// Cancelled and no-show bookings no longer hold their slot.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::NoShow)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        *self == next || !self.is_terminal()
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(BookingStatus::Scheduled),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "in_progress" => Ok(BookingStatus::InProgress),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "no_show" => Ok(BookingStatus::NoShow),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    TimeOff,
    Holiday,
    CustomHours,
}

impl ExceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionKind::TimeOff => "time_off",
            ExceptionKind::Holiday => "holiday",
            ExceptionKind::CustomHours => "custom_hours",
        }
    }
}

impl FromStr for ExceptionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_off" => Ok(ExceptionKind::TimeOff),
            "holiday" => Ok(ExceptionKind::Holiday),
            "custom_hours" => Ok(ExceptionKind::CustomHours),
            other => Err(format!("unknown exception type: {other}")),
        }
    }
}

/// Who touched a record and when. Held as a field by every entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub created_by: Option<Ulid>,
    pub created_at: Ms,
    pub updated_by: Option<Ulid>,
    pub updated_at: Ms,
    pub deleted_by: Option<Ulid>,
    pub deleted_at: Option<Ms>,
}

impl AuditInfo {
    pub fn created(actor: Option<Ulid>, at: Ms) -> Self {
        Self {
            created_by: actor,
            created_at: at,
            updated_by: actor,
            updated_at: at,
            deleted_by: None,
            deleted_at: None,
        }
    }

    pub fn touch(&mut self, actor: Option<Ulid>, at: Ms) {
        self.updated_by = actor;
        self.updated_at = at;
    }

    pub fn tombstone(&mut self, actor: Option<Ulid>, at: Ms) {
        self.touch(actor, at);
        self.deleted_by = actor;
        self.deleted_at = Some(at);
    }
}

/// An appointment (staff subject) or a resource booking (resource subject).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub business_id: Ulid,
    pub subject: Subject,
    pub client_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    /// Set on resource bookings made for an appointment.
    pub appointment_id: Option<Ulid>,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    /// Tombstone flag. Tombstoned bookings never take part in conflict checks.
    pub deleted: bool,
    pub audit: AuditInfo,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        !self.deleted && self.status.holds_slot()
    }

    /// Apply field changes. Callers validate the result.
    pub fn apply(&mut self, changes: &BookingChanges) {
        if let Some(start) = changes.start {
            self.span.start = start;
        }
        if let Some(end) = changes.end {
            self.span.end = end;
        }
        if let Some(status) = changes.status {
            self.status = status;
        }
        if let Some(client_id) = changes.client_id {
            self.client_id = Some(client_id);
        }
        if let Some(service_id) = changes.service_id {
            self.service_id = Some(service_id);
        }
        if let Some(ref notes) = changes.notes {
            self.notes = Some(notes.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub id: Ulid,
    pub business_id: Ulid,
    pub staff_id: Ulid,
    pub kind: ExceptionKind,
    /// For full-day exceptions only the local date of `span.start` matters.
    pub span: Span,
    pub is_full_day: bool,
    /// Present iff the exception repeats.
    pub recurrence: Option<RecurrenceRule>,
    pub notes: Option<String>,
    pub deleted: bool,
    pub audit: AuditInfo,
}

impl AvailabilityException {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }
}

/// One opening window of a staff member's regular week, in business-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkWindow {
    pub weekday: Weekday,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

/// Base weekly working hours. Time outside every window is unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    pub windows: Vec<WorkWindow>,
}

impl WeeklyHours {
    pub fn new(windows: Vec<WorkWindow>) -> Self {
        Self { windows }
    }

    /// Same window on each of the given weekdays.
    pub fn uniform(days: &[Weekday], open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            windows: days
                .iter()
                .map(|&weekday| WorkWindow { weekday, open, close })
                .collect(),
        }
    }

    pub fn windows_on(&self, weekday: Weekday) -> impl Iterator<Item = &WorkWindow> {
        self.windows.iter().filter(move |w| w.weekday == weekday)
    }
}

/// Everything stored for one subject. Bookings are kept sorted by start.
#[derive(Debug, Clone, Default)]
pub struct SubjectState {
    pub bookings: Vec<Booking>,
    /// Staff subjects only.
    pub exceptions: Vec<AvailabilityException>,
    pub hours: Option<WeeklyHours>,
}

impl SubjectState {
    /// Insert maintaining sort order by start (binary search).
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Replace a booking by id (or insert it), returning the previous version.
    pub fn upsert_booking(&mut self, booking: Booking) -> Option<Booking> {
        let previous = self.remove_booking(booking.id);
        self.insert_booking(booking);
        previous
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn upsert_exception(&mut self, exception: AvailabilityException) -> Option<AvailabilityException> {
        if let Some(slot) = self.exceptions.iter_mut().find(|e| e.id == exception.id) {
            return Some(std::mem::replace(slot, exception));
        }
        self.exceptions.push(exception);
        None
    }

    pub fn exception(&self, id: Ulid) -> Option<&AvailabilityException> {
        self.exceptions.iter().find(|e| e.id == id)
    }

    /// Exceptions that may block `query`: stored span overlaps, or recurring and
    /// anchored before the window ends.
    pub fn exceptions_for(&self, query: &Span) -> impl Iterator<Item = &AvailabilityException> {
        self.exceptions.iter().filter(move |e| {
            e.span.overlaps(query) || (e.is_recurring() && e.span.start < query.end)
        })
    }

    /// Snapshot events that recreate this state on replay.
    pub fn snapshot(&self, subject: Subject) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .bookings
            .iter()
            .cloned()
            .map(Event::BookingWritten)
            .collect();
        events.extend(self.exceptions.iter().cloned().map(Event::ExceptionWritten));
        if let (Subject::Staff(staff_id), Some(hours)) = (subject, &self.hours) {
            events.push(Event::WorkingHoursSet {
                staff_id,
                hours: Some(hours.clone()),
            });
        }
        events
    }
}

/// The event types. This is both the WAL record payload and the change-feed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Full snapshot of a booking after insert, update, cancel or tombstone.
    BookingWritten(Booking),
    /// Full snapshot of an exception after insert, update or tombstone.
    ExceptionWritten(AvailabilityException),
    WorkingHoursSet {
        staff_id: Ulid,
        hours: Option<WeeklyHours>,
    },
}

impl Event {
    pub fn subject(&self) -> Subject {
        match self {
            Event::BookingWritten(b) => b.subject,
            Event::ExceptionWritten(e) => Subject::Staff(e.staff_id),
            Event::WorkingHoursSet { staff_id, .. } => Subject::Staff(*staff_id),
        }
    }
}

// ── Request and query types ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub business_id: Ulid,
    pub subject: Subject,
    pub client_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub appointment_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub actor: Option<Ulid>,
}

impl BookingRequest {
    pub fn new(business_id: Ulid, subject: Subject, start: Ms, end: Ms) -> Self {
        Self {
            id: None,
            business_id,
            subject,
            client_id: None,
            service_id: None,
            appointment_id: None,
            start,
            end,
            status: BookingStatus::Scheduled,
            notes: None,
            actor: None,
        }
    }

    pub fn with_client(mut self, client_id: Ulid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn with_service(mut self, service_id: Ulid) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn for_appointment(mut self, appointment_id: Ulid) -> Self {
        self.appointment_id = Some(appointment_id);
        self
    }

    pub fn by(mut self, actor: Ulid) -> Self {
        self.actor = Some(actor);
        self
    }
}

/// Field changes for an existing booking. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<BookingStatus>,
    pub client_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub notes: Option<String>,
}

impl BookingChanges {
    pub fn reschedule(start: Ms, end: Ms) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    pub fn status(status: BookingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInput {
    pub id: Option<Ulid>,
    pub business_id: Ulid,
    pub staff_id: Ulid,
    pub kind: ExceptionKind,
    pub start: Ms,
    pub end: Ms,
    pub is_full_day: bool,
    pub is_recurring: bool,
    /// JSON object or `FREQ=...;BYDAY=...` text; required when `is_recurring`.
    pub recurrence_rule: Option<String>,
    pub notes: Option<String>,
    pub actor: Option<Ulid>,
}

impl ExceptionInput {
    pub fn new(business_id: Ulid, staff_id: Ulid, kind: ExceptionKind, start: Ms, end: Ms) -> Self {
        Self {
            id: None,
            business_id,
            staff_id,
            kind,
            start,
            end,
            is_full_day: false,
            is_recurring: false,
            recurrence_rule: None,
            notes: None,
            actor: None,
        }
    }

    pub fn full_day(mut self) -> Self {
        self.is_full_day = true;
        self
    }

    pub fn recurring(mut self, rule: impl Into<String>) -> Self {
        self.is_recurring = true;
        self.recurrence_rule = Some(rule.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionChanges {
    pub kind: Option<ExceptionKind>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub is_full_day: Option<bool>,
    pub is_recurring: Option<bool>,
    pub recurrence_rule: Option<String>,
    pub notes: Option<String>,
}

/// 1-based page. A zero page size means "use the configured default".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, page_size: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingScope {
    Staff(Ulid),
    Resource(Ulid),
    Business(Ulid),
    Client(Ulid),
}

/// Store-level listing request: bookings overlapping `span`, ordered by start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingQuery {
    pub scope: BookingScope,
    pub span: Span,
    pub include_deleted: bool,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionScope {
    Staff(Ulid),
    Business(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionQuery {
    pub scope: ExceptionScope,
    pub span: Span,
    pub include_deleted: bool,
    pub offset: usize,
    pub limit: usize,
}
