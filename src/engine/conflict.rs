use chrono::Utc;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::validation("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::validation("span too wide"));
    }
    Ok(())
}

/// Half-open overlap test against a list of occupied spans.
/// Back-to-back spans (`a.end == b.start`) never conflict.
pub fn has_conflict(candidate: &Span, existing: &[Span]) -> bool {
    existing.iter().any(|s| s.overlaps(candidate))
}

/// First unavailable span that `candidate` runs into.
pub fn first_blocking(candidate: &Span, unavailable: &[Span]) -> Option<Span> {
    unavailable.iter().copied().find(|s| s.overlaps(candidate))
}

/// First active booking overlapping `candidate`, skipping `exclude`
/// (the booking being updated).
pub fn first_conflict<'a>(
    candidate: &Span,
    bookings: impl IntoIterator<Item = &'a Booking>,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    bookings
        .into_iter()
        .filter(|b| Some(b.id) != exclude)
        .find(|b| b.is_active() && b.span.overlaps(candidate))
}

/// Reject two requests in the same batch that overlap on one subject.
pub(crate) fn check_batch_overlaps(bookings: &[Booking]) -> Result<(), EngineError> {
    for (i, a) in bookings.iter().enumerate() {
        for b in &bookings[i + 1..] {
            if a.subject == b.subject && a.span.overlaps(&b.span) {
                return Err(EngineError::Conflict { with: Some(a.id) });
            }
        }
    }
    Ok(())
}
