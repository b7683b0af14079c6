use crate::model::*;

use super::calendar::Calendar;

// ── Unavailability ────────────────────────────────────────────────

/// Concrete blocked spans produced by one exception that overlap `query`.
///
/// Full-day exceptions block the whole local day of their start. Recurring
/// occurrences keep the anchor's time of day and duration; a full-day recurring
/// exception blocks each matching local day.
pub fn expand_exception(cal: &Calendar, exc: &AvailabilityException, query: &Span) -> Vec<Span> {
    if !exc.is_active() {
        return Vec::new();
    }
    let Some(rule) = &exc.recurrence else {
        let effective = if exc.is_full_day {
            cal.day_span(cal.local_date(exc.span.start))
        } else {
            exc.span
        };
        return if effective.overlaps(query) {
            vec![effective]
        } else {
            Vec::new()
        };
    };

    let anchor = cal.local_date(exc.span.start);
    let start_time = cal.time_of_day(exc.span.start);
    let duration = exc.span.duration_ms();

    // Any occurrence starting less than `duration` before the query can still
    // reach into it, however many days back that is.
    let reach_back = cal.local_date(query.start.saturating_sub(duration));
    let first = reach_back.pred_opt().unwrap_or(reach_back);
    let last = cal.local_date(query.end - 1);

    first
        .iter_days()
        .take_while(|d| *d <= last)
        .filter(|d| rule.occurs(anchor, *d))
        .filter_map(|d| {
            if exc.is_full_day {
                Some(cal.day_span(d))
            } else {
                let start = cal.at(d, start_time);
                Span::checked(start, start + duration)
            }
        })
        .filter(|s| s.overlaps(query))
        .collect()
}

/// Time outside the weekly working windows on every local day `query` touches.
pub fn off_hours(cal: &Calendar, hours: &WeeklyHours, query: &Span) -> Vec<Span> {
    let mut result = Vec::new();
    for date in cal.dates_touching(query) {
        let day = cal.day_span(date);
        let mut open: Vec<Span> = hours
            .windows_on(chrono::Datelike::weekday(&date))
            .filter_map(|w| Span::checked(cal.at(date, w.open), cal.at(date, w.close)))
            .collect();
        open.sort_by_key(|s| s.start);
        let open = merge_overlapping(&open);
        result.extend(
            subtract_intervals(&[day], &open)
                .into_iter()
                .filter(|s| s.overlaps(query)),
        );
    }
    result
}

/// Union of everything that makes a staff member unavailable within `query`,
/// ascending by start and merged.
pub fn unavailable_intervals(
    cal: &Calendar,
    exceptions: &[AvailabilityException],
    hours: Option<&WeeklyHours>,
    query: &Span,
) -> Vec<Span> {
    let mut spans: Vec<Span> = exceptions
        .iter()
        .flat_map(|exc| expand_exception(cal, exc, query))
        .collect();
    if let Some(hours) = hours {
        spans.extend(off_hours(cal, hours, query));
    }
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Free gaps in `query` after removing unavailable time and active bookings.
/// Gaps shorter than `min_duration` are dropped.
pub fn free_slots(query: &Span, unavailable: &[Span], busy: &[Span], min_duration: Ms) -> Vec<Span> {
    let mut blocked: Vec<Span> = unavailable.iter().chain(busy).copied().collect();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    subtract_intervals(&[*query], &blocked)
        .into_iter()
        .filter(|s| s.duration_ms() >= min_duration.max(1))
        .collect()
}

// ── Interval arithmetic ───────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
