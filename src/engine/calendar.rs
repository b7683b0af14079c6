use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

/// Business-local calendar arithmetic over Unix-millisecond instants.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
    tz: Tz,
}

impl Default for Calendar {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl Calendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn local(&self, t: Ms) -> NaiveDateTime {
        DateTime::<Utc>::from_timestamp_millis(t)
            .unwrap_or_default()
            .with_timezone(&self.tz)
            .naive_local()
    }

    pub fn local_date(&self, t: Ms) -> NaiveDate {
        self.local(t).date()
    }

    pub fn time_of_day(&self, t: Ms) -> NaiveTime {
        self.local(t).time()
    }

    /// Instant of a local wall-clock time. Ambiguous times (DST fall-back) resolve
    /// to the earlier instant; times inside a DST gap move forward past the gap.
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        let naive = date.and_time(time);
        if let Some(dt) = self.tz.from_local_datetime(&naive).earliest() {
            return dt.timestamp_millis();
        }
        // Inside a gap: keep the offset in force before the transition, which
        // lands `naive` exactly one gap length later on the new wall clock.
        // Transitions are months apart, so a day earlier is still before the gap.
        let before = self.tz.offset_from_utc_datetime(&(naive - Duration::days(1)));
        (naive - Duration::seconds(i64::from(before.fix().local_minus_utc())))
            .and_utc()
            .timestamp_millis()
    }

    pub fn midnight(&self, date: NaiveDate) -> Ms {
        self.at(date, NaiveTime::MIN)
    }

    /// `[midnight(date), midnight(date + 1))`. 23 or 25 hours across DST changes.
    pub fn day_span(&self, date: NaiveDate) -> Span {
        let next = date.succ_opt().unwrap_or(date);
        let start = self.midnight(date);
        let end = self.midnight(next);
        Span::checked(start, end).unwrap_or(Span {
            start,
            end: start + 24 * 3_600_000,
        })
    }

    /// Half-open span covering the inclusive local date range `from..=to`.
    pub fn date_range_span(&self, from: NaiveDate, to: NaiveDate) -> Option<Span> {
        let after = to.succ_opt()?;
        Span::checked(self.midnight(from), self.midnight(after))
    }

    /// Every local date that `span` touches, in order.
    pub fn dates_touching(&self, span: &Span) -> impl Iterator<Item = NaiveDate> + use<> {
        let first = self.local_date(span.start);
        let last = self.local_date(span.end - 1);
        first.iter_days().take_while(move |d| *d <= last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn ms(rfc3339: &str) -> Ms {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().timestamp_millis()
    }

    #[test]
    fn utc_day_span() {
        let cal = Calendar::default();
        let span = cal.day_span(date(2025, 12, 25));
        assert_eq!(span.start, ms("2025-12-25T00:00:00Z"));
        assert_eq!(span.end, ms("2025-12-26T00:00:00Z"));
        assert_eq!(cal.local_date(ms("2025-12-25T23:59:59Z")), date(2025, 12, 25));
    }

    #[test]
    fn local_day_in_other_timezone() {
        let cal = Calendar::new(chrono_tz::America::New_York);
        // 03:00 UTC on Dec 26 is still Dec 25 in New York
        assert_eq!(cal.local_date(ms("2025-12-26T03:00:00Z")), date(2025, 12, 25));
        assert_eq!(cal.midnight(date(2025, 12, 25)), ms("2025-12-25T05:00:00Z"));
        assert_eq!(cal.time_of_day(ms("2025-12-25T14:30:00Z")), hm(9, 30));
    }

    #[test]
    fn dst_days_have_23_and_25_hours() {
        let cal = Calendar::new(chrono_tz::Europe::Berlin);
        let spring = cal.day_span(date(2025, 3, 30));
        assert_eq!(spring.duration_ms(), 23 * 3_600_000);
        let autumn = cal.day_span(date(2025, 10, 26));
        assert_eq!(autumn.duration_ms(), 25 * 3_600_000);
    }

    #[test]
    fn gap_times_move_forward() {
        let cal = Calendar::new(chrono_tz::Europe::Berlin);
        // 02:00-03:00 does not exist on 2025-03-30 in Berlin; gap times shift by one hour
        let ten_past = cal.at(date(2025, 3, 30), hm(2, 10));
        let half_past = cal.at(date(2025, 3, 30), hm(2, 30));
        assert_eq!(ten_past, ms("2025-03-30T01:10:00Z"));
        assert_eq!(half_past, ms("2025-03-30T01:30:00Z"));
        assert!(ten_past < half_past);
        assert_eq!(cal.at(date(2025, 3, 30), hm(3, 0)), ms("2025-03-30T01:00:00Z"));
        assert_eq!(cal.at(date(2025, 3, 30), hm(1, 59)), ms("2025-03-30T00:59:00Z"));
    }

    #[test]
    fn gap_window_keeps_its_length() {
        let cal = Calendar::new(chrono_tz::America::New_York);
        // 02:10-02:30 on 2026-03-08 falls in the spring-forward gap
        let open = cal.at(date(2026, 3, 8), hm(2, 10));
        let close = cal.at(date(2026, 3, 8), hm(2, 30));
        assert_eq!(Span::checked(open, close).map(|s| s.duration_ms()), Some(20 * 60_000));
        assert_eq!(open, ms("2026-03-08T07:10:00Z"));
    }

    #[test]
    fn ambiguous_times_take_earliest() {
        let cal = Calendar::new(chrono_tz::Europe::Berlin);
        // 02:30 happens twice on 2025-10-26; the first is still CEST (UTC+2)
        let t = cal.at(date(2025, 10, 26), hm(2, 30));
        assert_eq!(t, ms("2025-10-26T00:30:00Z"));
    }

    #[test]
    fn dates_touching_is_half_open() {
        let cal = Calendar::default();
        let span = Span::new(ms("2025-01-05T10:00:00Z"), ms("2025-01-07T00:00:00Z"));
        let dates: Vec<_> = cal.dates_touching(&span).collect();
        assert_eq!(dates, vec![date(2025, 1, 5), date(2025, 1, 6)]);
    }

    #[test]
    fn inclusive_date_range() {
        let cal = Calendar::default();
        let span = cal.date_range_span(date(2025, 1, 1), date(2025, 1, 31)).unwrap();
        assert_eq!(span, Span::new(ms("2025-01-01T00:00:00Z"), ms("2025-02-01T00:00:00Z")));
        assert!(cal.date_range_span(date(2025, 2, 1), date(2025, 1, 1)).is_none());
    }
}
