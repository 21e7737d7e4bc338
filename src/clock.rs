// Clock & Time-Zone Normalizer
//
// All temporal comparisons inside the engine use UTC instants. Civil (local) time only
// appears at the boundary, where Nepal wall-clock strings are converted with the fixed
// +05:45 offset, and when evaluating daily time slots, weekends and holidays.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc, Weekday, Datelike};

use crate::promotions::error::{PResult, PromotionError};

/// Nepal Standard Time offset from UTC in seconds (+05:45)
pub const NEPAL_OFFSET_SECONDS: i32 = 5 * 3600 + 45 * 60;

/// Wall-clock format accepted and produced at the API boundary
pub const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ACCEPTED_LOCAL_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Source of the current instant
///
/// Engines take a clock instead of calling `Utc::now()` directly so that
/// temporal rules can be exercised deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a single instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// The fixed regional offset used for every civil-time conversion
pub fn nepal_offset() -> FixedOffset {
    FixedOffset::east_opt(NEPAL_OFFSET_SECONDS).unwrap_or_else(|| Utc.fix())
}

/// Parse a Nepal civil timestamp (`YYYY-MM-DDTHH:mm:ss`, no offset) into a UTC instant
pub fn parse_local(value: &str) -> PResult<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PromotionError::ValidationError("Date value is required".to_string()));
    }

    let naive = ACCEPTED_LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| {
            PromotionError::ValidationError(format!(
                "Invalid date '{}': expected YYYY-MM-DDTHH:mm:ss",
                trimmed
            ))
        })?;

    from_local(naive)
}

/// Convert a Nepal civil date-time to a UTC instant
pub fn from_local(naive: NaiveDateTime) -> PResult<DateTime<Utc>> {
    nepal_offset()
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| PromotionError::ValidationError(format!("Ambiguous local time: {}", naive)))
}

/// Convert a UTC instant to Nepal civil date-time
pub fn to_local(instant: DateTime<Utc>) -> NaiveDateTime {
    instant.with_timezone(&nepal_offset()).naive_local()
}

/// Format a UTC instant as a Nepal civil string for the API boundary
pub fn format_local(instant: DateTime<Utc>) -> String {
    to_local(instant).format(LOCAL_FORMAT).to_string()
}

pub fn local_time_of_day(instant: DateTime<Utc>) -> NaiveTime {
    to_local(instant).time()
}

pub fn local_date(instant: DateTime<Utc>) -> NaiveDate {
    to_local(instant).date()
}

pub fn local_weekday(instant: DateTime<Utc>) -> Weekday {
    to_local(instant).weekday()
}

/// Whether the civil day of `instant` is Saturday or Sunday
pub fn is_local_weekend(instant: DateTime<Utc>) -> bool {
    matches!(local_weekday(instant), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_applies_offset() {
        let instant = parse_local("2024-01-15T10:00:00").unwrap();
        assert_eq!(instant, Utc.with_ymd_and_hms(2024, 1, 15, 4, 15, 0).unwrap());
    }

    #[test]
    fn test_parse_local_crosses_midnight() {
        // 03:00 local is still the previous UTC day
        let instant = parse_local("2024-03-01T03:00:00").unwrap();
        assert_eq!(instant, Utc.with_ymd_and_hms(2024, 2, 29, 21, 15, 0).unwrap());
    }

    #[test]
    fn test_parse_local_accepts_minutes_only() {
        let instant = parse_local(" 2024-01-15T10:00 ").unwrap();
        assert_eq!(instant, Utc.with_ymd_and_hms(2024, 1, 15, 4, 15, 0).unwrap());
    }

    #[test]
    fn test_parse_local_rejects_garbage() {
        let err = parse_local("15/01/2024").unwrap_err();
        assert!(matches!(err, PromotionError::ValidationError(_)));

        let err = parse_local("   ").unwrap_err();
        assert!(matches!(err, PromotionError::ValidationError(_)));
    }

    #[test]
    fn test_round_trip_formatting() {
        let instant = parse_local("2024-07-04T23:30:15").unwrap();
        assert_eq!(format_local(instant), "2024-07-04T23:30:15");
    }

    #[test]
    fn test_local_time_of_day() {
        let instant = Utc.with_ymd_and_hms(2024, 1, 15, 18, 15, 0).unwrap();
        assert_eq!(local_time_of_day(instant), NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(local_date(instant), NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
    }

    #[test]
    fn test_weekend_uses_civil_day() {
        // Friday 20:00 UTC is Saturday 01:45 in Nepal
        let instant = Utc.with_ymd_and_hms(2024, 1, 19, 20, 0, 0).unwrap();
        assert_eq!(local_weekday(instant), Weekday::Sat);
        assert!(is_local_weekend(instant));

        let monday = Utc.with_ymd_and_hms(2024, 1, 22, 6, 0, 0).unwrap();
        assert!(!is_local_weekend(monday));
    }

    #[test]
    fn test_fixed_clock() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(FixedClock(instant).now(), instant);
    }
}
