//! A 5-field cron matcher: minute, hour, day-of-month, month, day-of-week
//! (0 = Sunday). Ranges and `@`-macros are intentionally unsupported; an
//! ill-formed field makes the whole expression not match (safe default).

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Evaluates `expr` against `when`. Returns `false` for any malformed field.
pub fn matches(expr: &str, when: DateTime<Utc>) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    let minute = when.minute() as i64;
    let hour = when.hour() as i64;
    let day = when.day() as i64;
    let month = when.month() as i64;
    let weekday = when.weekday().num_days_from_sunday() as i64;

    field_matches(fields[0], minute)
        && field_matches(fields[1], hour)
        && field_matches(fields[2], day)
        && field_matches(fields[3], month)
        && field_matches(fields[4], weekday)
}

fn field_matches(field: &str, value: i64) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return match step.parse::<i64>() {
            Ok(n) if n > 0 => value % n == 0,
            _ => false,
        };
    }
    if field.contains(',') {
        return field.split(',').all(|p| !p.is_empty()) && field.split(',').any(|p| {
            p.parse::<i64>().map(|n| n == value).unwrap_or(false)
        });
    }
    field.parse::<i64>().map(|n| n == value).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn wildcard_matches_everything() {
        assert!(matches("* * * * *", t("2026-03-01T04:00:00Z")));
    }

    #[test]
    fn exact_fields_match() {
        assert!(matches("0 4 * * *", t("2026-03-01T04:00:00Z")));
        assert!(!matches("0 4 * * *", t("2026-03-01T04:01:00Z")));
    }

    #[test]
    fn step_expression() {
        assert!(matches("*/15 * * * *", t("2026-03-01T04:30:00Z")));
        assert!(!matches("*/15 * * * *", t("2026-03-01T04:31:00Z")));
    }

    #[test]
    fn comma_list() {
        assert!(matches("0,30 * * * *", t("2026-03-01T04:30:00Z")));
        assert!(matches("0,30 * * * *", t("2026-03-01T04:00:00Z")));
        assert!(!matches("0,30 * * * *", t("2026-03-01T04:15:00Z")));
    }

    #[test]
    fn malformed_field_never_matches() {
        assert!(!matches("bogus * * * *", t("2026-03-01T04:00:00Z")));
        assert!(!matches("*/0 * * * *", t("2026-03-01T04:00:00Z")));
        assert!(!matches("* * * *", t("2026-03-01T04:00:00Z")));
        assert!(!matches("0,,1 * * * *", t("2026-03-01T04:00:00Z")));
    }

    #[test]
    fn day_of_week_sunday_is_zero() {
        // 2026-03-01 is a Sunday.
        assert!(matches("* * * * 0", t("2026-03-01T12:00:00Z")));
        assert!(!matches("* * * * 1", t("2026-03-01T12:00:00Z")));
    }

    #[test]
    fn weekday_reference() {
        let sunday = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(sunday.weekday().num_days_from_sunday(), 0);
    }
}
