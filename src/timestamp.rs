//! `timestamptz` text helpers.

use chrono::{DateTime, FixedOffset, Local, ParseError, TimeZone};

/// Renders `at` as `YYYY-MM-DDTHH:MM:SS±HH:MM`, keeping its own offset.
///
/// Sub-second precision is dropped.
#[must_use]
pub fn to_pg_timestamptz<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Current local time in [`to_pg_timestamptz`] form.
#[must_use]
pub fn now_pg_timestamptz() -> String {
    to_pg_timestamptz(&Local::now())
}

/// Parses `timestamptz` text.
///
/// Accepts RFC 3339 as well as PostgreSQL's default output style
/// (`2024-03-05 07:08:09.123+08`).
///
/// # Errors
///
/// Returns the parse error of the PostgreSQL-style attempt if neither form
/// matches.
pub fn from_pg_timestamptz(value: &str) -> Result<DateTime<FixedOffset>, ParseError> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z"))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn offset(hours: i32) -> FixedOffset {
        let Some(offset) = FixedOffset::east_opt(hours * 3600) else {
            panic!("valid offset");
        };
        offset
    }

    #[test]
    fn renders_with_colon_offset() {
        let Some(at) = offset(8).with_ymd_and_hms(2024, 3, 5, 7, 8, 9).single() else {
            panic!("valid time");
        };
        assert_eq!(to_pg_timestamptz(&at), "2024-03-05T07:08:09+08:00");

        let Some(west) = offset(-5).with_ymd_and_hms(2024, 12, 31, 23, 0, 0).single() else {
            panic!("valid time");
        };
        assert_eq!(to_pg_timestamptz(&west), "2024-12-31T23:00:00-05:00");
    }

    #[test]
    fn parses_rendered_text_back() {
        let Some(at) = offset(8).with_ymd_and_hms(2024, 3, 5, 7, 8, 9).single() else {
            panic!("valid time");
        };
        let Ok(parsed) = from_pg_timestamptz(&to_pg_timestamptz(&at)) else {
            panic!("rendered text must parse");
        };
        assert_eq!(parsed, at);
    }

    #[test]
    fn parses_postgres_output_style() {
        let Ok(parsed) = from_pg_timestamptz("2024-03-05 07:08:09.25+08") else {
            panic!("postgres style must parse");
        };
        assert_eq!(parsed.offset(), &offset(8));
        assert_eq!(parsed.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn rejects_garbage() {
        assert!(from_pg_timestamptz("yesterday").is_err());
    }

    #[test]
    fn now_is_parseable() {
        tokio_test::assert_ok!(from_pg_timestamptz(&now_pg_timestamptz()));
    }
}
