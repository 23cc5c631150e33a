//! Fixed-width UTC timestamps stored as text.
//!
//! Every stored time uses `YYYY-MM-DDTHH:MM:SSZ`, zero padded, so that
//! comparing two values as strings gives the same answer as comparing them
//! as times. Expiry and pruning queries rely on this.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Error, Result};

pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format(at: DateTime<Utc>) -> String {
    at.format(FORMAT).to_string()
}

pub fn now() -> String {
    format(Utc::now())
}

pub fn parse(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::CorruptTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_format_is_fixed_width() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format(at), "2024-01-02T03:04:05Z");
        assert_eq!(parse("2024-01-02T03:04:05Z").unwrap(), at);
    }

    #[test]
    fn test_string_order_matches_time_order() {
        let base = Utc.with_ymd_and_hms(2024, 9, 30, 23, 59, 59).unwrap();
        let later = base + Duration::seconds(1);
        assert!(format(base) < format(later));
    }

    #[test]
    fn test_parse_rejects_other_formats() {
        assert!(matches!(
            parse("2024-01-02 03:04:05"),
            Err(Error::CorruptTimestamp(_))
        ));
    }
}
