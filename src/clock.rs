//! Wall-clock helpers. Delivery times on the wire are epoch seconds.

use chrono::Utc;

/// Current time as fractional epoch seconds.
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Current time as an RFC 3339 string, for records and log lines.
pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_now_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(epoch_now() > 1_577_836_800.0);
    }

    #[test]
    fn test_rfc3339_parses_back() {
        let now = rfc3339_now();
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
