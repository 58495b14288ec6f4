//! Diagnostic response headers.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

/// Remaining allowance after decay.
pub const REMAINING: &str = "RateLimit-Remaining";
/// Length of one decay tick.
pub const LEAK_RATE: &str = "RateLimit-LeakRate";
/// Units drained per tick.
pub const LEAK_AMOUNT: &str = "RateLimit-LeakAmount";
/// Bucket capacity.
pub const BUCKET_SIZE: &str = "RateLimit-BucketSize";
/// Units consumed per admitted request.
pub const COST: &str = "RateLimit-Cost";

const NANOS_PER_TICK: u32 = 100;

/// Render a duration as `[d.]hh:mm:ss[.fffffff]`.
///
/// Days appear only when non-zero; the fraction (in 100ns ticks) only when the
/// duration is not a whole number of seconds.
///
/// ```
/// use leaky_gate::headers::format_leak_rate;
/// use std::time::Duration;
///
/// assert_eq!(format_leak_rate(Duration::from_secs(1)), "00:00:01");
/// assert_eq!(format_leak_rate(Duration::from_secs(93_600)), "1.02:00:00");
/// assert_eq!(format_leak_rate(Duration::from_millis(250)), "00:00:00.2500000");
/// ```
pub fn format_leak_rate(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    let ticks = duration.subsec_nanos() / NANOS_PER_TICK;

    let mut out = String::with_capacity(20);
    if days > 0 {
        out.push_str(&format!("{days}."));
    }
    out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
    if ticks > 0 {
        out.push_str(&format!(".{ticks:07}"));
    }
    out
}

/// Insert `{prefix}{suffix}: value` into `headers`.
///
/// Names that do not form a valid header are skipped.
pub(crate) fn insert(headers: &mut HeaderMap, prefix: &str, suffix: &str, value: HeaderValue) {
    match HeaderName::from_bytes(format!("{prefix}{suffix}").as_bytes()) {
        Ok(name) => {
            headers.insert(name, value);
        }
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(prefix, suffix, "skipping rate limit header with invalid name");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_leak_rate() {
        assert_eq!(format_leak_rate(Duration::ZERO), "00:00:00");
        assert_eq!(format_leak_rate(Duration::from_secs(5)), "00:00:05");
        assert_eq!(format_leak_rate(Duration::from_secs(300)), "00:05:00");
        assert_eq!(format_leak_rate(Duration::from_secs(3_661)), "01:01:01");
        assert_eq!(format_leak_rate(Duration::from_secs(86_400)), "1.00:00:00");
        assert_eq!(
            format_leak_rate(Duration::from_millis(1_500)),
            "00:00:01.5000000"
        );
        assert_eq!(
            format_leak_rate(Duration::from_nanos(1_234_567_890)),
            "00:00:01.2345678"
        );
    }

    #[test]
    fn test_insert_skips_invalid_names() {
        let mut headers = HeaderMap::new();
        insert(&mut headers, "X-", COST, HeaderValue::from(1u64));
        insert(&mut headers, "bad prefix ", COST, HeaderValue::from(1u64));

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-ratelimit-cost").unwrap(), "1");
    }
}
