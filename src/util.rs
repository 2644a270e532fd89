//! Small shared helpers: duration-string parsing, annotation filtering and
//! the progressive backoff used by the error policies.

use anyhow::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::constants::SYSTEM_ANNOTATION_PREFIXES;

/// Parse a Kubernetes-style duration string into a [`Duration`].
///
/// Supports `<number><unit>` with units `s`, `m`, `h`, `d` (e.g. "30s",
/// "5m", "1h").
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("duration string cannot be empty"));
    }

    let duration_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$")
        .map_err(|e| anyhow::anyhow!("failed to compile duration regex: {e}"))?;

    let lowered = trimmed.to_lowercase();
    let captures = duration_regex.captures(&lowered).ok_or_else(|| {
        anyhow::anyhow!(
            "invalid duration format '{}', expected <number><unit> (e.g. '30s', '5m', '1h')",
            trimmed
        )
    })?;

    let number: u64 = captures["number"]
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid duration number in '{}': {}", trimmed, e))?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "duration must be greater than zero, got '{}'",
            trimmed
        ));
    }

    let seconds = match &captures["unit"] {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        unit => return Err(anyhow::anyhow!("invalid duration unit '{}'", unit)),
    };

    Ok(Duration::from_secs(seconds))
}

/// Copy annotations from a custom resource onto a managed object, dropping
/// system-prefixed keys.
pub fn filter_system_annotations(
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    annotations
        .iter()
        .filter(|(key, _)| {
            !SYSTEM_ANNOTATION_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Delay before retrying a push resource whose reconcile error propagated to
/// the manager (pull and dynamic schedule their own fixed requeues instead).
///
/// Grows along the Fibonacci sequence from one minute and caps at ten, so a
/// resource stuck on bad credentials or an unreachable KMS eases off the API
/// without disappearing for long stretches.
#[derive(Debug, Clone, Default)]
pub struct ErrorBackoff {
    prev: u64,
    current: u64,
}

const ERROR_BACKOFF_MIN_SECONDS: u64 = 60;
const ERROR_BACKOFF_MAX_SECONDS: u64 = 600;

impl ErrorBackoff {
    /// Return the current delay and advance the sequence.
    pub fn next(&mut self) -> Duration {
        if self.current == 0 {
            self.current = ERROR_BACKOFF_MIN_SECONDS;
        }
        let result = self.current;
        let next = self.prev + self.current;
        self.prev = self.current;
        self.current = next.min(ERROR_BACKOFF_MAX_SECONDS);
        Duration::from_secs(result)
    }

    /// Restart from the minimum after a successful reconcile.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration(" 10M ").unwrap(), Duration::from_secs(600));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("1w").is_err());
        assert!(parse_duration("1.5m").is_err());
    }

    #[test]
    fn drops_system_prefixed_annotations() {
        let mut annotations = BTreeMap::new();
        annotations.insert("kubectl.kubernetes.io/last-applied".into(), "x".into());
        annotations.insert("kubernetes.io/managed".into(), "x".into());
        annotations.insert("k8s.io/foo".into(), "x".into());
        annotations.insert("helm.sh/hook".into(), "x".into());
        annotations.insert("team".into(), "platform".into());
        annotations.insert("secrets.lux.network/custom".into(), "keep".into());

        let filtered = filter_system_annotations(&annotations);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.get("team").map(String::as_str), Some("platform"));
        assert!(filtered.contains_key("secrets.lux.network/custom"));
    }

    #[test]
    fn error_backoff_grows_and_caps_at_ten_minutes() {
        let mut backoff = ErrorBackoff::default();
        let observed: Vec<u64> = (0..8).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(observed, vec![60, 60, 120, 180, 300, 480, 600, 600]);
    }

    #[test]
    fn error_backoff_reset_restarts_from_one_minute() {
        let mut backoff = ErrorBackoff::default();
        backoff.next();
        backoff.next();
        backoff.next();

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(60));
        assert_eq!(backoff.next(), Duration::from_secs(60));
        assert_eq!(backoff.next(), Duration::from_secs(120));
    }
}
