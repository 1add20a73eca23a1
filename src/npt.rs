//! Normal Play Time (NPT) parsing/formatting and `TimeSeekRange.dlna.org`
//! header handling.

use std::time::Duration;

/// Parses an NPT time value: either `HH:MM:SS[.fff]` or a bare
/// floating-point seconds value (both forms appear in the wild; DLNA
/// renderers send both).
pub fn parse_npt(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some((h, rest)) = s.split_once(':') {
        let (m, sec) = rest.split_once(':')?;
        let hours: u64 = h.parse().ok()?;
        let minutes: u64 = m.parse().ok()?;
        let seconds: f64 = sec.parse().ok()?;
        if minutes >= 60 || seconds < 0.0 || seconds >= 60.0 {
            return None;
        }
        let total = (hours * 3600) as f64 + (minutes * 60) as f64 + seconds;
        Some(Duration::from_secs_f64(total))
    } else {
        let seconds: f64 = s.parse().ok()?;
        if seconds < 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(seconds))
    }
}

/// Formats a [`Duration`] as `HH:MM:SS.fff`, the canonical NPT
/// representation this server always echoes back.
pub fn format_npt(d: Duration) -> String {
    let total_millis = d.as_millis();
    let millis = total_millis % 1000;
    let total_secs = total_millis / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;
    format!("{hours:02}:{mins:02}:{secs:02}.{millis:03}")
}

/// A parsed `TimeSeekRange.dlna.org: npt=start-end` request.
///
/// `start_raw`/`end_raw` keep the exact substrings the client sent so the
/// response can echo them back unchanged: §4.7 requires echoing the
/// received `npt=start-end` verbatim with `/*` appended, not a
/// re-rendering of the parsed duration.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeekRange {
    pub start: Duration,
    pub end: Option<Duration>,
    pub start_raw: String,
    pub end_raw: Option<String>,
}

/// Parses a `TimeSeekRange.dlna.org` header value. The value MUST start
/// with the literal `npt=`; anything else, or an unparsable start/end, is a
/// malformed header (`400 Bad Request` at the call site).
pub fn parse_time_seek_range(value: &str) -> Result<TimeSeekRange, String> {
    let rest = value
        .strip_prefix("npt=")
        .ok_or_else(|| format!("TimeSeekRange must start with npt=, got {value:?}"))?;
    let (start_str, end_str) = rest
        .split_once('-')
        .ok_or_else(|| format!("TimeSeekRange missing '-': {value:?}"))?;

    let start = parse_npt(start_str).ok_or_else(|| format!("invalid NPT start: {start_str:?}"))?;
    let end = if end_str.is_empty() {
        None
    } else {
        Some(parse_npt(end_str).ok_or_else(|| format!("invalid NPT end: {end_str:?}"))?)
    };

    if let Some(end) = end {
        if end < start {
            return Err(format!("TimeSeekRange end before start: {value:?}"));
        }
    }

    Ok(TimeSeekRange {
        start,
        end,
        start_raw: start_str.to_string(),
        end_raw: (!end_str.is_empty()).then(|| end_str.to_string()),
    })
}

/// Builds the echoed `TimeSeekRange.dlna.org` response header: the
/// original start-end substrings, with `/*` appended to signal an unknown
/// total length, per `SPEC_FULL.md` 4.7.
pub fn echo_time_seek_range(r: &TimeSeekRange) -> String {
    match &r.end_raw {
        Some(end) => format!("npt={}-{}/*", r.start_raw, end),
        None => format!("npt={}-/*", r.start_raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_seconds() {
        let d = parse_npt("125.5").unwrap();
        assert!((d.as_secs_f64() - 125.5).abs() < 1e-9);
    }

    #[test]
    fn parse_hms() {
        let d = parse_npt("00:02:05.500").unwrap();
        assert!((d.as_secs_f64() - 125.5).abs() < 1e-9);
    }

    #[test]
    fn format_round_trips_hms() {
        let d = parse_npt("00:02:05.500").unwrap();
        assert_eq!(format_npt(d), "00:02:05.500");
    }

    #[test]
    fn rejects_invalid_minutes() {
        assert!(parse_npt("00:61:00").is_none());
    }

    #[test]
    fn parses_time_seek_range_scenario() {
        let r = parse_time_seek_range("npt=10.0-20.0").unwrap();
        assert_eq!(r.start, Duration::from_secs(10));
        assert_eq!(r.end, Some(Duration::from_secs(20)));
        assert_eq!(echo_time_seek_range(&r), "npt=10.0-20.0/*");
    }

    #[test]
    fn open_ended_range() {
        let r = parse_time_seek_range("npt=5.0-").unwrap();
        assert_eq!(r.end, None);
        assert_eq!(echo_time_seek_range(&r), "npt=5.0-/*");
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(parse_time_seek_range("10.0-20.0").is_err());
    }

    #[test]
    fn rejects_end_before_start() {
        assert!(parse_time_seek_range("npt=20.0-10.0").is_err());
    }
}
