//! Parsers for the size and duration strings accepted by the outer CLI and
//! handed to filters. The outer argument-parsing design is out of scope
//! (spec.md §1), but the parsing functions themselves are core vocabulary
//! shared by the filter and the CLI layer.

use crate::error::CoreError;
use std::time::Duration;

/// Parse a size string: a decimal value followed by an optional unit in
/// `{"", K, M, G, T}` with an optional trailing `B`, base 1024,
/// case-insensitive (`"100M"`, `"1.5GB"`, `"1024"`).
pub fn parse_size(s: &str) -> Result<u64, CoreError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CoreError::InvalidArgument("empty size string".into()));
    }

    let split_at = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number_part, unit_part) = s.split_at(split_at);
    let number: f64 = number_part
        .parse()
        .map_err(|_| CoreError::InvalidArgument(format!("invalid size: {s:?}")))?;

    let unit = unit_part.trim().to_ascii_uppercase();
    let unit = unit.strip_suffix('B').unwrap_or(&unit);

    let multiplier: u64 = match unit {
        "" => 1,
        "K" => 1024,
        "M" => 1024u64.pow(2),
        "G" => 1024u64.pow(3),
        "T" => 1024u64.pow(4),
        _ => return Err(CoreError::InvalidArgument(format!("unknown size unit: {s:?}"))),
    };

    Ok((number * multiplier as f64).round() as u64)
}

/// Render a byte count back into the canonical form `parse_size` accepts,
/// choosing the largest unit that keeps the mantissa `>= 1`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1024u64.pow(4), "T"),
        (1024u64.pow(3), "G"),
        (1024u64.pow(2), "M"),
        (1024, "K"),
    ];

    for (threshold, suffix) in UNITS {
        if bytes >= threshold {
            let value = bytes as f64 / threshold as f64;
            return format_trimmed(value, suffix);
        }
    }
    bytes.to_string()
}

fn format_trimmed(value: f64, suffix: &str) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{}{}", rounded as u64, suffix)
    } else {
        format!("{rounded}{suffix}")
    }
}

/// Parse a duration string: a decimal value followed by a suffix in
/// `{ns, us, ms, s, m, h, d, w, mo (30d), y (365d)}`, case-insensitive.
pub fn parse_duration(s: &str) -> Result<Duration, CoreError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CoreError::InvalidArgument("empty duration string".into()));
    }

    let split_at = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| CoreError::InvalidArgument(format!("missing duration suffix: {s:?}")))?;
    let (number_part, suffix_part) = s.split_at(split_at);
    let number: f64 = number_part
        .parse()
        .map_err(|_| CoreError::InvalidArgument(format!("invalid duration: {s:?}")))?;

    let suffix = suffix_part.trim().to_ascii_lowercase();
    let seconds: f64 = match suffix.as_str() {
        "ns" => number / 1e9,
        "us" => number / 1e6,
        "ms" => number / 1e3,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3_600.0,
        "d" => number * 86_400.0,
        "w" => number * 7.0 * 86_400.0,
        "mo" => number * 30.0 * 86_400.0,
        "y" => number * 365.0 * 86_400.0,
        _ => {
            return Err(CoreError::InvalidArgument(format!(
                "unknown duration suffix: {s:?}"
            )))
        }
    };

    if seconds < 0.0 {
        return Err(CoreError::InvalidArgument(format!(
            "negative duration: {s:?}"
        )));
    }

    Ok(Duration::from_secs_f64(seconds))
}

/// Render a duration back into the canonical form `parse_duration` accepts,
/// choosing the largest whole unit (`d`, `h`, `m`, `s`, `ms`) the value
/// divides into without a fractional remainder, falling back to seconds.
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs_f64();

    const UNITS: [(f64, &str); 4] = [
        (86_400.0, "d"),
        (3_600.0, "h"),
        (60.0, "m"),
        (1.0, "s"),
    ];

    for (unit_secs, suffix) in UNITS {
        let value = total_secs / unit_secs;
        if value >= 1.0 && (value * unit_secs - total_secs).abs() < 1e-6 {
            return format_trimmed(value, suffix);
        }
    }
    format!("{}ms", (total_secs * 1000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_examples() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("100M").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024u64.pow(3));
        assert_eq!(parse_size("1.5G").unwrap(), (1.5 * 1024f64.powi(3)) as u64);
        assert_eq!(parse_size("2MB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("2mb").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_unknown_unit() {
        assert!(parse_size("5Q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn size_round_trips() {
        for s in ["100M", "1G", "1.5G", "1024"] {
            let first = parse_size(s).unwrap();
            let second = parse_size(&format_size(first)).unwrap();
            assert_eq!(first, second, "round trip mismatch for {s:?}");
        }
    }

    #[test]
    fn parse_duration_examples() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(14 * 86_400));
        assert_eq!(parse_duration("1mo").unwrap(), Duration::from_secs(30 * 86_400));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(90 * 60));
    }

    #[test]
    fn duration_round_trips() {
        for s in ["30d", "2w", "1mo", "24h", "90m"] {
            let first = parse_duration(s).unwrap();
            let second = parse_duration(&format_duration(first)).unwrap();
            assert_eq!(first, second, "round trip mismatch for {s:?}");
        }
    }

    #[test]
    fn parse_duration_rejects_missing_suffix() {
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
