//! Provides parsing and formatting helpers for durations and byte sizes.
//!
//! These are used to read TTLs and memory limits from the configuration and to render them
//! in log messages and metric reports.
use std::fmt::Write;
use std::time::Duration;

const MILLIS_PER_SECOND: u128 = 1000;
const MILLIS_PER_MINUTE: u128 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u128 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u128 = 24 * MILLIS_PER_HOUR;

/// Formats a duration given in microseconds.
///
/// This picks the unit (microseconds, milliseconds or seconds) which yields the most concise
/// representation. See [format_short_duration] for examples.
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    let (value, unit) = match micros {
        n if n < 1_000 => return write!(f, "{} us", n),
        n if n < 1_000_000 => (n as f32 / 1_000., "ms"),
        n => (n as f32 / 1_000_000., "s"),
    };

    if value < 10. {
        write!(f, "{:.2} {}", value, unit)
    } else if value < 100. {
        write!(f, "{:.1} {}", value, unit)
    } else {
        write!(f, "{:.0} {}", value.trunc(), unit)
    }
}

/// Formats a duration given in microseconds and returns it as String.
///
/// # Examples
///
/// ```
/// assert_eq!(cachekeeper::fmt::format_short_duration(250), "250 us");
/// assert_eq!(cachekeeper::fmt::format_short_duration(4_096), "4.10 ms");
/// assert_eq!(cachekeeper::fmt::format_short_duration(42_420), "42.4 ms");
/// assert_eq!(cachekeeper::fmt::format_short_duration(512_900), "512 ms");
/// assert_eq!(cachekeeper::fmt::format_short_duration(2_500_000), "2.50 s");
/// assert_eq!(cachekeeper::fmt::format_short_duration(120_000_000), "120 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Formats a given size in bytes using binary units (KiB, MiB, ...).
///
/// # Examples
///
/// ```
/// assert_eq!(cachekeeper::fmt::format_size(1), "1 byte");
/// assert_eq!(cachekeeper::fmt::format_size(512), "512 bytes");
/// assert_eq!(cachekeeper::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(cachekeeper::fmt::format_size(16 * 1024 * 1024), "16.0 MiB");
/// assert_eq!(cachekeeper::fmt::format_size(873_400_000), "833 MiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    if size_in_bytes == 1 {
        return "1 byte".to_owned();
    } else if size_in_bytes < 1024 {
        return format!("{} bytes", size_in_bytes);
    }

    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    let mut unit = 0;
    let mut size = size_in_bytes as f64 / 1024.;
    while size > 1024. && unit < UNITS.len() - 1 {
        size /= 1024.;
        unit += 1;
    }

    if size <= 10. {
        format!("{:.2} {}", size, UNITS[unit])
    } else if size <= 100. {
        format!("{:.1} {}", size, UNITS[unit])
    } else {
        format!("{:.0} {}", size, UNITS[unit])
    }
}

/// Parses a memory size like "16m" or "1 g" into a number of bytes.
///
/// Supported suffixes are **b**, **k**, **m**, **g** and **t** (in upper or lower case). Each
/// one is interpreted as a binary unit (1k = 1024 bytes). A value without a suffix is treated
/// as bytes.
///
/// # Examples
///
/// ```
/// assert_eq!(cachekeeper::fmt::parse_size("512").unwrap(), 512);
/// assert_eq!(cachekeeper::fmt::parse_size("4k").unwrap(), 4096);
/// assert_eq!(cachekeeper::fmt::parse_size("16 M").unwrap(), 16 * 1024 * 1024);
/// assert_eq!(cachekeeper::fmt::parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
///
/// assert_eq!(cachekeeper::fmt::parse_size("2 X").is_err(), true);
/// assert_eq!(cachekeeper::fmt::parse_size("1.5m").is_err(), true);
/// assert_eq!(cachekeeper::fmt::parse_size("-4k").is_err(), true);
/// ```
pub fn parse_size(str: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref SIZE: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *([bBkKmMgGtT]?) *$").unwrap();
    }

    let captures = SIZE.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a size. \
             Expected a positive number and optionally 'b', 'k', 'm', 'g' or 't' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<usize>()?;
    let factor: usize = match captures[2].to_ascii_lowercase().as_str() {
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => 1,
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| anyhow::anyhow!("The size '{}' is too large.", str.as_ref()))
}

/// Parses a duration like "10s" or "250 ms".
///
/// Supported suffixes are **ms**, **s**, **m**, **h** and **d** (in upper or lower case). A
/// value without a suffix is treated as milliseconds.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(cachekeeper::fmt::parse_duration("250").unwrap(), Duration::from_millis(250));
/// assert_eq!(cachekeeper::fmt::parse_duration("250 ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(cachekeeper::fmt::parse_duration("10s").unwrap(), Duration::from_secs(10));
/// assert_eq!(cachekeeper::fmt::parse_duration("15 M").unwrap(), Duration::from_secs(15 * 60));
/// assert_eq!(cachekeeper::fmt::parse_duration("1h").unwrap(), Duration::from_secs(60 * 60));
/// assert_eq!(cachekeeper::fmt::parse_duration("2d").unwrap(), Duration::from_secs(2 * 24 * 60 * 60));
///
/// assert_eq!(cachekeeper::fmt::parse_duration("3 w").is_err(), true);
/// assert_eq!(cachekeeper::fmt::parse_duration("0.5s").is_err(), true);
/// assert_eq!(cachekeeper::fmt::parse_duration("-10s").is_err(), true);
/// assert_eq!(cachekeeper::fmt::parse_duration("999999999999999999d").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref DURATION: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *((ms|s|m|h|d|MS|S|M|H|D)?) *$").unwrap();
    }

    let captures = DURATION.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let seconds_per_unit: u64 = match captures[2].to_ascii_lowercase().as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => return Ok(Duration::from_millis(number)),
    };

    number
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("The duration '{}' is too large.", str.as_ref()))
}

/// Formats a duration into a string like "1d 2h 15m 10s 250ms".
///
/// Zero components are skipped and a zero duration is rendered as "0ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(cachekeeper::fmt::format_duration(Duration::from_millis(0)), "0ms");
/// assert_eq!(cachekeeper::fmt::format_duration(Duration::from_millis(250)), "250ms");
/// assert_eq!(cachekeeper::fmt::format_duration(Duration::from_millis(10_250)), "10s 250ms");
/// assert_eq!(cachekeeper::fmt::format_duration(Duration::from_secs(15 * 60)), "15m");
/// assert_eq!(cachekeeper::fmt::format_duration(Duration::from_secs(26 * 60 * 60 + 10)), "1d 2h 10s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut result = String::new();
    let mut value = duration.as_millis();

    for (unit, millis) in [
        ("d", MILLIS_PER_DAY),
        ("h", MILLIS_PER_HOUR),
        ("m", MILLIS_PER_MINUTE),
        ("s", MILLIS_PER_SECOND),
    ] {
        let amount = value / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            value %= millis;
        }
    }

    if value > 0 || result.is_empty() {
        if !result.is_empty() {
            result.push(' ');
        }
        let _ = write!(result, "{}ms", value);
    }

    result
}
