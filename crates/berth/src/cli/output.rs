//! Text rendering helpers.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Width of the short id column.
pub const SHORT_ID: usize = 12;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    &id[..SHORT_ID.min(id.len())]
}

/// Decimal units, three significant digits: `5.24MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else if value >= 100.0 {
        format!("{value:.0}{}", UNITS[unit])
    } else if value >= 10.0 {
        format!("{value:.1}{}", UNITS[unit])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

/// Rough age such as `3 hours ago`.
pub fn format_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created).num_seconds().max(0);
    let (n, unit) = match secs {
        0..60 => return "Less than a minute ago".to_string(),
        60..3_600 => (secs / 60, "minute"),
        3_600..86_400 => (secs / 3_600, "hour"),
        86_400..604_800 => (secs / 86_400, "day"),
        604_800..2_592_000 => (secs / 604_800, "week"),
        2_592_000..31_536_000 => (secs / 2_592_000, "month"),
        _ => (secs / 31_536_000, "year"),
    };
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

/// Split `repo:tag` the way image tables show it; `<none>` for untagged.
pub fn repo_and_tag(name: Option<&str>) -> (String, String) {
    let Some(name) = name else {
        return ("<none>".to_string(), "<none>".to_string());
    };
    let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[slash..].rfind(':') {
        Some(colon) => {
            let split = slash + colon;
            (name[..split].to_string(), name[split + 1..].to_string())
        }
        None => (name.to_string(), "<none>".to_string()),
    }
}
