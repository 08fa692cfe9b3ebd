//! Utility functions for shardkeeper

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map_or(0, char::len_utf8);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Whole milliseconds in `d`, for the `*_ms` config fields.
pub fn duration_millis(d: Duration) -> crate::Result<u64> {
    u64::try_from(d.as_millis())
        .map_err(|_| crate::Error::InvalidConfig(format!("duration out of range: {:?}", d)))
}

/// Whole seconds in `d`. Leases are granted in seconds, so a fractional or
/// zero TTL is rejected instead of rounded.
pub fn whole_seconds(d: Duration) -> crate::Result<u64> {
    if d.subsec_nanos() != 0 || d.is_zero() {
        return Err(crate::Error::InvalidConfig(format!(
            "expected a positive whole number of seconds, got {:?}",
            d
        )));
    }
    Ok(d.as_secs())
}

/// Bound a backend call; expiry surfaces as `BackendUnavailable`.
pub(crate) async fn bounded<T>(
    op: &str,
    timeout: Duration,
    fut: impl Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        crate::Error::BackendUnavailable(format!("{} timed out after {:?}", op, timeout))
    })?
}

/// Render a partition set compactly for logs, e.g. `0-3,7,9-10`.
pub fn format_partitions(partitions: &BTreeSet<u32>) -> String {
    let mut out = Vec::new();
    let mut iter = partitions.iter().copied();
    let Some(first) = iter.next() else {
        return "-".to_string();
    };

    let (mut start, mut end) = (first, first);
    for p in iter {
        if p == end + 1 {
            end = p;
            continue;
        }
        out.push(render_range(start, end));
        start = p;
        end = p;
    }
    out.push(render_range(start, end));
    out.join(",")
}

fn render_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}
