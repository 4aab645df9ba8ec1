use std::time::Duration;

const PREFIXES: [&str; 8] = ["", "ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];

/// Formats a byte count with binary prefixes, one decimal digit
/// (e.g. `20.0 MiB`, `-10.5 kiB`).
pub fn byte_size(bytes: i64) -> String {
    let mut v = bytes as f64;
    let mut prefix = "";
    for p in PREFIXES {
        prefix = p;
        if v.abs() <= 1024.0 {
            break;
        }
        v /= 1024.0;
    }
    format!("{v:.1} {prefix}B")
}

/// Formats a duration the way alarm descriptions expect: `XdYh` above a
/// day, `XhYm` above an hour, `XmYs` / `Xs` below.
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();

    if secs > 24 * 3600 {
        let rounded = (secs + 1800) / 3600; // whole hours
        return format!("{}d{}h", rounded / 24, rounded % 24);
    }

    if secs > 3600 {
        let rounded = (secs + 30) / 60; // whole minutes
        return format!("{}h{}m", rounded / 60, rounded % 60);
    }

    if secs >= 60 {
        return format!("{}m{}s", secs / 60, secs % 60);
    }

    format!("{secs}s")
}

/// Rounds a duration to the nearest multiple of `step`.
pub fn round_duration(d: Duration, step: Duration) -> Duration {
    let step_ns = step.as_nanos();
    if step_ns == 0 {
        return d;
    }
    let ns = d.as_nanos();
    let rounded = ((ns + step_ns / 2) / step_ns) * step_ns;
    Duration::from_nanos(rounded.min(u64::MAX as u128) as u64)
}
