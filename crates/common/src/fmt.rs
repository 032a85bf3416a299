/// Format a duration in milliseconds as a short human string
/// (e.g. "850ms", "1.2s", "2m 5s", "1h 3m").
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1000 {
        return format!("{}ms", ms);
    }
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        let tenths = (ms % 1000) / 100;
        if tenths > 0 {
            format!("{}.{}s", secs, tenths)
        } else {
            format!("{}s", secs)
        }
    }
}

/// Format a USD cost with four decimal places (engine costs are fractions
/// of a cent per turn).
pub fn format_cost(usd: f64) -> String {
    format!("${:.4}", usd)
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_millis() {
        assert_eq!(format_duration_ms(850), "850ms");
        assert_eq!(format_duration_ms(0), "0ms");
    }

    #[test]
    fn duration_seconds() {
        assert_eq!(format_duration_ms(1234), "1.2s");
        assert_eq!(format_duration_ms(5000), "5s");
    }

    #[test]
    fn duration_minutes_hours() {
        assert_eq!(format_duration_ms(125_000), "2m 5s");
        assert_eq!(format_duration_ms(3_780_000), "1h 3m");
    }

    #[test]
    fn cost() {
        assert_eq!(format_cost(0.01), "$0.0100");
        assert_eq!(format_cost(1.23456), "$1.2346");
    }

    #[test]
    fn truncate_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
