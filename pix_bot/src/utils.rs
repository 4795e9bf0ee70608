//! Small formatting helpers for outbound messages.

use chrono::{DateTime, Utc};

/// Formats a Unix timestamp into a readable date and time.
pub fn format_timestamp(timestamp: i64) -> String {
    let datetime = DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now);
    datetime.format("%Y-%m-%d at %H:%M UTC").to_string()
}

/// Human-readable remaining duration for reminders.
pub fn format_time_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;

    if hours == 0 {
        format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else if hours < 24 {
        format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else {
        let days = hours / 24;
        format!("{} day{}", days, if days == 1 { "" } else { "s" })
    }
}

/// Escapes user-controlled text for HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_duration() {
        assert_eq!(format_time_duration(90), "1 minute");
        assert_eq!(format_time_duration(2 * 3600), "2 hours");
        assert_eq!(format_time_duration(3 * 24 * 3600), "3 days");
        assert_eq!(format_time_duration(-5), "0 minutes");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }
}
