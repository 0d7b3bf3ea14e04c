use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};

pub fn now_utc() -> DateTime<Utc> {
    if let Ok(value) = std::env::var("REMTRACK_FIXED_TIME") {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&value) {
            return dt.with_timezone(&Utc);
        }
    }
    Utc::now()
}

pub fn parse_window(value: &str) -> Result<Duration> {
    let trimmed = value.trim().to_lowercase();
    if let Some(days_str) = trimmed.strip_suffix('d') {
        let days: i64 = days_str
            .parse()
            .map_err(|_| anyhow!("invalid window: {}", value))?;
        if matches!(days, 7 | 30 | 90) {
            return Ok(Duration::days(days));
        }
    }
    Err(anyhow!("invalid window (use 7d|30d|90d): {}", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_accepts_known_sizes() {
        assert_eq!(parse_window("7d").unwrap(), Duration::days(7));
        assert_eq!(parse_window("30D").unwrap(), Duration::days(30));
        assert!(parse_window("12d").is_err());
        assert!(parse_window("7h").is_err());
    }
}
