use std::time::{SystemTime, UNIX_EPOCH};
use chrono::Utc;

/// Milliseconds since the unix epoch. Clocks set before 1970 read as zero.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Compact UTC stamp used in backup file names (`20260101123000`).
pub fn backup_stamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_stamp_shape() {
        let stamp = backup_stamp();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }
}
