use crate::error::{BackupError, Result};
use chrono::Utc;
use std::str::FromStr;
use std::time::Duration;

/// Parsed cron expression.
///
/// Accepts the classic five-field form (minute precision, a seconds field
/// of `0` is implied), the six/seven-field form with seconds, and the
/// `@daily`-style shorthands.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(BackupError::Schedule("empty cron expression".into()));
        }

        let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };

        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| BackupError::Schedule(format!("invalid cron expression '{trimmed}': {e}")))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Time left until the next fire time.
    pub fn until_next(&self) -> Result<Duration> {
        let now = Utc::now();
        let next = self
            .schedule
            .after(&now)
            .next()
            .ok_or_else(|| BackupError::Schedule(format!("'{}' never fires again", self.expression)))?;
        Ok((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}
