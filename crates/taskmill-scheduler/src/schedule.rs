use chrono::{DateTime, Utc};
use croner::Cron;

use crate::error::{Result, TaskError};

/// Number of fields in an accepted expression: minute, hour, day-of-month,
/// month, day-of-week.
pub const CRON_FIELDS: usize = 5;

/// A parsed five-field cron expression.
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let invalid = |reason: String| TaskError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let fields = expression.split_whitespace().count();
        if fields != CRON_FIELDS {
            return Err(invalid(format!(
                "expected {CRON_FIELDS} fields, found {fields}"
            )));
        }
        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.cron
            .find_next_occurrence(&after, false)
            .map_err(|e| TaskError::InvalidCron {
                expression: self.expression.clone(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}
