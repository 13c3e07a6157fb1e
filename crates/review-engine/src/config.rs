//! Engine configuration.

use crate::error::{EngineError, EngineResult};
use crate::models::{DAY_MS, MAX_INTERVAL_DAYS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    #[default]
    Fsrs,
    Sm2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub algorithm: AlgorithmKind,
    #[serde(default = "default_retention")]
    pub desired_retention: f64,
    #[serde(default = "default_max_interval")]
    pub maximum_interval_days: f64,
    #[serde(default = "default_day_length")]
    pub day_length_ms: i64,
}

fn default_retention() -> f64 { 0.9 }
fn default_max_interval() -> f64 { 36500.0 }
fn default_day_length() -> i64 { DAY_MS }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::Fsrs,
            desired_retention: 0.9,
            maximum_interval_days: 36500.0,
            day_length_ms: DAY_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.desired_retention > 0.0 && self.desired_retention < 1.0) {
            return Err(EngineError::Config(format!(
                "desired_retention must be in (0, 1), got {}",
                self.desired_retention
            )));
        }
        if !(0.0..=MAX_INTERVAL_DAYS).contains(&self.maximum_interval_days) {
            return Err(EngineError::Config(format!(
                "maximum_interval_days must be in [0, {MAX_INTERVAL_DAYS}], got {}",
                self.maximum_interval_days
            )));
        }
        if self.day_length_ms <= 0 {
            return Err(EngineError::Config("day_length_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Queue policy chosen when a lesson starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Cards of every drill type mixed in one queue.
    #[default]
    Interleaved,
    /// Dictation, then listening, then speaking.
    Staged,
}

/// What giving up does to the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpPolicy {
    /// Only keep a failure record.
    #[default]
    RecordOnly,
    /// Also review the card with `Again`.
    ScheduleAgain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonConfig {
    #[serde(default)]
    pub strategy: QueueStrategy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_refill_threshold")]
    pub refill_threshold: usize,
    #[serde(default)]
    pub give_up_policy: GiveUpPolicy,
    #[serde(default = "default_dictation_max")]
    pub dictation_max_repetitions: u32,
}

fn default_batch_size() -> usize { 20 }
fn default_refill_threshold() -> usize { 3 }
fn default_dictation_max() -> u32 { 3 }

impl Default for LessonConfig {
    fn default() -> Self {
        Self {
            strategy: QueueStrategy::Interleaved,
            batch_size: 20,
            refill_threshold: 3,
            give_up_policy: GiveUpPolicy::RecordOnly,
            dictation_max_repetitions: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_retention() {
        let mut config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        config.desired_retention = 1.0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_interval_bounds() {
        let mut config = SchedulerConfig::default();
        config.maximum_interval_days = 1e12;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
        config.maximum_interval_days = f64::NAN;
        assert!(config.validate().is_err());
        config.maximum_interval_days = MAX_INTERVAL_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_lesson_config() {
        let config: LessonConfig = serde_json::from_str(r#"{"strategy":"staged"}"#).unwrap();
        assert_eq!(config.strategy, QueueStrategy::Staged);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.give_up_policy, GiveUpPolicy::RecordOnly);
    }
}
