//! Data models for the review engine.

use crate::algorithm::ScheduleUpdate;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifiers.
pub type ItemId = Uuid;
pub type LearnerId = String;

/// Milliseconds in one scheduling day.
pub const DAY_MS: i64 = 86_400_000;

/// Longest interval any review may schedule, in days (1000 years).
pub const MAX_INTERVAL_DAYS: f64 = 365_250.0;

/// Kind of drill a card exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrillType {
    /// Write down what you hear.
    Dictation,
    /// Understand what you hear.
    Listening,
    /// Say the prompt out loud.
    Speaking,
    /// Translate the prompt.
    Translation,
}

impl DrillType {
    /// Stage order used by the staged rotator.
    pub const STAGES: [DrillType; 3] = [DrillType::Dictation, DrillType::Listening, DrillType::Speaking];

    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dictation => "dictation",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Translation => "translation",
        }
    }

    /// Get display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dictation => "Dictation",
            Self::Listening => "Listening",
            Self::Speaking => "Speaking",
            Self::Translation => "Translation",
        }
    }
}

impl FromStr for DrillType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dictation" => Ok(Self::Dictation),
            "listening" => Ok(Self::Listening),
            "speaking" => Ok(Self::Speaking),
            "translation" => Ok(Self::Translation),
            other => Err(EngineError::InvalidDrill(other.to_string())),
        }
    }
}

/// One learnable item drilled one way. Queue entries and schedule rows are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CardKey {
    pub item_id: ItemId,
    pub drill: DrillType,
}

impl CardKey {
    pub fn new(item_id: ItemId, drill: DrillType) -> Self {
        Self { item_id, drill }
    }
}

impl fmt::Display for CardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.item_id, self.drill.as_str())
    }
}

/// Learner grade for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    /// Forgotten.
    Again,
    /// Difficult recall.
    Hard,
    /// Normal recall.
    Good,
    /// Effortless recall.
    Easy,
}

impl Grade {
    pub const ALL: [Grade; 4] = [Grade::Again, Grade::Hard, Grade::Good, Grade::Easy];

    /// Parse the 1-4 numeric form.
    pub fn from_u8(value: u8) -> EngineResult<Self> {
        match value {
            1 => Ok(Self::Again),
            2 => Ok(Self::Hard),
            3 => Ok(Self::Good),
            4 => Ok(Self::Easy),
            other => Err(EngineError::InvalidGrade(other.to_string())),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Again => 1,
            Self::Hard => 2,
            Self::Good => 3,
            Self::Easy => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Again => "again",
            Self::Hard => "hard",
            Self::Good => "good",
            Self::Easy => "easy",
        }
    }

    /// Whether this grade counts as a lapse.
    pub fn is_lapse(&self) -> bool {
        matches!(self, Self::Again)
    }
}

impl FromStr for Grade {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "again" => Ok(Self::Again),
            "hard" => Ok(Self::Hard),
            "good" => Ok(Self::Good),
            "easy" => Ok(Self::Easy),
            other => Err(EngineError::InvalidGrade(other.to_string())),
        }
    }
}

/// Persistent scheduling state for one card.
///
/// `next_review_at` only moves through [`ScheduleRecord::apply_review`], so it
/// always reflects the last algorithm run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    key: CardKey,
    difficulty: f64,
    stability: f64,
    repetitions: u32,
    lapses: u32,
    first_review_at: Option<DateTime<Utc>>,
    last_review_at: Option<DateTime<Utc>>,
    next_review_at: DateTime<Utc>,
    suspended: bool,
}

impl ScheduleRecord {
    /// Create a never-reviewed record that is due at `now`.
    pub fn new(key: CardKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            difficulty: 0.0,
            stability: 0.0,
            repetitions: 0,
            lapses: 0,
            first_review_at: None,
            last_review_at: None,
            next_review_at: now,
            suspended: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        key: CardKey,
        difficulty: f64,
        stability: f64,
        repetitions: u32,
        lapses: u32,
        first_review_at: Option<DateTime<Utc>>,
        last_review_at: Option<DateTime<Utc>>,
        next_review_at: DateTime<Utc>,
        suspended: bool,
    ) -> Self {
        Self {
            key,
            difficulty,
            stability,
            repetitions,
            lapses,
            first_review_at,
            last_review_at,
            next_review_at,
            suspended,
        }
    }

    pub fn key(&self) -> CardKey {
        self.key
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn stability(&self) -> f64 {
        self.stability
    }

    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    pub fn lapses(&self) -> u32 {
        self.lapses
    }

    pub fn first_review_at(&self) -> Option<DateTime<Utc>> {
        self.first_review_at
    }

    pub fn last_review_at(&self) -> Option<DateTime<Utc>> {
        self.last_review_at
    }

    pub fn next_review_at(&self) -> DateTime<Utc> {
        self.next_review_at
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// Never reviewed.
    pub fn is_new(&self) -> bool {
        self.repetitions == 0 && self.last_review_at.is_none()
    }

    /// Check if due for review.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.next_review_at <= now
    }

    /// Days since the last review, 0 if never reviewed.
    pub fn elapsed_days(&self, now: DateTime<Utc>) -> f64 {
        match self.last_review_at {
            Some(last) => ((now - last).num_milliseconds() as f64 / DAY_MS as f64).max(0.0),
            None => 0.0,
        }
    }

    /// Fold one settled attempt into the record.
    pub fn apply_review(&mut self, update: &ScheduleUpdate, grade: Grade, now: DateTime<Utc>, day_length_ms: i64) {
        self.difficulty = update.difficulty;
        self.stability = update.stability;
        self.repetitions += 1;
        if grade.is_lapse() {
            self.lapses += 1;
        }
        if self.first_review_at.is_none() {
            self.first_review_at = Some(now);
        }
        self.last_review_at = Some(now);
        let interval_days = update.interval_days.clamp(0.0, MAX_INTERVAL_DAYS);
        // `as` saturates, and an unrepresentable due date pins to the latest instant
        let interval_ms = (interval_days * day_length_ms as f64).round() as i64;
        self.next_review_at = now
            .checked_add_signed(Duration::milliseconds(interval_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

/// Content for one learnable item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier.
    pub id: ItemId,
    /// Owning learner.
    pub learner_id: LearnerId,
    /// What the learner is shown or hears.
    pub prompt: String,
    /// Reference answer handed to the judge.
    pub answer: String,
    /// BCP-47 style language code.
    pub language: String,
    /// Flagged items are never selected.
    pub flagged: bool,
    /// When created.
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Create a new item.
    pub fn new(
        learner_id: impl Into<LearnerId>,
        prompt: impl Into<String>,
        answer: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            learner_id: learner_id.into(),
            prompt: prompt.into(),
            answer: answer.into(),
            language: language.into(),
            flagged: false,
            created_at: Utc::now(),
        }
    }
}

/// Everything needed to render and grade one card inside a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionItem {
    pub key: CardKey,
    pub prompt: String,
    pub reference_answer: String,
    pub language: String,
    pub repetitions: u32,
    pub lapses: u32,
}

impl SessionItem {
    pub fn drill(&self) -> DrillType {
        self.key.drill
    }
}

/// A wrong or abandoned answer kept for end-of-lesson review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub key: CardKey,
    pub user_answer: String,
    pub reason: String,
}

/// A settled graded attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewLog {
    pub key: CardKey,
    pub grade: Grade,
    pub elapsed_days: f64,
    pub interval_days: f64,
    pub reviewed_at: DateTime<Utc>,
}

/// Progress counters for a learner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueCounts {
    /// Eligible cards.
    pub total: usize,
    /// Cards due now.
    pub due_now: usize,
    /// Never-reviewed cards.
    pub new: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CardKey {
        CardKey::new(Uuid::new_v4(), DrillType::Dictation)
    }

    #[test]
    fn test_grade_parsing() {
        assert_eq!(Grade::from_u8(3).unwrap(), Grade::Good);
        assert!(matches!(Grade::from_u8(0), Err(EngineError::InvalidGrade(_))));
        assert!(matches!("meh".parse::<Grade>(), Err(EngineError::InvalidGrade(_))));
        for grade in Grade::ALL {
            assert_eq!(grade.as_str().parse::<Grade>().unwrap(), grade);
        }
    }

    #[test]
    fn test_drill_parsing() {
        assert_eq!("speaking".parse::<DrillType>().unwrap(), DrillType::Speaking);
        assert!("writing".parse::<DrillType>().is_err());
    }

    #[test]
    fn test_new_record() {
        let now = Utc::now();
        let record = ScheduleRecord::new(key(), now);
        assert!(record.is_new());
        assert!(record.is_due(now));
        assert_eq!(record.elapsed_days(now + Duration::days(30)), 0.0);
    }

    #[test]
    fn test_apply_review() {
        let now = Utc::now();
        let mut record = ScheduleRecord::new(key(), now);
        let update = ScheduleUpdate { difficulty: 5.0, stability: 3.0, interval_days: 2.5 };

        record.apply_review(&update, Grade::Good, now, DAY_MS);
        assert_eq!(record.repetitions(), 1);
        assert_eq!(record.lapses(), 0);
        assert_eq!(record.first_review_at(), Some(now));
        assert_eq!(record.next_review_at(), now + Duration::hours(60));

        let later = now + Duration::days(3);
        record.apply_review(&update, Grade::Again, later, DAY_MS);
        assert_eq!(record.repetitions(), 2);
        assert_eq!(record.lapses(), 1);
        assert_eq!(record.first_review_at(), Some(now));
        assert_eq!(record.last_review_at(), Some(later));
        assert!(!record.is_new());
    }

    #[test]
    fn test_suspended_is_never_due() {
        let now = Utc::now();
        let mut record = ScheduleRecord::new(key(), now);
        record.set_suspended(true);
        assert!(!record.is_due(now));
    }

    #[test]
    fn test_card_key_display() {
        let id = Uuid::nil();
        let key = CardKey::new(id, DrillType::Listening);
        assert_eq!(key.to_string(), format!("{}:listening", id));
    }
}
