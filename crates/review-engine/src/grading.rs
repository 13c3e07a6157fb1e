//! Grading: external judgment in, scheduling update and queue outcome out.

use crate::algorithm::{algorithm_from_config, review, ReviewOutcome, SrsAlgorithm};
use crate::config::{GiveUpPolicy, LessonConfig, SchedulerConfig};
use crate::db::{blocking, ScheduleStore};
use crate::error::{EngineError, EngineResult};
use crate::models::{DrillType, Grade, ReviewLog, ScheduleRecord, SessionItem};
use crate::queue::GradeOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// What the judge is asked to compare.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub reference: String,
    pub answer: String,
    pub language: String,
    pub drill: DrillType,
}

/// Judge decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub pass: bool,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self { pass: true, reason: None }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { pass: false, reason: Some(reason.into()) }
    }
}

/// Infrastructure failures, as opposed to a wrong answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JudgeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Judge service error: {0}")]
    Service(String),

    #[error("Judge timed out")]
    Timeout,
}

/// Decides whether an answer matches the reference. May be slow and may fail.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest) -> Result<Verdict, JudgeError>;
}

/// Local judge that compares normalized text.
#[derive(Debug, Clone, Default)]
pub struct ExactMatchJudge;

impl ExactMatchJudge {
    /// Lowercase, drop punctuation and collapse whitespace.
    pub fn normalize(text: &str) -> String {
        let cleaned: String = text
            .chars()
            .filter(|c| !(c.is_ascii_punctuation() && *c != '\'') && !"¿¡«»…“”„".contains(*c))
            .flat_map(char::to_lowercase)
            .collect();
        cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[async_trait]
impl Judge for ExactMatchJudge {
    async fn judge(&self, request: &JudgeRequest) -> Result<Verdict, JudgeError> {
        if Self::normalize(&request.answer) == Self::normalize(&request.reference) {
            Ok(Verdict::pass())
        } else {
            Ok(Verdict::fail(format!("expected \"{}\"", request.reference)))
        }
    }
}

/// Fallback failure reason when the judge gives none.
pub const DEFAULT_FAILURE_REASON: &str = "incorrect";

/// Glues a judge to the scheduling algorithm and the record store.
pub struct GradingOrchestrator {
    store: Arc<dyn ScheduleStore>,
    algorithm: Box<dyn SrsAlgorithm>,
    judge: Arc<dyn Judge>,
    day_length_ms: i64,
    give_up_policy: GiveUpPolicy,
    clock: fn() -> DateTime<Utc>,
}

impl GradingOrchestrator {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        algorithm: Box<dyn SrsAlgorithm>,
        judge: Arc<dyn Judge>,
        day_length_ms: i64,
    ) -> Self {
        Self {
            store,
            algorithm,
            judge,
            day_length_ms,
            give_up_policy: GiveUpPolicy::RecordOnly,
            clock: Utc::now,
        }
    }

    pub fn from_config(
        store: Arc<dyn ScheduleStore>,
        judge: Arc<dyn Judge>,
        scheduler: &SchedulerConfig,
        lesson: &LessonConfig,
    ) -> EngineResult<Self> {
        scheduler.validate()?;
        Ok(Self::new(store, algorithm_from_config(scheduler), judge, scheduler.day_length_ms)
            .with_give_up_policy(lesson.give_up_policy))
    }

    pub fn with_give_up_policy(mut self, policy: GiveUpPolicy) -> Self {
        self.give_up_policy = policy;
        self
    }

    /// Override the clock used to timestamp settled reviews.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn algorithm(&self) -> &dyn SrsAlgorithm {
        self.algorithm.as_ref()
    }

    async fn load(&self, item: &SessionItem) -> EngineResult<ScheduleRecord> {
        let store = Arc::clone(&self.store);
        let key = item.key;
        match blocking(move || store.load_record(key)).await? {
            Some(record) => Ok(record),
            None => {
                error!(card = %item.key, "schedule record missing");
                Err(EngineError::NotFound(item.key))
            }
        }
    }

    async fn settle(&self, record: &ScheduleRecord, grade: Grade) -> EngineResult<ReviewLog> {
        let now = (self.clock)();
        let ReviewOutcome { record: next, log } = review(self.algorithm.as_ref(), record, grade, now, self.day_length_ms);
        let store = Arc::clone(&self.store);
        let (next, log) = blocking(move || {
            store.save_record(&next)?;
            store.log_review(&log)?;
            Ok((next, log))
        })
        .await?;
        info!(
            card = %record.key(),
            grade = grade.as_str(),
            repetitions = next.repetitions(),
            interval_days = log.interval_days,
            "review settled"
        );
        Ok(log)
    }

    /// Judge `answer` for `item` and persist the schedule change.
    ///
    /// A judge failure leaves the record untouched and yields
    /// [`GradeOutcome::Error`]. Pass maps to `Good` and fail to `Again`.
    pub async fn grade(&self, item: &SessionItem, answer: &str) -> EngineResult<GradeOutcome> {
        let record = self.load(item).await?;
        let request = JudgeRequest {
            reference: item.reference_answer.clone(),
            answer: answer.to_string(),
            language: item.language.clone(),
            drill: item.drill(),
        };

        let verdict = match self.judge.judge(&request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(card = %item.key, error = %e, "judging failed; dropping card from lesson");
                return Ok(GradeOutcome::Error { message: e.to_string() });
            }
        };

        if verdict.pass {
            self.settle(&record, Grade::Good).await?;
            Ok(GradeOutcome::Success)
        } else {
            self.settle(&record, Grade::Again).await?;
            Ok(GradeOutcome::Failure {
                user_answer: answer.to_string(),
                reason: verdict.reason.unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string()),
            })
        }
    }

    /// Apply the give-up policy. Returns the review when one was recorded.
    pub async fn give_up(&self, item: &SessionItem) -> EngineResult<Option<ReviewLog>> {
        match self.give_up_policy {
            GiveUpPolicy::RecordOnly => Ok(None),
            GiveUpPolicy::ScheduleAgain => {
                let record = self.load(item).await?;
                self.settle(&record, Grade::Again).await.map(Some)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::algorithm::Fsrs;
    use crate::db::Database;
    use crate::models::{CardKey, Item, DAY_MS};
    use crate::selector::{DueQuery, DueSource};

    /// Judge driven by the answer text: "err" fails the call, anything else is compared exactly.
    pub(crate) struct ScriptedJudge;

    #[async_trait]
    impl Judge for ScriptedJudge {
        async fn judge(&self, request: &JudgeRequest) -> Result<Verdict, JudgeError> {
            match request.answer.as_str() {
                "err" => Err(JudgeError::Transport("connection reset".to_string())),
                answer if answer == request.reference => Ok(Verdict::pass()),
                _ => Ok(Verdict { pass: false, reason: None }),
            }
        }
    }

    fn setup(policy: GiveUpPolicy) -> (Arc<Database>, GradingOrchestrator, SessionItem) {
        let db = Arc::new(Database::in_memory().unwrap());
        let item = Item::new("ana", "gato", "gato", "es");
        db.insert_item(&item, &[DrillType::Dictation], Utc::now()).unwrap();
        let session_item = db.select_due(&DueQuery::new("ana", 1, Utc::now())).unwrap().remove(0);
        let orchestrator = GradingOrchestrator::new(db.clone(), Box::new(Fsrs::default()), Arc::new(ScriptedJudge), DAY_MS)
            .with_give_up_policy(policy);
        (db, orchestrator, session_item)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(ExactMatchJudge::normalize("  ¿Qué   TAL? "), "qué tal");
        assert_eq!(ExactMatchJudge::normalize("l'eau."), "l'eau");
    }

    #[tokio::test]
    async fn test_exact_match_judge() {
        let request = JudgeRequest {
            reference: "Bonjour !".to_string(),
            answer: "bonjour".to_string(),
            language: "fr".to_string(),
            drill: DrillType::Dictation,
        };
        assert!(ExactMatchJudge.judge(&request).await.unwrap().pass);
        let wrong = JudgeRequest { answer: "bonsoir".to_string(), ..request };
        let verdict = ExactMatchJudge.judge(&wrong).await.unwrap();
        assert!(!verdict.pass);
        assert!(verdict.reason.unwrap().contains("Bonjour"));
    }

    #[tokio::test]
    async fn test_pass_schedules_good() {
        let (db, orchestrator, item) = setup(GiveUpPolicy::RecordOnly);
        let outcome = orchestrator.grade(&item, "gato").await.unwrap();
        assert_eq!(outcome, GradeOutcome::Success);

        let record = db.load_record(item.key).unwrap().unwrap();
        assert_eq!(record.repetitions(), 1);
        assert_eq!(record.lapses(), 0);
        assert_eq!(db.review_history(item.key).unwrap()[0].grade, Grade::Good);
    }

    #[tokio::test]
    async fn test_fail_schedules_again() {
        let (db, orchestrator, item) = setup(GiveUpPolicy::RecordOnly);
        let outcome = orchestrator.grade(&item, "pato").await.unwrap();
        assert_eq!(
            outcome,
            GradeOutcome::Failure {
                user_answer: "pato".to_string(),
                reason: DEFAULT_FAILURE_REASON.to_string(),
            }
        );
        let record = db.load_record(item.key).unwrap().unwrap();
        assert_eq!(record.lapses(), 1);
    }

    #[tokio::test]
    async fn test_judge_error_leaves_record() {
        let (db, orchestrator, item) = setup(GiveUpPolicy::RecordOnly);
        let before = db.load_record(item.key).unwrap().unwrap();
        let outcome = orchestrator.grade(&item, "err").await.unwrap();
        assert!(matches!(outcome, GradeOutcome::Error { .. }));
        assert_eq!(db.load_record(item.key).unwrap().unwrap(), before);
        assert!(db.review_history(item.key).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_record_is_an_error() {
        let (_db, orchestrator, mut item) = setup(GiveUpPolicy::RecordOnly);
        item.key = CardKey::new(uuid::Uuid::new_v4(), DrillType::Speaking);
        assert!(matches!(orchestrator.grade(&item, "gato").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_give_up_policies() {
        let (db, orchestrator, item) = setup(GiveUpPolicy::RecordOnly);
        assert!(orchestrator.give_up(&item).await.unwrap().is_none());
        assert!(db.load_record(item.key).unwrap().unwrap().is_new());

        let (db, orchestrator, item) = setup(GiveUpPolicy::ScheduleAgain);
        let log = orchestrator.give_up(&item).await.unwrap().unwrap();
        assert_eq!(log.grade, Grade::Again);
        assert_eq!(db.load_record(item.key).unwrap().unwrap().lapses(), 1);
    }
}
