//! Spaced-repetition scheduling and review lessons for language drills.
//!
//! Items are study prompts. Each item is drilled in several ways
//! ([`DrillType`]) and every (item, drill) pair carries its own
//! [`ScheduleRecord`]. A lesson pulls due cards from the store through a
//! [`DueSelector`], keeps them in a [`LessonQueue`], and settles answers
//! through a [`GradingOrchestrator`] that asks a [`Judge`] and updates the
//! schedule with an [`SrsAlgorithm`].
//!
//! # Example
//!
//! ```no_run
//! use review_engine::{
//!     lesson_queue, Database, DueSelector, ExactMatchJudge, GradingOrchestrator, LessonConfig,
//!     LessonSession, SchedulerConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> review_engine::EngineResult<()> {
//! let db = Arc::new(Database::in_memory()?);
//! let lesson = LessonConfig::default();
//! let orchestrator = GradingOrchestrator::from_config(
//!     db.clone(),
//!     Arc::new(ExactMatchJudge),
//!     &SchedulerConfig::default(),
//!     &lesson,
//! )?;
//! let selector = DueSelector::new(db, lesson.batch_size);
//! let handle = LessonSession::new(lesson_queue(&lesson), Arc::new(orchestrator), Arc::new(selector), "ana")
//!     .with_refill_threshold(lesson.refill_threshold)
//!     .spawn();
//! handle.refill().await?;
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod config;
pub mod db;
pub mod error;
pub mod grading;
pub mod models;
pub mod queue;
pub mod rotator;
pub mod selector;
pub mod session;

pub use algorithm::{algorithm_from_config, review, Fsrs, Prior, ReviewOutcome, Sm2, SrsAlgorithm};
pub use config::{AlgorithmKind, GiveUpPolicy, LessonConfig, QueueStrategy, SchedulerConfig};
pub use db::{Database, ScheduleStore};
pub use error::{EngineError, EngineResult};
pub use grading::{ExactMatchJudge, GradingOrchestrator, Judge, JudgeError, JudgeRequest, Verdict};
pub use models::{
    CardKey, DrillType, DueCounts, FailureRecord, Grade, Item, ItemId, LearnerId, ReviewLog,
    ScheduleRecord, SessionItem,
};
pub use queue::{lesson_queue, GradeOutcome, LessonQueue, LessonSnapshot, SessionQueueState, Transition};
pub use rotator::StagedQueue;
pub use selector::{DueQuery, DueSelector, DueSource};
pub use session::{LessonSession, SessionEvent, SessionHandle};
