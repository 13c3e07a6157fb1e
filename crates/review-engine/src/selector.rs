//! Due-card selection policy.
//!
//! Eligible cards belong to the learner, are neither flagged nor suspended and
//! have `next_review_at <= now`. They come back ordered by repetitions
//! (descending) and then by how overdue they are, so cards with history are
//! resurfaced before new cards can flood a lesson.

use crate::db::blocking;
use crate::error::EngineResult;
use crate::models::{CardKey, DueCounts, LearnerId, SessionItem};
use crate::queue::LessonQueue;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Parameters for one due-card query.
#[derive(Debug, Clone)]
pub struct DueQuery {
    pub learner_id: LearnerId,
    pub exclude: HashSet<CardKey>,
    pub limit: usize,
    pub now: DateTime<Utc>,
}

impl DueQuery {
    pub fn new(learner_id: impl Into<LearnerId>, limit: usize, now: DateTime<Utc>) -> Self {
        Self {
            learner_id: learner_id.into(),
            exclude: HashSet::new(),
            limit,
            now,
        }
    }

    pub fn excluding(mut self, keys: impl IntoIterator<Item = CardKey>) -> Self {
        self.exclude.extend(keys);
        self
    }
}

/// Read side of the store used for lesson building and progress display.
pub trait DueSource: Send + Sync {
    /// At most `query.limit` due cards. An empty result means the lesson is done.
    fn select_due(&self, query: &DueQuery) -> EngineResult<Vec<SessionItem>>;

    fn count_due(&self, learner_id: &str, now: DateTime<Utc>) -> EngineResult<DueCounts>;
}

/// Fetches batches for a running lesson.
pub struct DueSelector {
    source: Arc<dyn DueSource>,
    batch_size: usize,
}

impl DueSelector {
    pub fn new(source: Arc<dyn DueSource>, batch_size: usize) -> Self {
        Self { source, batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Query for the next batch of `lesson`, skipping every card the lesson already knows about.
    pub fn query(&self, learner_id: &str, lesson: &dyn LessonQueue, now: DateTime<Utc>) -> DueQuery {
        DueQuery::new(learner_id, self.batch_size, now).excluding(lesson.known_keys())
    }

    /// Run `query` against the store on the blocking pool.
    pub async fn fetch(&self, query: DueQuery) -> EngineResult<Vec<SessionItem>> {
        let source = Arc::clone(&self.source);
        blocking(move || {
            let batch = source.select_due(&query)?;
            debug!(
                learner = %query.learner_id,
                excluded = query.exclude.len(),
                fetched = batch.len(),
                "selected due batch"
            );
            Ok(batch)
        })
        .await
    }

    pub async fn next_batch(
        &self,
        learner_id: &str,
        lesson: &dyn LessonQueue,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<SessionItem>> {
        let query = self.query(learner_id, lesson, now);
        self.fetch(query).await
    }

    pub async fn counts(&self, learner_id: &str, now: DateTime<Utc>) -> EngineResult<DueCounts> {
        let source = Arc::clone(&self.source);
        let learner_id = learner_id.to_string();
        blocking(move || source.count_due(&learner_id, now)).await
    }
}
