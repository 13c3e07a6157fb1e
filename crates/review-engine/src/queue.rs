//! In-lesson queue state machine.
//!
//! A lesson queue is owned by exactly one writer and only changes through
//! [`Transition`]s. Grading is optimistic: `WillGrade` pops the head right away
//! and parks the card in `awaiting_grade` until its `DidGrade` arrives, so the
//! learner can move on while the judge is still working.
//!
//! `items_by_id` only holds cards that are still reachable from the queue, the
//! cards awaiting a grade, or the failure list. [`SessionQueueState::collect_garbage`]
//! is a full mark-and-sweep that runs after every transition that removes
//! something.

use crate::config::{LessonConfig, QueueStrategy};
use crate::models::{CardKey, DrillType, FailureRecord, SessionItem};
use crate::rotator::StagedQueue;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Failure reason recorded when the learner gives up.
pub const GAVE_UP_REASON: &str = "gave up";

/// Settled result of one grading call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GradeOutcome {
    /// Judged correct.
    Success,
    /// Judged wrong.
    Failure { user_answer: String, reason: String },
    /// Judge or transport failed. The card leaves the lesson for good.
    Error { message: String },
}

impl GradeOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::Error { .. } => "error",
        }
    }
}

/// Every way a lesson queue can change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Merge a batch of due cards.
    AddMore(Vec<SessionItem>),
    /// The head was answered and sent to the judge.
    WillGrade(CardKey),
    /// A grading call settled.
    DidGrade { key: CardKey, outcome: GradeOutcome },
    /// The learner gave up on the head.
    UserGaveUp(CardKey),
    /// The head is deferred to a later lesson without grading.
    FlagQuiz(CardKey),
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddMore(_) => "add_more",
            Self::WillGrade(_) => "will_grade",
            Self::DidGrade { .. } => "did_grade",
            Self::UserGaveUp(_) => "user_gave_up",
            Self::FlagQuiz(_) => "flag_quiz",
        }
    }
}

/// Rejected transitions. The queue is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{got} is not the current card")]
    NotHead { expected: Option<CardKey>, got: CardKey },

    #[error("{0} is not awaiting a grade")]
    NotAwaiting(CardKey),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A failure plus the card content, for end-of-lesson review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureView {
    pub failure: FailureRecord,
    pub item: Option<SessionItem>,
}

/// Read model handed to hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonSnapshot {
    pub strategy: String,
    pub stage: Option<DrillType>,
    pub current: Option<SessionItem>,
    pub queue_len: usize,
    pub awaiting: usize,
    pub errored: usize,
    pub failures: Vec<FailureView>,
    pub complete: bool,
}

/// Lesson queue policy chosen at lesson start.
pub trait LessonQueue: Send {
    /// Policy name.
    fn name(&self) -> &str;

    /// Apply one transition.
    fn apply(&mut self, transition: Transition) -> QueueResult<()>;

    /// Card at the head of the queue.
    fn current(&self) -> Option<&SessionItem>;

    fn item(&self, key: &CardKey) -> Option<&SessionItem>;

    fn queue_len(&self) -> usize;

    fn awaiting(&self) -> &HashSet<CardKey>;

    fn errored(&self) -> &HashSet<CardKey>;

    /// Most recent first.
    fn failures(&self) -> &[FailureRecord];

    /// Every card this lesson has seen and must not be offered again.
    fn known_keys(&self) -> HashSet<CardKey>;

    /// Current drill stage, for staged policies.
    fn stage(&self) -> Option<DrillType> {
        None
    }

    /// Whether the host should fetch another batch.
    fn needs_refill(&self, threshold: usize) -> bool {
        self.queue_len() <= threshold
    }

    /// Nothing left to present and nothing in flight.
    fn is_complete(&self) -> bool {
        self.queue_len() == 0 && self.awaiting().is_empty()
    }

    fn snapshot(&self) -> LessonSnapshot {
        LessonSnapshot {
            strategy: self.name().to_string(),
            stage: self.stage(),
            current: self.current().cloned(),
            queue_len: self.queue_len(),
            awaiting: self.awaiting().len(),
            errored: self.errored().len(),
            failures: self
                .failures()
                .iter()
                .map(|failure| FailureView {
                    failure: failure.clone(),
                    item: self.item(&failure.key).cloned(),
                })
                .collect(),
            complete: self.is_complete(),
        }
    }
}

/// Build the queue for a new lesson.
pub fn lesson_queue(config: &LessonConfig) -> Box<dyn LessonQueue> {
    match config.strategy {
        QueueStrategy::Interleaved => Box::new(SessionQueueState::new()),
        QueueStrategy::Staged => Box::new(StagedQueue::new(config.dictation_max_repetitions)),
    }
}

/// Keep the head in place, then drop later duplicates of it or of each other.
pub fn better_unique(ids: impl IntoIterator<Item = CardKey>) -> Vec<CardKey> {
    let mut ids = ids.into_iter();
    let Some(head) = ids.next() else {
        return Vec::new();
    };
    let mut seen = HashSet::from([head]);
    let mut unique = vec![head];
    unique.extend(ids.filter(|id| seen.insert(*id)));
    unique
}

/// Interleaved lesson queue: cards of every drill type share one queue.
#[derive(Debug, Clone, Default)]
pub struct SessionQueueState {
    queue: Vec<CardKey>,
    items_by_id: HashMap<CardKey, SessionItem>,
    awaiting_grade: HashSet<CardKey>,
    errored_ids: HashSet<CardKey>,
    /// Flagged cards, kept out of this lesson only.
    skipped: HashSet<CardKey>,
    failures: Vec<FailureRecord>,
}

impl SessionQueueState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self) -> &[CardKey] {
        &self.queue
    }

    pub fn items_by_id(&self) -> &HashMap<CardKey, SessionItem> {
        &self.items_by_id
    }

    pub(crate) fn head(&self) -> Option<CardKey> {
        self.queue.first().copied()
    }

    fn expect_head(&self, key: CardKey) -> QueueResult<()> {
        match self.head() {
            Some(head) if head == key => Ok(()),
            expected => Err(QueueError::NotHead { expected, got: key }),
        }
    }

    fn add_more(&mut self, batch: Vec<SessionItem>) {
        let mut incoming = Vec::with_capacity(batch.len());
        for item in batch {
            // Errored and skipped cards are never retried and in-flight cards are already handled.
            if self.errored_ids.contains(&item.key)
                || self.skipped.contains(&item.key)
                || self.awaiting_grade.contains(&item.key)
            {
                continue;
            }
            incoming.push(item.key);
            self.items_by_id.insert(item.key, item);
        }
        let merged = self.queue.iter().copied().chain(incoming);
        self.queue = better_unique(merged);
    }

    fn pop_head(&mut self) {
        if !self.queue.is_empty() {
            self.queue.remove(0);
        }
    }

    /// Drop every item that is no longer referenced by the queue, the cards
    /// awaiting a grade or the failure list.
    pub fn collect_garbage(&mut self) {
        let mut reachable: HashSet<CardKey> = self.queue.iter().copied().collect();
        reachable.extend(self.awaiting_grade.iter().copied());
        reachable.extend(self.failures.iter().map(|f| f.key));

        let before = self.items_by_id.len();
        self.items_by_id.retain(|key, _| reachable.contains(key));
        let swept = before - self.items_by_id.len();
        if swept > 0 {
            debug!(swept, live = self.items_by_id.len(), "collected lesson items");
        }
    }

    /// Verify the structural invariants; used by tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        check_reachability(
            &self.items_by_id,
            self.queue.iter().copied(),
            &self.awaiting_grade,
            &self.failures,
        )?;
        if self.queue.len() > 1 {
            let tail = &self.queue[1..];
            if better_unique(tail.iter().copied()).len() != tail.len() {
                return Err("queue tail contains duplicates".to_string());
            }
        }
        if let Some(key) = self.awaiting_grade.iter().find(|k| self.errored_ids.contains(*k)) {
            return Err(format!("{key} is both awaiting and errored"));
        }
        Ok(())
    }
}

/// Shared reachability check: every stored item is referenced and every
/// referenced card that needs content has it.
pub(crate) fn check_reachability(
    items_by_id: &HashMap<CardKey, SessionItem>,
    live: impl IntoIterator<Item = CardKey>,
    awaiting: &HashSet<CardKey>,
    failures: &[FailureRecord],
) -> Result<(), String> {
    let mut reachable: HashSet<CardKey> = HashSet::new();
    for key in live {
        if !items_by_id.contains_key(&key) {
            return Err(format!("queued card {key} has no item"));
        }
        reachable.insert(key);
    }
    for key in awaiting {
        if !items_by_id.contains_key(key) {
            return Err(format!("awaiting card {key} was collected"));
        }
        reachable.insert(*key);
    }
    for failure in failures {
        if !items_by_id.contains_key(&failure.key) {
            return Err(format!("failed card {} was collected", failure.key));
        }
        reachable.insert(failure.key);
    }
    if let Some(key) = items_by_id.keys().find(|k| !reachable.contains(*k)) {
        return Err(format!("{key} is unreachable but still stored"));
    }
    Ok(())
}

impl LessonQueue for SessionQueueState {
    fn name(&self) -> &str {
        "interleaved"
    }

    fn apply(&mut self, transition: Transition) -> QueueResult<()> {
        debug!(transition = transition.name(), queued = self.queue.len(), "applying transition");
        match transition {
            Transition::AddMore(batch) => {
                self.add_more(batch);
            }
            Transition::WillGrade(key) => {
                self.expect_head(key)?;
                self.pop_head();
                self.awaiting_grade.insert(key);
                self.collect_garbage();
            }
            Transition::DidGrade { key, outcome } => {
                if !self.awaiting_grade.remove(&key) {
                    return Err(QueueError::NotAwaiting(key));
                }
                match outcome {
                    GradeOutcome::Success => {}
                    GradeOutcome::Failure { user_answer, reason } => {
                        self.failures.insert(0, FailureRecord { key, user_answer, reason });
                    }
                    GradeOutcome::Error { .. } => {
                        self.errored_ids.insert(key);
                    }
                }
                self.collect_garbage();
            }
            Transition::UserGaveUp(key) => {
                self.expect_head(key)?;
                self.failures.insert(
                    0,
                    FailureRecord {
                        key,
                        user_answer: String::new(),
                        reason: GAVE_UP_REASON.to_string(),
                    },
                );
                self.pop_head();
                self.collect_garbage();
            }
            Transition::FlagQuiz(key) => {
                self.expect_head(key)?;
                self.pop_head();
                self.skipped.insert(key);
                self.collect_garbage();
            }
        }
        Ok(())
    }

    fn current(&self) -> Option<&SessionItem> {
        self.head().and_then(|key| self.items_by_id.get(&key))
    }

    fn item(&self, key: &CardKey) -> Option<&SessionItem> {
        self.items_by_id.get(key)
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn awaiting(&self) -> &HashSet<CardKey> {
        &self.awaiting_grade
    }

    fn errored(&self) -> &HashSet<CardKey> {
        &self.errored_ids
    }

    fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    fn known_keys(&self) -> HashSet<CardKey> {
        let mut keys: HashSet<CardKey> = self.queue.iter().copied().collect();
        keys.extend(self.awaiting_grade.iter().copied());
        keys.extend(self.errored_ids.iter().copied());
        keys.extend(self.skipped.iter().copied());
        keys.extend(self.failures.iter().map(|f| f.key));
        keys
    }
}
