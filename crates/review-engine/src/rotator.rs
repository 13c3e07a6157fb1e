//! Staged lesson queue.
//!
//! Cards are drilled one type at a time: every dictation card first, then
//! listening, then speaking. Only items that got through a stage without a
//! failure or a judging error are carried into the next one. Dictation cards
//! that have already been drilled more than `dictation_max_repetitions` times
//! are skipped. The lesson ends when the speaking stage drains.

use crate::models::{CardKey, DrillType, FailureRecord, ItemId, SessionItem};
use crate::queue::{
    better_unique, check_reachability, GradeOutcome, LessonQueue, QueueError, QueueResult, Transition,
    GAVE_UP_REASON,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

fn stage_index(drill: DrillType) -> Option<usize> {
    DrillType::STAGES.iter().position(|d| *d == drill)
}

#[derive(Debug, Clone)]
pub struct StagedQueue {
    stage: usize,
    queue: Vec<CardKey>,
    items_by_id: HashMap<CardKey, SessionItem>,
    /// Items in arrival order.
    carried: Vec<ItemId>,
    /// Items that failed, errored or were deferred.
    dropped: HashSet<ItemId>,
    /// Cards passed this lesson.
    done: HashSet<CardKey>,
    awaiting_grade: HashSet<CardKey>,
    errored_ids: HashSet<CardKey>,
    failures: Vec<FailureRecord>,
    dictation_max_repetitions: u32,
}

impl StagedQueue {
    pub fn new(dictation_max_repetitions: u32) -> Self {
        Self {
            stage: 0,
            queue: Vec::new(),
            items_by_id: HashMap::new(),
            carried: Vec::new(),
            dropped: HashSet::new(),
            done: HashSet::new(),
            awaiting_grade: HashSet::new(),
            errored_ids: HashSet::new(),
            failures: Vec::new(),
            dictation_max_repetitions,
        }
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

    fn stage_drill(&self) -> Option<DrillType> {
        DrillType::STAGES.get(self.stage).copied()
    }

    fn eligible(&self, item: &SessionItem) -> bool {
        !(item.key.drill == DrillType::Dictation && item.repetitions > self.dictation_max_repetitions)
    }

    fn is_active(&self, item_id: &ItemId) -> bool {
        self.carried.contains(item_id) && !self.dropped.contains(item_id)
    }

    /// Card waiting for a later stage of an item still in the lesson.
    fn is_future(&self, key: &CardKey) -> bool {
        self.is_active(&key.item_id) && stage_index(key.drill).is_some_and(|idx| idx > self.stage)
    }

    fn expect_head(&self, key: CardKey) -> QueueResult<()> {
        match self.head() {
            Some(head) if head == key => Ok(()),
            expected => Err(QueueError::NotHead { expected, got: key }),
        }
    }

    fn pop_head(&mut self) {
        if !self.queue.is_empty() {
            self.queue.remove(0);
        }
    }

    fn add_more(&mut self, batch: Vec<SessionItem>) {
        if self.stage_drill().is_none() {
            return;
        }
        let mut incoming = Vec::new();
        let mut stored = 0;
        for item in batch {
            let key = item.key;
            let Some(idx) = stage_index(key.drill) else {
                continue;
            };
            if idx < self.stage
                || self.dropped.contains(&key.item_id)
                || self.done.contains(&key)
                || self.awaiting_grade.contains(&key)
                || self.errored_ids.contains(&key)
            {
                continue;
            }
            if idx == self.stage {
                if !self.eligible(&item) {
                    continue;
                }
                incoming.push(key);
            }
            if !self.carried.contains(&key.item_id) {
                self.carried.push(key.item_id);
            }
            self.items_by_id.insert(key, item);
            stored += 1;
        }
        let merged = self.queue.iter().copied().chain(incoming);
        self.queue = better_unique(merged);
        // A batch with nothing for this stage still feeds the later ones
        if stored > 0 {
            self.advance_if_drained();
        }
    }

    /// Move to the next stage that has work once this one has drained.
    fn advance_if_drained(&mut self) {
        while self.queue.is_empty() && self.awaiting_grade.is_empty() {
            self.stage += 1;
            let Some(drill) = self.stage_drill() else {
                debug!("staged lesson finished");
                break;
            };
            let queue: Vec<CardKey> = self
                .carried
                .iter()
                .filter(|id| !self.dropped.contains(*id))
                .map(|id| CardKey::new(*id, drill))
                .filter(|key| self.items_by_id.get(key).is_some_and(|item| self.eligible(item)))
                .collect();
            debug!(stage = drill.as_str(), cards = queue.len(), "advanced lesson stage");
            self.queue = queue;
        }
        self.collect_garbage();
    }

    /// Mark-and-sweep over `items_by_id`.
    pub fn collect_garbage(&mut self) {
        let mut reachable: HashSet<CardKey> = self.queue.iter().copied().collect();
        reachable.extend(self.awaiting_grade.iter().copied());
        reachable.extend(self.failures.iter().map(|f| f.key));

        let future: Vec<CardKey> = self.items_by_id.keys().filter(|k| self.is_future(k)).copied().collect();
        reachable.extend(future);

        self.items_by_id.retain(|key, _| reachable.contains(key));
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let future: Vec<CardKey> = self.items_by_id.keys().filter(|k| self.is_future(k)).copied().collect();
        check_reachability(
            &self.items_by_id,
            self.queue.iter().copied().chain(future),
            &self.awaiting_grade,
            &self.failures,
        )?;
        let drill = self.stage_drill();
        if let Some(key) = self.queue.iter().find(|k| Some(k.drill) != drill) {
            return Err(format!("{key} queued outside its stage"));
        }
        if let Some(key) = self.queue.iter().find(|k| self.dropped.contains(&k.item_id)) {
            return Err(format!("{key} queued after being dropped"));
        }
        if better_unique(self.queue.iter().copied()).len() != self.queue.len() {
            return Err("queue contains duplicates".to_string());
        }
        Ok(())
    }
}

impl LessonQueue for StagedQueue {
    fn name(&self) -> &str {
        "staged"
    }

    fn apply(&mut self, transition: Transition) -> QueueResult<()> {
        debug!(transition = transition.name(), stage = self.stage, "applying transition");
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
                    GradeOutcome::Success => {
                        self.done.insert(key);
                    }
                    GradeOutcome::Failure { user_answer, reason } => {
                        self.failures.insert(0, FailureRecord { key, user_answer, reason });
                        self.dropped.insert(key.item_id);
                    }
                    GradeOutcome::Error { .. } => {
                        self.errored_ids.insert(key);
                        self.dropped.insert(key.item_id);
                    }
                }
                self.collect_garbage();
                self.advance_if_drained();
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
                self.dropped.insert(key.item_id);
                self.pop_head();
                self.collect_garbage();
                self.advance_if_drained();
            }
            Transition::FlagQuiz(key) => {
                self.expect_head(key)?;
                self.dropped.insert(key.item_id);
                self.pop_head();
                self.collect_garbage();
                self.advance_if_drained();
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
        let mut keys: HashSet<CardKey> = self.items_by_id.keys().copied().collect();
        keys.extend(self.queue.iter().copied());
        keys.extend(self.awaiting_grade.iter().copied());
        keys.extend(self.errored_ids.iter().copied());
        keys.extend(self.done.iter().copied());
        keys.extend(self.failures.iter().map(|f| f.key));
        // Dropped items stay out of this lesson at every stage
        keys.extend(
            self.dropped
                .iter()
                .flat_map(|id| DrillType::STAGES.iter().map(move |drill| CardKey::new(*id, *drill))),
        );
        keys
    }

    fn stage(&self) -> Option<DrillType> {
        self.stage_drill()
    }

    /// Only the first stage takes new cards from the store.
    fn needs_refill(&self, threshold: usize) -> bool {
        self.stage == 0 && self.queue.len() <= threshold
    }
}
