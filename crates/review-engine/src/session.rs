//! Lesson session actor.
//!
//! One task owns the [`LessonQueue`] and applies every transition in the
//! order its commands arrive. Grading runs on separate tasks, so several
//! cards may be in flight at once; each settles back into the actor as a
//! `DidGrade` through the same command channel.

use crate::error::{EngineError, EngineResult};
use crate::grading::GradingOrchestrator;
use crate::models::{CardKey, DueCounts, LearnerId};
use crate::queue::{GradeOutcome, LessonQueue, LessonSnapshot, Transition};
use crate::selector::DueSelector;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Pushed to subscribers as the lesson moves.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A grade settled and the queue has been updated.
    Graded { key: CardKey, outcome: GradeOutcome },
    /// A batch was fetched from the store.
    Refilled { fetched: usize },
    /// Nothing left to present, nothing in flight and no more due cards.
    Completed,
}

enum Command {
    Refill { reply: oneshot::Sender<EngineResult<usize>> },
    Submit { key: CardKey, answer: String, reply: oneshot::Sender<EngineResult<()>> },
    Settle { key: CardKey, outcome: GradeOutcome },
    GiveUp { key: CardKey, reply: oneshot::Sender<EngineResult<()>> },
    Flag { key: CardKey, reply: oneshot::Sender<EngineResult<()>> },
    Snapshot { reply: oneshot::Sender<LessonSnapshot> },
    Close { reply: oneshot::Sender<()> },
}

/// Everything a lesson needs before it starts.
pub struct LessonSession {
    queue: Box<dyn LessonQueue>,
    orchestrator: Arc<GradingOrchestrator>,
    selector: Arc<DueSelector>,
    learner: LearnerId,
    refill_threshold: usize,
}

impl LessonSession {
    pub fn new(
        queue: Box<dyn LessonQueue>,
        orchestrator: Arc<GradingOrchestrator>,
        selector: Arc<DueSelector>,
        learner: impl Into<LearnerId>,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            selector,
            learner: learner.into(),
            refill_threshold: 0,
        }
    }

    /// Fetch more cards once the queue holds this many or fewer.
    pub fn with_refill_threshold(mut self, threshold: usize) -> Self {
        self.refill_threshold = threshold;
        self
    }

    /// Start the actor on the current tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let handle = SessionHandle {
            tx: tx.clone(),
            events: events.clone(),
            selector: Arc::clone(&self.selector),
            learner: self.learner.clone(),
        };
        let actor = SessionActor {
            session: self,
            tx: tx.downgrade(),
            events,
            announced: false,
        };
        tokio::spawn(actor.run(rx));
        handle
    }
}

/// Cloneable front door to a running lesson.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    selector: Arc<DueSelector>,
    learner: LearnerId,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| EngineError::SessionClosed)?;
        rx.await.map_err(|_| EngineError::SessionClosed)
    }

    /// Fetch the next batch of due cards. Returns how many were fetched.
    pub async fn refill(&self) -> EngineResult<usize> {
        self.request(|reply| Command::Refill { reply }).await?
    }

    /// Submit an answer for the head card. Returns once grading has started;
    /// the result arrives as [`SessionEvent::Graded`].
    pub async fn submit(&self, key: CardKey, answer: impl Into<String>) -> EngineResult<()> {
        let answer = answer.into();
        self.request(|reply| Command::Submit { key, answer, reply }).await?
    }

    pub async fn give_up(&self, key: CardKey) -> EngineResult<()> {
        self.request(|reply| Command::GiveUp { key, reply }).await?
    }

    /// Skip the head card for the rest of this lesson. Nothing is written to the
    /// store, so the card is due again in the next lesson.
    pub async fn flag(&self, key: CardKey) -> EngineResult<()> {
        self.request(|reply| Command::Flag { key, reply }).await?
    }

    pub async fn snapshot(&self) -> EngineResult<LessonSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Due counts straight from the store.
    pub async fn counts(&self) -> EngineResult<DueCounts> {
        self.selector.counts(&self.learner, Utc::now()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop the actor and drop the lesson state. Grades already in flight
    /// still persist.
    pub async fn close(&self) {
        if self.request(|reply| Command::Close { reply }).await.is_err() {
            debug!("session already closed");
        }
    }
}

struct SessionActor {
    session: LessonSession,
    tx: mpsc::WeakSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    announced: bool,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(
            learner = %self.session.learner,
            strategy = self.session.queue.name(),
            "lesson started"
        );
        while let Some(command) = rx.recv().await {
            match command {
                Command::Close { reply } => {
                    let _ = reply.send(());
                    break;
                }
                Command::Refill { reply } => {
                    let result = self.refill().await;
                    self.announce_if_complete();
                    let _ = reply.send(result);
                }
                Command::Submit { key, answer, reply } => {
                    let result = self.submit(key, answer);
                    if result.is_ok() {
                        self.top_up().await;
                    }
                    let _ = reply.send(result);
                }
                Command::Settle { key, outcome } => self.settle(key, outcome).await,
                Command::GiveUp { key, reply } => {
                    let result = self.give_up(key).await;
                    self.top_up().await;
                    self.announce_if_complete();
                    let _ = reply.send(result);
                }
                Command::Flag { key, reply } => {
                    let result = self.flag(key);
                    self.top_up().await;
                    self.announce_if_complete();
                    let _ = reply.send(result);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.session.queue.snapshot());
                }
            }
        }
        info!(
            learner = %self.session.learner,
            in_flight = self.session.queue.awaiting().len(),
            "lesson closed"
        );
    }

    async fn refill(&mut self) -> EngineResult<usize> {
        // `&dyn LessonQueue` is not Send, so the query is built before the await
        let query = self
            .session
            .selector
            .query(&self.session.learner, self.session.queue.as_ref(), Utc::now());
        let batch = self.session.selector.fetch(query).await?;
        let fetched = batch.len();
        if fetched > 0 {
            self.session.queue.apply(Transition::AddMore(batch))?;
            let _ = self.events.send(SessionEvent::Refilled { fetched });
        }
        Ok(fetched)
    }

    /// Refill when the queue runs low. Failures only cost us the prefetch.
    async fn top_up(&mut self) {
        if self.session.queue.needs_refill(self.session.refill_threshold) {
            if let Err(e) = self.refill().await {
                warn!(error = %e, "refill failed");
            }
        }
    }

    fn announce_if_complete(&mut self) {
        let complete = self.session.queue.is_complete();
        if complete && !self.announced {
            info!(learner = %self.session.learner, failures = self.session.queue.failures().len(), "lesson complete");
            let _ = self.events.send(SessionEvent::Completed);
        }
        self.announced = complete;
    }

    fn submit(&mut self, key: CardKey, answer: String) -> EngineResult<()> {
        let tx = self.tx.upgrade().ok_or(EngineError::SessionClosed)?;
        self.session.queue.apply(Transition::WillGrade(key))?;
        let item = self
            .session
            .queue
            .item(&key)
            .cloned()
            .ok_or(EngineError::NotFound(key))?;

        let orchestrator = Arc::clone(&self.session.orchestrator);
        tokio::spawn(async move {
            let outcome = match orchestrator.grade(&item, &answer).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(card = %key, error = %e, "grading failed");
                    GradeOutcome::Error { message: e.to_string() }
                }
            };
            if tx.send(Command::Settle { key, outcome }).await.is_err() {
                debug!(card = %key, "grade settled after lesson closed");
            }
        });
        Ok(())
    }

    async fn settle(&mut self, key: CardKey, outcome: GradeOutcome) {
        if let Err(e) = self.session.queue.apply(Transition::DidGrade { key, outcome: outcome.clone() }) {
            warn!(card = %key, error = %e, "dropping stale grade");
            return;
        }
        let _ = self.events.send(SessionEvent::Graded { key, outcome });
        self.top_up().await;
        self.announce_if_complete();
    }

    async fn give_up(&mut self, key: CardKey) -> EngineResult<()> {
        let item = self.session.queue.item(&key).cloned();
        self.session.queue.apply(Transition::UserGaveUp(key))?;
        if let Some(item) = item {
            self.session.orchestrator.give_up(&item).await?;
        }
        Ok(())
    }

    fn flag(&mut self, key: CardKey) -> EngineResult<()> {
        self.session.queue.apply(Transition::FlagQuiz(key))?;
        debug!(card = %key, "card skipped for this lesson");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::Fsrs;
    use crate::db::{Database, ScheduleStore};
    use crate::grading::tests::ScriptedJudge;
    use crate::models::{DrillType, Item, DAY_MS};
    use crate::queue::{QueueError, SessionQueueState, GAVE_UP_REASON};
    use crate::rotator::StagedQueue;
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    struct Fixture {
        db: Arc<Database>,
        keys: Vec<CardKey>,
    }

    fn fixture(prompts: &[&str]) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let start = Utc::now() - Duration::days(1);
        let keys = prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| {
                let item = Item::new("ana", *prompt, *prompt, "es");
                db.insert_item(&item, &[DrillType::Dictation], start + Duration::minutes(i as i64)).unwrap();
                CardKey::new(item.id, DrillType::Dictation)
            })
            .collect();
        Fixture { db, keys }
    }

    fn start(fixture: &Fixture, queue: Box<dyn LessonQueue>, batch: usize) -> SessionHandle {
        let orchestrator = GradingOrchestrator::new(
            fixture.db.clone(),
            Box::new(Fsrs::default()),
            Arc::new(ScriptedJudge),
            DAY_MS,
        );
        let selector = DueSelector::new(fixture.db.clone(), batch);
        LessonSession::new(queue, Arc::new(orchestrator), Arc::new(selector), "ana").spawn()
    }

    async fn next_graded(events: &mut broadcast::Receiver<SessionEvent>) -> (CardKey, GradeOutcome) {
        loop {
            let event = timeout(StdDuration::from_secs(5), events.recv()).await.unwrap().unwrap();
            if let SessionEvent::Graded { key, outcome } = event {
                return (key, outcome);
            }
        }
    }

    #[tokio::test]
    async fn test_lesson_runs_to_completion() {
        let fx = fixture(&["uno", "dos"]);
        let handle = start(&fx, Box::new(SessionQueueState::new()), 10);
        let mut events = handle.subscribe();

        assert_eq!(handle.refill().await.unwrap(), 2);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current.as_ref().map(|i| i.key), Some(fx.keys[0]));

        handle.submit(fx.keys[0], "uno").await.unwrap();
        assert_eq!(next_graded(&mut events).await, (fx.keys[0], GradeOutcome::Success));

        handle.submit(fx.keys[1], "tres").await.unwrap();
        let (key, outcome) = next_graded(&mut events).await;
        assert_eq!(key, fx.keys[1]);
        assert!(matches!(outcome, GradeOutcome::Failure { .. }));

        loop {
            let event = timeout(StdDuration::from_secs(5), events.recv()).await.unwrap().unwrap();
            if event == SessionEvent::Completed {
                break;
            }
        }
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.complete);
        assert_eq!(snapshot.failures.len(), 1);
        assert_eq!(fx.db.load_record(fx.keys[0]).unwrap().unwrap().repetitions(), 1);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_submit_rejects_non_head() {
        let fx = fixture(&["uno", "dos"]);
        let handle = start(&fx, Box::new(SessionQueueState::new()), 10);
        handle.refill().await.unwrap();

        let err = handle.submit(fx.keys[1], "dos").await.unwrap_err();
        assert!(matches!(err, EngineError::Queue(QueueError::NotHead { .. })));
        assert_eq!(handle.snapshot().await.unwrap().awaiting, 0);
    }

    #[tokio::test]
    async fn test_judge_error_marks_card_errored() {
        let fx = fixture(&["uno"]);
        let handle = start(&fx, Box::new(SessionQueueState::new()), 10);
        let mut events = handle.subscribe();
        handle.refill().await.unwrap();
        let before = fx.db.load_record(fx.keys[0]).unwrap().unwrap();

        handle.submit(fx.keys[0], "err").await.unwrap();
        let (_, outcome) = next_graded(&mut events).await;
        assert!(matches!(outcome, GradeOutcome::Error { .. }));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.errored, 1);
        assert_eq!(snapshot.queue_len, 0);
        assert_eq!(fx.db.load_record(fx.keys[0]).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_give_up_and_flag() {
        let fx = fixture(&["uno", "dos"]);
        let handle = start(&fx, Box::new(SessionQueueState::new()), 10);
        handle.refill().await.unwrap();

        handle.give_up(fx.keys[0]).await.unwrap();
        handle.flag(fx.keys[1]).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.failures.len(), 1);
        assert_eq!(snapshot.failures[0].failure.reason, GAVE_UP_REASON);
        assert!(snapshot.complete);
        assert!(!fx.db.get_item(fx.keys[1].item_id).unwrap().unwrap().flagged);
        assert_eq!(handle.counts().await.unwrap().due_now, 2);
    }

    #[tokio::test]
    async fn test_flagged_card_returns_next_lesson() {
        let fx = fixture(&["uno", "dos"]);
        let handle = start(&fx, Box::new(SessionQueueState::new()), 10);
        handle.refill().await.unwrap();
        let before = fx.db.load_record(fx.keys[0]).unwrap().unwrap();

        handle.flag(fx.keys[0]).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current.map(|i| i.key), Some(fx.keys[1]));
        assert!(snapshot.failures.is_empty());
        // Skipped for the rest of this lesson
        assert_eq!(handle.refill().await.unwrap(), 0);
        handle.close().await;

        assert_eq!(fx.db.load_record(fx.keys[0]).unwrap().unwrap(), before);
        assert!(fx.db.review_history(fx.keys[0]).unwrap().is_empty());

        let next = start(&fx, Box::new(SessionQueueState::new()), 10);
        assert_eq!(next.refill().await.unwrap(), 2);
        let snapshot = next.snapshot().await.unwrap();
        assert_eq!(snapshot.current.map(|i| i.key), Some(fx.keys[0]));
        next.close().await;
    }

    #[tokio::test]
    async fn test_flagged_item_leaves_staged_lesson_only() {
        let fx = fixture(&["uno"]);
        let handle = start(&fx, Box::new(StagedQueue::new(3)), 10);
        handle.refill().await.unwrap();
        handle.flag(fx.keys[0]).await.unwrap();
        assert!(handle.snapshot().await.unwrap().complete);
        handle.close().await;

        let next = start(&fx, Box::new(StagedQueue::new(3)), 10);
        assert_eq!(next.refill().await.unwrap(), 1);
        assert_eq!(next.snapshot().await.unwrap().current.map(|i| i.key), Some(fx.keys[0]));
    }

    #[tokio::test]
    async fn test_refill_tops_up_small_batches() {
        let fx = fixture(&["uno", "dos", "tres"]);
        let handle = start(&fx, Box::new(SessionQueueState::new()), 1);
        let mut events = handle.subscribe();
        handle.refill().await.unwrap();

        for (key, answer) in fx.keys.iter().zip(["uno", "dos", "tres"]) {
            assert_eq!(handle.snapshot().await.unwrap().current.map(|i| i.key), Some(*key));
            handle.submit(*key, answer).await.unwrap();
            assert_eq!(next_graded(&mut events).await, (*key, GradeOutcome::Success));
        }
        assert!(handle.snapshot().await.unwrap().complete);
    }

    #[tokio::test]
    async fn test_staged_session() {
        let fx = fixture(&["uno"]);
        let handle = start(&fx, Box::new(StagedQueue::new(3)), 10);
        handle.refill().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.strategy, "staged");
        assert_eq!(snapshot.stage, Some(DrillType::Dictation));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_commands() {
        let fx = fixture(&["uno"]);
        let handle = start(&fx, Box::new(SessionQueueState::new()), 10);
        handle.close().await;
        assert!(matches!(handle.refill().await, Err(EngineError::SessionClosed)));
        assert!(matches!(handle.snapshot().await, Err(EngineError::SessionClosed)));
    }
}
