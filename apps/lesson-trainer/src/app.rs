//! Application state and logic.

use crate::config::Config;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use review_engine::{
    lesson_queue, CardKey, Database, DueCounts, DueSelector, ExactMatchJudge, GradeOutcome,
    GradingOrchestrator, LessonSession, LessonSnapshot, SessionEvent, SessionHandle,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Lesson,
    Review,
}

/// Result of the last settled answer, shown under the input.
#[derive(Debug, Clone)]
pub struct LastResult {
    pub prompt: String,
    pub reference: String,
    pub outcome: GradeOutcome,
}

pub struct App {
    pub config: Config,
    pub session: SessionHandle,
    events: broadcast::Receiver<SessionEvent>,
    pub view: View,
    pub snapshot: Option<LessonSnapshot>,
    pub counts: DueCounts,
    pub input: String,
    /// Prompt and reference answer of each card awaiting a grade.
    pending: HashMap<CardKey, (String, String)>,
    pub last_result: Option<LastResult>,
    pub graded: usize,
    pub selected_failure: usize,
    pub message: Option<String>,
    pub show_help: bool,
}

impl App {
    pub async fn new(config: Config, db: Arc<Database>) -> anyhow::Result<Self> {
        let orchestrator = GradingOrchestrator::from_config(
            db.clone(),
            Arc::new(ExactMatchJudge),
            &config.scheduler,
            &config.lesson,
        )?;
        let selector = DueSelector::new(db, config.lesson.batch_size);
        let session = LessonSession::new(
            lesson_queue(&config.lesson),
            Arc::new(orchestrator),
            Arc::new(selector),
            config.learner.clone(),
        )
        .with_refill_threshold(config.lesson.refill_threshold)
        .spawn();
        let events = session.subscribe();

        let mut app = Self {
            config,
            session,
            events,
            view: View::Lesson,
            snapshot: None,
            counts: DueCounts::default(),
            input: String::new(),
            pending: HashMap::new(),
            last_result: None,
            graded: 0,
            selected_failure: 0,
            message: None,
            show_help: false,
        };

        let fetched = app.session.refill().await?;
        if fetched == 0 {
            app.message = Some("Nothing due. Import items with `lesson-trainer import <file>`.".to_string());
        }
        app.refresh().await?;
        Ok(app)
    }

    pub async fn refresh(&mut self) -> anyhow::Result<()> {
        let snapshot = self.session.snapshot().await?;
        self.counts = self.session.counts().await?;
        if snapshot.complete {
            self.view = View::Review;
            self.selected_failure = self.selected_failure.min(snapshot.failures.len().saturating_sub(1));
        } else {
            self.view = View::Lesson;
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Drain pushed session events. Returns true when anything changed.
    pub async fn poll_events(&mut self) -> anyhow::Result<bool> {
        let mut changed = false;
        loop {
            match self.events.try_recv() {
                Ok(SessionEvent::Graded { key, outcome }) => {
                    self.graded += 1;
                    if let Some((prompt, reference)) = self.pending.remove(&key) {
                        self.last_result = Some(LastResult { prompt, reference, outcome });
                    }
                    changed = true;
                }
                Ok(SessionEvent::Refilled { .. }) | Ok(SessionEvent::Completed) => changed = true,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "missed session events");
                    changed = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if changed {
            self.refresh().await?;
        }
        Ok(changed)
    }

    fn head(&self) -> Option<CardKey> {
        self.snapshot.as_ref()?.current.as_ref().map(|item| item.key)
    }

    /// Handle one key press. Returns true when the app should quit.
    pub async fn handle_key(&mut self, key: KeyEvent) -> bool {
        self.message = None;

        if self.show_help {
            self.show_help = false;
            return false;
        }

        if key.code == KeyCode::Esc {
            return true;
        }
        if key.code == KeyCode::F(1) {
            self.show_help = true;
            return false;
        }

        let result = match self.view {
            View::Lesson => self.handle_lesson_key(key).await,
            View::Review => self.handle_review_key(key).await,
        };
        match result {
            Ok(quit) => quit,
            Err(e) => {
                self.message = Some(e.to_string());
                false
            }
        }
    }

    async fn handle_lesson_key(&mut self, key: KeyEvent) -> anyhow::Result<bool> {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => return Ok(true),
            KeyCode::Char('g') if ctrl => {
                if let Some(head) = self.head() {
                    self.session.give_up(head).await?;
                    self.refresh().await?;
                }
            }
            KeyCode::Char('f') if ctrl => {
                if let Some(head) = self.head() {
                    self.session.flag(head).await?;
                    self.message = Some("Skipped; it comes back next lesson".to_string());
                    self.refresh().await?;
                }
            }
            KeyCode::Enter => self.submit().await?,
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(c) if !ctrl => self.input.push(c),
            _ => {}
        }
        Ok(false)
    }

    async fn submit(&mut self) -> anyhow::Result<()> {
        let Some(item) = self.snapshot.as_ref().and_then(|s| s.current.clone()) else {
            return Ok(());
        };
        if self.input.trim().is_empty() {
            return Ok(());
        }
        let answer = std::mem::take(&mut self.input);
        self.pending.insert(item.key, (item.prompt, item.reference_answer));
        self.session.submit(item.key, answer).await?;
        self.refresh().await
    }

    async fn handle_review_key(&mut self, key: KeyEvent) -> anyhow::Result<bool> {
        let failures = self.snapshot.as_ref().map_or(0, |s| s.failures.len());
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => {
                if failures > 0 {
                    self.selected_failure = (self.selected_failure + 1).min(failures - 1);
                }
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.selected_failure = self.selected_failure.saturating_sub(1);
            }
            KeyCode::Char('r') => {
                if self.session.refill().await? == 0 {
                    self.message = Some("No more cards due".to_string());
                }
                self.refresh().await?;
            }
            _ => {}
        }
        Ok(false)
    }
}
