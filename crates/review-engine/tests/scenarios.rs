//! End-to-end lesson scenarios against an in-memory store.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use review_engine::{
    CardKey, Database, DrillType, DueQuery, DueSource, Fsrs, GradeOutcome, GradingOrchestrator,
    Item, Judge, JudgeError, JudgeRequest, LessonQueue, ScheduleStore, SessionItem,
    SessionQueueState, Transition, Verdict,
};
use review_engine::models::DAY_MS;
use std::sync::Arc;

struct FixedJudge(Result<Verdict, JudgeError>);

#[async_trait]
impl Judge for FixedJudge {
    async fn judge(&self, _request: &JudgeRequest) -> Result<Verdict, JudgeError> {
        self.0.clone()
    }
}

fn seed(db: &Database, prompt: &str, due_days_ago: i64) -> CardKey {
    let item = Item::new("ana", prompt, prompt, "es");
    db.insert_item(&item, &[DrillType::Dictation], Utc::now() - Duration::days(due_days_ago))
        .unwrap();
    CardKey::new(item.id, DrillType::Dictation)
}

fn orchestrator(db: &Arc<Database>, verdict: Result<Verdict, JudgeError>) -> GradingOrchestrator {
    GradingOrchestrator::new(db.clone(), Box::new(Fsrs::default()), Arc::new(FixedJudge(verdict)), DAY_MS)
}

fn session_item(key: CardKey, prompt: &str) -> SessionItem {
    SessionItem {
        key,
        prompt: prompt.to_string(),
        reference_answer: prompt.to_string(),
        language: "es".to_string(),
        repetitions: 0,
        lapses: 0,
    }
}

#[tokio::test]
async fn new_item_graded_good() {
    let db = Arc::new(Database::in_memory().unwrap());
    let key = seed(&db, "perro", 0);
    let before = db.load_record(key).unwrap().unwrap();
    assert!(before.is_new());

    let now = Utc::now();
    let outcome = orchestrator(&db, Ok(Verdict::pass()))
        .grade(&session_item(key, "perro"), "perro")
        .await
        .unwrap();
    assert_eq!(outcome, GradeOutcome::Success);

    let after = db.load_record(key).unwrap().unwrap();
    assert_eq!(after.repetitions(), 1);
    assert_eq!(after.lapses(), 0);
    assert!(after.first_review_at().is_some());
    assert!(after.next_review_at() > now);
}

#[test]
fn due_selection_respects_exclusions() {
    let db = Database::in_memory().unwrap();
    let a = seed(&db, "a", 3);
    let b = seed(&db, "b", 2);
    let c = seed(&db, "c", 1);

    let due = db
        .select_due(&DueQuery::new("ana", 10, Utc::now()).excluding([b]))
        .unwrap();
    let keys: Vec<CardKey> = due.iter().map(|item| item.key).collect();
    assert_eq!(keys, vec![a, c]);
}

#[tokio::test]
async fn judging_error_does_not_touch_schedule() {
    let db = Arc::new(Database::in_memory().unwrap());
    let key = seed(&db, "casa", 1);
    let stored = db.load_record(key).unwrap().unwrap();

    let mut lesson = SessionQueueState::new();
    let batch = db.select_due(&DueQuery::new("ana", 10, Utc::now())).unwrap();
    lesson.apply(Transition::AddMore(batch)).unwrap();
    lesson.apply(Transition::WillGrade(key)).unwrap();

    let item = lesson.item(&key).cloned().unwrap();
    let outcome = orchestrator(&db, Err(JudgeError::Timeout))
        .grade(&item, "casa")
        .await
        .unwrap();
    assert!(matches!(outcome, GradeOutcome::Error { .. }));
    lesson.apply(Transition::DidGrade { key, outcome }).unwrap();

    assert_eq!(db.load_record(key).unwrap().unwrap(), stored);
    assert!(db.review_history(key).unwrap().is_empty());
    assert!(lesson.errored().contains(&key));
    assert!(!lesson.queue().contains(&key));
    lesson.check_invariants().unwrap();
}

#[test]
fn head_survives_add_more() {
    let ids: Vec<CardKey> = (0..3)
        .map(|_| CardKey::new(uuid::Uuid::new_v4(), DrillType::Dictation))
        .collect();
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    let mut lesson = SessionQueueState::new();
    lesson
        .apply(Transition::AddMore(vec![session_item(a, "a"), session_item(b, "b")]))
        .unwrap();
    lesson
        .apply(Transition::AddMore(vec![session_item(a, "a"), session_item(c, "c")]))
        .unwrap();

    assert_eq!(lesson.queue(), &[a, b, c]);
    assert_eq!(lesson.current().map(|item| item.key), Some(a));
}

#[tokio::test]
async fn failed_answer_is_kept_for_review() {
    let db = Arc::new(Database::in_memory().unwrap());
    let key = seed(&db, "libro", 1);

    let mut lesson = SessionQueueState::new();
    lesson
        .apply(Transition::AddMore(db.select_due(&DueQuery::new("ana", 10, Utc::now())).unwrap()))
        .unwrap();
    lesson.apply(Transition::WillGrade(key)).unwrap();

    let item = lesson.item(&key).cloned().unwrap();
    let outcome = orchestrator(&db, Ok(Verdict::fail("missing accent")))
        .grade(&item, "lbro")
        .await
        .unwrap();
    lesson.apply(Transition::DidGrade { key, outcome }).unwrap();

    assert_eq!(lesson.failures().len(), 1);
    assert_eq!(lesson.failures()[0].reason, "missing accent");
    assert_eq!(lesson.failures()[0].user_answer, "lbro");
    assert!(lesson.item(&key).is_some());
    assert!(lesson.is_complete());
    assert_eq!(db.load_record(key).unwrap().unwrap().lapses(), 1);
}
