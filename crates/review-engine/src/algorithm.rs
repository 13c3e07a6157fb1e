//! Spaced repetition algorithms.
//!
//! Algorithms are pure: they see the prior memory state, the elapsed time and
//! the grade, and never touch the clock or the store. [`review`] is the caller
//! side that folds a result back into a [`ScheduleRecord`].

use crate::config::{AlgorithmKind, SchedulerConfig};
use crate::models::{Grade, ReviewLog, ScheduleRecord};
use chrono::{DateTime, Utc};

/// Memory strength carried between reviews.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryState {
    pub difficulty: f64,
    pub stability: f64,
}

/// What the algorithm knows about a card before an attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    /// Never reviewed.
    New,
    /// Reviewed at least once.
    Reviewed(MemoryState),
}

impl Prior {
    pub fn of(record: &ScheduleRecord) -> Self {
        if record.is_new() {
            Self::New
        } else {
            Self::Reviewed(MemoryState {
                difficulty: record.difficulty(),
                stability: record.stability(),
            })
        }
    }
}

/// Algorithm output for one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleUpdate {
    pub difficulty: f64,
    pub stability: f64,
    /// Non-negative, fractional days until the card is due again.
    pub interval_days: f64,
}

/// Trait for spaced repetition algorithms.
pub trait SrsAlgorithm: Send + Sync {
    /// Algorithm name.
    fn name(&self) -> &str;

    /// Compute the next memory state. New cards ignore `elapsed_days`.
    fn update(&self, prior: Prior, elapsed_days: f64, grade: Grade) -> ScheduleUpdate;
}

/// FSRS-5 default parameters.
pub const FSRS5_WEIGHTS: [f64; 19] = [
    0.40255, 1.18385, 3.173, 15.69105, 7.1949, 0.5345, 1.4604, 0.0046, 1.54575, 0.1192, 1.01925,
    1.9395, 0.11, 0.29605, 2.2698, 0.2315, 2.9898, 0.51655, 0.6621,
];

const DECAY: f64 = -0.5;
const FACTOR: f64 = 19.0 / 81.0;
const MIN_STABILITY: f64 = 0.01;
const MIN_DIFFICULTY: f64 = 1.0;
const MAX_DIFFICULTY: f64 = 10.0;

/// Free Spaced Repetition Scheduler (FSRS-5).
pub struct Fsrs {
    /// Model weights.
    pub weights: [f64; 19],
    /// Target probability of recall when the card comes due.
    pub desired_retention: f64,
    /// Upper bound on intervals.
    pub maximum_interval_days: f64,
}

impl Default for Fsrs {
    fn default() -> Self {
        Self {
            weights: FSRS5_WEIGHTS,
            desired_retention: 0.9,
            maximum_interval_days: 36500.0,
        }
    }
}

impl Fsrs {
    fn grade_value(grade: Grade) -> f64 {
        grade.as_u8() as f64
    }

    /// Probability of recall after `elapsed_days` at `stability`.
    pub fn retrievability(&self, elapsed_days: f64, stability: f64) -> f64 {
        (1.0 + FACTOR * elapsed_days / stability).powf(DECAY)
    }

    fn initial_stability(&self, grade: Grade) -> f64 {
        self.weights[grade.as_u8() as usize - 1].max(MIN_STABILITY)
    }

    fn initial_difficulty(&self, grade: Grade) -> f64 {
        let w = &self.weights;
        w[4] - (w[5] * (Self::grade_value(grade) - 1.0)).exp() + 1.0
    }

    fn next_difficulty(&self, difficulty: f64, grade: Grade) -> f64 {
        let w = &self.weights;
        let delta = -w[6] * (Self::grade_value(grade) - 3.0);
        let damped = difficulty + delta * (10.0 - difficulty) / 9.0;
        let reverted = w[7] * self.initial_difficulty(Grade::Easy) + (1.0 - w[7]) * damped;
        reverted.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
    }

    fn recall_stability(&self, state: MemoryState, r: f64, grade: Grade) -> f64 {
        let w = &self.weights;
        let hard_penalty = if grade == Grade::Hard { w[15] } else { 1.0 };
        let easy_bonus = if grade == Grade::Easy { w[16] } else { 1.0 };
        state.stability
            * (w[8].exp()
                * (11.0 - state.difficulty)
                * state.stability.powf(-w[9])
                * ((w[10] * (1.0 - r)).exp() - 1.0)
                * hard_penalty
                * easy_bonus
                + 1.0)
    }

    fn forget_stability(&self, state: MemoryState, r: f64) -> f64 {
        let w = &self.weights;
        let forgotten = w[11]
            * state.difficulty.powf(-w[12])
            * ((state.stability + 1.0).powf(w[13]) - 1.0)
            * (w[14] * (1.0 - r)).exp();
        forgotten.min(state.stability)
    }

    fn short_term_stability(&self, stability: f64, grade: Grade) -> f64 {
        let w = &self.weights;
        stability * (w[17] * (Self::grade_value(grade) - 3.0 + w[18])).exp()
    }

    fn interval(&self, stability: f64) -> f64 {
        let days = stability / FACTOR * (self.desired_retention.powf(1.0 / DECAY) - 1.0);
        days.clamp(0.0, self.maximum_interval_days)
    }
}

impl SrsAlgorithm for Fsrs {
    fn name(&self) -> &str {
        "FSRS"
    }

    fn update(&self, prior: Prior, elapsed_days: f64, grade: Grade) -> ScheduleUpdate {
        let (difficulty, stability) = match prior {
            Prior::New => (
                self.initial_difficulty(grade).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY),
                self.initial_stability(grade),
            ),
            Prior::Reviewed(state) => {
                let state = MemoryState {
                    difficulty: state.difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY),
                    stability: state.stability.max(MIN_STABILITY),
                };
                let elapsed = elapsed_days.max(0.0);
                let stability = if elapsed < 1.0 {
                    // Same-day review
                    self.short_term_stability(state.stability, grade)
                } else {
                    let r = self.retrievability(elapsed, state.stability);
                    if grade == Grade::Again {
                        self.forget_stability(state, r)
                    } else {
                        self.recall_stability(state, r, grade)
                    }
                };
                (self.next_difficulty(state.difficulty, grade), stability.max(MIN_STABILITY))
            }
        };

        ScheduleUpdate {
            difficulty,
            stability,
            interval_days: self.interval(stability),
        }
    }
}

/// SM-2 algorithm (SuperMemo/Anki classic).
///
/// Difficulty carries the ease factor and stability the current interval.
pub struct Sm2 {
    /// Initial ease factor.
    pub initial_ease: f64,
    /// Easy bonus multiplier.
    pub easy_bonus: f64,
    /// Hard interval multiplier.
    pub hard_multiplier: f64,
    /// Minimum ease factor.
    pub min_ease: f64,
    /// Upper bound on intervals.
    pub maximum_interval_days: f64,
}

impl Default for Sm2 {
    fn default() -> Self {
        Self {
            initial_ease: 2.5,
            easy_bonus: 1.3,
            hard_multiplier: 1.2,
            min_ease: 1.3,
            maximum_interval_days: 36500.0,
        }
    }
}

impl SrsAlgorithm for Sm2 {
    fn name(&self) -> &str {
        "SM-2"
    }

    fn update(&self, prior: Prior, _elapsed_days: f64, grade: Grade) -> ScheduleUpdate {
        let (mut ease, mut interval, is_new) = match prior {
            Prior::New => (self.initial_ease, 0.0, true),
            Prior::Reviewed(state) => (state.difficulty.max(self.min_ease), state.stability.max(0.0), false),
        };

        match grade {
            Grade::Again => {
                ease = (ease - 0.2).max(self.min_ease);
                interval = 1.0;
            }
            Grade::Hard => {
                ease = (ease - 0.15).max(self.min_ease);
                interval = (interval * self.hard_multiplier).max(1.0);
            }
            Grade::Good => {
                interval = if is_new { 1.0 } else { (interval * ease).max(1.0) };
            }
            Grade::Easy => {
                ease += 0.15;
                interval = (interval * ease * self.easy_bonus).max(4.0);
            }
        }

        let interval = interval.min(self.maximum_interval_days);
        ScheduleUpdate {
            difficulty: ease,
            stability: interval,
            interval_days: interval,
        }
    }
}

/// Build the configured algorithm.
pub fn algorithm_from_config(config: &SchedulerConfig) -> Box<dyn SrsAlgorithm> {
    match config.algorithm {
        AlgorithmKind::Sm2 => Box::new(Sm2 {
            maximum_interval_days: config.maximum_interval_days,
            ..Sm2::default()
        }),
        AlgorithmKind::Fsrs => Box::new(Fsrs {
            weights: FSRS5_WEIGHTS,
            desired_retention: config.desired_retention,
            maximum_interval_days: config.maximum_interval_days,
        }),
    }
}

/// Result of reviewing one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub record: ScheduleRecord,
    pub log: ReviewLog,
}

/// Run one graded attempt through `algorithm` and fold it into a copy of `record`.
pub fn review(
    algorithm: &dyn SrsAlgorithm,
    record: &ScheduleRecord,
    grade: Grade,
    now: DateTime<Utc>,
    day_length_ms: i64,
) -> ReviewOutcome {
    let elapsed_days = record.elapsed_days(now);
    let update = algorithm.update(Prior::of(record), elapsed_days, grade);

    let mut next = record.clone();
    next.apply_review(&update, grade, now, day_length_ms);

    ReviewOutcome {
        log: ReviewLog {
            key: record.key(),
            grade,
            elapsed_days,
            interval_days: update.interval_days,
            reviewed_at: now,
        },
        record: next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CardKey, DrillType, DAY_MS};
    use chrono::Duration;
    use proptest::prelude::*;

    fn record() -> ScheduleRecord {
        ScheduleRecord::new(CardKey::new(uuid::Uuid::new_v4(), DrillType::Dictation), Utc::now())
    }

    fn reviewed(difficulty: f64, stability: f64) -> Prior {
        Prior::Reviewed(MemoryState { difficulty, stability })
    }

    #[test]
    fn test_fsrs_first_review_uses_grade_weights() {
        let algo = Fsrs::default();
        let update = algo.update(Prior::New, 0.0, Grade::Good);
        assert_eq!(update.stability, FSRS5_WEIGHTS[2]);
        // At 90% retention the interval equals stability
        assert!((update.interval_days - update.stability).abs() < 1e-9);
        assert!(update.difficulty >= 1.0 && update.difficulty <= 10.0);
    }

    #[test]
    fn test_fsrs_first_review_ignores_elapsed() {
        let algo = Fsrs::default();
        assert_eq!(
            algo.update(Prior::New, 9999.0, Grade::Good),
            algo.update(Prior::New, 0.0, Grade::Good)
        );
    }

    #[test]
    fn test_fsrs_again_shrinks_and_good_grows() {
        let algo = Fsrs::default();
        let prior = reviewed(5.0, 10.0);
        let again = algo.update(prior, 10.0, Grade::Again);
        let good = algo.update(prior, 10.0, Grade::Good);
        assert!(again.stability < 10.0);
        assert!(good.stability > 10.0);
        assert!(again.difficulty > good.difficulty);
    }

    #[test]
    fn test_fsrs_retrievability_at_stability() {
        let algo = Fsrs::default();
        assert!((algo.retrievability(7.0, 7.0) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_fsrs_interval_is_capped() {
        let algo = Fsrs { maximum_interval_days: 30.0, ..Fsrs::default() };
        let update = algo.update(reviewed(1.0, 500.0), 400.0, Grade::Easy);
        assert_eq!(update.interval_days, 30.0);
    }

    #[test]
    fn test_sm2_good_response() {
        let algo = Sm2::default();
        let result = algo.update(reviewed(2.5, 1.0), 1.0, Grade::Good);
        assert!(result.interval_days >= 2.0);
    }

    #[test]
    fn test_sm2_again_response() {
        let algo = Sm2::default();
        let result = algo.update(reviewed(2.5, 10.0), 10.0, Grade::Again);
        assert_eq!(result.interval_days, 1.0);
        assert!((result.difficulty - 2.3).abs() < 1e-9);
    }

    #[test]
    fn test_review_side_effects() {
        let algo = Fsrs::default();
        let now = Utc::now();
        let fresh = record();

        let first = review(&algo, &fresh, Grade::Good, now, DAY_MS);
        assert_eq!(first.record.repetitions(), 1);
        assert_eq!(first.record.lapses(), 0);
        assert_eq!(first.record.first_review_at(), Some(now));
        assert!(first.record.next_review_at() > now);
        assert_eq!(first.log.elapsed_days, 0.0);

        let later = now + Duration::days(5);
        let second = review(&algo, &first.record, Grade::Again, later, DAY_MS);
        assert_eq!(second.record.repetitions(), 2);
        assert_eq!(second.record.lapses(), 1);
        assert_eq!(second.record.first_review_at(), Some(now));
        assert_eq!(second.record.last_review_at(), Some(later));
        assert!((second.log.elapsed_days - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_algorithm_from_config() {
        let mut config = SchedulerConfig::default();
        assert_eq!(algorithm_from_config(&config).name(), "FSRS");
        config.algorithm = AlgorithmKind::Sm2;
        assert_eq!(algorithm_from_config(&config).name(), "SM-2");
    }

    #[test]
    fn test_long_success_streaks_stay_capped() {
        let mut config = SchedulerConfig::default();
        for kind in [AlgorithmKind::Fsrs, AlgorithmKind::Sm2] {
            config.algorithm = kind;
            let algo = algorithm_from_config(&config);
            for grade in [Grade::Good, Grade::Easy] {
                let mut now = Utc::now();
                let mut current = record();
                for _ in 0..200 {
                    let outcome = review(algo.as_ref(), &current, grade, now, DAY_MS);
                    assert!(outcome.log.interval_days <= config.maximum_interval_days);
                    assert!(outcome.record.next_review_at() <= now + Duration::days(36500));
                    current = outcome.record;
                    now = current.next_review_at();
                }
            }
        }
    }

    #[test]
    fn test_oversized_interval_does_not_overflow() {
        let algo = Sm2 { maximum_interval_days: f64::MAX, ..Sm2::default() };
        let now = Utc::now();
        let outcome = review(&algo, &record(), Grade::Easy, now, DAY_MS);
        let mut current = outcome.record;
        for _ in 0..50 {
            current = review(&algo, &current, Grade::Easy, now, DAY_MS).record;
        }
        assert!(current.next_review_at() > now);
        assert!(current.next_review_at() <= now + Duration::days(crate::models::MAX_INTERVAL_DAYS as i64));
    }

    fn grade() -> impl Strategy<Value = Grade> {
        prop::sample::select(Grade::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn test_again_never_beats_easy(
            difficulty in 1.0f64..10.0,
            stability in 0.01f64..3650.0,
            elapsed in 0.0f64..3650.0,
        ) {
            for algo in [&Fsrs::default() as &dyn SrsAlgorithm, &Sm2::default()] {
                let prior = reviewed(difficulty, stability);
                let again = algo.update(prior, elapsed, Grade::Again);
                let easy = algo.update(prior, elapsed, Grade::Easy);
                prop_assert!(again.stability <= easy.stability);
            }
            let again = Fsrs::default().update(Prior::New, elapsed, Grade::Again);
            let easy = Fsrs::default().update(Prior::New, elapsed, Grade::Easy);
            prop_assert!(again.stability <= easy.stability);
        }

        #[test]
        fn test_intervals_are_non_negative(
            difficulty in 1.0f64..10.0,
            stability in 0.01f64..3650.0,
            elapsed in 0.0f64..3650.0,
            grade in grade(),
        ) {
            let update = Fsrs::default().update(reviewed(difficulty, stability), elapsed, grade);
            prop_assert!(update.interval_days >= 0.0);
            prop_assert!(update.interval_days.is_finite());
            prop_assert!((1.0..=10.0).contains(&update.difficulty));
        }

        #[test]
        fn test_new_branch_ignores_elapsed(elapsed in 0.0f64..100_000.0, grade in grade()) {
            let algo = Fsrs::default();
            prop_assert_eq!(algo.update(Prior::New, elapsed, grade), algo.update(Prior::New, 0.0, grade));
        }

        #[test]
        fn test_repetitions_and_lapses(grades in prop::collection::vec(grade(), 1..20)) {
            let algo = Fsrs::default();
            let mut now = Utc::now();
            let mut current = record();
            for grade in grades {
                let before = current.clone();
                current = review(&algo, &current, grade, now, DAY_MS).record;
                prop_assert_eq!(current.repetitions(), before.repetitions() + 1);
                let expected_lapses = before.lapses() + u32::from(grade == Grade::Again);
                prop_assert_eq!(current.lapses(), expected_lapses);
                prop_assert!(current.next_review_at() >= now);
                now += Duration::hours(30);
            }
        }
    }
}
