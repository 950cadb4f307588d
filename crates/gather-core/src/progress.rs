//! Progress calculation for collection tasks.
//!
//! A task walks three phases of very different sizes whose totals are only
//! partially known while it runs. The calculator folds the raw counters into
//! one percentage on a fixed scale of 100 so that the figure shown to a
//! polling client does not jump backwards when a later phase reports a
//! larger total than anyone expected.
//!
//! # Rule
//!
//! Each phase owns a fixed weight (groups 10, posts 30, comments 60 by
//! default). The percentage is the sum of the weights of the completed
//! phases plus `floor(weight × processed / total)` of the current phase,
//! where the current phase is the first one not yet completed. While a phase
//! is not completed it contributes at most `weight − 1`, so 100 is only ever
//! reached once every phase is done.
//!
//! A phase counts as completed when:
//! - groups: every submitted group was processed, or a later phase has begun;
//! - posts: its total is exact (inputs exhausted), the reported total was
//!   reached, or comments have begun;
//! - comments: its total is exact or the reported total was reached.
//!
//! A phase has begun once it processed an item or its total became exact.
//! There is no cross-phase credit: 3 of 10 groups processed with nothing
//! else started is `floor(10 × 3 / 10)` = 3 %.
//!
//! When a phase has no reported total yet, it is sized by [`estimate_total`].

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::task::{TaskMetrics, TaskOptions};

/// Scale of the reported progress.
pub const PROGRESS_TOTAL: u64 = 100;

/// Comments expected per post when nothing better is known.
pub const DEFAULT_COMMENTS_PER_POST: f64 = 10.0;

/// Posts expected per group when nothing better is known.
pub const DEFAULT_AVG_POSTS_PER_GROUP: f64 = 20.0;

/// Smallest comment estimate ever used.
pub const DEFAULT_ESTIMATE_FLOOR: u64 = 100;

// =============================================================================
// Phases and weights
// =============================================================================

/// A stage of the collection hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Groups,
    Posts,
    Comments,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Groups, Phase::Posts, Phase::Comments];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Groups => "groups",
            Phase::Posts => "posts",
            Phase::Comments => "comments",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Share of the 100-point scale owned by each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseWeights {
    groups: u8,
    posts: u8,
    comments: u8,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            groups: 10,
            posts: 30,
            comments: 60,
        }
    }
}

impl PhaseWeights {
    /// Creates weights that must add up to exactly 100.
    pub fn new(groups: u8, posts: u8, comments: u8) -> Result<Self, AppError> {
        let sum = groups as u64 + posts as u64 + comments as u64;
        if sum != PROGRESS_TOTAL {
            return Err(AppError::ConfigError(format!(
                "phase weights must sum to {}, got {}",
                PROGRESS_TOTAL, sum
            )));
        }
        Ok(Self {
            groups,
            posts,
            comments,
        })
    }

    pub fn weight(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Groups => self.groups as u64,
            Phase::Posts => self.posts as u64,
            Phase::Comments => self.comments as u64,
        }
    }
}

// =============================================================================
// Estimation
// =============================================================================

/// Lower and optional upper bound applied to an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimateBounds {
    pub floor: u64,
    pub cap: Option<u64>,
}

impl Default for EstimateBounds {
    fn default() -> Self {
        Self {
            floor: DEFAULT_ESTIMATE_FLOOR,
            cap: None,
        }
    }
}

impl EstimateBounds {
    pub fn new(floor: u64) -> Self {
        Self { floor, cap: None }
    }

    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Clamps `value` into the bounds. A cap below the floor is raised to it.
    pub fn apply(&self, value: u64) -> u64 {
        let value = value.max(self.floor);
        match self.cap {
            Some(cap) => value.min(cap.max(self.floor)),
            None => value,
        }
    }
}

/// Estimates the size of a phase whose total has not been reported.
///
/// The raw estimate is `groups_count × avg_posts_per_group × comments_per_post`.
/// Non-finite or negative factors count as zero, so a garbage estimate falls
/// back to the floor instead of poisoning the percentage.
///
/// # Examples
///
/// ```
/// use gather_core::progress::{estimate_total, EstimateBounds};
///
/// assert_eq!(estimate_total(2, 20.0, 10.0, EstimateBounds::default()), 400);
/// assert_eq!(estimate_total(0, 20.0, 10.0, EstimateBounds::default()), 100);
/// assert_eq!(estimate_total(50, 20.0, 10.0, EstimateBounds::default().with_cap(5_000)), 5_000);
/// ```
pub fn estimate_total(
    groups_count: u64,
    avg_posts_per_group: f64,
    comments_per_post: f64,
    bounds: EstimateBounds,
) -> u64 {
    let sanitize = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
    let raw = groups_count as f64 * sanitize(avg_posts_per_group) * sanitize(comments_per_post);
    // `as` saturates for out-of-range floats.
    bounds.apply(raw.round() as u64)
}

// =============================================================================
// Calculator
// =============================================================================

/// Tunables of the progress calculation.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub weights: PhaseWeights,
    pub avg_posts_per_group: f64,
    pub estimate_floor: u64,
    /// Upper bound of the comments estimate.
    pub max_comments: Option<u64>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            weights: PhaseWeights::default(),
            avg_posts_per_group: DEFAULT_AVG_POSTS_PER_GROUP,
            estimate_floor: DEFAULT_ESTIMATE_FLOOR,
            max_comments: None,
        }
    }
}

impl ProgressConfig {
    pub fn with_weights(mut self, weights: PhaseWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_avg_posts_per_group(mut self, avg: f64) -> Self {
        self.avg_posts_per_group = avg;
        self
    }

    pub fn with_estimate_floor(mut self, floor: u64) -> Self {
        self.estimate_floor = floor;
        self
    }

    pub fn with_max_comments(mut self, max: Option<u64>) -> Self {
        self.max_comments = max;
        self
    }

    /// Applies the per-task options on top of this configuration.
    pub fn for_task(&self, options: &TaskOptions) -> Self {
        self.clone().with_max_comments(options.max_comments)
    }
}

/// Detail of a single phase in a [`ProgressSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub weight: u64,
    pub processed: u64,
    /// Reported total, or the estimate when `estimated` is set.
    pub total: u64,
    pub estimated: bool,
    pub completed: bool,
}

/// Result of a progress calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// First phase that is not completed; `comments` once everything is.
    pub phase: Phase,
    pub percentage: u8,
    /// Same as `percentage`, on a scale of `total`.
    pub processed: u64,
    /// Always [`PROGRESS_TOTAL`].
    pub total: u64,
    pub phases: [PhaseProgress; 3],
}

impl ProgressSnapshot {
    pub fn phase_detail(&self, phase: Phase) -> &PhaseProgress {
        match phase {
            Phase::Groups => &self.phases[0],
            Phase::Posts => &self.phases[1],
            Phase::Comments => &self.phases[2],
        }
    }

    /// Raises the percentage to a previously reported high-water mark.
    pub fn at_least(mut self, percentage: u8) -> Self {
        let percentage = percentage.min(PROGRESS_TOTAL as u8);
        if percentage > self.percentage {
            self.percentage = percentage;
            self.processed = percentage as u64;
        }
        self
    }

    /// Snapshot of a task that finished successfully.
    pub fn finished(mut self) -> Self {
        self.phase = Phase::Comments;
        self.percentage = PROGRESS_TOTAL as u8;
        self.processed = PROGRESS_TOTAL;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.phases.iter().all(|p| p.completed)
    }
}

/// Folds task metrics into a single percentage.
#[derive(Debug, Clone, Default)]
pub struct ProgressCalculator {
    config: ProgressConfig,
}

impl ProgressCalculator {
    pub fn new(config: ProgressConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProgressConfig {
        &self.config
    }

    pub fn calculate(&self, metrics: &TaskMetrics) -> ProgressSnapshot {
        let posts_begun = metrics.posts_processed > 0 || metrics.posts_total_exact;
        let comments_begun = metrics.comments_processed > 0 || metrics.comments_total_exact;

        let groups_done =
            metrics.groups_processed >= metrics.groups_total || posts_begun || comments_begun;
        let posts_done = metrics.posts_total_exact
            || (metrics.posts_total > 0 && metrics.posts_processed >= metrics.posts_total)
            || comments_begun;
        let comments_done = metrics.comments_total_exact
            || (metrics.comments_total > 0 && metrics.comments_processed >= metrics.comments_total);

        let (posts_total, posts_estimated) =
            if metrics.posts_total > 0 || metrics.posts_total_exact {
                (metrics.posts_total, false)
            } else {
                (self.estimate_posts(metrics), true)
            };
        let (comments_total, comments_estimated) =
            if metrics.comments_total > 0 || metrics.comments_total_exact {
                (metrics.comments_total, false)
            } else {
                (self.estimate_comments(metrics), true)
            };

        let weights = &self.config.weights;
        let phases = [
            PhaseProgress {
                phase: Phase::Groups,
                weight: weights.weight(Phase::Groups),
                processed: metrics.groups_processed,
                total: metrics.groups_total,
                estimated: false,
                completed: groups_done,
            },
            PhaseProgress {
                phase: Phase::Posts,
                weight: weights.weight(Phase::Posts),
                processed: metrics.posts_processed,
                total: posts_total,
                estimated: posts_estimated,
                completed: groups_done && posts_done,
            },
            PhaseProgress {
                phase: Phase::Comments,
                weight: weights.weight(Phase::Comments),
                processed: metrics.comments_processed,
                total: comments_total,
                estimated: comments_estimated,
                completed: groups_done && posts_done && comments_done,
            },
        ];

        let mut percentage = 0u64;
        let mut current = None;
        for detail in &phases {
            if detail.completed {
                percentage += detail.weight;
            } else {
                percentage += partial_credit(detail);
                current = Some(detail.phase);
                break;
            }
        }
        let percentage = percentage.min(PROGRESS_TOTAL);

        ProgressSnapshot {
            phase: current.unwrap_or(Phase::Comments),
            percentage: percentage as u8,
            processed: percentage,
            total: PROGRESS_TOTAL,
            phases,
        }
    }

    fn estimate_posts(&self, metrics: &TaskMetrics) -> u64 {
        estimate_total(
            metrics.groups_total,
            self.config.avg_posts_per_group,
            1.0,
            EstimateBounds::new(1),
        )
    }

    fn estimate_comments(&self, metrics: &TaskMetrics) -> u64 {
        let bounds = EstimateBounds {
            floor: self.config.estimate_floor,
            cap: self.config.max_comments,
        };
        if metrics.posts_total > 0 {
            estimate_total(
                metrics.posts_total,
                1.0,
                metrics.estimated_comments_per_post,
                bounds,
            )
        } else {
            estimate_total(
                metrics.groups_total,
                self.config.avg_posts_per_group,
                metrics.estimated_comments_per_post,
                bounds,
            )
        }
    }
}

/// Credit of an unfinished phase: proportional, but never its full weight.
fn partial_credit(detail: &PhaseProgress) -> u64 {
    let denominator = detail.total.max(detail.processed);
    if denominator == 0 {
        return 0;
    }
    let credit = (detail.weight as u128 * detail.processed as u128 / denominator as u128) as u64;
    credit.min(detail.weight.saturating_sub(1))
}

/// Calculates progress with the default configuration.
///
/// # Examples
///
/// ```
/// use gather_core::progress::{calculate, Phase};
/// use gather_core::task::TaskMetrics;
///
/// let metrics = TaskMetrics {
///     groups_total: 10,
///     groups_processed: 3,
///     ..TaskMetrics::default()
/// };
/// let snapshot = calculate(&metrics);
/// assert_eq!(snapshot.phase, Phase::Groups);
/// assert_eq!(snapshot.percentage, 3);
/// ```
pub fn calculate(metrics: &TaskMetrics) -> ProgressSnapshot {
    ProgressCalculator::default().calculate(metrics)
}

/// Lists every consistency violation in `metrics`.
///
/// A processed count above its total is only a violation once that total is
/// known: groups always, posts and comments once reported or exact.
pub fn validate_metrics(metrics: &TaskMetrics) -> Vec<String> {
    let mut violations = Vec::new();

    let mut check = |phase: Phase, processed: u64, total: u64, known: bool| {
        if known && processed > total {
            violations.push(format!(
                "{}: processed ({}) exceeds total ({})",
                phase, processed, total
            ));
        }
    };
    check(
        Phase::Groups,
        metrics.groups_processed,
        metrics.groups_total,
        true,
    );
    check(
        Phase::Posts,
        metrics.posts_processed,
        metrics.posts_total,
        metrics.posts_total > 0 || metrics.posts_total_exact,
    );
    check(
        Phase::Comments,
        metrics.comments_processed,
        metrics.comments_total,
        metrics.comments_total > 0 || metrics.comments_total_exact,
    );

    let estimate = metrics.estimated_comments_per_post;
    if !estimate.is_finite() || estimate < 0.0 {
        violations.push(format!(
            "estimated_comments_per_post must be a non-negative number, got {}",
            estimate
        ));
    }

    violations
}

// =============================================================================
// Tests
// =============================================================================
