//! Scroll velocity classification
//!
//! Classifies navigation into Idle, Slow or Fast from the page deltas seen
//! over a sliding time window. Velocity is measured in pages per second: the
//! sum of absolute page changes inside the window divided by the window
//! length. The first sample after Idle always yields Slow; Fast is entered on
//! a later sample once velocity reaches the threshold. Idle is only entered
//! after no sample arrived for the debounce period, which the owner checks
//! through [`ScrollClassifier::poll`].

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use folio_cache::PageNumber;

/// Scroll classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScrollClass {
    /// No sample within the debounce period
    Idle,
    /// Scrolling below the fast threshold
    Slow,
    /// Velocity at or above the fast threshold
    Fast,
}

impl fmt::Display for ScrollClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScrollClass::Idle => "idle",
            ScrollClass::Slow => "slow",
            ScrollClass::Fast => "fast",
        })
    }
}

/// Direction of travel through the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScrollDirection {
    /// Towards page 1
    Up,
    /// Towards the last page
    Down,
    /// No movement seen yet
    #[default]
    None,
}

impl ScrollDirection {
    /// Signed unit step, 0 for `None`.
    pub fn step(self) -> i64 {
        match self {
            ScrollDirection::Up => -1,
            ScrollDirection::Down => 1,
            ScrollDirection::None => 0,
        }
    }
}

/// Snapshot of the classifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollState {
    /// Pages per second over the window
    pub velocity: f32,
    /// Last non-zero direction
    pub direction: ScrollDirection,
    pub classification: ScrollClass,
}

impl Default for ScrollState {
    fn default() -> Self {
        Self {
            velocity: 0.0,
            direction: ScrollDirection::None,
            classification: ScrollClass::Idle,
        }
    }
}

/// Classifier thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
    /// Pages per second at which scrolling counts as fast
    pub fast_threshold: f32,
    /// Length of the sliding velocity window
    pub window: Duration,
    /// Quiet period before returning to idle
    pub idle_debounce: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 10.0,
            window: Duration::from_millis(1000),
            idle_debounce: Duration::from_millis(150),
        }
    }
}

/// A change of classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollTransition {
    pub from: ScrollClass,
    pub to: ScrollClass,
}

impl ScrollTransition {
    /// Whether the classification actually moved.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Sliding-window scroll classifier
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use folio_scheduler::{ClassifierConfig, ScrollClass, ScrollClassifier};
///
/// let mut classifier = ScrollClassifier::new(ClassifierConfig::default());
/// let start = Instant::now();
/// classifier.seed(1);
///
/// let transition = classifier.on_sample(2, start);
/// assert_eq!(transition.to, ScrollClass::Slow);
///
/// let quiet = start + Duration::from_millis(150);
/// assert_eq!(classifier.poll(quiet).map(|t| t.to), Some(ScrollClass::Idle));
/// ```
#[derive(Debug, Clone)]
pub struct ScrollClassifier {
    config: ClassifierConfig,
    state: ScrollState,
    last_page: Option<PageNumber>,
    last_sample_at: Option<Instant>,
    deltas: VecDeque<(Instant, u32)>,
}

impl ScrollClassifier {
    /// Create an idle classifier with no reference page.
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            state: ScrollState::default(),
            last_page: None,
            last_sample_at: None,
            deltas: VecDeque::new(),
        }
    }

    /// Set the reference page without recording a sample.
    pub fn seed(&mut self, page: PageNumber) {
        self.last_page = Some(page);
    }

    /// Record the current page observed at `at`.
    ///
    /// Any sample moves the classifier out of Idle, always into Slow. The
    /// sample's crossings still count towards velocity, so the next sample can
    /// escalate to Fast. A sample with an unchanged page still counts as
    /// activity for the debounce.
    pub fn on_sample(&mut self, page: PageNumber, at: Instant) -> ScrollTransition {
        let from = self.state.classification;

        let delta = self
            .last_page
            .map(|last| i64::from(page) - i64::from(last))
            .unwrap_or(0);
        if delta != 0 {
            self.state.direction = if delta > 0 {
                ScrollDirection::Down
            } else {
                ScrollDirection::Up
            };
            self.deltas.push_back((at, delta.unsigned_abs() as u32));
        }
        self.prune(at);

        let crossed: u64 = self.deltas.iter().map(|(_, pages)| u64::from(*pages)).sum();
        let window = self.config.window.as_secs_f32().max(f32::EPSILON);
        self.state.velocity = crossed as f32 / window;
        self.state.classification = if from == ScrollClass::Idle {
            ScrollClass::Slow
        } else if self.state.velocity >= self.config.fast_threshold {
            ScrollClass::Fast
        } else {
            ScrollClass::Slow
        };

        self.last_page = Some(page);
        self.last_sample_at = Some(at);

        let transition = ScrollTransition {
            from,
            to: self.state.classification,
        };
        if transition.changed() {
            tracing::debug!(
                target: "folio::scroll",
                from = %transition.from,
                to = %transition.to,
                velocity = self.state.velocity,
                "scroll classification changed"
            );
        }
        transition
    }

    /// Enter Idle if the debounce period has elapsed since the last sample.
    pub fn poll(&mut self, now: Instant) -> Option<ScrollTransition> {
        let deadline = self.idle_deadline()?;
        if now < deadline {
            return None;
        }

        let from = self.state.classification;
        self.state.classification = ScrollClass::Idle;
        self.state.velocity = 0.0;
        self.deltas.clear();
        tracing::debug!(target: "folio::scroll", from = %from, "scroll settled");
        Some(ScrollTransition {
            from,
            to: ScrollClass::Idle,
        })
    }

    /// When the classifier will settle into Idle, if it is not idle already.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.state.classification == ScrollClass::Idle {
            return None;
        }
        self.last_sample_at
            .map(|last| last + self.config.idle_debounce)
    }

    /// Current velocity, direction and classification.
    pub fn state(&self) -> ScrollState {
        self.state
    }

    pub fn classification(&self) -> ScrollClass {
        self.state.classification
    }

    pub fn config(&self) -> ClassifierConfig {
        self.config
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.deltas.front() {
            if now.saturating_duration_since(*at) >= self.config.window {
                self.deltas.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ScrollClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}
