use serde::Serialize;

/// Numeric stand-in for an unbounded upper bound.
pub const UNBOUNDED_SENTINEL: f64 = 1e10;

/// Upper bounds at or above this value never count as found.
pub const FINITE_LIMIT: f64 = 1e9;

/// Upper end of the scale-constant search interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum UpperBound {
    /// No successful round yet.
    Unbounded,
    /// Smallest scale constant that produced a success.
    Finite(f64),
}

impl UpperBound {
    #[must_use]
    pub fn is_finite(self) -> bool {
        matches!(self, Self::Finite(_))
    }

    /// The bound's value, with the sentinel standing in for `Unbounded`.
    #[must_use]
    pub fn value_or_sentinel(self) -> f64 {
        match self {
            Self::Unbounded => UNBOUNDED_SENTINEL,
            Self::Finite(value) => value,
        }
    }

    fn tighten(self, candidate: f64) -> Self {
        match self {
            Self::Finite(current) => Self::Finite(current.min(candidate)),
            Self::Unbounded if candidate < FINITE_LIMIT => Self::Finite(candidate),
            Self::Unbounded => Self::Unbounded,
        }
    }
}

/// Binary search over one example's scale constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchBounds {
    pub lower: f64,
    pub upper: UpperBound,
    pub scale_const: f64,
}

impl SearchBounds {
    #[must_use]
    pub fn new(initial_const: f64) -> Self {
        Self {
            lower: 0.0,
            upper: UpperBound::Unbounded,
            scale_const: initial_const,
        }
    }

    /// Shrink toward smaller constants after a success, grow after a failure.
    pub fn adjust(&mut self, success: bool) {
        if success {
            self.upper = self.upper.tighten(self.scale_const);
            if let UpperBound::Finite(upper) = self.upper {
                self.scale_const = (self.lower + upper) / 2.0;
            }
        } else {
            self.lower = self.lower.max(self.scale_const);
            self.scale_const = match self.upper {
                UpperBound::Finite(upper) => (self.lower + upper) / 2.0,
                UpperBound::Unbounded => self.scale_const * 10.0,
            };
        }
    }

    /// Rerun the search at the best known upper bound.
    pub fn repeat_at_upper(&mut self) {
        self.scale_const = self.upper.value_or_sentinel();
    }
}

/// Smallest successful distortion seen in the current round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundBest {
    pub distance: f64,
    pub label: usize,
}

/// Smallest successful distortion seen over the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct OverallBest {
    pub distance: f64,
    pub label: usize,
    pub adversarial: Vec<f64>,
}

/// Everything the driver tracks for a single example.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleState {
    pub label: usize,
    pub bounds: SearchBounds,
    pub round_best: Option<RoundBest>,
    pub overall_best: Option<OverallBest>,
}

impl ExampleState {
    #[must_use]
    pub fn new(label: usize, initial_const: f64) -> Self {
        Self {
            label,
            bounds: SearchBounds::new(initial_const),
            round_best: None,
            overall_best: None,
        }
    }

    pub fn start_round(&mut self) {
        self.round_best = None;
    }

    /// Record one step's candidate. Only successful candidates with a
    /// strictly smaller distortion replace a stored record.
    pub fn observe(&mut self, distance: f64, predicted: usize, success: bool, adversarial: &[f64]) {
        if !success {
            return;
        }
        if self.round_best.is_none_or(|best| distance < best.distance) {
            self.round_best = Some(RoundBest {
                distance,
                label: predicted,
            });
        }
        if self
            .overall_best
            .as_ref()
            .is_none_or(|best| distance < best.distance)
        {
            self.overall_best = Some(OverallBest {
                distance,
                label: predicted,
                adversarial: adversarial.to_vec(),
            });
        }
    }
}
