//! Training configuration.
//!
//! [`TrainOptions`] can be built in code with the `with_*` methods, filled
//! from `key=value` pairs with [`TrainOptions::set`], or loaded from a JSON
//! object with [`TrainOptions::from_json`]. Missing JSON keys take their
//! defaults.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::maxent::MaxentError;

/// Options recognized by [`TrainOptions::set`].
pub const OPTION_NAMES: [&str; 10] = [
    "cutoff",
    "sigma",
    "widthfactor",
    "heldout_count",
    "early_stopping_window",
    "memory",
    "weight_bound",
    "gradient_tolerance",
    "max_iterations",
    "max_evaluations",
];

/// Configuration for [`MeModel::train`](crate::MeModel::train).
///
/// Defaults:
/// - no cutoff, no regularization, no held-out data
/// - history of 8 curvature pairs, weights bounded by `±10000`
/// - projected-gradient tolerance `1e-4`, at most 1000 iterations and
///   10000 objective evaluations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainOptions {
    /// Minimum corpus count of a `(label, feature)` pair; 0 keeps every pair.
    pub cutoff: usize,
    /// Gaussian prior scale; 0 disables the prior.
    pub sigma: f64,
    /// Inequality width numerator, divided by the number of training
    /// samples; 0 disables inequality training. Takes precedence over `sigma`.
    pub widthfactor: f64,
    /// Number of trailing samples held out for early stopping.
    pub heldout_count: usize,
    /// Trailing-window size of the held-out trend test; 0 disables early stopping.
    pub early_stopping_window: usize,
    pub memory: usize,
    /// Weights live in `[-weight_bound, weight_bound]`, or in
    /// `[0, weight_bound]` per half under inequality training.
    pub weight_bound: f64,
    pub gradient_tolerance: f64,
    pub max_iterations: usize,
    pub max_evaluations: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            cutoff: 0,
            sigma: 0.0,
            widthfactor: 0.0,
            heldout_count: 0,
            early_stopping_window: 0,
            memory: 8,
            weight_bound: 10_000.0,
            gradient_tolerance: 1e-4,
            max_iterations: 1000,
            max_evaluations: 10_000,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, MaxentError> {
    value.trim().parse().map_err(|_| MaxentError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
        reason: "not a valid number",
    })
}

impl TrainOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cutoff(mut self, cutoff: usize) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn with_widthfactor(mut self, widthfactor: f64) -> Self {
        self.widthfactor = widthfactor;
        self
    }

    /// Holds out the last `heldout_count` samples and stops early once their
    /// log-likelihood trends down over `window` evaluations.
    pub fn with_heldout(mut self, heldout_count: usize, window: usize) -> Self {
        self.heldout_count = heldout_count;
        self.early_stopping_window = window;
        self
    }

    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_weight_bound(mut self, weight_bound: f64) -> Self {
        self.weight_bound = weight_bound;
        self
    }

    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    /// Sets one option from its textual form, e.g. `set("sigma", "1.5")`.
    ///
    /// # Errors
    /// - [`MaxentError::UnknownOption`] if `key` is not one of [`OPTION_NAMES`].
    /// - [`MaxentError::InvalidOption`] if `value` does not parse or is out of range.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), MaxentError> {
        let mut next = self.clone();
        match key {
            "cutoff" => next.cutoff = parse(key, value)?,
            "sigma" => next.sigma = parse(key, value)?,
            "widthfactor" => next.widthfactor = parse(key, value)?,
            "heldout_count" => next.heldout_count = parse(key, value)?,
            "early_stopping_window" => next.early_stopping_window = parse(key, value)?,
            "memory" => next.memory = parse(key, value)?,
            "weight_bound" => next.weight_bound = parse(key, value)?,
            "gradient_tolerance" => next.gradient_tolerance = parse(key, value)?,
            "max_iterations" => next.max_iterations = parse(key, value)?,
            "max_evaluations" => next.max_evaluations = parse(key, value)?,
            _ => {
                return Err(MaxentError::UnknownOption {
                    key: key.to_string(),
                });
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Parses a JSON object of options and validates it.
    pub fn from_json(json: &str) -> Result<Self, MaxentError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks value ranges.
    ///
    /// # Rules
    /// - `sigma` and `widthfactor` must be finite and non-negative.
    /// - `weight_bound` must be finite and strictly positive.
    /// - `gradient_tolerance` must be finite and non-negative.
    /// - `memory` must be at least 1.
    pub fn validate(&self) -> Result<(), MaxentError> {
        let invalid = |key: &str, value: String, reason: &'static str| MaxentError::InvalidOption {
            key: key.to_string(),
            value,
            reason,
        };
        if !(self.sigma.is_finite() && self.sigma >= 0.0) {
            return Err(invalid("sigma", self.sigma.to_string(), "must be finite and >= 0"));
        }
        if !(self.widthfactor.is_finite() && self.widthfactor >= 0.0) {
            return Err(invalid(
                "widthfactor",
                self.widthfactor.to_string(),
                "must be finite and >= 0",
            ));
        }
        if !(self.weight_bound.is_finite() && self.weight_bound > 0.0) {
            return Err(invalid(
                "weight_bound",
                self.weight_bound.to_string(),
                "must be finite and > 0",
            ));
        }
        if !(self.gradient_tolerance.is_finite() && self.gradient_tolerance >= 0.0) {
            return Err(invalid(
                "gradient_tolerance",
                self.gradient_tolerance.to_string(),
                "must be finite and >= 0",
            ));
        }
        if self.memory == 0 {
            return Err(invalid("memory", "0".to_string(), "must be at least 1"));
        }
        Ok(())
    }
}
