//! A limited-memory variable-metric solver for bound-constrained minimization
//! (BLMVM), and a maximum-entropy classifier trained with it.
//!
//! The solver follows Benson & Moré, "A Limited-Memory Variable-Metric
//! Algorithm for Bound-Constrained Minimization" (ANL/MCS-P909-0901, 2001):
//! gradient projection onto a box, an L-BFGS two-loop recursion for the
//! search direction, and a backtracking line search that clamps every trial
//! point into the box.
//!
//! # Features
//! - Box constraints supplied by the objective itself through the [`Objective`]
//!   capability trait, so alternative objectives plug in without touching the
//!   solver.
//! - Curvature-pair filtering that keeps the implied inverse Hessian positive
//!   definite; rejected pairs are counted, not reported as failures.
//! - Projected-gradient fallback whenever the quasi-Newton direction is not a
//!   descent direction.
//! - Optional early stopping driven by a held-out log-likelihood trend.
//! - A sparse maximum-entropy (multinomial logistic regression) trainer in
//!   [`maxent`], with Gaussian or inequality (box) regularization, feature
//!   cutoffs and a plain-text model format.
//!
//! ## Defaults (key settings)
//! - History size `8`, projected-gradient tolerance `1e-4`.
//! - Stop after more than `1000` iterations or `10000` function evaluations.
//! - Line search: start at the full step, shrink by `0.75`, give up after
//!   `100` trials and keep the last one.
//!
//! # Example
//!
//! Minimize a shifted quadratic over the box `[0, 2]²`.
//!
//! ```
//! use blmvm_maxent::{Blmvm, FnObjective, Termination};
//! use ndarray::{array, Array1};
//!
//! let objective = FnObjective::new(|x: &Array1<f64>| {
//!     let f = (x[0] - 3.0).powi(2) + (x[1] + 1.0).powi(2);
//!     let g = array![2.0 * (x[0] - 3.0), 2.0 * (x[1] + 1.0)];
//!     (f, g)
//! })
//! .with_bounds(0.0, 2.0);
//!
//! let solution = Blmvm::new(array![1.0, 1.0], objective)
//!     .run()
//!     .expect("BLMVM failed to solve");
//!
//! assert_eq!(solution.termination, Termination::Converged);
//! assert!((solution.final_point[0] - 2.0).abs() < 1e-9);
//! assert!(solution.final_point[1].abs() < 1e-9);
//! ```

pub mod features;
pub mod lmvm;
pub mod maxent;
pub mod model_file;
pub mod options;
pub mod vector;

use std::convert::Infallible;
use std::error::Error as StdError;

use ndarray::Array1;

use crate::lmvm::LmvmMatrix;
pub use crate::maxent::{Classification, MaxentError, MeModel, MeSample, TrainingReport};
pub use crate::options::TrainOptions;
pub use crate::vector::VectorError;

/// Supplier of function values, gradients and box bounds for [`Blmvm`].
///
/// The solver treats every method as a black box. Errors returned here abort
/// the solve and surface as [`BlmvmError::Objective`].
pub trait Objective {
    type Error: StdError + Send + Sync + 'static;

    /// Returns `(f(x), ∇f(x))`. The gradient must have the length of `x`.
    fn evaluate(&mut self, x: &Array1<f64>) -> Result<(f64, Array1<f64>), Self::Error>;

    /// Returns per-coordinate `(lower, upper)` bounds for an `n`-dimensional problem.
    fn bounds(&self, n: usize) -> Result<(Array1<f64>, Array1<f64>), Self::Error>;

    /// Log-likelihood of held-out data at `x`, if the objective has any.
    /// Only consulted when early stopping is enabled on the solver.
    fn heldout_log_likelihood(&mut self, _: &Array1<f64>) -> Result<Option<f64>, Self::Error> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
enum FnBounds {
    Uniform(f64, f64),
    PerCoordinate(Array1<f64>, Array1<f64>),
}

/// Adapts a closure returning `(value, gradient)` to [`Objective`].
///
/// Unbounded unless [`with_bounds`](FnObjective::with_bounds) or
/// [`with_box`](FnObjective::with_box) is used.
pub struct FnObjective<F> {
    obj_fn: F,
    bounds: FnBounds,
}

impl<F> FnObjective<F>
where
    F: FnMut(&Array1<f64>) -> (f64, Array1<f64>),
{
    pub fn new(obj_fn: F) -> Self {
        Self {
            obj_fn,
            bounds: FnBounds::Uniform(f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    /// Applies the same `[lower, upper]` interval to every coordinate.
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.bounds = FnBounds::Uniform(lower, upper);
        self
    }

    /// Per-coordinate bounds. Lengths are checked when the solve starts.
    pub fn with_box(mut self, lower: Array1<f64>, upper: Array1<f64>) -> Self {
        self.bounds = FnBounds::PerCoordinate(lower, upper);
        self
    }
}

impl<F> Objective for FnObjective<F>
where
    F: FnMut(&Array1<f64>) -> (f64, Array1<f64>),
{
    type Error = Infallible;

    fn evaluate(&mut self, x: &Array1<f64>) -> Result<(f64, Array1<f64>), Infallible> {
        Ok((self.obj_fn)(x))
    }

    fn bounds(&self, n: usize) -> Result<(Array1<f64>, Array1<f64>), Infallible> {
        Ok(match &self.bounds {
            FnBounds::Uniform(lo, hi) => (Array1::from_elem(n, *lo), Array1::from_elem(n, *hi)),
            FnBounds::PerCoordinate(lo, hi) => (lo.clone(), hi.clone()),
        })
    }
}

/// An error type for clear diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum BlmvmError {
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error("bounds provider returned {found} coordinates for a problem of dimension {expected}")]
    BoundsDimension { expected: usize, found: usize },
    #[error("lower bound {lower} exceeds upper bound {upper} at index {index}")]
    BoundsCrossed { index: usize, lower: f64, upper: f64 },
    #[error("the variable-metric history must hold at least one pair")]
    InvalidMemory,
    #[error("the objective value {value} is not finite after {iterations} iterations")]
    NonFiniteValue { value: f64, iterations: usize },
    #[error("objective evaluation failed: {0}")]
    Objective(#[source] Box<dyn StdError + Send + Sync>),
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The projected-gradient norm dropped below the tolerance.
    Converged,
    /// The iteration count exceeded its cap.
    MaxIterations,
    /// The function-evaluation count exceeded its cap.
    MaxEvaluations,
    /// The held-out log-likelihood trend turned down; the point before the
    /// last accepted step was restored.
    EarlyStopped,
}

impl Termination {
    /// True for the two budget caps.
    pub fn is_stalled(self) -> bool {
        matches!(self, Termination::MaxIterations | Termination::MaxEvaluations)
    }
}

/// Final point and diagnostics of one solve.
#[derive(Debug, Clone)]
pub struct BlmvmSolution {
    /// The point at which the solve stopped.
    pub final_point: Array1<f64>,
    /// Objective value at `final_point`.
    pub final_value: f64,
    /// Norm of the projected gradient at `final_point`.
    pub final_gradient_norm: f64,
    /// Outer iterations performed.
    pub iterations: usize,
    /// Objective evaluations, including line-search trials.
    pub func_evals: usize,
    /// Iterations that fell back to the projected gradient as search direction.
    pub projected_gradient_iterations: usize,
    /// Curvature pairs discarded by the variable-metric update.
    pub rejected_pairs: usize,
    /// Line searches that ran out of trials and kept the last one.
    pub exhausted_line_searches: usize,
    pub termination: Termination,
}

#[derive(Clone)]
struct BoxSpec {
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl BoxSpec {
    fn from_objective<O: Objective>(objective: &O, n: usize) -> Result<Self, BlmvmError> {
        let (lower, upper) = objective.bounds(n).map_err(objective_error)?;
        for found in [lower.len(), upper.len()] {
            if found != n {
                return Err(BlmvmError::BoundsDimension { expected: n, found });
            }
        }
        for i in 0..n {
            // written so that NaN bounds are rejected too
            if !(lower[i] <= upper[i]) {
                return Err(BlmvmError::BoundsCrossed {
                    index: i,
                    lower: lower[i],
                    upper: upper[i],
                });
            }
        }
        Ok(Self { lower, upper })
    }

    fn project(&self, x: &mut Array1<f64>) -> Result<(), VectorError> {
        vector::clamp(x, &self.lower, &self.upper)
    }

    fn project_gradient(&self, x: &Array1<f64>, g: &mut Array1<f64>) -> Result<(), VectorError> {
        vector::project_gradient(&self.lower, x, &self.upper, g)
    }
}

// Trailing-window trend of held-out log-likelihoods.
struct HeldoutTrend {
    window: usize,
    values: Vec<f64>,
}

impl HeldoutTrend {
    fn new(window: usize) -> Self {
        Self {
            window,
            values: Vec::new(),
        }
    }

    // Records `value`; true when the mean of the last `window` values is
    // strictly below the mean of the `window` values before them.
    fn push(&mut self, value: f64) -> bool {
        self.values.push(value);
        let n = self.window;
        let len = self.values.len();
        if n == 0 || len < 2 * n {
            return false;
        }
        let recent: f64 = self.values[len - n..].iter().sum::<f64>() / n as f64;
        let earlier: f64 = self.values[len - 2 * n..len - n].iter().sum::<f64>() / n as f64;
        recent < earlier
    }
}

// The iterate before the most recent accepted step.
struct PreviousIterate {
    x: Array1<f64>,
    value: f64,
    gradient_norm: f64,
}

struct LineSearchOutcome {
    value: f64,
    gradient: Array1<f64>,
    step: f64,
    evaluations: usize,
    exhausted: bool,
}

/// Core configuration for the BLMVM solver.
struct BlmvmCore {
    x0: Array1<f64>,
    memory: usize,
    gradient_tolerance: f64,
    max_iterations: usize,
    max_evaluations: usize,
    early_stopping_window: usize,
    max_line_search_trials: usize,
    step_shrink: f64,
}

/// A configurable BLMVM solver.
pub struct Blmvm<O> {
    core: BlmvmCore,
    objective: O,
}

fn objective_error<E: StdError + Send + Sync + 'static>(e: E) -> BlmvmError {
    BlmvmError::Objective(Box::new(e))
}

fn evaluate<O: Objective>(objective: &mut O, x: &Array1<f64>) -> Result<(f64, Array1<f64>), BlmvmError> {
    let (f, g) = objective.evaluate(x).map_err(objective_error)?;
    if g.len() != x.len() {
        return Err(VectorError::LengthMismatch {
            expected: x.len(),
            found: g.len(),
        }
        .into());
    }
    Ok((f, g))
}

impl BlmvmCore {
    fn new(x0: Array1<f64>) -> Self {
        Self {
            x0,
            memory: 8,
            gradient_tolerance: 1e-4,
            max_iterations: 1000,
            max_evaluations: 10_000,
            early_stopping_window: 0,
            max_line_search_trials: 100,
            step_shrink: 0.75,
        }
    }

    fn run<O: Objective>(&self, objective: &mut O) -> Result<BlmvmSolution, BlmvmError> {
        if self.memory == 0 {
            return Err(BlmvmError::InvalidMemory);
        }
        let n = self.x0.len();
        let bounds = BoxSpec::from_objective(objective, n)?;

        let mut x = self.x0.clone();
        bounds.project(&mut x)?;
        let (mut f, mut g) = evaluate(objective, &x)?;
        if !f.is_finite() {
            return Err(BlmvmError::NonFiniteValue {
                value: f,
                iterations: 0,
            });
        }

        let mut matrix = LmvmMatrix::new(self.memory);
        let mut trend = HeldoutTrend::new(self.early_stopping_window);
        let mut gp = Array1::<f64>::zeros(n);
        let mut dx = Array1::<f64>::zeros(n);
        let mut previous: Option<PreviousIterate> = None;
        let mut func_evals = 1usize;
        let mut iterations = 0usize;
        let mut pg_iterations = 0usize;
        let mut exhausted_searches = 0usize;
        let mut last_step = 0.0f64;

        let (termination, gnorm) = loop {
            vector::copy(&g, &mut gp)?;
            bounds.project_gradient(&x, &mut gp)?;
            let gnorm = vector::dot(&gp, &gp)?.sqrt();
            log::info!(
                "[BLMVM] iter={:3} f={:.7e} ||pg||={:.3e} step={:.3e}",
                iterations,
                f,
                gnorm,
                -last_step
            );

            if self.early_stopping_window > 0 {
                let heldout = objective.heldout_log_likelihood(&x).map_err(objective_error)?;
                if let Some(logl) = heldout {
                    if trend.push(logl) {
                        log::info!(
                            "[BLMVM] Early stopping: held-out log-likelihood {:.7} is trending down",
                            logl
                        );
                        match previous.take() {
                            Some(prev) => {
                                x = prev.x;
                                f = prev.value;
                                break (Termination::EarlyStopped, prev.gradient_norm);
                            }
                            None => break (Termination::EarlyStopped, gnorm),
                        }
                    }
                }
            }

            if gnorm < self.gradient_tolerance {
                break (Termination::Converged, gnorm);
            }
            if iterations > self.max_iterations {
                break (Termination::MaxIterations, gnorm);
            }
            if func_evals > self.max_evaluations {
                break (Termination::MaxEvaluations, gnorm);
            }
            iterations += 1;

            matrix.update(&x, &gp)?;
            matrix.solve(&g, &mut dx)?;
            bounds.project_gradient(&x, &mut dx)?;

            let gdx = vector::dot(&g, &dx)?;
            if gdx <= 0.0 {
                log::warn!(
                    "[BLMVM] Non-descent direction (gᵀd = {:.2e}); using the projected gradient.",
                    gdx
                );
                vector::copy(&gp, &mut dx)?;
                pg_iterations += 1;
            }

            let x_old = x.clone();
            let outcome = backtracking_line_search(self, objective, &bounds, &x_old, &dx, f, &mut x)?;
            func_evals += outcome.evaluations;
            if outcome.exhausted {
                exhausted_searches += 1;
            }
            if !outcome.value.is_finite() {
                return Err(BlmvmError::NonFiniteValue {
                    value: outcome.value,
                    iterations,
                });
            }
            previous = Some(PreviousIterate {
                x: x_old,
                value: f,
                gradient_norm: gnorm,
            });
            f = outcome.value;
            g = outcome.gradient;
            last_step = outcome.step;
        };

        let solution = BlmvmSolution {
            final_point: x,
            final_value: f,
            final_gradient_norm: gnorm,
            iterations,
            func_evals,
            projected_gradient_iterations: pg_iterations,
            rejected_pairs: matrix.rejects(),
            exhausted_line_searches: exhausted_searches,
            termination,
        };
        let log_level = if termination.is_stalled() {
            log::Level::Warn
        } else {
            log::Level::Info
        };
        log::log!(
            log_level,
            "[BLMVM] {:?}: iters={}, f={:.6e}, ||pg||={:.3e}, fe={}, pg-iters={}, rejected pairs={}",
            solution.termination,
            solution.iterations,
            solution.final_value,
            solution.final_gradient_norm,
            solution.func_evals,
            solution.projected_gradient_iterations,
            solution.rejected_pairs
        );
        Ok(solution)
    }
}

impl<O> Blmvm<O>
where
    O: Objective,
{
    /// Creates a new BLMVM solver.
    ///
    /// # Arguments
    /// * `x0` - The initial guess; it is clamped into the box before the first evaluation.
    /// * `objective` - Supplies values, gradients and bounds.
    pub fn new(x0: Array1<f64>, objective: O) -> Self {
        Self {
            core: BlmvmCore::new(x0),
            objective,
        }
    }

    /// Sets how many curvature pairs the variable-metric matrix keeps (default: 8).
    pub fn with_memory(mut self, memory: usize) -> Self {
        self.core.memory = memory;
        self
    }

    /// Sets the projected-gradient norm below which the solve converges (default: 1e-4).
    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.core.gradient_tolerance = tolerance;
        self
    }

    /// Stops once the iteration count exceeds this cap (default: 1000).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.core.max_iterations = max_iterations;
        self
    }

    /// Stops once the function-evaluation count exceeds this cap (default: 10000).
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.core.max_evaluations = max_evaluations;
        self
    }

    /// Enables early stopping on the held-out log-likelihood reported by the
    /// objective. `window` is the trailing-window size; 0 disables it.
    pub fn with_early_stopping(mut self, window: usize) -> Self {
        self.core.early_stopping_window = window;
        self
    }

    /// Executes the solve.
    pub fn run(&mut self) -> Result<BlmvmSolution, BlmvmError> {
        self.core.run(&mut self.objective)
    }

    /// Borrows the objective, e.g. to read statistics it gathered.
    pub fn objective(&self) -> &O {
        &self.objective
    }

    /// Consumes the solver and hands back the objective.
    pub fn into_objective(self) -> O {
        self.objective
    }
}

/// Backtracking along `x_old - t * dx` for `t = 1, 0.75, 0.75², ...`, clamping
/// each trial into the box. Accepts the first trial with a strictly smaller
/// finite value; after the last allowed trial, accepts it regardless.
fn backtracking_line_search<O: Objective>(
    core: &BlmvmCore,
    objective: &mut O,
    bounds: &BoxSpec,
    x_old: &Array1<f64>,
    dx: &Array1<f64>,
    f_old: f64,
    x: &mut Array1<f64>,
) -> Result<LineSearchOutcome, BlmvmError> {
    let mut alpha = -1.0;
    let mut trials = 0usize;
    loop {
        vector::waxpy(alpha, dx, x_old, x)?;
        bounds.project(x)?;
        let (f_new, g_new) = evaluate(objective, x)?;
        trials += 1;

        let decreased = f_new.is_finite() && f_new < f_old;
        if decreased || trials >= core.max_line_search_trials {
            if decreased {
                log::debug!("[BLMVM] line search accepted step {:.3e} after {} trials", -alpha, trials);
            } else {
                log::warn!(
                    "[BLMVM] Line search found no decrease in {} trials; keeping the last trial (f = {:.6e}).",
                    trials,
                    f_new
                );
            }
            return Ok(LineSearchOutcome {
                value: f_new,
                gradient: g_new,
                step: alpha,
                evaluations: trials,
                exhausted: !decreased,
            });
        }
        alpha *= core.step_shrink;
    }
}
