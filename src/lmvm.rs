//! Limited-memory variable-metric matrix.
//!
//! Keeps the `memory` most recent curvature pairs `(s, y)` with
//! `s = x_k - x_{k-1}` and `y = g_k - g_{k-1}`, newest first, and applies the
//! implied inverse-Hessian approximation to a vector with the two-loop
//! recursion (Nocedal & Wright, Alg. 7.4). The initial matrix is the scaled
//! identity `(s·y / y·y) I` taken from the newest pair.

use std::collections::VecDeque;

use ndarray::Array1;

use crate::vector::{self, VectorError};

/// Curvature acceptance tolerance: a pair is kept only when
/// `s·y > CURVATURE_EPS * y·y`.
pub const CURVATURE_EPS: f64 = 2.2e-11;

struct CurvaturePair {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

// Point and projected gradient of the last update, kept apart from the ring.
struct PreviousSample {
    x: Array1<f64>,
    g: Array1<f64>,
}

/// What an [`LmvmMatrix::update`] call did with the new sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairUpdate {
    /// First sample of a solve; no pair can be formed yet.
    Seeded,
    /// A new pair was pushed to the front of the history.
    Accepted,
    /// The pair failed the curvature test and was discarded.
    Rejected,
}

/// Bounded history of curvature pairs plus the two-loop solve.
pub struct LmvmMatrix {
    memory: usize,
    history: VecDeque<CurvaturePair>,
    previous: Option<PreviousSample>,
    y0_norm_squared: f64,
    rejects: usize,
    beta: Vec<f64>,
}

impl LmvmMatrix {
    /// Creates an empty matrix holding at most `memory` pairs (at least one).
    pub fn new(memory: usize) -> Self {
        let memory = memory.max(1);
        Self {
            memory,
            history: VecDeque::with_capacity(memory),
            previous: None,
            y0_norm_squared: 1.0,
            rejects: 0,
            beta: vec![0.0; memory],
        }
    }

    /// Number of pairs currently stored.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Pairs discarded by the curvature test since the matrix was seeded.
    pub fn rejects(&self) -> usize {
        self.rejects
    }

    /// `y·y` of the newest accepted pair, or 1 when the history is empty.
    pub fn y0_norm_squared(&self) -> f64 {
        if self.history.is_empty() {
            1.0
        } else {
            self.y0_norm_squared
        }
    }

    /// Stored pairs as `(s, y, rho)`, newest first.
    pub fn pairs(&self) -> impl Iterator<Item = (&Array1<f64>, &Array1<f64>, f64)> {
        self.history.iter().map(|p| (&p.s, &p.y, p.rho))
    }

    /// Feeds the newest point and its projected gradient.
    ///
    /// The first call only records the sample. Later calls form the pair from
    /// the difference to the recorded sample and keep it if its curvature is
    /// sufficiently positive; either way the recorded sample becomes `(x, g)`.
    pub fn update(&mut self, x: &Array1<f64>, g: &Array1<f64>) -> Result<PairUpdate, VectorError> {
        if x.len() != g.len() {
            return Err(VectorError::LengthMismatch {
                expected: x.len(),
                found: g.len(),
            });
        }

        let Some(mut prev) = self.previous.take() else {
            self.previous = Some(PreviousSample {
                x: x.clone(),
                g: g.clone(),
            });
            self.y0_norm_squared = 1.0;
            self.rejects = 0;
            return Ok(PairUpdate::Seeded);
        };

        // prev <- current - prev, in place
        vector::aypx(-1.0, x, &mut prev.x)?;
        vector::aypx(-1.0, g, &mut prev.g)?;
        let curvature = vector::dot(&prev.x, &prev.g)?;
        let y_norm_squared = vector::dot(&prev.g, &prev.g)?;

        let outcome;
        let mut next_slot = if curvature > CURVATURE_EPS * y_norm_squared {
            let evicted = if self.history.len() == self.memory {
                self.history.pop_back()
            } else {
                None
            };
            self.history.push_front(CurvaturePair {
                s: prev.x,
                y: prev.g,
                rho: 1.0 / curvature,
            });
            self.y0_norm_squared = y_norm_squared;
            outcome = PairUpdate::Accepted;
            match evicted {
                Some(pair) => PreviousSample {
                    x: pair.s,
                    g: pair.y,
                },
                None => PreviousSample {
                    x: Array1::zeros(x.len()),
                    g: Array1::zeros(x.len()),
                },
            }
        } else {
            self.rejects += 1;
            log::debug!(
                "[LMVM] rejected curvature pair: s·y = {:.3e}, y·y = {:.3e}",
                curvature,
                y_norm_squared
            );
            outcome = PairUpdate::Rejected;
            prev
        };

        vector::copy(x, &mut next_slot.x)?;
        vector::copy(g, &mut next_slot.g)?;
        self.previous = Some(next_slot);
        Ok(outcome)
    }

    /// Two-loop recursion: `out = H g` for the current inverse-Hessian
    /// approximation `H`. With an empty history `H` is the identity.
    pub fn solve(&mut self, g: &Array1<f64>, out: &mut Array1<f64>) -> Result<(), VectorError> {
        vector::copy(g, out)?;
        let (rho0, y0) = match self.history.front() {
            Some(newest) => (newest.rho, self.y0_norm_squared),
            None => (1.0, 1.0),
        };

        for (ll, pair) in self.history.iter().enumerate() {
            let sq = vector::dot(out, &pair.s)?;
            self.beta[ll] = sq * pair.rho;
            vector::axpy(-self.beta[ll], &pair.y, out)?;
        }
        vector::scale(1.0 / (rho0 * y0), out);
        for (ll, pair) in self.history.iter().enumerate().rev() {
            let yq = vector::dot(out, &pair.y)?;
            vector::axpy(self.beta[ll] - yq * pair.rho, &pair.s, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use spectral::prelude::*;

    // Gradient of 0.5 * sum(a_i x_i^2).
    fn diag_grad(a: &Array1<f64>, x: &Array1<f64>) -> Array1<f64> {
        a * x
    }

    #[test]
    fn empty_history_solves_to_identity() {
        let mut m = LmvmMatrix::new(8);
        let g = array![0.3, -7.0, 1e-9, 42.0];
        let mut out = Array1::zeros(4);
        m.solve(&g, &mut out).unwrap();
        assert_eq!(out, g);
    }

    #[test]
    fn first_update_only_seeds() {
        let mut m = LmvmMatrix::new(4);
        let x = array![1.0, 2.0];
        let g = array![0.5, 0.5];
        assert_eq!(m.update(&x, &g).unwrap(), PairUpdate::Seeded);
        assert_that!(&m.len()).is_equal_to(0);
        assert_eq!(m.y0_norm_squared(), 1.0);
    }

    #[test]
    fn zero_displacement_pair_is_rejected() {
        let mut m = LmvmMatrix::new(4);
        let x = array![1.0, -1.0, 3.0];
        let g = array![0.2, 0.1, -0.4];
        m.update(&x, &g).unwrap();
        assert_eq!(m.update(&x, &g).unwrap(), PairUpdate::Rejected);
        assert_that!(&m.len()).is_equal_to(0);
        assert_that!(&m.rejects()).is_equal_to(1);
    }

    #[test]
    fn negative_curvature_pair_is_rejected() {
        let mut m = LmvmMatrix::new(4);
        m.update(&array![0.0], &array![1.0]).unwrap();
        // step +1 while gradient drops: s·y < 0
        assert_eq!(
            m.update(&array![1.0], &array![0.0]).unwrap(),
            PairUpdate::Rejected
        );
        assert!(m.is_empty());
    }

    #[test]
    fn one_pair_recovers_exact_inverse_in_one_dimension() {
        let a = array![4.0];
        let mut m = LmvmMatrix::new(3);
        let x0 = array![2.0];
        let x1 = array![0.5];
        m.update(&x0, &diag_grad(&a, &x0)).unwrap();
        assert_eq!(
            m.update(&x1, &diag_grad(&a, &x1)).unwrap(),
            PairUpdate::Accepted
        );

        let g = array![3.0];
        let mut out = Array1::zeros(1);
        m.solve(&g, &mut out).unwrap();
        assert_that!(&out[0]).is_close_to(3.0 / 4.0, 1e-12);
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let a = array![1.0, 3.0];
        let mut m = LmvmMatrix::new(2);
        let points = [
            array![4.0, 4.0],
            array![3.0, 2.0],
            array![2.0, 1.5],
            array![1.0, 0.5],
        ];
        for p in &points {
            m.update(p, &diag_grad(&a, p)).unwrap();
        }
        assert_that!(&m.len()).is_equal_to(2);
        assert_that!(&m.rejects()).is_equal_to(0);

        let newest: Vec<Array1<f64>> = m.pairs().map(|(s, _, _)| s.clone()).collect();
        assert_eq!(newest[0], &points[3] - &points[2]);
        assert_eq!(newest[1], &points[2] - &points[1]);

        for (s, y, rho) in m.pairs() {
            assert_that!(&(rho * s.dot(y))).is_close_to(1.0, 1e-12);
        }
        let newest_y = m.pairs().next().map(|(_, y, _)| y.clone()).unwrap();
        assert_that!(&m.y0_norm_squared()).is_close_to(newest_y.dot(&newest_y), 1e-12);
    }

    #[test]
    fn solve_satisfies_secant_condition_for_newest_pair() {
        let a = array![1.0, 10.0, 100.0];
        let mut m = LmvmMatrix::new(5);
        let points = [array![1.0, 1.0, 1.0], array![0.7, 0.2, 0.9], array![0.3, 0.1, 0.2]];
        for p in &points {
            m.update(p, &diag_grad(&a, p)).unwrap();
        }
        let (s, y, _) = m.pairs().next().unwrap();
        let (s, y) = (s.clone(), y.clone());
        let mut out = Array1::zeros(3);
        m.solve(&y, &mut out).unwrap();
        for i in 0..3 {
            assert_that!(&out[i]).is_close_to(s[i], 1e-10);
        }
    }

    #[test]
    fn mismatched_update_is_an_error() {
        let mut m = LmvmMatrix::new(2);
        assert!(m.update(&array![1.0, 2.0], &array![1.0]).is_err());
        m.update(&array![1.0, 2.0], &array![1.0, 1.0]).unwrap();
        assert!(m.update(&array![1.0], &array![1.0]).is_err());
    }
}
