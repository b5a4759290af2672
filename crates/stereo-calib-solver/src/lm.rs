//! Dense Levenberg-Marquardt with Marquardt diagonal scaling.
//!
//! The engine is generic over the problem's state type: problems map a
//! parameter increment onto their own state with [`LeastSquaresProblem::retract`],
//! so rotations can be updated multiplicatively.

use crate::SolverError;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Damping never drops below this after a run of accepted steps.
const MIN_LAMBDA: f64 = 1e-15;

/// Stopping criteria and damping schedule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmOptions {
    /// Maximum number of linearizations.
    pub max_iterations: usize,
    /// Stop once an accepted step lowers the cost by less than this fraction.
    pub cost_tolerance: f64,
    /// Stop once `max |J^T r|` falls below this.
    pub gradient_tolerance: f64,
    /// Stop once the step norm falls below this.
    pub step_tolerance: f64,
    pub initial_lambda: f64,
    /// Giving up on improving the cost beyond this damping.
    pub max_lambda: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-8,
            gradient_tolerance: 1e-12,
            step_tolerance: 1e-12,
            initial_lambda: 1e-3,
            max_lambda: 1e16,
        }
    }
}

/// Why the optimizer stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    CostTolerance,
    GradientTolerance,
    SmallStep,
    /// No damping up to `max_lambda` produced a cost decrease.
    DampingSaturated,
    MaxIterations,
}

impl Termination {
    pub fn converged(&self) -> bool {
        !matches!(self, Termination::MaxIterations)
    }
}

/// Summary of one optimizer run. Costs are `0.5 * |r|^2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LmReport {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub termination: Termination,
}

/// A nonlinear least-squares problem over an arbitrary state.
pub trait LeastSquaresProblem {
    type State: Clone;

    /// Length of the increment vector accepted by [`Self::retract`].
    fn num_params(&self) -> usize;

    /// Residual vector, or `None` when the state cannot be evaluated
    /// (for example a point moved behind a camera).
    fn residuals(&self, state: &Self::State) -> Option<DVector<f64>>;

    /// Residuals together with their Jacobian w.r.t. the increment.
    fn linearize(&self, state: &Self::State) -> Option<(DVector<f64>, DMatrix<f64>)>;

    /// Apply an increment.
    fn retract(&self, state: &Self::State, delta: &DVector<f64>) -> Self::State;

    /// Human-readable name of a parameter column, used in error messages.
    fn parameter_label(&self, index: usize) -> String {
        format!("x[{index}]")
    }
}

/// Minimize `0.5 * |r(x)|^2` starting from `initial`.
///
/// Returns the best state found. Hitting the iteration cap is reported in
/// [`LmReport::termination`], not as an error.
#[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(params = problem.num_params())))]
pub fn minimize<P: LeastSquaresProblem>(
    problem: &P,
    initial: P::State,
    opts: &LmOptions,
) -> Result<(P::State, LmReport), SolverError> {
    let n = problem.num_params();
    let mut state = initial;
    let (mut r, mut j) = problem
        .linearize(&state)
        .ok_or(SolverError::ResidualEvaluation)?;
    let mut cost = 0.5 * r.norm_squared();
    if !cost.is_finite() {
        return Err(SolverError::ResidualEvaluation);
    }
    let initial_cost = cost;
    let mut lambda = opts.initial_lambda;
    let mut iterations = 0;

    let termination = 'outer: loop {
        if n == 0 || cost == 0.0 {
            break Termination::CostTolerance;
        }
        if iterations >= opts.max_iterations {
            break Termination::MaxIterations;
        }
        iterations += 1;

        let g = j.tr_mul(&r);
        if g.amax() <= opts.gradient_tolerance {
            break Termination::GradientTolerance;
        }
        let a = j.tr_mul(&j);
        let diag = a.diagonal();
        if let Some(col) = diag.iter().position(|d| !(*d > 0.0)) {
            return Err(SolverError::UnobservableParameter {
                parameter: problem.parameter_label(col),
            });
        }

        loop {
            let mut damped = a.clone();
            for i in 0..n {
                damped[(i, i)] += lambda * diag[i];
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                if lambda > opts.max_lambda {
                    return Err(SolverError::SingularNormalEquations);
                }
                continue;
            };
            let delta = chol.solve(&(-&g));
            if delta.norm() <= opts.step_tolerance {
                break 'outer Termination::SmallStep;
            }

            let candidate = problem.retract(&state, &delta);
            let new_cost = problem
                .residuals(&candidate)
                .map(|rc| 0.5 * rc.norm_squared())
                .filter(|c| c.is_finite());

            match new_cost {
                Some(new_cost) if new_cost < cost => {
                    let relative_decrease = (cost - new_cost) / cost;
                    state = candidate;
                    cost = new_cost;
                    lambda = (lambda * 0.1).max(MIN_LAMBDA);
                    log::debug!(
                        "lm iteration {iterations}: cost {cost:.6e}, lambda {lambda:.1e}, |dx| {:.3e}",
                        delta.norm()
                    );
                    (r, j) = problem
                        .linearize(&state)
                        .ok_or(SolverError::ResidualEvaluation)?;
                    if relative_decrease < opts.cost_tolerance {
                        break 'outer Termination::CostTolerance;
                    }
                    continue 'outer;
                }
                _ => {
                    lambda *= 10.0;
                    if lambda > opts.max_lambda {
                        break 'outer Termination::DampingSaturated;
                    }
                }
            }
        }
    };

    Ok((
        state,
        LmReport {
            iterations,
            initial_cost,
            final_cost: cost,
            termination,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rosenbrock in residual form: r = (10 (y - x^2), 1 - x).
    struct Rosenbrock;

    impl LeastSquaresProblem for Rosenbrock {
        type State = DVector<f64>;

        fn num_params(&self) -> usize {
            2
        }

        fn residuals(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
            Some(DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]))
        }

        fn linearize(&self, x: &DVector<f64>) -> Option<(DVector<f64>, DMatrix<f64>)> {
            let j = DMatrix::from_row_slice(2, 2, &[-20.0 * x[0], 10.0, -1.0, 0.0]);
            Some((self.residuals(x)?, j))
        }

        fn retract(&self, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
            x + delta
        }
    }

    /// Second parameter never enters the residuals.
    struct Unobservable;

    impl LeastSquaresProblem for Unobservable {
        type State = DVector<f64>;

        fn num_params(&self) -> usize {
            2
        }

        fn residuals(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
            Some(DVector::from_vec(vec![x[0] - 3.0]))
        }

        fn linearize(&self, x: &DVector<f64>) -> Option<(DVector<f64>, DMatrix<f64>)> {
            Some((self.residuals(x)?, DMatrix::from_row_slice(1, 2, &[1.0, 0.0])))
        }

        fn retract(&self, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
            x + delta
        }

        fn parameter_label(&self, index: usize) -> String {
            ["a", "b"][index].to_string()
        }
    }

    #[test]
    fn solves_rosenbrock() {
        let x0 = DVector::from_vec(vec![-1.2, 1.0]);
        let (x, report) = minimize(&Rosenbrock, x0, &LmOptions::default()).expect("solve");
        assert!((x[0] - 1.0).abs() < 1e-6, "x = {x}");
        assert!((x[1] - 1.0).abs() < 1e-6, "x = {x}");
        assert!(report.final_cost < 1e-12);
        assert!(report.final_cost <= report.initial_cost);
        assert!(report.termination.converged(), "{report:?}");
    }

    #[test]
    fn iteration_cap_is_not_an_error() {
        let opts = LmOptions {
            max_iterations: 2,
            ..LmOptions::default()
        };
        let x0 = DVector::from_vec(vec![-1.2, 1.0]);
        let (_, report) = minimize(&Rosenbrock, x0, &opts).expect("solve");
        assert_eq!(report.iterations, 2);
        assert_eq!(report.termination, Termination::MaxIterations);
        assert!(report.final_cost < report.initial_cost);
    }

    #[test]
    fn zero_jacobian_column_is_reported_by_name() {
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let err = minimize(&Unobservable, x0, &LmOptions::default()).unwrap_err();
        assert_eq!(
            err,
            SolverError::UnobservableParameter {
                parameter: "b".to_string()
            }
        );
    }

    #[test]
    fn exact_start_stops_immediately() {
        let x0 = DVector::from_vec(vec![1.0, 1.0]);
        let (x, report) = minimize(&Rosenbrock, x0, &LmOptions::default()).expect("solve");
        assert_eq!(report.iterations, 0);
        assert_eq!(report.final_cost, 0.0);
        assert_eq!(x[0], 1.0);
    }
}
