//! Fixed-iteration damped least-squares solver.
//!
//! Levenberg-Marquardt over any `LeastSquaresProblem`:
//!
//! ```text
//! (JᵀJ + λ diag(JᵀJ)) δ = -Jᵀ r
//! ```
//!
//! A step is accepted when it lowers the cost, and λ shrinks; otherwise the
//! parameters are restored and λ grows. There is no convergence test: the
//! loop always runs the requested number of iterations, which keeps the
//! per-frame cost of the alignment bounded and predictable.

use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{DVector, Dyn, Owned};
use tracing::trace;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const LAMBDA_MIN: f64 = 1e-10;
const LAMBDA_MAX: f64 = 1e10;

/// Outcome of a solver run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSummary {
    /// Iterations executed.
    pub iterations: usize,
    /// Iterations whose step was accepted.
    pub accepted: usize,
    /// ½‖r‖² at the start.
    pub initial_cost: f64,
    /// ½‖r‖² at the end.
    pub final_cost: f64,
}

fn cost(residuals: &DVector<f64>) -> f64 {
    0.5 * residuals.norm_squared()
}

/// Runs exactly `iterations` damped Gauss-Newton iterations on `problem`.
///
/// Iterations where the problem cannot produce residuals or a Jacobian, or
/// where the damped system is singular, count as rejected steps.
pub fn solve_fixed_iterations<P>(problem: &mut P, iterations: usize) -> SolverSummary
where
    P: LeastSquaresProblem<
            f64,
            Dyn,
            Dyn,
            ParameterStorage = Owned<f64, Dyn>,
            ResidualStorage = Owned<f64, Dyn>,
            JacobianStorage = Owned<f64, Dyn, Dyn>,
        >,
{
    let initial_cost = problem.residuals().map(|r| cost(&r)).unwrap_or(f64::INFINITY);
    let mut current_cost = initial_cost;
    let mut lambda = LAMBDA_INIT;
    let mut accepted = 0;

    for iter in 0..iterations {
        let (Some(residuals), Some(jacobian)) = (problem.residuals(), problem.jacobian()) else {
            lambda = (lambda * LAMBDA_UP).min(LAMBDA_MAX);
            continue;
        };

        let gradient = jacobian.transpose() * &residuals;
        let mut damped_jtj = jacobian.transpose() * &jacobian;
        for i in 0..damped_jtj.nrows() {
            damped_jtj[(i, i)] += lambda * damped_jtj[(i, i)].max(1e-6);
        }

        let Some(delta) = damped_jtj.lu().solve(&(-&gradient)) else {
            lambda = (lambda * LAMBDA_UP).min(LAMBDA_MAX);
            continue;
        };

        let current_params = problem.params();
        problem.set_params(&(&current_params + &delta));
        let trial_cost = problem.residuals().map(|r| cost(&r)).unwrap_or(f64::INFINITY);

        if trial_cost < current_cost {
            current_cost = trial_cost;
            accepted += 1;
            lambda = (lambda * LAMBDA_DOWN).max(LAMBDA_MIN);
        } else {
            problem.set_params(&current_params);
            lambda = (lambda * LAMBDA_UP).min(LAMBDA_MAX);
        }
        trace!("LM iter {}: cost {:.6e}, lambda {:.1e}", iter, current_cost, lambda);
    }

    SolverSummary {
        iterations,
        accepted,
        initial_cost,
        final_cost: current_cost,
    }
}
