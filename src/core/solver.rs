use serde::Serialize;
use thiserror::Error;

use super::Plan;
use super::aggregate::simulate;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("target success must be between 0 and 1")]
    TargetOutOfRange,
    #[error("search bounds must be finite and non-negative")]
    InvalidBounds,
    #[error("search max must be greater than search min")]
    EmptySearchRange,
    #[error("tolerance must be > 0")]
    InvalidTolerance,
    #[error("max iterations must be > 0")]
    NoIterations,
    #[error("{0} must be > 0")]
    NoPaths(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendingSolveConfig {
    pub target_success: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub paths_per_iteration: u32,
    pub final_paths: u32,
    pub seed: u64,
}

impl Default for SpendingSolveConfig {
    fn default() -> Self {
        Self {
            target_success: 0.9,
            search_min: 0.0,
            search_max: 250_000.0,
            tolerance: 100.0,
            max_iterations: 30,
            paths_per_iteration: 500,
            final_paths: 1_000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_baseline: f64,
    pub success_probability: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingSolveResult {
    pub target_success: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub paths_per_iteration: u32,
    pub final_paths: u32,
    pub seed: u64,
    pub original_baseline: f64,
    pub solved_baseline: Option<f64>,
    pub achieved_success_probability: Option<f64>,
    pub achieved_ci_half_width: Option<f64>,
    pub iterations: Vec<SpendingSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Binary-searches the largest `expenses.baseline` whose success
/// probability still meets the target. Probes run on a private copy of the
/// plan; the caller's plan is never touched.
pub fn solve_max_spending(
    plan: &Plan,
    config: SpendingSolveConfig,
) -> Result<SpendingSolveResult, SolveError> {
    validate_config(config)?;

    let mut probe = Prober::new(plan, config);
    let mut iterations = Vec::with_capacity(config.max_iterations as usize);

    let low_eval = probe.evaluate(config.search_min, config.paths_per_iteration);
    let high_eval = probe.evaluate(config.search_max, config.paths_per_iteration);

    let mut solved_baseline = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.success_probability + 1e-12 < config.target_success {
        feasible = false;
        message = "No feasible spending level found within the search bounds.".to_string();
    } else if high_eval.success_probability + 1e-12 >= config.target_success {
        solved_baseline = Some(config.search_max);
        converged = true;
        feasible = true;
        message = "Upper spending bound is still feasible; increase search max for a higher answer."
            .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = probe.evaluate(mid, config.paths_per_iteration);
            iterations.push(SpendingSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_baseline: mid,
                success_probability: eval.success_probability,
                success_ci_half_width: eval.success_ci_half_width,
            });

            if eval.success_probability + 1e-12 >= config.target_success {
                lo = mid;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved_baseline = Some(lo);
        feasible = true;
        message = if converged {
            "Solved maximum sustainable spending.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let mut achieved_success_probability = None;
    let mut achieved_ci_half_width = None;
    if let Some(baseline) = solved_baseline {
        let eval = probe.evaluate(baseline, config.final_paths);
        achieved_success_probability = Some(eval.success_probability);
        achieved_ci_half_width = Some(eval.success_ci_half_width);
    }

    log::debug!(
        "spending solve: target {:.3}, baseline {:?}, {} probes, converged {}",
        config.target_success,
        solved_baseline,
        iterations.len(),
        converged
    );

    Ok(SpendingSolveResult {
        target_success: config.target_success,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        max_iterations: config.max_iterations,
        paths_per_iteration: config.paths_per_iteration,
        final_paths: config.final_paths,
        seed: config.seed,
        original_baseline: plan.expenses.baseline,
        solved_baseline,
        achieved_success_probability,
        achieved_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    success_probability: f64,
    success_ci_half_width: f64,
}

/// Owns the working copy of the plan that probes mutate.
struct Prober {
    plan: Plan,
    seed: u64,
}

impl Prober {
    fn new(plan: &Plan, config: SpendingSolveConfig) -> Self {
        Self {
            plan: plan.clone(),
            seed: config.seed,
        }
    }

    fn evaluate(&mut self, baseline: f64, n_paths: u32) -> CandidateEval {
        self.plan.expenses.baseline = baseline.max(0.0);
        let result = simulate(&self.plan, n_paths, self.seed);
        CandidateEval {
            success_probability: result.success_probability,
            success_ci_half_width: binomial_ci_half_width(result.success_probability, n_paths),
        }
    }
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_config(config: SpendingSolveConfig) -> Result<(), SolveError> {
    if !(0.0..=1.0).contains(&config.target_success) {
        return Err(SolveError::TargetOutOfRange);
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() || config.search_min < 0.0
    {
        return Err(SolveError::InvalidBounds);
    }
    if config.search_max <= config.search_min {
        return Err(SolveError::EmptySearchRange);
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(SolveError::InvalidTolerance);
    }
    if config.max_iterations == 0 {
        return Err(SolveError::NoIterations);
    }
    if config.paths_per_iteration == 0 {
        return Err(SolveError::NoPaths("paths per iteration"));
    }
    if config.final_paths == 0 {
        return Err(SolveError::NoPaths("final paths"));
    }
    Ok(())
}
