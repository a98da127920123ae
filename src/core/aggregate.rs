use rayon::prelude::*;

use super::engine::simulate_path;
use super::results::{AccountSeries, Ledger, PathResult, PercentileBands, SimulationResult};
use super::rng::{Rng, derive_seed};
use super::types::{Plan, TaxClass};

/// Runs `n_paths` independent paths and summarises them. Path `i` always
/// draws from `derive_seed(seed, i)`, so the result does not depend on how
/// many worker threads ran it.
pub fn simulate(plan: &Plan, n_paths: u32, seed: u64) -> SimulationResult {
    let paths: Vec<PathResult> = (0..n_paths)
        .into_par_iter()
        .map(|index| {
            let mut rng = Rng::new(derive_seed(seed, u64::from(index)));
            simulate_path(plan, &mut rng)
        })
        .collect();

    let result = summarise(plan.ages(), paths, seed);
    log::debug!(
        "simulated {} paths over {} years: success {:.3}, median terminal {:.0}",
        result.n_paths,
        result.ages.len(),
        result.success_probability,
        result.median_terminal
    );
    result
}

fn summarise(ages: Vec<u32>, mut paths: Vec<PathResult>, seed: u64) -> SimulationResult {
    let n_paths = paths.len();
    let years = ages.len();

    let mut percentiles = PercentileBands {
        p10: Vec::with_capacity(years),
        p50: Vec::with_capacity(years),
        p90: Vec::with_capacity(years),
    };
    let mut acct_series_median = AccountSeries::with_capacity(years);
    let mut column = Vec::with_capacity(n_paths);

    for year in 0..years {
        column.clear();
        column.extend(paths.iter().map(|path| path.net_worth[year]));
        percentiles.p10.push(percentile(&mut column, 10.0));
        percentiles.p50.push(percentile(&mut column, 50.0));
        percentiles.p90.push(percentile(&mut column, 90.0));

        for class in [
            TaxClass::PreTax,
            TaxClass::Roth,
            TaxClass::Taxable,
            TaxClass::Cash,
        ] {
            column.clear();
            column.extend(paths.iter().map(|path| path.acct_series.series(class)[year]));
            acct_series_median
                .series_mut(class)
                .push(percentile(&mut column, 50.0));
        }
    }

    let mut terminal: Vec<f64> = paths.iter().map(PathResult::terminal_net_worth).collect();
    let success_probability = if n_paths == 0 {
        0.0
    } else {
        terminal.iter().filter(|value| **value >= 0.0).count() as f64 / n_paths as f64
    };

    let unsorted = terminal.clone();
    let median_terminal = percentile(&mut terminal, 50.0);
    let ledger_median = representative_index(&unsorted, median_terminal)
        .map(|index| paths.swap_remove(index).ledger)
        .unwrap_or_else(Ledger::default);

    SimulationResult {
        ages,
        success_probability,
        percentiles,
        median_terminal,
        acct_series_median,
        ledger_median,
        n_paths: n_paths as u32,
        seed,
    }
}

/// The path whose terminal value is closest to `median`; ties go to the
/// lowest index.
fn representative_index(terminal: &[f64], median: f64) -> Option<usize> {
    terminal
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - median).abs().total_cmp(&(*b - median).abs()))
        .map(|(index, _)| index)
}

/// Linear-interpolation percentile. Sorts `values` in place.
pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
