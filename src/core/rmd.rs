//! Required minimum distributions for pre-tax accounts.

/// First age in the Uniform Lifetime Table.
const TABLE_START_AGE: u32 = 72;

/// Uniform Lifetime Table distribution periods, ages 72 through 120.
const UNIFORM_LIFETIME: [f64; 49] = [
    27.4, 26.5, 25.5, 24.6, 23.7, 22.9, 22.0, 21.1, 20.2, 19.4, // 72-81
    18.5, 17.7, 16.8, 16.0, 15.2, 14.4, 13.7, 12.9, 12.2, 11.5, // 82-91
    10.8, 10.1, 9.5, 8.9, 8.4, 7.8, 7.3, 6.8, 6.4, 6.0, // 92-101
    5.6, 5.2, 4.9, 4.6, 4.3, 4.1, 3.9, 3.7, 3.5, 3.4, // 102-111
    3.3, 3.1, 3.0, 2.9, 2.8, 2.7, 2.5, 2.3, 2.0, // 112-120
];

/// Age at which distributions begin for someone born in `birth_year`.
pub fn rmd_start_age(birth_year: i32) -> u32 {
    match birth_year {
        ..=1950 => 72,
        1951..=1959 => 73,
        _ => 75,
    }
}

pub fn distribution_period(age: u32) -> Option<f64> {
    let offset = age.checked_sub(TABLE_START_AGE)?;
    UNIFORM_LIFETIME.get(offset as usize).copied()
}

/// Required distribution for `age` given the prior year-end balance.
/// Ages outside the table, and non-positive balances, require nothing.
pub fn compute_rmd(balance: f64, age: u32) -> f64 {
    if balance <= 0.0 {
        return 0.0;
    }
    match distribution_period(age) {
        Some(period) => balance / period,
        None => 0.0,
    }
}
