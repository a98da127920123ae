//! Social Security benefit adjustment and a salary-based PIA estimate.

pub const DEFAULT_FULL_RETIREMENT_AGE: u32 = 67;
pub const EARLIEST_CLAIM_AGE: u32 = 62;
pub const LATEST_CLAIM_AGE: u32 = 70;

const EARLY_REDUCTION_PER_YEAR: f64 = 0.07;
const DELAYED_CREDIT_PER_YEAR: f64 = 0.08;

const CAREER_START_AGE: u32 = 22;
const COMPUTATION_YEARS: usize = 35;
const FIRST_BEND_POINT: f64 = 1_174.0;
const SECOND_BEND_POINT: f64 = 7_078.0;

/// Monthly benefit after the early-claim reduction or delayed credit.
pub fn adjusted_monthly_benefit(pia: f64, claim_age: u32, fra: u32) -> f64 {
    let claim_age = claim_age.clamp(EARLIEST_CLAIM_AGE, LATEST_CLAIM_AGE);
    let factor = if claim_age < fra {
        1.0 - EARLY_REDUCTION_PER_YEAR * f64::from(fra - claim_age)
    } else {
        1.0 + DELAYED_CREDIT_PER_YEAR * f64::from(claim_age - fra)
    };
    pia.max(0.0) * factor.max(0.0)
}

/// Annual benefit paid from `claim_age` onward.
pub fn social_security_benefit(pia: f64, claim_age: u32, fra: u32) -> f64 {
    adjusted_monthly_benefit(pia, claim_age, fra) * 12.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Claim {
    pub pia: f64,
    pub claim_age: u32,
}

/// Household benefit. With `survivor` set only the larger of the two
/// adjusted benefits is paid; otherwise both are.
pub fn household_benefit(primary: Claim, spouse: Option<Claim>, fra: u32, survivor: bool) -> f64 {
    let own = social_security_benefit(primary.pia, primary.claim_age, fra);
    let Some(spouse) = spouse else {
        return own;
    };
    let other = social_security_benefit(spouse.pia, spouse.claim_age, fra);
    if survivor { own.max(other) } else { own + other }
}

/// Rough PIA from a flat-growth salary history: earnings from age 22 up to
/// retirement, best 35 years averaged monthly, then the two bend points.
pub fn estimate_pia(current_age: u32, retire_age: u32, salary: f64, salary_growth: f64) -> f64 {
    if salary <= 0.0 || retire_age <= CAREER_START_AGE {
        return 0.0;
    }

    let growth = 1.0 + salary_growth;
    let mut earnings: Vec<f64> = Vec::new();

    let mut past = salary;
    for _ in (CAREER_START_AGE..current_age).rev() {
        past = if growth > 0.0 { past / growth } else { 0.0 };
        earnings.push(past);
    }

    let mut future = salary;
    for _ in current_age..retire_age {
        earnings.push(future);
        future *= growth;
    }

    earnings.sort_by(|a, b| b.total_cmp(a));
    earnings.resize(COMPUTATION_YEARS, 0.0);
    let aime = earnings.iter().sum::<f64>() / (COMPUTATION_YEARS as f64 * 12.0);

    let first = aime.min(FIRST_BEND_POINT);
    let second = (aime.min(SECOND_BEND_POINT) - FIRST_BEND_POINT).max(0.0);
    let third = (aime - SECOND_BEND_POINT).max(0.0);
    0.9 * first + 0.32 * second + 0.15 * third
}
