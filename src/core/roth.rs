use std::collections::BTreeMap;

use super::types::RothConversionPolicy;

/// Gross conversion for `age`: the capped fraction of last year's pre-tax
/// balance while inside the policy window, otherwise nothing.
pub fn decide_conversion(prior_pre_tax: f64, age: u32, policy: &RothConversionPolicy) -> f64 {
    if age < policy.start_age || age > policy.end_age {
        return 0.0;
    }
    prior_pre_tax.max(0.0) * policy.annual_cap.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionResult {
    pub pre_tax: f64,
    pub roth: f64,
    /// Tax still owed from outside the converted amount.
    pub tax_due: f64,
    pub tax: f64,
}

/// Moves up to `amount` from pre-tax to Roth. When the tax is paid from the
/// taxable account the full amount lands in Roth and `tax_due` is reported;
/// otherwise the tax is withheld from the conversion.
pub fn apply_conversion(
    pre_tax: f64,
    roth: f64,
    amount: f64,
    tax_rate: f64,
    pay_tax_from_taxable: bool,
) -> ConversionResult {
    let gross = amount.clamp(0.0, pre_tax.max(0.0));
    let tax = gross * tax_rate.max(0.0);
    let (credited, tax_due) = if pay_tax_from_taxable {
        (gross, tax)
    } else {
        ((gross - tax).max(0.0), 0.0)
    };
    ConversionResult {
        pre_tax: pre_tax - gross,
        roth: roth + credited,
        tax_due,
        tax,
    }
}

/// Converts a fixed `annual_amount` each year for `years` years, stopping
/// early once pre-tax is empty. `tax` and `tax_due` are totals.
pub fn convert_fixed_amount(
    pre_tax: f64,
    roth: f64,
    annual_amount: f64,
    years: u32,
    tax_rate: f64,
    pay_tax_from_taxable: bool,
) -> ConversionResult {
    let mut total = ConversionResult {
        pre_tax,
        roth,
        tax_due: 0.0,
        tax: 0.0,
    };
    for _ in 0..years {
        if total.pre_tax <= 0.0 {
            break;
        }
        let year = apply_conversion(
            total.pre_tax,
            total.roth,
            annual_amount,
            tax_rate,
            pay_tax_from_taxable,
        );
        total = ConversionResult {
            pre_tax: year.pre_tax,
            roth: year.roth,
            tax_due: total.tax_due + year.tax_due,
            tax: total.tax + year.tax,
        };
    }
    total
}

/// Maximum Roth IRA contribution per working age, inflated yearly, rounded
/// to the nearest $500, plus the $1,000 catch-up from age 50.
pub fn roth_ira_max_schedule(
    start_age: u32,
    retire_age: u32,
    base_limit: f64,
    inflation: f64,
) -> BTreeMap<u32, f64> {
    (start_age..retire_age)
        .enumerate()
        .map(|(years, age)| {
            let inflated = base_limit * (1.0 + inflation).powi(years as i32);
            let mut limit = (inflated / 500.0).round() * 500.0;
            if age >= 50 {
                limit += 1_000.0;
            }
            (age, limit)
        })
        .collect()
}
