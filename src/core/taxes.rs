use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::FilingStatus;

pub const DEFAULT_TAX_YEAR: u32 = 2024;

const EMBEDDED_TABLES: &str = include_str!("../../data/tax_tables.json");

#[derive(Debug, Error)]
pub enum TaxTableError {
    #[error("invalid tax table JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("tax tables define no years")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    pub rate: f64,
    pub start: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederalSchedule {
    pub standard_deduction: f64,
    pub brackets: Vec<Bracket>,
    pub cap_gains: Vec<Bracket>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateRule {
    pub standard_deduction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brackets: Option<Vec<Bracket>>,
}

impl StateRule {
    pub fn tax(&self, income: f64) -> f64 {
        let taxable = (income - self.standard_deduction).max(0.0);
        if taxable <= 0.0 {
            return 0.0;
        }
        match (&self.brackets, self.rate) {
            (Some(brackets), _) => progressive_tax(taxable, brackets),
            (None, Some(rate)) => taxable * rate.max(0.0),
            (None, None) => 0.0,
        }
    }
}

/// A state's default rule plus optional per-filing-status overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSchedule {
    pub standard_deduction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brackets: Option<Vec<Bracket>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub by_status: BTreeMap<FilingStatus, StateRule>,
}

impl StateSchedule {
    pub fn tax(&self, income: f64, status: FilingStatus) -> f64 {
        if let Some(rule) = self.by_status.get(&status) {
            return rule.tax(income);
        }
        StateRule {
            standard_deduction: self.standard_deduction,
            rate: self.rate,
            brackets: self.brackets.clone(),
        }
        .tax(income)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YearTables {
    pub federal: BTreeMap<FilingStatus, FederalSchedule>,
    pub state: BTreeMap<String, StateSchedule>,
}

impl YearTables {
    /// Falls back to the single schedule when a status is missing.
    pub fn federal(&self, status: FilingStatus) -> Option<&FederalSchedule> {
        self.federal
            .get(&status)
            .or_else(|| self.federal.get(&FilingStatus::Single))
    }

    pub fn state(&self, code: &str) -> Option<&StateSchedule> {
        self.state.get(code.trim()).or_else(|| {
            let upper = code.trim().to_ascii_uppercase();
            self.state.get(&upper)
        })
    }
}

/// Federal and state bracket data keyed by tax year.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxTables {
    years: BTreeMap<u32, YearTables>,
}

impl TaxTables {
    pub fn from_json(json: &str) -> Result<Self, TaxTableError> {
        let tables: TaxTables = serde_json::from_str(json)?;
        if tables.years.is_empty() {
            return Err(TaxTableError::Empty);
        }
        Ok(tables)
    }

    /// Tables compiled into the crate.
    pub fn embedded() -> &'static TaxTables {
        static TABLES: OnceLock<TaxTables> = OnceLock::new();
        TABLES.get_or_init(|| {
            TaxTables::from_json(EMBEDDED_TABLES).unwrap_or_else(|err| {
                log::error!("embedded tax tables failed to load: {err}");
                TaxTables::default()
            })
        })
    }

    pub fn years(&self) -> impl Iterator<Item = u32> + '_ {
        self.years.keys().copied()
    }

    /// The latest year not after `year`, else the earliest available.
    pub fn year(&self, year: u32) -> Option<&YearTables> {
        self.years
            .range(..=year)
            .next_back()
            .or_else(|| self.years.iter().next())
            .map(|(_, tables)| tables)
    }

    pub fn standard_deduction(&self, status: FilingStatus, year: u32) -> f64 {
        self.year(year)
            .and_then(|t| t.federal(status))
            .map(|s| s.standard_deduction)
            .unwrap_or(0.0)
    }

    pub fn federal_tax(&self, income: f64, status: FilingStatus, year: u32) -> f64 {
        let Some(schedule) = self.year(year).and_then(|t| t.federal(status)) else {
            return 0.0;
        };
        progressive_tax(income - schedule.standard_deduction, &schedule.brackets)
    }

    /// Long-term gains taxed on their own through the gains brackets.
    pub fn capital_gains_tax(&self, gain: f64, status: FilingStatus, year: u32) -> f64 {
        let Some(schedule) = self.year(year).and_then(|t| t.federal(status)) else {
            return 0.0;
        };
        progressive_tax(gain, &schedule.cap_gains)
    }

    pub fn state_tax(&self, taxable_income: f64, state: &str, status: FilingStatus, year: u32) -> f64 {
        self.year(year)
            .and_then(|t| t.state(state))
            .map(|schedule| schedule.tax(taxable_income, status))
            .unwrap_or(0.0)
    }

    pub fn combined_tax(
        &self,
        ordinary: f64,
        gains: f64,
        status: FilingStatus,
        state: Option<&str>,
        year: u32,
    ) -> CombinedTax {
        let federal = self.federal_tax(ordinary, status, year);
        let capital_gains = self.capital_gains_tax(gains, status, year);
        let state = match state {
            Some(code) => {
                let base = (ordinary + gains - self.standard_deduction(status, year)).max(0.0);
                self.state_tax(base, code, status, year)
            }
            None => 0.0,
        };
        CombinedTax {
            federal,
            capital_gains,
            state,
            total: federal + capital_gains + state,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedTax {
    pub federal: f64,
    pub capital_gains: f64,
    pub state: f64,
    pub total: f64,
}

/// Sum of each bracket's rate times the slice of `amount` inside it.
pub fn progressive_tax(amount: f64, brackets: &[Bracket]) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    brackets
        .iter()
        .map(|bracket| {
            let end = bracket.end.unwrap_or(f64::INFINITY);
            (amount.min(end) - bracket.start).max(0.0) * bracket.rate
        })
        .sum()
}

pub fn compute_federal_tax(income: f64, status: FilingStatus) -> f64 {
    TaxTables::embedded().federal_tax(income, status, DEFAULT_TAX_YEAR)
}

pub fn compute_capital_gains_tax(gain: f64, status: FilingStatus) -> f64 {
    TaxTables::embedded().capital_gains_tax(gain, status, DEFAULT_TAX_YEAR)
}

pub fn compute_state_tax(taxable_income: f64, state: &str, status: FilingStatus) -> f64 {
    TaxTables::embedded().state_tax(taxable_income, state, status, DEFAULT_TAX_YEAR)
}

pub fn combined_tax(ordinary: f64, gains: f64, status: FilingStatus, state: Option<&str>) -> f64 {
    TaxTables::embedded()
        .combined_tax(ordinary, gains, status, state, DEFAULT_TAX_YEAR)
        .total
}
