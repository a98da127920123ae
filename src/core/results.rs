use serde::Serialize;

use super::types::{AccountKind, TaxClass};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBreakdown {
    pub ordinary: f64,
    pub conversion: f64,
    pub withdrawal: f64,
    pub state: f64,
    pub capital_gains: f64,
}

impl TaxBreakdown {
    pub fn total(&self) -> f64 {
        self.ordinary + self.conversion + self.withdrawal + self.state + self.capital_gains
    }
}

/// End-of-year balance of every canonical account kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalances {
    pub pre_tax_401k: f64,
    pub pre_tax_ira: f64,
    pub roth_401k: f64,
    pub roth_ira: f64,
    pub taxable: f64,
    pub cash: f64,
}

impl AccountBalances {
    pub fn from_slots(slots: &[f64; 6]) -> Self {
        Self {
            pre_tax_401k: slots[AccountKind::PreTax401k.index()],
            pre_tax_ira: slots[AccountKind::PreTaxIra.index()],
            roth_401k: slots[AccountKind::Roth401k.index()],
            roth_ira: slots[AccountKind::RothIra.index()],
            taxable: slots[AccountKind::Taxable.index()],
            cash: slots[AccountKind::Cash.index()],
        }
    }

    pub fn get(&self, kind: AccountKind) -> f64 {
        match kind {
            AccountKind::PreTax401k => self.pre_tax_401k,
            AccountKind::PreTaxIra => self.pre_tax_ira,
            AccountKind::Roth401k => self.roth_401k,
            AccountKind::RothIra => self.roth_ira,
            AccountKind::Taxable => self.taxable,
            AccountKind::Cash => self.cash,
        }
    }

    pub fn class_total(&self, class: TaxClass) -> f64 {
        AccountKind::ALL
            .iter()
            .filter(|kind| kind.class() == class)
            .map(|kind| self.get(*kind))
            .sum()
    }

    pub fn total(&self) -> f64 {
        AccountKind::ALL.iter().map(|kind| self.get(*kind)).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerYear {
    pub age: u32,
    pub income: f64,
    pub expenses: f64,
    pub contributions: f64,
    pub withdrawals: f64,
    pub rmd: f64,
    pub roth_conversion: f64,
    pub taxes: TaxBreakdown,
    pub total_taxes: f64,
    pub shortfall: f64,
    pub balances: AccountBalances,
    pub net_worth: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Ledger {
    pub years: Vec<LedgerYear>,
}

impl Ledger {
    pub fn push(&mut self, year: LedgerYear) {
        self.years.push(year);
    }

    pub fn len(&self) -> usize {
        self.years.len()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }

    pub fn row(&self, age: u32) -> Option<&LedgerYear> {
        self.years.iter().find(|year| year.age == age)
    }

    pub fn total_shortfall(&self) -> f64 {
        self.years.iter().map(|year| year.shortfall).sum()
    }
}

/// Per-age balances grouped by tax treatment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSeries {
    pub pre_tax: Vec<f64>,
    pub roth: Vec<f64>,
    pub taxable: Vec<f64>,
    pub cash: Vec<f64>,
}

impl AccountSeries {
    pub fn with_capacity(len: usize) -> Self {
        Self {
            pre_tax: Vec::with_capacity(len),
            roth: Vec::with_capacity(len),
            taxable: Vec::with_capacity(len),
            cash: Vec::with_capacity(len),
        }
    }

    pub fn push(&mut self, balances: &AccountBalances) {
        self.pre_tax.push(balances.class_total(TaxClass::PreTax));
        self.roth.push(balances.class_total(TaxClass::Roth));
        self.taxable.push(balances.taxable);
        self.cash.push(balances.cash);
    }

    pub fn series(&self, class: TaxClass) -> &[f64] {
        match class {
            TaxClass::PreTax => &self.pre_tax,
            TaxClass::Roth => &self.roth,
            TaxClass::Taxable => &self.taxable,
            TaxClass::Cash => &self.cash,
        }
    }

    pub fn series_mut(&mut self, class: TaxClass) -> &mut Vec<f64> {
        match class {
            TaxClass::PreTax => &mut self.pre_tax,
            TaxClass::Roth => &mut self.roth,
            TaxClass::Taxable => &mut self.taxable,
            TaxClass::Cash => &mut self.cash,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub ages: Vec<u32>,
    pub net_worth: Vec<f64>,
    pub acct_series: AccountSeries,
    pub ledger: Ledger,
}

impl PathResult {
    pub fn terminal_net_worth(&self) -> f64 {
        self.net_worth.last().copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBands {
    pub p10: Vec<f64>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub ages: Vec<u32>,
    pub success_probability: f64,
    pub percentiles: PercentileBands,
    pub median_terminal: f64,
    pub acct_series_median: AccountSeries,
    pub ledger_median: Ledger,
    pub n_paths: u32,
    pub seed: u64,
}
