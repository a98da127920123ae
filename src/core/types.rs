use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

/// Largest magnitude at which every whole `f64` is an exact integer.
const MAX_EXACT_WHOLE: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid plan JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FilingStatus {
    #[default]
    Single,
    #[serde(alias = "married_filing_jointly", alias = "mfj")]
    MarriedJoint,
    #[serde(alias = "married_filing_separately", alias = "mfs")]
    MarriedSeparate,
    #[serde(alias = "hoh")]
    HeadOfHousehold,
}

/// Retirement-phase funding order. Unknown names fall back to `Standard`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WithdrawalStrategy {
    #[default]
    Standard,
    Proportional,
    TaxBracket,
}

impl From<String> for WithdrawalStrategy {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "proportional" => WithdrawalStrategy::Proportional,
            "tax_bracket" | "taxbracket" => WithdrawalStrategy::TaxBracket,
            _ => WithdrawalStrategy::Standard,
        }
    }
}

impl From<WithdrawalStrategy> for String {
    fn from(value: WithdrawalStrategy) -> Self {
        match value {
            WithdrawalStrategy::Standard => "standard",
            WithdrawalStrategy::Proportional => "proportional",
            WithdrawalStrategy::TaxBracket => "tax_bracket",
        }
        .to_string()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomeTaxMode {
    #[default]
    Flat,
    Brackets,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    #[serde(rename = "pre_tax_401k")]
    PreTax401k,
    #[serde(rename = "pre_tax_ira")]
    PreTaxIra,
    #[serde(rename = "roth_401k")]
    Roth401k,
    #[serde(rename = "roth_ira")]
    RothIra,
    #[serde(rename = "taxable")]
    Taxable,
    #[serde(rename = "cash")]
    Cash,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaxClass {
    PreTax,
    Roth,
    Taxable,
    Cash,
}

impl AccountKind {
    pub const ALL: [AccountKind; 6] = [
        AccountKind::PreTax401k,
        AccountKind::PreTaxIra,
        AccountKind::Roth401k,
        AccountKind::RothIra,
        AccountKind::Taxable,
        AccountKind::Cash,
    ];

    /// Kinds that receive a market return, in draw order.
    pub const INVESTED: [AccountKind; 5] = [
        AccountKind::PreTax401k,
        AccountKind::PreTaxIra,
        AccountKind::Roth401k,
        AccountKind::RothIra,
        AccountKind::Taxable,
    ];

    /// Priority in which a working-year surplus is contributed.
    pub const CONTRIBUTION_ORDER: [AccountKind; 5] = [
        AccountKind::PreTax401k,
        AccountKind::Roth401k,
        AccountKind::PreTaxIra,
        AccountKind::RothIra,
        AccountKind::Taxable,
    ];

    pub fn index(self) -> usize {
        match self {
            AccountKind::PreTax401k => 0,
            AccountKind::PreTaxIra => 1,
            AccountKind::Roth401k => 2,
            AccountKind::RothIra => 3,
            AccountKind::Taxable => 4,
            AccountKind::Cash => 5,
        }
    }

    pub fn class(self) -> TaxClass {
        match self {
            AccountKind::PreTax401k | AccountKind::PreTaxIra => TaxClass::PreTax,
            AccountKind::Roth401k | AccountKind::RothIra => TaxClass::Roth,
            AccountKind::Taxable => TaxClass::Taxable,
            AccountKind::Cash => TaxClass::Cash,
        }
    }

    pub fn default_mean_return(self) -> f64 {
        match self.class() {
            TaxClass::PreTax => 0.05,
            TaxClass::Roth | TaxClass::Taxable => 0.06,
            TaxClass::Cash => 0.0,
        }
    }

    pub fn default_stdev_return(self) -> f64 {
        match self.class() {
            TaxClass::PreTax => 0.10,
            TaxClass::Roth | TaxClass::Taxable => 0.12,
            TaxClass::Cash => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub balance: f64,
    pub contribution: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contribution_schedule: Option<BTreeMap<u32, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_return: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdev_return: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_tax_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basis: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annual_limit: Option<f64>,
    pub limit_growth: f64,
    pub max_out: bool,
}

impl Account {
    pub fn with_balance(balance: f64) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    /// Requested contribution at `age`; a schedule replaces the flat amount.
    pub fn contribution_for_age(&self, age: u32) -> f64 {
        let amount = match &self.contribution_schedule {
            Some(schedule) => schedule.get(&age).copied().unwrap_or(0.0),
            None => self.contribution,
        };
        amount.max(0.0)
    }

    /// Contribution wanted this year after applying the (possibly growing) annual limit.
    pub fn planned_contribution(&self, age: u32, years_elapsed: u32) -> f64 {
        let limit = self.annual_limit.map(|limit| {
            limit.max(0.0) * (1.0 + self.limit_growth).powi(years_elapsed as i32)
        });
        let wanted = match limit {
            Some(limit) if self.max_out => limit,
            _ => self.contribution_for_age(age),
        };
        match limit {
            Some(limit) => wanted.min(limit).max(0.0),
            None => wanted.max(0.0),
        }
    }
}

/// The canonical account set. Merged (`pre_tax`, `roth`) and split
/// (`pre_tax_401k`, `pre_tax_ira`, `roth_401k`, `roth_ira`) documents both
/// land in the same six slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "AccountsDocument", into = "AccountsDocument")]
pub struct Accounts {
    slots: BTreeMap<AccountKind, Account>,
    fallback_withdrawal_rate: Option<f64>,
}

impl Accounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: AccountKind, account: Account) -> Self {
        self.slots.insert(kind, account);
        self
    }

    pub fn insert(&mut self, kind: AccountKind, account: Account) {
        self.slots.insert(kind, account);
    }

    pub fn get(&self, kind: AccountKind) -> Option<&Account> {
        self.slots.get(&kind)
    }

    pub fn get_mut(&mut self, kind: AccountKind) -> Option<&mut Account> {
        self.slots.get_mut(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AccountKind, &Account)> {
        self.slots.iter().map(|(kind, account)| (*kind, account))
    }

    pub fn balance(&self, kind: AccountKind) -> f64 {
        self.get(kind).map(|a| a.balance).unwrap_or(0.0)
    }

    pub fn total_of(&self, class: TaxClass) -> f64 {
        self.iter()
            .filter(|(kind, _)| kind.class() == class)
            .map(|(_, account)| account.balance)
            .sum()
    }

    pub fn total(&self) -> f64 {
        self.slots.values().map(|a| a.balance).sum()
    }

    /// Ordinary-income rate applied to pre-tax withdrawals.
    pub fn pre_tax_withdrawal_rate(&self) -> f64 {
        [AccountKind::PreTax401k, AccountKind::PreTaxIra]
            .iter()
            .find_map(|kind| self.get(*kind).and_then(|a| a.withdrawal_tax_rate))
            .or(self.fallback_withdrawal_rate)
            .unwrap_or(0.0)
            .max(0.0)
    }

    /// Flat rate applied to retirement draws from the taxable account.
    pub fn taxable_withdrawal_rate(&self) -> f64 {
        self.get(AccountKind::Taxable)
            .and_then(|a| a.withdrawal_tax_rate)
            .map(|rate| rate.max(0.0))
            .unwrap_or_else(|| self.pre_tax_withdrawal_rate())
    }

    pub fn taxable_basis(&self) -> f64 {
        let taxable = self.get(AccountKind::Taxable);
        let balance = taxable.map(|a| a.balance).unwrap_or(0.0).max(0.0);
        taxable
            .and_then(|a| a.basis)
            .unwrap_or(balance)
            .clamp(0.0, balance)
    }

    pub fn return_params(&self, kind: AccountKind) -> (f64, f64) {
        let account = self.get(kind);
        let mean = account
            .and_then(|a| a.mean_return)
            .unwrap_or_else(|| kind.default_mean_return());
        let stdev = account
            .and_then(|a| a.stdev_return)
            .unwrap_or_else(|| kind.default_stdev_return())
            .max(0.0);
        (mean, stdev)
    }

    /// Parameters of the shared draw in correlated mode: the Roth IRA, else
    /// the Roth 401k, else the first configured invested account.
    pub fn correlated_reference(&self) -> (f64, f64) {
        let reference = [AccountKind::RothIra, AccountKind::Roth401k]
            .into_iter()
            .chain(AccountKind::INVESTED)
            .find(|kind| self.get(*kind).is_some())
            .unwrap_or(AccountKind::RothIra);
        self.return_params(reference)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AccountsDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pre_tax: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roth: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pre_tax_401k: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pre_tax_ira: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roth_401k: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roth_ira: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    taxable: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cash: Option<Account>,
}

impl From<AccountsDocument> for Accounts {
    fn from(doc: AccountsDocument) -> Self {
        let mut accounts = Accounts::new();
        let split_pre_tax = doc.pre_tax_401k.is_some() || doc.pre_tax_ira.is_some();
        let split_roth = doc.roth_401k.is_some() || doc.roth_ira.is_some();

        if split_pre_tax {
            accounts.fallback_withdrawal_rate =
                doc.pre_tax.as_ref().and_then(|a| a.withdrawal_tax_rate);
        }

        let merged_pre_tax = if split_pre_tax { None } else { doc.pre_tax };
        let merged_roth = if split_roth { None } else { doc.roth };

        for (kind, account) in [
            (AccountKind::PreTax401k, doc.pre_tax_401k.or(merged_pre_tax)),
            (AccountKind::PreTaxIra, doc.pre_tax_ira),
            (AccountKind::Roth401k, doc.roth_401k),
            (AccountKind::RothIra, doc.roth_ira.or(merged_roth)),
            (AccountKind::Taxable, doc.taxable),
            (AccountKind::Cash, doc.cash),
        ] {
            if let Some(account) = account {
                accounts.insert(kind, account);
            }
        }
        accounts
    }
}

impl From<Accounts> for AccountsDocument {
    fn from(mut accounts: Accounts) -> Self {
        let mut take = |kind: AccountKind| accounts.slots.remove(&kind);
        let pre_tax_401k = take(AccountKind::PreTax401k);
        let pre_tax_ira = take(AccountKind::PreTaxIra);
        let roth_401k = take(AccountKind::Roth401k);
        let roth_ira = take(AccountKind::RothIra);
        let taxable = take(AccountKind::Taxable);
        let cash = take(AccountKind::Cash);
        let pre_tax = accounts.fallback_withdrawal_rate.map(|rate| Account {
            withdrawal_tax_rate: Some(rate),
            ..Account::default()
        });
        AccountsDocument {
            pre_tax,
            roth: None,
            pre_tax_401k,
            pre_tax_ira,
            roth_401k,
            roth_ira,
            taxable,
            cash,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Income {
    pub salary: f64,
    pub salary_growth: f64,
    pub tax_rate: f64,
    pub tax_mode: IncomeTaxMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roth_income_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialExpense {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    pub age: u32,
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expenses {
    pub baseline: f64,
    pub special: Vec<SpecialExpense>,
}

impl Expenses {
    /// One-off expenses scheduled for `age`; duplicates at the same age add up.
    pub fn special_at(&self, age: u32) -> f64 {
        self.special
            .iter()
            .filter(|item| item.age == age)
            .map(|item| item.amount)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Assumptions {
    pub returns_correlated: bool,
}

impl Default for Assumptions {
    fn default() -> Self {
        Self {
            returns_correlated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialSecurityPlan {
    #[serde(alias = "PIA")]
    pub pia: f64,
    pub claim_age: u32,
    pub fra: u32,
    pub estimate_from_salary: bool,
}

impl Default for SocialSecurityPlan {
    fn default() -> Self {
        Self {
            pia: 0.0,
            claim_age: 67,
            fra: 67,
            estimate_from_salary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RothConversionPolicy {
    /// Fraction of the prior-year pre-tax balance converted each eligible year.
    pub annual_cap: f64,
    pub start_age: u32,
    pub end_age: u32,
    pub tax_rate: f64,
    pub pay_tax_from_taxable: bool,
}

impl Default for RothConversionPolicy {
    fn default() -> Self {
        Self {
            annual_cap: 0.0,
            start_age: 0,
            end_age: 0,
            tax_rate: 0.0,
            pay_tax_from_taxable: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalBracket {
    pub pre_tax_limit: f64,
}

/// Complete input for one projection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    pub current_age: u32,
    pub retire_age: u32,
    pub end_age: u32,
    pub birth_year: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub filing_status: FilingStatus,
    pub tax_year: u32,
    pub accounts: Accounts,
    pub income: Income,
    pub expenses: Expenses,
    pub assumptions: Assumptions,
    pub social_security: SocialSecurityPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roth_conversion: Option<RothConversionPolicy>,
    pub withdrawal_strategy: WithdrawalStrategy,
    pub withdrawal_bracket: WithdrawalBracket,
    pub simulations: u32,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            current_age: 55,
            retire_age: 65,
            end_age: 90,
            birth_year: 1900,
            state: None,
            filing_status: FilingStatus::Single,
            tax_year: 2024,
            accounts: Accounts::default(),
            income: Income::default(),
            expenses: Expenses::default(),
            assumptions: Assumptions::default(),
            social_security: SocialSecurityPlan::default(),
            roth_conversion: None,
            withdrawal_strategy: WithdrawalStrategy::Standard,
            withdrawal_bracket: WithdrawalBracket::default(),
            simulations: 1000,
        }
    }
}

impl Plan {
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Reads a plan document, treating `null` as missing and accepting
    /// whole-number floats wherever an integer is expected.
    pub fn from_value(mut value: Value) -> Result<Self, PlanError> {
        relax_numbers(&mut value);
        Ok(Self::deserialize(value)?)
    }

    /// `deserialize_with` hook for plans embedded in other documents.
    pub fn deserialize_relaxed<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }

    pub fn to_json(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every simulated age, `current_age..=end_age`; empty when the horizon is inverted.
    pub fn ages(&self) -> Vec<u32> {
        (self.current_age..=self.end_age).collect()
    }

    pub fn state_code(&self) -> Option<&str> {
        self.state
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }
}

fn relax_numbers(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, field| !field.is_null());
            map.values_mut().for_each(relax_numbers);
        }
        Value::Array(items) => {
            items.retain(|item| !item.is_null());
            items.iter_mut().for_each(relax_numbers);
        }
        Value::Number(number) if number.is_f64() => {
            let whole = number
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < MAX_EXACT_WHOLE);
            if let Some(whole) = whole {
                *number = if whole >= 0.0 {
                    Number::from(whole as u64)
                } else {
                    Number::from(whole as i64)
                };
            }
        }
        _ => {}
    }
}
