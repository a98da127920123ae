mod aggregate;
mod engine;
pub mod insights;
mod results;
pub mod rmd;
mod rng;
pub mod roth;
pub mod social_security;
mod solver;
pub mod taxes;
mod types;

pub use aggregate::{percentile, simulate};
pub use engine::{ReturnModel, simulate_path, simulate_path_with_tables};
pub use insights::{InsightPrompt, InsightProvider, generate_insights};
pub use results::{
    AccountBalances, AccountSeries, Ledger, LedgerYear, PathResult, PercentileBands,
    SimulationResult, TaxBreakdown,
};
pub use rng::{Rng, derive_seed};
pub use solver::{
    SolveError, SpendingSolveConfig, SpendingSolveIteration, SpendingSolveResult,
    solve_max_spending,
};
pub use taxes::{
    CombinedTax, TaxTableError, TaxTables, combined_tax, compute_capital_gains_tax,
    compute_federal_tax, compute_state_tax,
};
pub use types::{
    Account, AccountKind, Accounts, Assumptions, Expenses, FilingStatus, Income, IncomeTaxMode,
    Plan, PlanError, RothConversionPolicy, SocialSecurityPlan, SpecialExpense, TaxClass,
    WithdrawalBracket, WithdrawalStrategy,
};
