use super::results::{AccountBalances, AccountSeries, Ledger, LedgerYear, PathResult, TaxBreakdown};
use super::rng::Rng;
use super::taxes::TaxTables;
use super::types::{AccountKind, Accounts, IncomeTaxMode, Plan, WithdrawalStrategy};
use super::{rmd, roth, social_security};

const EPSILON: f64 = 1e-9;

/// Upper bound on draw rounds when covering a deficit; capital-gains tax on
/// each taxable sale feeds back into the need, so the loop must be bounded.
const MAX_DRAW_ROUNDS: usize = 64;

/// How yearly returns are drawn for one path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnModel {
    /// One shared draw; each account keeps its mean offset from the reference.
    Correlated { mean: f64, stdev: f64 },
    /// One draw per invested account, in canonical order.
    Independent,
}

impl ReturnModel {
    pub fn for_plan(plan: &Plan) -> Self {
        if plan.assumptions.returns_correlated {
            let (mean, stdev) = plan.accounts.correlated_reference();
            ReturnModel::Correlated { mean, stdev }
        } else {
            ReturnModel::Independent
        }
    }

    fn apply(self, accounts: &Accounts, holdings: &mut Holdings, rng: &mut Rng) {
        match self {
            ReturnModel::Correlated {
                mean: reference_mean,
                stdev,
            } => {
                let shared = rng.normal(reference_mean, stdev);
                for kind in AccountKind::INVESTED {
                    let (mean, _) = accounts.return_params(kind);
                    holdings.grow(kind, shared + (mean - reference_mean));
                }
            }
            ReturnModel::Independent => {
                for kind in AccountKind::INVESTED {
                    let (mean, stdev) = accounts.return_params(kind);
                    holdings.grow(kind, rng.normal(mean, stdev));
                }
            }
        }
        holdings.taxable_basis = holdings.taxable_basis.min(holdings.balance(AccountKind::Taxable));
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sale {
    gross: f64,
    gain: f64,
}

/// Mutable balances for one path. Never shared between paths.
#[derive(Debug, Clone)]
struct Holdings {
    slots: [f64; 6],
    taxable_basis: f64,
    /// Needs that could not be funded, accumulated over the path.
    unfunded: f64,
}

impl Holdings {
    fn from_accounts(accounts: &Accounts) -> Self {
        let mut slots = [0.0; 6];
        for (kind, account) in accounts.iter() {
            slots[kind.index()] = account.balance.max(0.0);
        }
        Self {
            slots,
            taxable_basis: accounts.taxable_basis(),
            unfunded: 0.0,
        }
    }

    fn balance(&self, kind: AccountKind) -> f64 {
        self.slots[kind.index()]
    }

    fn pre_tax(&self) -> f64 {
        self.balance(AccountKind::PreTax401k) + self.balance(AccountKind::PreTaxIra)
    }

    fn roth(&self) -> f64 {
        self.balance(AccountKind::Roth401k) + self.balance(AccountKind::RothIra)
    }

    fn credit(&mut self, kind: AccountKind, amount: f64) {
        if amount > 0.0 {
            self.slots[kind.index()] += amount;
        }
    }

    /// Takes up to `amount`, never more than the balance. Returns what was taken.
    fn debit(&mut self, kind: AccountKind, amount: f64) -> f64 {
        let taken = amount.clamp(0.0, self.balance(kind));
        self.slots[kind.index()] -= taken;
        taken
    }

    fn debit_pre_tax(&mut self, amount: f64) -> f64 {
        let first = self.debit(AccountKind::PreTax401k, amount);
        first + self.debit(AccountKind::PreTaxIra, amount - first)
    }

    fn debit_roth(&mut self, amount: f64) -> f64 {
        let first = self.debit(AccountKind::Roth401k, amount);
        first + self.debit(AccountKind::RothIra, amount - first)
    }

    /// Sells from the taxable account, releasing basis in proportion.
    fn sell_taxable(&mut self, amount: f64) -> Sale {
        let balance = self.balance(AccountKind::Taxable);
        let gross = amount.clamp(0.0, balance);
        if gross <= 0.0 {
            return Sale::default();
        }
        let basis_used = gross * (self.taxable_basis / balance).clamp(0.0, 1.0);
        self.taxable_basis = (self.taxable_basis - basis_used).max(0.0);
        self.slots[AccountKind::Taxable.index()] -= gross;
        Sale {
            gross,
            gain: (gross - basis_used).max(0.0),
        }
    }

    fn buy_taxable(&mut self, amount: f64) {
        if amount > 0.0 {
            self.credit(AccountKind::Taxable, amount);
            self.taxable_basis += amount;
        }
    }

    fn grow(&mut self, kind: AccountKind, rate: f64) {
        let slot = &mut self.slots[kind.index()];
        *slot = (*slot * (1.0 + rate)).max(0.0);
    }

    fn snapshot(&self) -> AccountBalances {
        AccountBalances::from_slots(&self.slots)
    }

    fn net_worth(&self) -> f64 {
        self.slots.iter().sum::<f64>() - self.unfunded
    }
}

#[derive(Debug, Default)]
struct YearFlows {
    withdrawals: f64,
    rmd: f64,
    realized_gains: f64,
    taxes: TaxBreakdown,
    shortfall: f64,
}

fn grossed_up(net: f64, rate: f64) -> f64 {
    if rate < 1.0 {
        net / (1.0 - rate.max(0.0))
    } else {
        net
    }
}

fn net_of(gross: f64, rate: f64) -> f64 {
    gross * (1.0 - rate.clamp(0.0, 1.0))
}

/// Per-plan values resolved once before the year loop.
struct PathContext<'a> {
    plan: &'a Plan,
    tables: &'a TaxTables,
    returns: ReturnModel,
    pre_tax_rate: f64,
    taxable_rate: f64,
    rmd_start_age: u32,
    social_security: f64,
}

impl<'a> PathContext<'a> {
    fn new(plan: &'a Plan, tables: &'a TaxTables) -> Self {
        let ss = &plan.social_security;
        let pia = if ss.pia > 0.0 {
            ss.pia
        } else if ss.estimate_from_salary {
            social_security::estimate_pia(
                plan.current_age,
                plan.retire_age,
                plan.income.salary,
                plan.income.salary_growth,
            )
        } else {
            0.0
        };
        let social_security = if pia > 0.0 {
            social_security::social_security_benefit(pia, ss.claim_age, ss.fra)
        } else {
            0.0
        };

        Self {
            plan,
            tables,
            returns: ReturnModel::for_plan(plan),
            pre_tax_rate: plan.accounts.pre_tax_withdrawal_rate(),
            taxable_rate: plan.accounts.taxable_withdrawal_rate(),
            rmd_start_age: rmd::rmd_start_age(plan.birth_year),
            social_security,
        }
    }

    fn capital_gains_tax(&self, gain: f64) -> f64 {
        self.tables
            .capital_gains_tax(gain, self.plan.filing_status, self.plan.tax_year)
    }

    fn income_tax(&self, income: f64) -> f64 {
        match self.plan.income.tax_mode {
            IncomeTaxMode::Flat => income.max(0.0) * self.plan.income.tax_rate.max(0.0),
            IncomeTaxMode::Brackets => {
                self.tables
                    .federal_tax(income, self.plan.filing_status, self.plan.tax_year)
            }
        }
    }

    fn advance_year(
        &self,
        holdings: &mut Holdings,
        age: u32,
        salary: &mut f64,
        rng: &mut Rng,
    ) -> LedgerYear {
        let plan = self.plan;
        let prior_pre_tax = holdings.pre_tax();
        let working = age < plan.retire_age;
        let mut flows = YearFlows::default();

        let earned = if working {
            let current = *salary;
            *salary *= 1.0 + plan.income.salary_growth;
            current
        } else {
            0.0
        };
        let benefit = if age >= plan.social_security.claim_age {
            self.social_security
        } else {
            0.0
        };
        let income = earned + benefit;
        let expenses = plan.expenses.baseline.max(0.0) + plan.expenses.special_at(age);

        let mut surplus = income - expenses;
        let pending = if working && surplus > 0.0 {
            self.plan_contributions(age, income, &mut surplus)
        } else {
            [0.0; 6]
        };

        let income_tax = self.income_tax(income);
        flows.taxes.ordinary = income_tax;
        surplus -= income_tax;

        let mut retirement_need = 0.0;
        if surplus < 0.0 {
            if working {
                self.cover_deficit(holdings, &mut flows, -surplus);
            } else {
                retirement_need = -surplus;
            }
        } else {
            holdings.credit(AccountKind::Cash, surplus);
        }

        if let Some(state) = plan.state_code() {
            let base = income + flows.realized_gains;
            let tax = self
                .tables
                .state_tax(base, state, plan.filing_status, plan.tax_year);
            if tax > 0.0 {
                flows.taxes.state = tax;
                self.cover_deficit(holdings, &mut flows, tax);
            }
        }

        self.returns.apply(&plan.accounts, holdings, rng);

        let contributions: f64 = pending.iter().sum();
        for kind in AccountKind::ALL {
            let amount = pending[kind.index()];
            if kind == AccountKind::Taxable {
                holdings.buy_taxable(amount);
            } else {
                holdings.credit(kind, amount);
            }
        }

        let converted = self.convert_to_roth(holdings, &mut flows, prior_pre_tax, age);

        if !working {
            self.fund_retirement(holdings, &mut flows, retirement_need, prior_pre_tax, age);
        }

        let balances = holdings.snapshot();
        LedgerYear {
            age,
            income,
            expenses,
            contributions,
            withdrawals: flows.withdrawals,
            rmd: flows.rmd,
            roth_conversion: converted,
            taxes: flows.taxes,
            total_taxes: flows.taxes.total(),
            shortfall: flows.shortfall,
            balances,
            net_worth: holdings.net_worth(),
        }
    }

    /// Splits a working-year surplus across accounts in priority order.
    fn plan_contributions(&self, age: u32, income: f64, surplus: &mut f64) -> [f64; 6] {
        let plan = self.plan;
        let years_elapsed = age.saturating_sub(plan.current_age);
        let roth_limit = plan.income.roth_income_limit.unwrap_or(f64::INFINITY);
        let mut pending = [0.0; 6];

        for kind in AccountKind::CONTRIBUTION_ORDER {
            if *surplus <= 0.0 {
                break;
            }
            let Some(account) = plan.accounts.get(kind) else {
                continue;
            };
            if kind == AccountKind::RothIra && income > roth_limit {
                continue;
            }
            let amount = account
                .planned_contribution(age, years_elapsed)
                .min(*surplus);
            pending[kind.index()] = amount;
            *surplus -= amount;
        }
        pending
    }

    /// Funds `need` from cash, then taxable, then pre-tax, then Roth.
    fn cover_deficit(&self, holdings: &mut Holdings, flows: &mut YearFlows, need: f64) {
        let mut need = need;
        for _ in 0..MAX_DRAW_ROUNDS {
            if need <= EPSILON {
                break;
            }
            if holdings.balance(AccountKind::Cash) > 0.0 {
                need -= draw_cash(holdings, flows, need);
            } else if holdings.balance(AccountKind::Taxable) > 0.0 {
                let sale = holdings.sell_taxable(need);
                flows.withdrawals += sale.gross;
                flows.realized_gains += sale.gain;
                let tax = self.capital_gains_tax(sale.gain);
                flows.taxes.capital_gains += tax;
                need += tax - sale.gross;
            } else if holdings.pre_tax() > 0.0 {
                need -= draw_pre_tax(holdings, flows, need, self.pre_tax_rate, f64::INFINITY);
            } else if holdings.roth() > 0.0 {
                need -= draw_roth(holdings, flows, need);
            } else {
                break;
            }
        }
        record_unmet(holdings, flows, need);
    }

    fn convert_to_roth(
        &self,
        holdings: &mut Holdings,
        flows: &mut YearFlows,
        prior_pre_tax: f64,
        age: u32,
    ) -> f64 {
        let Some(policy) = &self.plan.roth_conversion else {
            return 0.0;
        };
        let requested = roth::decide_conversion(prior_pre_tax, age, policy);
        if requested <= 0.0 {
            return 0.0;
        }

        let pre_tax = holdings.pre_tax();
        let roth_before = holdings.balance(AccountKind::RothIra);
        let result = roth::apply_conversion(
            pre_tax,
            roth_before,
            requested,
            policy.tax_rate,
            policy.pay_tax_from_taxable,
        );
        let converted = holdings.debit_pre_tax(pre_tax - result.pre_tax);
        holdings.credit(AccountKind::RothIra, result.roth - roth_before);
        flows.taxes.conversion += result.tax;

        if result.tax_due > 0.0 {
            let sale = holdings.sell_taxable(result.tax_due);
            flows.withdrawals += sale.gross;
            let rest = result.tax_due - sale.gross;
            let from_cash = draw_cash(holdings, flows, rest);
            record_unmet(holdings, flows, rest - from_cash);
        }
        converted
    }

    /// Retirement-year funding: the RMD first, then the selected strategy.
    fn fund_retirement(
        &self,
        holdings: &mut Holdings,
        flows: &mut YearFlows,
        need: f64,
        prior_pre_tax: f64,
        age: u32,
    ) {
        let mut need = need;
        let mut rmd_taken = 0.0;

        if age >= self.rmd_start_age && holdings.pre_tax() > 0.0 {
            let required = rmd::compute_rmd(prior_pre_tax, age);
            rmd_taken = holdings.debit_pre_tax(required);
            let net = net_of(rmd_taken, self.pre_tax_rate);
            flows.rmd = rmd_taken;
            flows.withdrawals += rmd_taken;
            flows.taxes.withdrawal += rmd_taken - net;
            if net > need {
                holdings.credit(AccountKind::Cash, net - need);
                need = 0.0;
            } else {
                need -= net;
            }
        }

        match self.plan.withdrawal_strategy {
            WithdrawalStrategy::Standard => {
                need -= draw_taxable(holdings, flows, need, self.taxable_rate);
                need -= draw_pre_tax(holdings, flows, need, self.pre_tax_rate, f64::INFINITY);
            }
            WithdrawalStrategy::Proportional => {
                let taxable_value = net_of(holdings.balance(AccountKind::Taxable), self.taxable_rate);
                let pre_tax_value = net_of(holdings.pre_tax(), self.pre_tax_rate);
                let total = taxable_value + pre_tax_value;
                if total > 0.0 && need > EPSILON {
                    let taxable_share = need * taxable_value / total;
                    need -= draw_taxable(holdings, flows, taxable_share, self.taxable_rate);
                    let pre_tax_share = need.min(pre_tax_value);
                    need -= draw_pre_tax(
                        holdings,
                        flows,
                        pre_tax_share,
                        self.pre_tax_rate,
                        f64::INFINITY,
                    );
                }
            }
            WithdrawalStrategy::TaxBracket => {
                let ceiling =
                    (self.plan.withdrawal_bracket.pre_tax_limit - rmd_taken).max(0.0);
                need -= draw_pre_tax(holdings, flows, need, self.pre_tax_rate, ceiling);
                need -= draw_taxable(holdings, flows, need, self.taxable_rate);
            }
        }

        need -= draw_roth(holdings, flows, need);
        need -= draw_cash(holdings, flows, need);
        record_unmet(holdings, flows, need);
    }
}

/// Sells enough taxable holdings to net `need` after the flat rate.
fn draw_taxable(holdings: &mut Holdings, flows: &mut YearFlows, need: f64, rate: f64) -> f64 {
    if need <= EPSILON {
        return 0.0;
    }
    let sale = holdings.sell_taxable(grossed_up(need, rate));
    let net = net_of(sale.gross, rate);
    flows.withdrawals += sale.gross;
    flows.realized_gains += sale.gain;
    flows.taxes.capital_gains += sale.gross - net;
    net
}

fn draw_pre_tax(
    holdings: &mut Holdings,
    flows: &mut YearFlows,
    need: f64,
    rate: f64,
    gross_ceiling: f64,
) -> f64 {
    if need <= EPSILON || gross_ceiling <= 0.0 {
        return 0.0;
    }
    let taken = holdings.debit_pre_tax(grossed_up(need, rate).min(gross_ceiling));
    let net = net_of(taken, rate);
    flows.withdrawals += taken;
    flows.taxes.withdrawal += taken - net;
    net
}

fn draw_roth(holdings: &mut Holdings, flows: &mut YearFlows, need: f64) -> f64 {
    if need <= EPSILON {
        return 0.0;
    }
    let taken = holdings.debit_roth(need);
    flows.withdrawals += taken;
    taken
}

fn draw_cash(holdings: &mut Holdings, flows: &mut YearFlows, need: f64) -> f64 {
    if need <= EPSILON {
        return 0.0;
    }
    let taken = holdings.debit(AccountKind::Cash, need);
    flows.withdrawals += taken;
    taken
}

fn record_unmet(holdings: &mut Holdings, flows: &mut YearFlows, need: f64) {
    if need > EPSILON {
        flows.shortfall += need;
        holdings.unfunded += need;
    }
}

/// Runs one path against the embedded tax tables.
pub fn simulate_path(plan: &Plan, rng: &mut Rng) -> PathResult {
    simulate_path_with_tables(plan, TaxTables::embedded(), rng)
}

/// Runs one path year by year from `current_age` through `end_age`.
/// The plan is only read; balances live in per-path working state.
pub fn simulate_path_with_tables(plan: &Plan, tables: &TaxTables, rng: &mut Rng) -> PathResult {
    let context = PathContext::new(plan, tables);
    let ages = plan.ages();
    let mut holdings = Holdings::from_accounts(&plan.accounts);
    let mut salary = plan.income.salary.max(0.0);

    let mut net_worth = Vec::with_capacity(ages.len());
    let mut acct_series = AccountSeries::with_capacity(ages.len());
    let mut ledger = Ledger::default();

    for &age in &ages {
        let year = context.advance_year(&mut holdings, age, &mut salary, rng);
        net_worth.push(year.net_worth);
        acct_series.push(&year.balances);
        ledger.push(year);
    }

    PathResult {
        ages,
        net_worth,
        acct_series,
        ledger,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        Account, RothConversionPolicy, SpecialExpense, WithdrawalBracket,
    };
    use crate::core::rng::Rng;
    use proptest::prelude::*;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn still(balance: f64) -> Account {
        Account {
            balance,
            mean_return: Some(0.0),
            stdev_return: Some(0.0),
            ..Account::default()
        }
    }

    fn taxed(balance: f64, rate: f64) -> Account {
        Account {
            withdrawal_tax_rate: Some(rate),
            ..still(balance)
        }
    }

    /// Retired at 65, no income, zero returns everywhere.
    fn retiree(accounts: Accounts, baseline: f64, end_age: u32) -> Plan {
        let mut plan = Plan {
            current_age: 65,
            retire_age: 65,
            end_age,
            accounts,
            ..Plan::default()
        };
        plan.expenses.baseline = baseline;
        plan.assumptions.returns_correlated = false;
        plan
    }

    fn run(plan: &Plan) -> PathResult {
        simulate_path(plan, &mut Rng::new(42))
    }

    #[test]
    fn pre_tax_only_retiree_runs_out_in_second_year() {
        let plan = retiree(
            Accounts::new().with(AccountKind::PreTax401k, taxed(100_000.0, 0.2)),
            50_000.0,
            66,
        );
        let path = run(&plan);

        let first = &path.ledger.years[0];
        // 50,000 / (1 - 0.2)
        assert_approx(first.withdrawals, 62_500.0);
        assert_approx(first.taxes.withdrawal, 12_500.0);
        assert_approx(first.balances.pre_tax_401k, 37_500.0);
        assert_approx(first.shortfall, 0.0);
        assert_approx(path.net_worth[0], 37_500.0);

        let second = &path.ledger.years[1];
        // 37,500 nets 30,000; 20,000 unmet
        assert_approx(second.balances.pre_tax_401k, 0.0);
        assert_approx(second.shortfall, 20_000.0);
        assert_approx(path.terminal_net_worth(), -20_000.0);
    }

    #[test]
    fn surplus_fills_accounts_in_priority_order() {
        let accounts = Accounts::new()
            .with(
                AccountKind::PreTax401k,
                Account {
                    contribution: 20_000.0,
                    ..still(0.0)
                },
            )
            .with(
                AccountKind::RothIra,
                Account {
                    contribution: 6_000.0,
                    ..still(0.0)
                },
            )
            .with(
                AccountKind::Taxable,
                Account {
                    contribution: 5_000.0,
                    ..still(0.0)
                },
            );
        let mut plan = Plan {
            current_age: 30,
            retire_age: 65,
            end_age: 30,
            accounts,
            ..Plan::default()
        };
        plan.income.salary = 50_000.0;
        plan.expenses.baseline = 30_000.0;

        let path = run(&plan);
        let year = &path.ledger.years[0];
        assert_approx(year.contributions, 20_000.0);
        assert_approx(year.balances.pre_tax_401k, 20_000.0);
        assert_approx(year.balances.roth_ira, 0.0);
        assert_approx(year.balances.taxable, 0.0);
        assert_approx(year.balances.cash, 0.0);
    }

    #[test]
    fn leftover_surplus_is_swept_to_cash_after_tax() {
        let accounts = Accounts::new().with(
            AccountKind::Roth401k,
            Account {
                contribution: 5_000.0,
                ..still(0.0)
            },
        );
        let mut plan = Plan {
            current_age: 40,
            retire_age: 65,
            end_age: 40,
            accounts,
            ..Plan::default()
        };
        plan.income.salary = 60_000.0;
        plan.income.tax_rate = 0.1;
        plan.expenses.baseline = 40_000.0;

        let year = &run(&plan).ledger.years[0];
        // 20,000 surplus - 5,000 contribution - 6,000 tax
        assert_approx(year.balances.roth_401k, 5_000.0);
        assert_approx(year.balances.cash, 9_000.0);
        assert_approx(year.taxes.ordinary, 6_000.0);
    }

    #[test]
    fn roth_ira_contribution_skipped_above_income_limit() {
        let accounts = Accounts::new()
            .with(
                AccountKind::RothIra,
                Account {
                    contribution: 7_000.0,
                    ..still(0.0)
                },
            )
            .with(
                AccountKind::Taxable,
                Account {
                    contribution: 3_000.0,
                    ..still(0.0)
                },
            );
        let mut plan = Plan {
            current_age: 40,
            retire_age: 65,
            end_age: 40,
            accounts,
            ..Plan::default()
        };
        plan.income.salary = 200_000.0;
        plan.income.roth_income_limit = Some(150_000.0);
        plan.expenses.baseline = 100_000.0;

        let year = &run(&plan).ledger.years[0];
        assert_approx(year.balances.roth_ira, 0.0);
        assert_approx(year.balances.taxable, 3_000.0);
        assert_approx(year.balances.cash, 97_000.0);
    }

    #[test]
    fn working_deficit_draws_cash_then_taxable_with_gains() {
        let accounts = Accounts::new()
            .with(AccountKind::Cash, still(1_000.0))
            .with(
                AccountKind::Taxable,
                Account {
                    basis: Some(5_000.0),
                    ..still(10_000.0)
                },
            );
        let mut plan = Plan {
            current_age: 40,
            retire_age: 65,
            end_age: 40,
            accounts,
            ..Plan::default()
        };
        plan.expenses.baseline = 5_000.0;

        let year = &run(&plan).ledger.years[0];
        // 1,000 from cash, 4,000 sold at half basis; gains tax at 0%
        assert_approx(year.balances.cash, 0.0);
        assert_approx(year.balances.taxable, 6_000.0);
        assert_approx(year.withdrawals, 5_000.0);
        assert_approx(year.taxes.capital_gains, 0.0);
        assert_approx(year.shortfall, 0.0);
    }

    #[test]
    fn standard_strategy_draws_taxable_first() {
        let plan = retiree(
            Accounts::new()
                .with(AccountKind::PreTax401k, taxed(50_000.0, 0.2))
                .with(AccountKind::Taxable, still(50_000.0)),
            10_000.0,
            65,
        );
        let year = &run(&plan).ledger.years[0];
        // taxable inherits the 0.2 pre-tax rate: 12,500 gross
        assert_approx(year.balances.taxable, 37_500.0);
        assert_approx(year.balances.pre_tax_401k, 50_000.0);
        assert_approx(year.taxes.capital_gains, 2_500.0);
    }

    #[test]
    fn proportional_strategy_splits_by_after_tax_value() {
        let mut plan = retiree(
            Accounts::new()
                .with(AccountKind::PreTax401k, taxed(50_000.0, 0.2))
                .with(AccountKind::Taxable, still(50_000.0)),
            10_000.0,
            65,
        );
        plan.withdrawal_strategy = WithdrawalStrategy::Proportional;

        let year = &run(&plan).ledger.years[0];
        // 5,000 net from each, grossed up to 6,250
        assert_approx(year.balances.taxable, 43_750.0);
        assert_approx(year.balances.pre_tax_401k, 43_750.0);
        assert_approx(year.withdrawals, 12_500.0);
    }

    #[test]
    fn tax_bracket_strategy_fills_pre_tax_ceiling_first() {
        let mut plan = retiree(
            Accounts::new()
                .with(AccountKind::PreTax401k, taxed(50_000.0, 0.2))
                .with(AccountKind::Taxable, still(50_000.0)),
            20_000.0,
            65,
        );
        plan.withdrawal_strategy = WithdrawalStrategy::TaxBracket;
        plan.withdrawal_bracket = WithdrawalBracket {
            pre_tax_limit: 10_000.0,
        };

        let year = &run(&plan).ledger.years[0];
        // 10,000 gross pre-tax nets 8,000; the other 12,000 needs 15,000 taxable
        assert_approx(year.balances.pre_tax_401k, 40_000.0);
        assert_approx(year.balances.taxable, 35_000.0);
    }

    #[test]
    fn pre_tax_draws_empty_401k_before_ira() {
        let plan = retiree(
            Accounts::new()
                .with(AccountKind::PreTax401k, still(5_000.0))
                .with(AccountKind::PreTaxIra, still(20_000.0)),
            8_000.0,
            65,
        );
        let year = &run(&plan).ledger.years[0];
        assert_approx(year.balances.pre_tax_401k, 0.0);
        assert_approx(year.balances.pre_tax_ira, 17_000.0);
    }

    #[test]
    fn roth_then_cash_are_last_resort() {
        let plan = retiree(
            Accounts::new()
                .with(AccountKind::Roth401k, still(3_000.0))
                .with(AccountKind::RothIra, still(3_000.0))
                .with(AccountKind::Cash, still(10_000.0)),
            8_000.0,
            65,
        );
        let year = &run(&plan).ledger.years[0];
        assert_approx(year.balances.roth_401k, 0.0);
        assert_approx(year.balances.roth_ira, 0.0);
        assert_approx(year.balances.cash, 8_000.0);
    }

    #[test]
    fn rmd_excess_is_swept_to_cash() {
        let mut plan = retiree(
            Accounts::new().with(AccountKind::PreTax401k, taxed(265_000.0, 0.1)),
            0.0,
            73,
        );
        plan.current_age = 73;
        plan.retire_age = 65;
        plan.birth_year = 1955;

        let year = &run(&plan).ledger.years[0];
        // 265,000 / 26.5 = 10,000 gross, 9,000 net
        assert_approx(year.rmd, 10_000.0);
        assert_approx(year.balances.pre_tax_401k, 255_000.0);
        assert_approx(year.balances.cash, 9_000.0);
        assert_approx(year.taxes.withdrawal, 1_000.0);
    }

    #[test]
    fn rmd_counts_toward_bracket_ceiling() {
        let mut plan = retiree(
            Accounts::new()
                .with(AccountKind::PreTax401k, still(265_000.0))
                .with(AccountKind::Taxable, still(100_000.0)),
            30_000.0,
            73,
        );
        plan.current_age = 73;
        plan.birth_year = 1955;
        plan.withdrawal_strategy = WithdrawalStrategy::TaxBracket;
        plan.withdrawal_bracket.pre_tax_limit = 25_000.0;

        let year = &run(&plan).ledger.years[0];
        // 10,000 RMD + 15,000 fill, then 5,000 from taxable
        assert_approx(year.balances.pre_tax_401k, 240_000.0);
        assert_approx(year.balances.taxable, 95_000.0);
    }

    #[test]
    fn conversion_moves_capped_amount_and_taxes_from_taxable() {
        let mut plan = Plan {
            current_age: 60,
            retire_age: 70,
            end_age: 60,
            accounts: Accounts::new()
                .with(AccountKind::PreTaxIra, still(100_000.0))
                .with(AccountKind::RothIra, still(0.0))
                .with(AccountKind::Taxable, still(10_000.0)),
            ..Plan::default()
        };
        plan.roth_conversion = Some(RothConversionPolicy {
            annual_cap: 0.1,
            start_age: 60,
            end_age: 65,
            tax_rate: 0.25,
            pay_tax_from_taxable: true,
        });

        let year = &run(&plan).ledger.years[0];
        assert_approx(year.roth_conversion, 10_000.0);
        assert_approx(year.balances.pre_tax_ira, 90_000.0);
        assert_approx(year.balances.roth_ira, 10_000.0);
        assert_approx(year.balances.taxable, 7_500.0);
        assert_approx(year.taxes.conversion, 2_500.0);
    }

    #[test]
    fn withheld_conversion_tax_shrinks_roth_credit() {
        let mut plan = Plan {
            current_age: 60,
            retire_age: 70,
            end_age: 60,
            accounts: Accounts::new().with(AccountKind::PreTax401k, still(100_000.0)),
            ..Plan::default()
        };
        plan.roth_conversion = Some(RothConversionPolicy {
            annual_cap: 0.2,
            start_age: 55,
            end_age: 65,
            tax_rate: 0.25,
            pay_tax_from_taxable: false,
        });

        let year = &run(&plan).ledger.years[0];
        assert_approx(year.balances.pre_tax_401k, 80_000.0);
        assert_approx(year.balances.roth_ira, 15_000.0);
        assert_approx(year.shortfall, 0.0);
    }

    #[test]
    fn unpaid_conversion_tax_falls_to_cash_then_shortfall() {
        let mut plan = Plan {
            current_age: 60,
            retire_age: 70,
            end_age: 60,
            accounts: Accounts::new()
                .with(AccountKind::PreTax401k, still(100_000.0))
                .with(AccountKind::Taxable, still(1_000.0))
                .with(AccountKind::Cash, still(500.0)),
            ..Plan::default()
        };
        plan.roth_conversion = Some(RothConversionPolicy {
            annual_cap: 0.1,
            start_age: 60,
            end_age: 60,
            tax_rate: 0.3,
            pay_tax_from_taxable: true,
        });

        let year = &run(&plan).ledger.years[0];
        // 3,000 due: 1,000 taxable, 500 cash, 1,500 unmet
        assert_approx(year.balances.taxable, 0.0);
        assert_approx(year.balances.cash, 0.0);
        assert_approx(year.shortfall, 1_500.0);
        assert_approx(year.net_worth, 100_000.0 - 1_500.0);
    }

    #[test]
    fn special_expense_hits_only_its_age() {
        let mut plan = retiree(
            Accounts::new().with(AccountKind::Cash, still(50_000.0)),
            1_000.0,
            67,
        );
        plan.expenses.special.push(SpecialExpense {
            label: "car".to_string(),
            age: 66,
            amount: 20_000.0,
        });

        let path = run(&plan);
        let expenses: Vec<f64> = path.ledger.years.iter().map(|y| y.expenses).collect();
        assert_eq!(expenses, vec![1_000.0, 21_000.0, 1_000.0]);
        assert_approx(path.terminal_net_worth(), 27_000.0);
    }

    #[test]
    fn social_security_starts_at_claim_age() {
        let mut plan = retiree(Accounts::new(), 0.0, 68);
        plan.social_security.pia = 2_000.0;
        plan.social_security.claim_age = 67;

        let path = run(&plan);
        let income: Vec<f64> = path.ledger.years.iter().map(|y| y.income).collect();
        assert_eq!(income, vec![0.0, 0.0, 24_000.0, 24_000.0]);
        assert_approx(path.terminal_net_worth(), 48_000.0);
    }

    #[test]
    fn estimated_benefit_used_when_pia_missing() {
        let mut plan = Plan {
            current_age: 64,
            retire_age: 65,
            end_age: 67,
            ..Plan::default()
        };
        plan.income.salary = 60_000.0;
        plan.social_security.estimate_from_salary = true;

        let path = run(&plan);
        let expected = social_security::social_security_benefit(
            social_security::estimate_pia(64, 65, 60_000.0, 0.0),
            67,
            67,
        );
        assert!(expected > 0.0);
        assert_approx(path.ledger.years[3].income, expected);
    }

    #[test]
    fn bracket_income_tax_uses_federal_schedule() {
        let mut plan = Plan {
            current_age: 40,
            retire_age: 65,
            end_age: 40,
            ..Plan::default()
        };
        plan.income.salary = 60_000.0;
        plan.income.tax_mode = IncomeTaxMode::Brackets;

        let year = &run(&plan).ledger.years[0];
        assert_approx(year.taxes.ordinary, 5_216.0);
        assert_approx(year.balances.cash, 60_000.0 - 5_216.0);
    }

    #[test]
    fn state_tax_is_drawn_like_a_deficit() {
        let mut plan = Plan {
            current_age: 40,
            retire_age: 65,
            end_age: 40,
            state: Some("MI".to_string()),
            ..Plan::default()
        };
        plan.income.salary = 40_000.0;
        plan.expenses.baseline = 40_000.0;
        plan.accounts = Accounts::new().with(AccountKind::Cash, still(5_000.0));

        let year = &run(&plan).ledger.years[0];
        assert_approx(year.taxes.state, 1_700.0);
        assert_approx(year.balances.cash, 3_300.0);
    }

    #[test]
    fn salary_grows_after_each_working_year() {
        let mut plan = Plan {
            current_age: 40,
            retire_age: 42,
            end_age: 42,
            ..Plan::default()
        };
        plan.income.salary = 100.0;
        plan.income.salary_growth = 0.1;

        let income: Vec<f64> = run(&plan).ledger.years.iter().map(|y| y.income).collect();
        assert_approx(income[0], 100.0);
        assert_approx(income[1], 110.0);
        assert_approx(income[2], 0.0);
    }

    #[test]
    fn correlated_returns_keep_mean_offsets() {
        let accounts = Accounts::new()
            .with(
                AccountKind::RothIra,
                Account {
                    balance: 100_000.0,
                    mean_return: Some(0.06),
                    stdev_return: Some(0.0),
                    ..Account::default()
                },
            )
            .with(
                AccountKind::PreTax401k,
                Account {
                    balance: 100_000.0,
                    mean_return: Some(0.04),
                    stdev_return: Some(0.5),
                    ..Account::default()
                },
            );
        let plan = Plan {
            current_age: 40,
            retire_age: 65,
            end_age: 40,
            accounts,
            ..Plan::default()
        };

        let year = &run(&plan).ledger.years[0];
        assert_approx(year.balances.roth_ira, 106_000.0);
        assert_approx(year.balances.pre_tax_401k, 104_000.0);
    }

    #[test]
    fn inverted_horizon_yields_empty_path() {
        let plan = Plan {
            current_age: 70,
            end_age: 60,
            ..Plan::default()
        };
        let path = run(&plan);
        assert!(path.ages.is_empty());
        assert!(path.ledger.is_empty());
        assert_eq!(path.terminal_net_worth(), 0.0);
    }

    #[test]
    fn withdrawal_rate_of_one_does_not_blow_up() {
        let plan = retiree(
            Accounts::new()
                .with(AccountKind::PreTax401k, taxed(10_000.0, 1.0))
                .with(AccountKind::Roth401k, still(2_000.0)),
            5_000.0,
            65,
        );
        let year = &run(&plan).ledger.years[0];
        assert!(year.net_worth.is_finite());
        assert_approx(year.balances.pre_tax_401k, 5_000.0);
        assert_approx(year.balances.roth_401k, 0.0);
        assert_approx(year.shortfall, 3_000.0);
    }

    #[test]
    fn plan_is_not_mutated_by_a_path() {
        let plan = retiree(
            Accounts::new().with(AccountKind::PreTax401k, taxed(100_000.0, 0.2)),
            50_000.0,
            70,
        );
        let before = plan.clone();
        let _ = run(&plan);
        assert_eq!(plan, before);
    }

    fn zero_tax_plan(
        start: [f64; 4],
        salary: f64,
        baseline: f64,
        retire_offset: u32,
        years: u32,
    ) -> Plan {
        let [pre_tax, roth, taxable, cash] = start;
        let mut plan = Plan {
            current_age: 60,
            retire_age: 60 + retire_offset,
            end_age: 60 + years,
            birth_year: 1965,
            accounts: Accounts::new()
                .with(
                    AccountKind::PreTax401k,
                    Account {
                        contribution: 5_000.0,
                        ..still(pre_tax)
                    },
                )
                .with(AccountKind::RothIra, still(roth))
                .with(AccountKind::Taxable, still(taxable))
                .with(AccountKind::Cash, still(cash)),
            ..Plan::default()
        };
        plan.income.salary = salary;
        plan.expenses.baseline = baseline;
        plan
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn zero_return_zero_tax_conserves_money(
            pre_tax in 0.0f64..300_000.0,
            roth in 0.0f64..100_000.0,
            taxable in 0.0f64..100_000.0,
            cash in 0.0f64..50_000.0,
            salary in 0.0f64..120_000.0,
            baseline in 0.0f64..90_000.0,
            retire_offset in 0u32..6,
            years in 0u32..12,
        ) {
            let plan = zero_tax_plan([pre_tax, roth, taxable, cash], salary, baseline, retire_offset, years);
            let path = run(&plan);

            let start = pre_tax + roth + taxable + cash;
            let flows: f64 = path
                .ledger
                .years
                .iter()
                .map(|y| y.income - y.expenses)
                .sum();
            let scale = 1.0 + start.abs() + flows.abs();
            prop_assert!((path.terminal_net_worth() - (start + flows)).abs() <= 1e-9 * scale * 100.0);
            for year in &path.ledger.years {
                prop_assert!(year.total_taxes.abs() <= 1e-9 * scale);
            }
        }

        #[test]
        fn rmd_never_below_required_floor(
            balance in 1_000.0f64..2_000_000.0,
            seed in any::<u64>(),
        ) {
            let mut plan = retiree(
                Accounts::new().with(
                    AccountKind::PreTaxIra,
                    Account {
                        balance,
                        withdrawal_tax_rate: Some(0.2),
                        mean_return: Some(0.05),
                        stdev_return: Some(0.15),
                        ..Account::default()
                    },
                ),
                0.0,
                85,
            );
            plan.current_age = 72;
            plan.birth_year = 1950;

            let path = simulate_path(&plan, &mut Rng::new(seed));
            let mut prior = balance;
            for year in &path.ledger.years {
                let required = rmd::compute_rmd(prior, year.age);
                let pre_tax_after = year.balances.class_total(crate::core::types::TaxClass::PreTax);
                prop_assert!(year.rmd + 1e-6 >= required || pre_tax_after <= 1e-9);
                prior = pre_tax_after;
            }
        }

        #[test]
        fn conversions_respect_cap(
            balance in 0.0f64..1_000_000.0,
            cap in 0.0f64..1.5,
            seed in any::<u64>(),
        ) {
            let mut plan = Plan {
                current_age: 55,
                retire_age: 62,
                end_age: 66,
                accounts: Accounts::new()
                    .with(
                        AccountKind::PreTax401k,
                        Account {
                            balance,
                            mean_return: Some(0.05),
                            stdev_return: Some(0.2),
                            ..Account::default()
                        },
                    )
                    .with(AccountKind::Taxable, Account::with_balance(50_000.0)),
                ..Plan::default()
            };
            plan.roth_conversion = Some(RothConversionPolicy {
                annual_cap: cap,
                start_age: 56,
                end_age: 64,
                tax_rate: 0.22,
                pay_tax_from_taxable: true,
            });

            let path = simulate_path(&plan, &mut Rng::new(seed));
            let mut prior = balance;
            for year in &path.ledger.years {
                prop_assert!(year.roth_conversion <= cap.min(1.0) * prior + 1e-6);
                prop_assert!(year.roth_conversion >= 0.0);
                prior = year.balances.class_total(crate::core::types::TaxClass::PreTax);
            }
        }

        #[test]
        fn balances_never_go_negative(
            baseline in 0.0f64..200_000.0,
            seed in any::<u64>(),
        ) {
            let plan = retiree(
                Accounts::new()
                    .with(AccountKind::PreTax401k, Account { balance: 300_000.0, withdrawal_tax_rate: Some(0.25), ..Account::default() })
                    .with(AccountKind::Taxable, Account { balance: 100_000.0, basis: Some(40_000.0), ..Account::default() })
                    .with(AccountKind::RothIra, Account::with_balance(50_000.0)),
                baseline,
                80,
            );
            let path = simulate_path(&plan, &mut Rng::new(seed));
            for year in &path.ledger.years {
                for kind in AccountKind::ALL {
                    prop_assert!(year.balances.get(kind) >= 0.0);
                }
            }
        }
    }

    #[test]
    fn taxable_basis_never_exceeds_balance_after_losses() {
        let accounts = Accounts::new().with(
            AccountKind::Taxable,
            Account {
                basis: Some(80_000.0),
                mean_return: Some(-0.5),
                stdev_return: Some(0.0),
                ..Account::with_balance(100_000.0)
            },
        );
        let mut holdings = Holdings::from_accounts(&accounts);
        ReturnModel::Independent.apply(&accounts, &mut holdings, &mut Rng::new(1));
        assert_approx(holdings.balance(AccountKind::Taxable), 50_000.0);
        assert_approx(holdings.taxable_basis, 50_000.0);

        let mut correlated = Holdings::from_accounts(&accounts);
        ReturnModel::Correlated {
            mean: -0.5,
            stdev: 0.0,
        }
        .apply(&accounts, &mut correlated, &mut Rng::new(2));
        assert_approx(correlated.taxable_basis, 50_000.0);

        let sale = holdings.sell_taxable(10_000.0);
        assert_approx(sale.gain, 0.0);
        assert_approx_tol(holdings.taxable_basis, 40_000.0, 1e-9);
    }
}
