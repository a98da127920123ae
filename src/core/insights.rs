//! Plain-language summary of a simulation result.

use super::results::SimulationResult;

/// What a narrative collaborator is told about a run.
#[derive(Debug, Clone, PartialEq)]
pub struct InsightPrompt {
    pub success_probability: f64,
    pub median_terminal: f64,
    pub final_age: Option<u32>,
}

impl InsightPrompt {
    pub fn from_result(result: &SimulationResult) -> Self {
        Self {
            success_probability: result.success_probability,
            median_terminal: result.median_terminal,
            final_age: result.ages.last().copied(),
        }
    }

    pub fn to_text(&self) -> String {
        let horizon = self
            .final_age
            .map(|age| format!(" at age {age}"))
            .unwrap_or_default();
        format!(
            "Summarise a retirement plan with a {:.0}% success probability and a median net worth{horizon} of {}.",
            self.success_probability * 100.0,
            format_dollars(self.median_terminal)
        )
    }
}

/// Source of narrative text, e.g. a language-model client owned by the caller.
pub trait InsightProvider {
    fn insight(&self, prompt: &InsightPrompt) -> Option<String>;
}

/// Provider text when available, else the rule-based sentence.
pub fn generate_insights(
    result: &SimulationResult,
    provider: Option<&dyn InsightProvider>,
) -> String {
    let prompt = InsightPrompt::from_result(result);
    provider
        .and_then(|provider| provider.insight(&prompt))
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| rule_based_insight(&prompt))
}

pub fn rule_based_insight(prompt: &InsightPrompt) -> String {
    let outlook = if prompt.success_probability >= 0.85 {
        "Your plan has a high chance of success."
    } else if prompt.success_probability >= 0.6 {
        "Your plan has a moderate chance of success."
    } else {
        "Your plan may be at risk."
    };
    match prompt.final_age {
        Some(age) => format!(
            "{outlook} Median projected net worth at age {age} is {}.",
            format_dollars(prompt.median_terminal)
        ),
        None => outlook.to_string(),
    }
}

/// Whole dollars with thousands separators, e.g. `-$1,234,567`.
pub fn format_dollars(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0.0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}
