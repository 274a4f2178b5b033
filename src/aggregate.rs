//! Per-trait averages over the item responses.
//!
//! Response `i` of a model pairs with question `i`. Reverse-keyed items are
//! flipped with `6 - score` before averaging; a trait with no usable score for
//! a model is absent rather than zero.

use std::collections::{BTreeMap, BTreeSet};

use crate::runner::EvaluationResults;
use crate::structured::{MAX_SCORE, MIN_SCORE};

/// Map a raw 1..=5 score onto the reverse-keyed scale (1<->5, 2<->4, 3<->3).
pub fn reverse_transform(score: u8) -> u8 {
    (MIN_SCORE + MAX_SCORE).saturating_sub(score)
}

/// Running sum for one (model, trait) cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Accumulator {
    sum: u32,
    count: u32,
}

impl Accumulator {
    fn push(&mut self, score: u8) {
        self.sum += u32::from(score);
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(f64::from(self.sum) / f64::from(self.count))
        }
    }
}

/// Trait averages for every model in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitAverages {
    /// Sorted trait labels found in the question bank.
    pub traits: Vec<String>,
    /// Model names in evaluation order.
    pub models: Vec<String>,
    averages: BTreeMap<(String, String), f64>,
}

impl TraitAverages {
    /// Mean post-transform score, or `None` when the trait has no data for the model.
    pub fn get(&self, model: &str, trait_name: &str) -> Option<f64> {
        self.averages
            .get(&(model.to_string(), trait_name.to_string()))
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    /// Row-major view: one row per trait, one cell per model.
    pub fn rows(&self) -> Vec<(&str, Vec<Option<f64>>)> {
        self.traits
            .iter()
            .map(|t| {
                let cells = self.models.iter().map(|m| self.get(m, t)).collect();
                (t.as_str(), cells)
            })
            .collect()
    }
}

/// Compute the mean score per (model, trait).
pub fn aggregate(results: &EvaluationResults) -> TraitAverages {
    let traits: BTreeSet<String> = results
        .questions
        .iter()
        .filter_map(|q| q.trait_name.clone())
        .collect();

    let mut averages = BTreeMap::new();
    let mut models = Vec::with_capacity(results.model_evaluations.len());

    for evaluation in &results.model_evaluations {
        models.push(evaluation.model_name.clone());

        let mut per_trait: BTreeMap<&str, Accumulator> = BTreeMap::new();
        for (question, response) in results.questions.iter().zip(&evaluation.responses) {
            let (Some(trait_name), Some(score)) = (question.trait_name.as_deref(), response.score)
            else {
                continue;
            };
            let score = if question.reverse {
                reverse_transform(score)
            } else {
                score
            };
            per_trait.entry(trait_name).or_default().push(score);
        }

        for (trait_name, acc) in per_trait {
            if let Some(mean) = acc.mean() {
                averages.insert((evaluation.model_name.clone(), trait_name.to_string()), mean);
            }
        }
    }

    TraitAverages {
        traits: traits.into_iter().collect(),
        models,
        averages,
    }
}

/// Format a mean for reports: two decimals or "N/A".
pub fn format_average(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => "N/A".to_string(),
    }
}
