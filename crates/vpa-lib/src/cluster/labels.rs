//! Label selectors and the cluster-wide label-set intern table

use crate::models::Labels;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Operator of a set-based selector requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One set-based requirement on a label key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelRequirement {
    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.map_or(false, |v| self.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Pod label selector: every `match_labels` pair and every requirement must hold
///
/// An empty selector matches every label set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelRequirement>,
}

impl LabelSelector {
    pub fn from_labels(labels: &[(&str, &str)]) -> Self {
        Self {
            match_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for requirement in &self.match_expressions {
            parts.push(match requirement.operator {
                SelectorOperator::In => {
                    format!("{} in ({})", requirement.key, requirement.values.join(","))
                }
                SelectorOperator::NotIn => {
                    format!("{} notin ({})", requirement.key, requirement.values.join(","))
                }
                SelectorOperator::Exists => requirement.key.clone(),
                SelectorOperator::DoesNotExist => format!("!{}", requirement.key),
            });
        }
        write!(f, "{}", parts.join(","))
    }
}

/// Handle to an interned label set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelSetId(u32);

impl fmt::Display for LabelSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "labels#{}", self.0)
    }
}

/// Content-addressed table of label sets
///
/// Structurally equal label sets share one id, so pods of the same
/// workload generation collapse onto the same aggregation keys.
#[derive(Debug, Default)]
pub struct LabelSetInterner {
    ids: HashMap<Labels, LabelSetId>,
    sets: Vec<Labels>,
}

impl LabelSetInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, labels: &Labels) -> LabelSetId {
        if let Some(id) = self.ids.get(labels) {
            return *id;
        }
        let id = LabelSetId(self.sets.len() as u32);
        self.sets.push(labels.clone());
        self.ids.insert(labels.clone(), id);
        id
    }

    /// Labels behind an id handed out by this table
    pub fn get(&self, id: LabelSetId) -> &Labels {
        &self.sets[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector::from_labels(&[("app", "web")]);
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(LabelSelector::default().matches(&labels(&[("any", "thing")])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                LabelRequirement {
                    key: "env".to_string(),
                    operator: SelectorOperator::In,
                    values: vec!["prod".to_string(), "staging".to_string()],
                },
                LabelRequirement {
                    key: "canary".to_string(),
                    operator: SelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        };

        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("canary", "true")])));
        assert_eq!(selector.to_string(), "env in (prod,staging),!canary");
    }

    #[test]
    fn test_interner_shares_ids_for_equal_sets() {
        let mut interner = LabelSetInterner::new();
        let a = interner.intern(&labels(&[("app", "web"), ("tier", "front")]));
        let b = interner.intern(&labels(&[("tier", "front"), ("app", "web")]));
        let c = interner.intern(&labels(&[("app", "db")]));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.len(), 2);
        assert_eq!(interner.get(c).get("app").map(String::as_str), Some("db"));
    }
}
