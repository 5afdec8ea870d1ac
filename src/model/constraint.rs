//! Inter-parameter constraints.
//!
//! Constraints are boolean formulas over (parameter, value) pairs. They are
//! evaluated against row assignments and rendered into the covering-array
//! tool's expression syntax by the CA adapter.
use super::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq {
        param: String,
        value: Json,
    },
    Ne {
        param: String,
        value: Json,
    },
    IsNull {
        param: String,
    },
    NotNull {
        param: String,
    },
    And {
        terms: Vec<Condition>,
    },
    Or {
        terms: Vec<Condition>,
    },
    Not {
        term: Box<Condition>,
    },
    Implies {
        premise: Box<Condition>,
        conclusion: Box<Condition>,
    },
}

impl Condition {
    pub fn not_null(param: &str) -> Self {
        Self::NotNull {
            param: param.to_string(),
        }
    }

    pub fn is_null(param: &str) -> Self {
        Self::IsNull {
            param: param.to_string(),
        }
    }

    /// Evaluate against a row. Parameters missing from the row count as null.
    pub fn holds(&self, row: &BTreeMap<String, Value>) -> bool {
        let lookup = |param: &str| row.get(param).filter(|value| !value.is_null());
        match self {
            Self::Eq { param, value } => lookup(param).is_some_and(|found| &found.val == value),
            Self::Ne { param, value } => !lookup(param).is_some_and(|found| &found.val == value),
            Self::IsNull { param } => lookup(param).is_none(),
            Self::NotNull { param } => lookup(param).is_some(),
            Self::And { terms } => terms.iter().all(|term| term.holds(row)),
            Self::Or { terms } => terms.iter().any(|term| term.holds(row)),
            Self::Not { term } => !term.holds(row),
            Self::Implies {
                premise,
                conclusion,
            } => !premise.holds(row) || conclusion.holds(row),
        }
    }
}

/// Shape of a constraint group, as proposed by the oracle or declared in an
/// `x-constraints` extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// The first parameter, when present, requires all others.
    Requires,
    /// At most one of the parameters may be present.
    Exclusive,
    AtLeastOne,
    AllOrNone,
    /// All parameters carry the same value (same-request binding).
    Equal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintGroup {
    pub kind: GroupKind,
    pub params: Vec<String>,
}

impl ConstraintGroup {
    /// Formula for this group, or `None` for groups expressed as bindings
    /// (or with too few parameters to constrain anything).
    pub fn to_condition(&self) -> Option<Condition> {
        if self.params.len() < 2 {
            return None;
        }
        let present: Vec<Condition> = self
            .params
            .iter()
            .map(|param| Condition::not_null(param.as_str()))
            .collect();
        match self.kind {
            GroupKind::Requires => Some(Condition::Implies {
                premise: Box::new(present[0].clone()),
                conclusion: Box::new(Condition::And {
                    terms: present[1..].to_vec(),
                }),
            }),
            GroupKind::Exclusive => {
                let mut terms = Vec::new();
                for (idx, left) in present.iter().enumerate() {
                    for right in &present[idx + 1..] {
                        terms.push(Condition::Not {
                            term: Box::new(Condition::And {
                                terms: vec![left.clone(), right.clone()],
                            }),
                        });
                    }
                }
                Some(Condition::And { terms })
            }
            GroupKind::AtLeastOne => Some(Condition::Or { terms: present }),
            GroupKind::AllOrNone => Some(Condition::Or {
                terms: vec![
                    Condition::And { terms: present },
                    Condition::And {
                        terms: self
                            .params
                            .iter()
                            .map(|param| Condition::is_null(param.as_str()))
                            .collect(),
                    },
                ],
            }),
            GroupKind::Equal => None,
        }
    }
}
