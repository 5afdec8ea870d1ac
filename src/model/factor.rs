//! Typed parameter factors.
//!
//! A factor partitions a parameter's value space into equivalence classes and
//! keeps one generated value per class in `domain`. Object and array factors
//! are structural only: they own children and compose printable values, but
//! have no domain of their own.
use super::equivalence::{BindingTarget, Equivalence, Unresolved};
use super::value::{DataType, Generator, Value};
use crate::rest::OperationId;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

/// Separator used in global (dotted) factor names.
pub const NAME_DELIMITER: &str = ".";
/// Name given to the single representative item of an array factor.
pub const ARRAY_ITEM_NAME: &str = "_item";

pub const DEFAULT_INT_MIN: i64 = i32::MIN as i64;
pub const DEFAULT_INT_MAX: i64 = i32::MAX as i64;
const DEFAULT_STRING_SPAN: usize = 16;

/// Per-factor hint values (keyed by global name) folded in as examples.
pub type Hints = BTreeMap<String, Vec<Json>>;

#[derive(Debug, Clone)]
pub enum FactorKind {
    String {
        min_length: usize,
        max_length: Option<usize>,
        pattern: Option<String>,
    },
    Integer {
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    Number {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Boolean,
    Enum {
        values: Vec<Json>,
        data_type: DataType,
    },
    Date,
    Time,
    DateTime,
    Array {
        item: Box<Factor>,
    },
    Object {
        properties: Vec<Factor>,
    },
}

#[derive(Debug, Clone)]
pub struct Factor {
    pub name: String,
    /// Names of the ancestors, root first. Captured when the factor is
    /// attached so no back-reference to the parent is needed.
    pub parent_path: Vec<String>,
    pub required: bool,
    ancestors_required: bool,
    pub description: Option<String>,
    pub default: Option<Json>,
    pub examples: Vec<Json>,
    /// Static producer/consumer relations registered at model build time.
    pub bindings: Vec<BindingTarget>,
    pub domain: Vec<Value>,
    pub equivalences: Vec<Equivalence>,
    pub kind: FactorKind,
}

impl Factor {
    pub fn new(name: impl Into<String>, kind: FactorKind) -> Self {
        let mut factor = Self {
            name: name.into(),
            parent_path: Vec::new(),
            required: false,
            ancestors_required: true,
            description: None,
            default: None,
            examples: Vec::new(),
            bindings: Vec::new(),
            domain: Vec::new(),
            equivalences: Vec::new(),
            kind,
        };
        factor.propagate();
        factor
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FactorKind::String {
                min_length: 0,
                max_length: None,
                pattern: None,
            },
        )
    }

    pub fn integer(name: impl Into<String>, minimum: Option<i64>, maximum: Option<i64>) -> Self {
        Self::new(name, FactorKind::Integer { minimum, maximum })
    }

    pub fn number(name: impl Into<String>, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        Self::new(name, FactorKind::Number { minimum, maximum })
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FactorKind::Boolean)
    }

    pub fn enumeration(name: impl Into<String>, values: Vec<Json>) -> Self {
        let data_type = match values.first() {
            Some(Json::Bool(_)) => DataType::Boolean,
            Some(Json::Number(number)) if number.is_i64() || number.is_u64() => DataType::Integer,
            Some(Json::Number(_)) => DataType::Number,
            _ => DataType::String,
        };
        Self::new(name, FactorKind::Enum { values, data_type })
    }

    pub fn object(name: impl Into<String>, properties: Vec<Factor>) -> Self {
        Self::new(name, FactorKind::Object { properties })
    }

    pub fn array(name: impl Into<String>, mut item: Factor) -> Self {
        item.name = ARRAY_ITEM_NAME.to_string();
        Self::new(
            name,
            FactorKind::Array {
                item: Box::new(item),
            },
        )
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self.propagate();
        self
    }

    pub fn with_default(mut self, default: Option<Json>) -> Self {
        self.default = default;
        self
    }

    pub fn with_examples(mut self, examples: Vec<Json>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Re-root this factor under `path`.
    pub fn set_parent_path(&mut self, path: Vec<String>, ancestors_required: bool) {
        self.parent_path = path;
        self.ancestors_required = ancestors_required;
        self.propagate();
    }

    fn propagate(&mut self) {
        let mut child_path = self.parent_path.clone();
        child_path.push(self.name.clone());
        let child_required = self.required && self.ancestors_required;
        match &mut self.kind {
            FactorKind::Object { properties } => {
                for child in properties {
                    child.set_parent_path(child_path.clone(), child_required);
                }
            }
            FactorKind::Array { item } => item.set_parent_path(child_path, child_required),
            _ => {}
        }
    }

    pub fn global_name(&self) -> String {
        let mut parts = self.parent_path.clone();
        parts.push(self.name.clone());
        parts.join(NAME_DELIMITER)
    }

    /// Required along the whole path from the root.
    pub fn is_essential(&self) -> bool {
        self.required && self.ancestors_required
    }

    /// Whether any current equivalence class admits `val`.
    pub fn accepts(&self, val: &Json) -> bool {
        self.equivalences.iter().any(|class| class.check(val))
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind,
            FactorKind::Object { .. } | FactorKind::Array { .. }
        )
    }

    pub fn data_type(&self) -> DataType {
        match &self.kind {
            FactorKind::String { .. } => DataType::String,
            FactorKind::Integer { .. } => DataType::Integer,
            FactorKind::Number { .. } => DataType::Number,
            FactorKind::Boolean => DataType::Boolean,
            FactorKind::Enum { data_type, .. } => *data_type,
            FactorKind::Date => DataType::Date,
            FactorKind::Time => DataType::Time,
            FactorKind::DateTime => DataType::DateTime,
            FactorKind::Array { .. } => DataType::Array,
            FactorKind::Object { .. } => DataType::Object,
        }
    }

    pub fn children(&self) -> Vec<&Factor> {
        match &self.kind {
            FactorKind::Object { properties } => properties.iter().collect(),
            FactorKind::Array { item } => vec![item.as_ref()],
            _ => Vec::new(),
        }
    }

    pub fn leaves(&self) -> Vec<&Factor> {
        if !self.is_structural() {
            return vec![self];
        }
        self.children()
            .into_iter()
            .flat_map(|child| child.leaves())
            .collect()
    }

    pub fn leaves_mut(&mut self) -> Vec<&mut Factor> {
        let mut out = Vec::new();
        self.collect_leaves_mut(&mut out);
        out
    }

    fn collect_leaves_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Factor>) {
        if !self.is_structural() {
            out.push(self);
            return;
        }
        match &mut self.kind {
            FactorKind::Object { properties } => {
                for child in properties {
                    child.collect_leaves_mut(out);
                }
            }
            FactorKind::Array { item } => item.collect_leaves_mut(out),
            _ => {}
        }
    }

    pub fn find(&self, global_name: &str) -> Option<&Factor> {
        if self.global_name() == global_name {
            return Some(self);
        }
        self.children()
            .into_iter()
            .find_map(|child| child.find(global_name))
    }

    /// Rebuild the equivalence classes from static constraints, registered
    /// bindings and hint values. Clears any previous classes and domain.
    pub fn init_equivalences(&mut self, hints: &Hints) {
        self.equivalences.clear();
        self.domain.clear();
        if self.is_structural() {
            for child in self.leaves_mut() {
                child.init_equivalences(hints);
            }
            return;
        }

        for target in &self.bindings {
            if matches!(target, BindingTarget::Response { .. }) {
                self.equivalences
                    .push(Equivalence::Binding(super::equivalence::Binding::new(
                        target.clone(),
                    )));
            }
        }

        let mut literals: Vec<Json> = Vec::new();
        if let Some(default) = &self.default {
            self.equivalences
                .push(Equivalence::fixed(default.clone(), Generator::Default));
            literals.push(default.clone());
        }
        let hinted = hints.get(&self.global_name()).cloned().unwrap_or_default();
        for example in self.examples.iter().chain(hinted.iter()) {
            if example.is_null() || literals.contains(example) {
                continue;
            }
            literals.push(example.clone());
            self.equivalences
                .push(Equivalence::fixed(example.clone(), Generator::Example));
        }

        let classes = self.kind_equivalences(&literals);
        self.equivalences.extend(classes);

        if !self.is_essential() {
            self.equivalences.push(Equivalence::Null);
        }
    }

    fn kind_equivalences(&self, literals: &[Json]) -> Vec<Equivalence> {
        match &self.kind {
            FactorKind::String {
                min_length,
                max_length,
                pattern,
            } => {
                if let Some(pattern) = pattern {
                    if let Ok(regex) = Regex::new(pattern) {
                        let candidates = literals
                            .iter()
                            .filter_map(|literal| literal.as_str().map(str::to_string))
                            .collect();
                        return vec![Equivalence::Pattern { regex, candidates }];
                    }
                }
                let min = if max_length == &Some(0) {
                    0
                } else {
                    (*min_length).max(1)
                };
                let max = max_length
                    .unwrap_or(usize::MAX)
                    .min(min.saturating_add(DEFAULT_STRING_SPAN))
                    .max(min);
                vec![Equivalence::StringLength { min, max }]
            }
            FactorKind::Integer { minimum, maximum } => {
                let (min, max) = int_range(*minimum, *maximum);
                int_classes(min, max)
            }
            FactorKind::Number { minimum, maximum } => {
                let (min, max) = float_range(*minimum, *maximum);
                float_classes(min, max)
            }
            FactorKind::Boolean => vec![
                Equivalence::fixed(Json::Bool(true), Generator::Enum),
                Equivalence::fixed(Json::Bool(false), Generator::Enum),
            ],
            FactorKind::Enum { values, .. } => values
                .iter()
                .filter(|value| !literals.contains(value))
                .map(|value| Equivalence::fixed(value.clone(), Generator::Enum))
                .collect(),
            FactorKind::Date => vec![Equivalence::DateRange {
                lo: default_date_min(),
                hi: default_date_max(),
            }],
            FactorKind::Time => vec![Equivalence::TimeRange {
                lo: NaiveTime::default(),
                hi: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
            }],
            FactorKind::DateTime => vec![Equivalence::DateTimeRange {
                lo: NaiveDateTime::new(default_date_min(), NaiveTime::default()),
                hi: NaiveDateTime::new(default_date_max(), NaiveTime::default()),
            }],
            FactorKind::Array { .. } | FactorKind::Object { .. } => Vec::new(),
        }
    }

    /// Refresh response bindings from the latest recorded responses.
    ///
    /// A binding whose target operation has no recorded response (or whose
    /// field is missing) is dropped, leaving the remaining classes.
    /// Returns how many bindings were dropped.
    pub fn update_bindings<'a, F>(&mut self, lookup: &F) -> usize
    where
        F: Fn(&OperationId) -> Option<&'a Json>,
    {
        if self.is_structural() {
            return self
                .leaves_mut()
                .into_iter()
                .map(|leaf| leaf.update_bindings(lookup))
                .sum();
        }
        let before = self.equivalences.len();
        self.equivalences.retain_mut(|class| {
            let Equivalence::Binding(binding) = class else {
                return true;
            };
            let BindingTarget::Response { operation, .. } = &binding.target else {
                return true;
            };
            match lookup(operation) {
                Some(body) => binding.update_from_response(body),
                None => false,
            }
        });
        before - self.equivalences.len()
    }

    /// Regenerate the domain: one value per class, in class order.
    pub fn generate_domain<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), Unresolved> {
        self.domain.clear();
        if self.is_structural() {
            let mut first_error = None;
            for leaf in self.leaves_mut() {
                if let Err(err) = leaf.generate_domain(rng) {
                    first_error.get_or_insert(err);
                }
            }
            return first_error.map_or(Ok(()), Err);
        }
        if self.equivalences.is_empty() {
            return Err(Unresolved::NoEquivalences {
                factor: self.global_name(),
            });
        }
        let data_type = self.data_type();
        let mut domain = Vec::with_capacity(self.equivalences.len());
        for class in &self.equivalences {
            domain.push(class.generate(data_type, rng)?);
        }
        self.domain = domain;
        Ok(())
    }

    /// Compose the JSON value sent for this factor from a row assignment.
    ///
    /// Leaves assigned `Null` (or not assigned) are omitted; structural
    /// factors keep only their active children.
    pub fn printable(&self, assignment: &BTreeMap<String, Value>) -> Option<Json> {
        match &self.kind {
            FactorKind::Object { properties } => {
                let mut map = Map::new();
                for child in properties {
                    if let Some(val) = child.printable(assignment) {
                        map.insert(child.name.clone(), val);
                    }
                }
                if map.is_empty() && !self.is_essential() {
                    return None;
                }
                Some(Json::Object(map))
            }
            FactorKind::Array { item } => match item.printable(assignment) {
                Some(val) => Some(Json::Array(vec![val])),
                None if self.is_essential() => Some(Json::Array(Vec::new())),
                None => None,
            },
            _ => assignment
                .get(&self.global_name())
                .filter(|value| !value.is_null())
                .map(|value| value.val.clone()),
        }
    }
}

fn default_date_min() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn default_date_max() -> NaiveDate {
    NaiveDate::from_ymd_opt(2099, 12, 31).unwrap_or_default()
}

/// Fill the missing side of a one-sided range. The default span applies
/// unless the declared side already lies beyond it.
fn int_range(minimum: Option<i64>, maximum: Option<i64>) -> (i64, i64) {
    match (minimum, maximum) {
        (Some(lo), None) if lo >= DEFAULT_INT_MAX => (lo, lo.saturating_add(DEFAULT_INT_MAX)),
        (None, Some(hi)) if hi <= DEFAULT_INT_MIN => (hi.saturating_add(DEFAULT_INT_MIN), hi),
        (lo, hi) => (lo.unwrap_or(DEFAULT_INT_MIN), hi.unwrap_or(DEFAULT_INT_MAX)),
    }
}

fn float_range(minimum: Option<f64>, maximum: Option<f64>) -> (f64, f64) {
    let (default_lo, default_hi) = (DEFAULT_INT_MIN as f64, DEFAULT_INT_MAX as f64);
    match (minimum, maximum) {
        (Some(lo), None) if lo >= default_hi => (lo, lo + default_hi),
        (None, Some(hi)) if hi <= default_lo => (hi + default_lo, hi),
        (lo, hi) => (lo.unwrap_or(default_lo), hi.unwrap_or(default_hi)),
    }
}

/// Boundary plus partition classes for an integer range.
fn int_classes(min: i64, max: i64) -> Vec<Equivalence> {
    let mut classes = vec![Equivalence::fixed(Json::from(min), Generator::Random)];
    if max == min {
        return classes;
    }
    if min < 0 && 0 < max {
        if min + 1 < 0 {
            classes.push(Equivalence::IntRange { lo: min, hi: 0 });
        }
        classes.push(Equivalence::fixed(Json::from(0), Generator::Random));
        if 1 < max {
            classes.push(Equivalence::IntRange { lo: 0, hi: max });
        }
    } else if min + 1 < max {
        classes.push(Equivalence::IntRange { lo: min, hi: max });
    }
    classes.push(Equivalence::fixed(Json::from(max), Generator::Random));
    classes
}

fn float_classes(min: f64, max: f64) -> Vec<Equivalence> {
    let number = |val: f64| {
        serde_json::Number::from_f64(val)
            .map(Json::Number)
            .unwrap_or(Json::Null)
    };
    let mut classes = vec![Equivalence::fixed(number(min), Generator::Random)];
    if max <= min {
        return classes;
    }
    if min < 0.0 && 0.0 < max {
        classes.push(Equivalence::FloatRange { lo: min, hi: 0.0 });
        classes.push(Equivalence::fixed(number(0.0), Generator::Random));
        classes.push(Equivalence::FloatRange { lo: 0.0, hi: max });
    } else {
        classes.push(Equivalence::FloatRange { lo: min, hi: max });
    }
    classes.push(Equivalence::fixed(number(max), Generator::Random));
    classes
}
