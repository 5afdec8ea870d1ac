//! Equivalence classes: one semantically distinct region of a parameter's
//! value space, able to produce a representative value and recognise members.
use super::value::{coerce, DataType, Generator, Value};
use crate::rest::OperationId;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::VecDeque;

/// Attempts made to draw an interior value before accepting an endpoint.
pub const RANGE_RETRIES: usize = 5;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A factor cannot produce a value right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unresolved {
    #[error("binding on {target} has not been updated")]
    BindingNotUpdated { target: String },
    #[error("no candidate matches pattern {pattern}")]
    NoPatternMatch { pattern: String },
    #[error("factor {factor} has no equivalence classes")]
    NoEquivalences { factor: String },
}

/// What a binding draws its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingTarget {
    /// A field of the latest response recorded for another operation.
    Response {
        operation: OperationId,
        field: String,
        data_type: DataType,
    },
    /// Another parameter of the same request, by global name.
    Input { factor: String },
}

impl BindingTarget {
    pub fn describe(&self) -> String {
        match self {
            Self::Response {
                operation, field, ..
            } => format!("{operation}#{field}"),
            Self::Input { factor } => format!("input:{factor}"),
        }
    }
}

/// An `EqualTo` relation whose value must be refreshed before use.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub target: BindingTarget,
    resolved: Option<Json>,
}

impl Binding {
    pub fn new(target: BindingTarget) -> Self {
        Self {
            target,
            resolved: None,
        }
    }

    /// Refresh from a response body. Returns false when the field is absent,
    /// which leaves the binding unresolved.
    pub fn update_from_response(&mut self, body: &Json) -> bool {
        let BindingTarget::Response { field, .. } = &self.target else {
            return false;
        };
        match find_field(body, field) {
            Some(found) if !found.is_null() => {
                self.resolved = Some(found.clone());
                true
            }
            _ => {
                self.resolved = None;
                false
            }
        }
    }

    pub fn update_from_input(&mut self, val: &Json) {
        self.resolved = Some(val.clone());
    }

    pub fn generate(&self, data_type: DataType) -> Result<Value, Unresolved> {
        match &self.resolved {
            Some(val) => Ok(Value::new(
                coerce(val, data_type),
                Generator::Dynamic,
                data_type,
            )),
            None => Err(Unresolved::BindingNotUpdated {
                target: self.target.describe(),
            }),
        }
    }
}

/// Look up a (possibly dotted) field in a response body.
///
/// Arrays are entered through their first element. When the dotted path
/// does not match, the last segment is searched breadth-first.
pub fn find_field<'a>(body: &'a Json, field: &str) -> Option<&'a Json> {
    if let Some(found) = walk_path(body, field) {
        return Some(found);
    }
    let leaf = field.rsplit('.').next().unwrap_or(field);
    let mut queue = VecDeque::from([body]);
    while let Some(node) = queue.pop_front() {
        match node {
            Json::Object(map) => {
                if let Some(found) = map.get(leaf) {
                    return Some(found);
                }
                queue.extend(map.values());
            }
            Json::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

fn walk_path<'a>(body: &'a Json, field: &str) -> Option<&'a Json> {
    let mut node = body;
    for segment in field.split('.') {
        while let Json::Array(items) = node {
            node = items.first()?;
        }
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

#[derive(Debug, Clone)]
pub enum Equivalence {
    /// A literal: enum member, boundary, zero, default or example.
    Fixed { value: Json, generator: Generator },
    Null,
    /// Open integer interval `(lo, hi)`.
    IntRange { lo: i64, hi: i64 },
    /// Open float interval `(lo, hi)`.
    FloatRange { lo: f64, hi: f64 },
    DateRange { lo: NaiveDate, hi: NaiveDate },
    TimeRange { lo: NaiveTime, hi: NaiveTime },
    DateTimeRange { lo: NaiveDateTime, hi: NaiveDateTime },
    StringLength { min: usize, max: usize },
    Pattern { regex: Regex, candidates: Vec<String> },
    Binding(Binding),
}

impl Equivalence {
    pub fn fixed(value: Json, generator: Generator) -> Self {
        Self::Fixed { value, generator }
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> String {
        match self {
            Self::Fixed { value, generator } => format!("{generator}:{value}"),
            Self::Null => "null".to_string(),
            Self::IntRange { lo, hi } => format!("int({lo},{hi})"),
            Self::FloatRange { lo, hi } => format!("float({lo},{hi})"),
            Self::DateRange { lo, hi } => format!("date({lo},{hi})"),
            Self::TimeRange { lo, hi } => format!("time({lo},{hi})"),
            Self::DateTimeRange { lo, hi } => format!("datetime({lo},{hi})"),
            Self::StringLength { min, max } => format!("len[{min},{max}]"),
            Self::Pattern { regex, .. } => format!("pattern({})", regex.as_str()),
            Self::Binding(binding) => format!("bind({})", binding.target.describe()),
        }
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        data_type: DataType,
        rng: &mut R,
    ) -> Result<Value, Unresolved> {
        let random = |val: Json| Value::new(val, Generator::Random, data_type);
        match self {
            Self::Fixed { value, generator } => Ok(Value::new(value.clone(), *generator, data_type)),
            Self::Null => Ok(Value::null(data_type)),
            Self::IntRange { lo, hi } => Ok(random(Json::from(sample_interior_int(*lo, *hi, rng)))),
            Self::FloatRange { lo, hi } => {
                let sampled = sample_interior_float(*lo, *hi, rng);
                Ok(random(
                    serde_json::Number::from_f64(sampled)
                        .map(Json::Number)
                        .unwrap_or(Json::Null),
                ))
            }
            Self::DateRange { lo, hi } => {
                let span = (*hi - *lo).num_days();
                let offset = sample_interior_int(0, span, rng);
                let date = *lo + Duration::days(offset);
                Ok(random(Json::String(date.format(DATE_FORMAT).to_string())))
            }
            Self::TimeRange { lo, hi } => {
                let span = (*hi - *lo).num_seconds();
                let offset = sample_interior_int(0, span, rng);
                let (time, _) = lo.overflowing_add_signed(Duration::seconds(offset));
                Ok(random(Json::String(time.format(TIME_FORMAT).to_string())))
            }
            Self::DateTimeRange { lo, hi } => {
                let span = (*hi - *lo).num_seconds();
                let offset = sample_interior_int(0, span, rng);
                let stamp = *lo + Duration::seconds(offset);
                Ok(random(Json::String(stamp.format(DATETIME_FORMAT).to_string())))
            }
            Self::StringLength { min, max } => {
                let len = if max > min {
                    rng.gen_range(*min..=*max)
                } else {
                    *min
                };
                let text: String = (0..len)
                    .map(|_| char::from(rng.sample(Alphanumeric)))
                    .collect();
                Ok(random(Json::String(text)))
            }
            Self::Pattern { regex, candidates } => candidates
                .iter()
                .find(|candidate| regex.is_match(candidate))
                .map(|candidate| Value::new(Json::String(candidate.clone()), Generator::Example, data_type))
                .ok_or_else(|| Unresolved::NoPatternMatch {
                    pattern: regex.as_str().to_string(),
                }),
            Self::Binding(binding) => binding.generate(data_type),
        }
    }

    /// Whether `val` belongs to this class.
    pub fn check(&self, val: &Json) -> bool {
        match self {
            Self::Fixed { value, .. } => val == value,
            Self::Null => val.is_null(),
            Self::IntRange { lo, hi } => val.as_i64().is_some_and(|v| *lo < v && v < *hi),
            Self::FloatRange { lo, hi } => val.as_f64().is_some_and(|v| *lo < v && v < *hi),
            Self::DateRange { lo, hi } => val
                .as_str()
                .and_then(|text| NaiveDate::parse_from_str(text, DATE_FORMAT).ok())
                .is_some_and(|date| *lo <= date && date <= *hi),
            Self::TimeRange { lo, hi } => val
                .as_str()
                .and_then(|text| NaiveTime::parse_from_str(text, TIME_FORMAT).ok())
                .is_some_and(|time| *lo <= time && time <= *hi),
            Self::DateTimeRange { lo, hi } => val
                .as_str()
                .and_then(|text| NaiveDateTime::parse_from_str(text, DATETIME_FORMAT).ok())
                .is_some_and(|stamp| *lo <= stamp && stamp <= *hi),
            Self::StringLength { min, max } => val.as_str().is_some_and(|text| {
                let len = text.chars().count();
                *min <= len && len <= *max
            }),
            Self::Pattern { regex, .. } => val.as_str().is_some_and(|text| regex.is_match(text)),
            Self::Binding(binding) => binding
                .resolved
                .as_ref()
                .is_some_and(|resolved| resolved == val || render_eq(resolved, val)),
        }
    }
}

fn render_eq(left: &Json, right: &Json) -> bool {
    super::value::render_plain(left) == super::value::render_plain(right)
}

/// Draw from `[lo, hi]`, retrying a few times to stay off the endpoints.
/// Boundaries have dedicated classes; after the retries the last draw is
/// returned even if it is an endpoint.
pub fn sample_interior_int<R: Rng + ?Sized>(lo: i64, hi: i64, rng: &mut R) -> i64 {
    if hi <= lo {
        return lo;
    }
    let mut sampled = lo;
    for _ in 0..RANGE_RETRIES {
        sampled = rng.gen_range(lo..=hi);
        if sampled != lo && sampled != hi {
            return sampled;
        }
    }
    sampled
}

pub fn sample_interior_float<R: Rng + ?Sized>(lo: f64, hi: f64, rng: &mut R) -> f64 {
    if hi <= lo {
        return lo;
    }
    let mut sampled = lo;
    for _ in 0..RANGE_RETRIES {
        sampled = rng.gen_range(lo..=hi);
        if sampled != lo && sampled != hi {
            return sampled;
        }
    }
    sampled
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn response_target(field: &str) -> BindingTarget {
        BindingTarget::Response {
            operation: OperationId::from("POST /items"),
            field: field.to_string(),
            data_type: DataType::Integer,
        }
    }

    #[test]
    fn binding_fails_until_updated() {
        let mut binding = Binding::new(response_target("id"));
        assert!(matches!(
            binding.generate(DataType::Integer),
            Err(Unresolved::BindingNotUpdated { .. })
        ));
        assert!(binding.update_from_response(&json!({"id": 42})));
        let value = binding.generate(DataType::Integer).expect("resolved");
        assert_eq!(value.val, json!(42));
        assert_eq!(value.generator, Generator::Dynamic);
    }

    #[test]
    fn binding_update_with_missing_field_stays_unresolved() {
        let mut binding = Binding::new(response_target("id"));
        assert!(!binding.update_from_response(&json!({"name": "x"})));
        assert!(binding.generate(DataType::Integer).is_err());
    }

    #[test]
    fn find_field_walks_paths_arrays_and_nested_objects() {
        let body = json!({"data": [{"item": {"id": 7}}]});
        assert_eq!(find_field(&body, "data.item.id"), Some(&json!(7)));
        assert_eq!(find_field(&body, "id"), Some(&json!(7)));
        assert_eq!(find_field(&json!([{"id": 3}, {"id": 4}]), "id"), Some(&json!(3)));
        assert_eq!(find_field(&body, "missing"), None);
    }

    #[test]
    fn interior_sampling_avoids_endpoints_when_possible() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let sampled = sample_interior_int(-10, 0, &mut rng);
            assert!((-10..=0).contains(&sampled));
        }
        let mut interior = 0;
        for _ in 0..200 {
            let sampled = sample_interior_int(0, 2, &mut rng);
            if sampled == 1 {
                interior += 1;
            }
        }
        assert!(interior > 150, "retries should mostly land inside: {interior}");
    }

    #[test]
    fn range_classes_generate_members() {
        let mut rng = StdRng::seed_from_u64(11);
        let class = Equivalence::IntRange { lo: -100, hi: 0 };
        let value = class.generate(DataType::Integer, &mut rng).expect("value");
        assert!(class.check(&value.val));
        assert_eq!(value.generator, Generator::Random);

        let lo = NaiveDate::from_ymd_opt(2020, 1, 1).expect("date");
        let hi = NaiveDate::from_ymd_opt(2020, 12, 31).expect("date");
        let class = Equivalence::DateRange { lo, hi };
        let value = class.generate(DataType::Date, &mut rng).expect("value");
        assert!(class.check(&value.val), "{:?}", value.val);

        let class = Equivalence::StringLength { min: 3, max: 5 };
        let value = class.generate(DataType::String, &mut rng).expect("value");
        assert!(class.check(&value.val));
    }

    #[test]
    fn pattern_without_matching_candidate_is_unresolved() {
        let mut rng = StdRng::seed_from_u64(1);
        let class = Equivalence::Pattern {
            regex: Regex::new("^[0-9]{3}$").expect("regex"),
            candidates: vec!["abc".to_string(), "123".to_string()],
        };
        let value = class.generate(DataType::String, &mut rng).expect("value");
        assert_eq!(value.val, json!("123"));
        let class = Equivalence::Pattern {
            regex: Regex::new("^[0-9]{3}$").expect("regex"),
            candidates: vec!["abc".to_string()],
        };
        assert!(matches!(
            class.generate(DataType::String, &mut rng),
            Err(Unresolved::NoPatternMatch { .. })
        ));
    }
}
