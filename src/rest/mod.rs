//! REST operation model: operations, their parameters and response shapes.
//!
//! Operations are built once by the ingestion adapter; every execution round
//! re-initialises the parameter factors from hints and constraint groups
//! gathered so far.
mod binding;
mod ingest;
mod matching;
mod path;
mod request;

pub use binding::discover_bindings;
pub use ingest::{load_operations, parse_document};
pub use matching::MatchThresholds;
pub use path::{
    cluster_paths, is_descendant, is_prefix, is_same_or_descendant, parse_template,
    render_template, PathToken,
};
pub use request::{build_request, encode_component};

use crate::model::{
    Binding, BindingTarget, Condition, ConstraintGroup, Factor, GroupKind, Hints, Unresolved,
    Value,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "get" => Some(Self::Get),
            "post" => Some(Self::Post),
            "put" => Some(Self::Put),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation identity: `"{METHOD} {path template}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(method: Method, template: &str) -> Self {
        Self(format!("{method} {template}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Path,
    Query,
    Header,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Json,
    Form,
    Multipart,
}

impl BodyKind {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Form => "application/x-www-form-urlencoded",
            Self::Multipart => "multipart/form-data",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestParam {
    pub location: Location,
    pub factor: Factor,
    /// Multipart part sent as a file upload.
    pub is_file: bool,
}

impl RestParam {
    pub fn new(location: Location, factor: Factor) -> Self {
        Self {
            location,
            factor,
            is_file: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    /// `None` for templates covering a class of codes (`default`).
    pub status_code: Option<u16>,
    /// `(content type, body shape)` pairs.
    pub contents: Vec<(String, Factor)>,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        self.status_code.is_some_and(|code| (200..300).contains(&code))
    }

    pub fn json_shape(&self) -> Option<&Factor> {
        self.contents
            .iter()
            .find(|(content_type, _)| content_type.contains("json"))
            .map(|(_, factor)| factor)
    }
}

#[derive(Debug, Clone)]
pub struct RestOperation {
    pub method: Method,
    pub path: Vec<PathToken>,
    pub params: Vec<RestParam>,
    pub body_kind: Option<BodyKind>,
    /// The whole body is the single `body` parameter (not flattened).
    pub raw_body: bool,
    pub responses: Vec<RestResponse>,
    pub summary: Option<String>,
    /// Groups declared with the description itself.
    pub static_groups: Vec<ConstraintGroup>,
    /// Formulas in force for the current round.
    pub constraints: Vec<Condition>,
    /// `(consumer, target)` global names sharing one value in a request.
    pub input_bindings: Vec<(String, String)>,
}

impl RestOperation {
    pub fn new(method: Method, template: &str) -> Self {
        Self {
            method,
            path: parse_template(template),
            params: Vec::new(),
            body_kind: None,
            raw_body: false,
            responses: Vec::new(),
            summary: None,
            static_groups: Vec::new(),
            constraints: Vec::new(),
            input_bindings: Vec::new(),
        }
    }

    pub fn with_param(mut self, location: Location, factor: Factor) -> Self {
        self.params.push(RestParam::new(location, factor));
        self
    }

    pub fn id(&self) -> OperationId {
        OperationId::new(self.method, &self.template())
    }

    pub fn template(&self) -> String {
        render_template(&self.path)
    }

    pub fn leaves(&self) -> Vec<&Factor> {
        self.params
            .iter()
            .flat_map(|param| param.factor.leaves())
            .collect()
    }

    pub fn leaf_names(&self) -> BTreeSet<String> {
        self.leaves().iter().map(|leaf| leaf.global_name()).collect()
    }

    pub fn find_leaf(&self, global_name: &str) -> Option<&Factor> {
        self.leaves()
            .into_iter()
            .find(|leaf| leaf.global_name() == global_name)
    }

    pub fn path_param_mut(&mut self, name: &str) -> Option<&mut Factor> {
        self.params
            .iter_mut()
            .find(|param| param.location == Location::Path && param.factor.name == name)
            .map(|param| &mut param.factor)
    }

    /// Success response shapes with a JSON body.
    pub fn success_shapes(&self) -> Vec<&Factor> {
        self.responses
            .iter()
            .filter(|response| response.is_success())
            .filter_map(RestResponse::json_shape)
            .collect()
    }

    /// Reset factors and constraints for a new round.
    ///
    /// `extra_groups` carries groupings learned at runtime; groups naming
    /// parameters this operation does not have are ignored.
    pub fn prepare_round(&mut self, hints: &Hints, extra_groups: &[ConstraintGroup]) {
        for param in &mut self.params {
            param.factor.init_equivalences(hints);
        }
        let known = self.leaf_names();
        self.constraints.clear();
        self.input_bindings.clear();
        let groups: Vec<ConstraintGroup> = self
            .static_groups
            .iter()
            .chain(extra_groups)
            .filter(|group| group.params.iter().all(|name| known.contains(name)))
            .cloned()
            .collect();
        for group in groups {
            if group.kind == GroupKind::Equal {
                let Some((target, consumers)) = group.params.split_first() else {
                    continue;
                };
                for consumer in consumers {
                    let pair = (consumer.clone(), target.clone());
                    if consumer != target && !self.input_bindings.contains(&pair) {
                        self.input_bindings.push(pair);
                    }
                }
            } else if let Some(condition) = group.to_condition() {
                if !self.constraints.contains(&condition) {
                    self.constraints.push(condition);
                }
            }
        }
    }

    /// Refresh response bindings; returns how many were dropped.
    pub fn refresh_bindings<'a, F>(&mut self, lookup: &F) -> usize
    where
        F: Fn(&OperationId) -> Option<&'a Json>,
    {
        self.params
            .iter_mut()
            .map(|param| param.factor.update_bindings(lookup))
            .sum()
    }

    /// Regenerate every leaf domain. Leaves that cannot produce a value are
    /// returned with the reason; their domains stay empty.
    pub fn generate_domains<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<(String, Unresolved)> {
        let mut unresolved = Vec::new();
        for param in &mut self.params {
            for leaf in param.factor.leaves_mut() {
                if let Err(err) = leaf.generate_domain(rng) {
                    leaf.domain.clear();
                    unresolved.push((leaf.global_name(), err));
                }
            }
        }
        unresolved
    }

    /// `(global name, domain)` for leaves entering a covering array.
    ///
    /// Leaves with empty domains and consumers of same-request bindings are
    /// left out.
    pub fn domain_map(&self, essential_only: bool) -> Vec<(String, Vec<Value>)> {
        let consumers: BTreeSet<&str> = self
            .input_bindings
            .iter()
            .map(|(consumer, _)| consumer.as_str())
            .collect();
        self.leaves()
            .into_iter()
            .filter(|leaf| !leaf.domain.is_empty())
            .filter(|leaf| !essential_only || leaf.is_essential())
            .filter(|leaf| !consumers.contains(leaf.global_name().as_str()))
            .map(|leaf| (leaf.global_name(), leaf.domain.clone()))
            .collect()
    }

    /// Whether every leaf is essential (no incremental full phase).
    pub fn all_essential(&self) -> bool {
        self.leaves().iter().all(|leaf| leaf.is_essential())
    }

    /// Copy same-request binding targets onto their consumers.
    pub fn apply_input_bindings(&self, row: &mut BTreeMap<String, Value>) {
        for (consumer, target) in &self.input_bindings {
            let Some(leaf) = self.find_leaf(consumer) else {
                continue;
            };
            let data_type = leaf.data_type();
            let resolved = match row.get(target).filter(|value| !value.is_null()) {
                Some(value) => {
                    let mut binding = Binding::new(BindingTarget::Input {
                        factor: target.clone(),
                    });
                    binding.update_from_input(&value.val);
                    binding.generate(data_type).unwrap_or_else(|_| Value::null(data_type))
                }
                None => Value::null(data_type),
            };
            row.insert(consumer.clone(), resolved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Generator;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn search_operation() -> RestOperation {
        RestOperation::new(Method::Get, "/items")
            .with_param(Location::Query, Factor::string("q").required(true))
            .with_param(Location::Query, Factor::string("from"))
            .with_param(Location::Query, Factor::string("to"))
            .with_param(Location::Query, Factor::integer("limit", Some(1), Some(100)))
    }

    #[test]
    fn identity_is_method_and_template() {
        let op = RestOperation::new(Method::Delete, "/items/{id}");
        assert_eq!(op.id().as_str(), "DELETE /items/{id}");
        assert_eq!(op.id(), OperationId::from("DELETE /items/{id}"));
    }

    #[test]
    fn domain_map_respects_essential_filter() {
        let mut op = search_operation();
        op.prepare_round(&Hints::new(), &[]);
        assert!(op.generate_domains(&mut StdRng::seed_from_u64(3)).is_empty());
        let essential: Vec<String> = op.domain_map(true).into_iter().map(|(n, _)| n).collect();
        assert_eq!(essential, vec!["q"]);
        assert_eq!(op.domain_map(false).len(), 4);
        assert!(!op.all_essential());
    }

    #[test]
    fn groups_become_constraints_or_input_bindings() {
        let mut op = search_operation();
        let groups = [
            ConstraintGroup {
                kind: GroupKind::AllOrNone,
                params: vec!["from".to_string(), "to".to_string()],
            },
            ConstraintGroup {
                kind: GroupKind::Equal,
                params: vec!["from".to_string(), "to".to_string()],
            },
            ConstraintGroup {
                kind: GroupKind::Requires,
                params: vec!["missing".to_string(), "q".to_string()],
            },
        ];
        op.prepare_round(&Hints::new(), &groups);
        assert_eq!(op.constraints.len(), 1);
        assert_eq!(op.input_bindings, vec![("to".to_string(), "from".to_string())]);

        op.generate_domains(&mut StdRng::seed_from_u64(3));
        let names: Vec<String> = op.domain_map(false).into_iter().map(|(n, _)| n).collect();
        assert!(!names.contains(&"to".to_string()));

        let mut row = BTreeMap::new();
        row.insert(
            "from".to_string(),
            Value::new(json!("2020"), Generator::Example, crate::model::DataType::String),
        );
        op.apply_input_bindings(&mut row);
        assert_eq!(row["to"].val, json!("2020"));
        assert_eq!(row["to"].generator, Generator::Dynamic);
    }

    #[test]
    fn prepare_round_is_repeatable() {
        let mut op = search_operation();
        let group = ConstraintGroup {
            kind: GroupKind::Exclusive,
            params: vec!["from".to_string(), "limit".to_string()],
        };
        op.prepare_round(&Hints::new(), std::slice::from_ref(&group));
        op.prepare_round(&Hints::new(), std::slice::from_ref(&group));
        assert_eq!(op.constraints.len(), 1);
    }
}
