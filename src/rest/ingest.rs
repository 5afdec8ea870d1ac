//! OpenAPI 3 / Swagger 2 ingestion.
//!
//! Only the shape the test generator needs is kept: operations, parameter
//! factors with their static constraints, and response body shapes. Local
//! `$ref`s are followed; anything malformed is a hard error.
use super::{BodyKind, Location, Method, PathToken, RestOperation, RestParam, RestResponse};
use crate::model::{ConstraintGroup, Factor, FactorKind};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value as Json};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Longest `$ref` chain followed before giving up.
const MAX_REF_HOPS: usize = 32;
/// Deepest schema nesting turned into factors; deeper properties are cut.
const MAX_SCHEMA_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct ApiDescription {
    pub title: String,
    pub servers: Vec<String>,
    pub operations: Vec<RestOperation>,
}

/// Read a description from disk (YAML by extension, JSON otherwise).
pub fn load_operations(path: &Path) -> Result<ApiDescription> {
    let text = fs::read_to_string(path).with_context(|| format!("read spec {}", path.display()))?;
    let yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    let doc: Json = if yaml {
        serde_yaml::from_str(&text).with_context(|| format!("parse YAML {}", path.display()))?
    } else {
        serde_json::from_str(&text).with_context(|| format!("parse JSON {}", path.display()))?
    };
    parse_document(&doc).with_context(|| format!("ingest {}", path.display()))
}

pub fn parse_document(doc: &Json) -> Result<ApiDescription> {
    let swagger2 = doc.get("swagger").is_some();
    if !swagger2 && doc.get("openapi").is_none() {
        bail!("document has neither an `openapi` nor a `swagger` version field");
    }
    let reader = Reader { doc, swagger2 };
    let title = doc
        .pointer("/info/title")
        .and_then(Json::as_str)
        .unwrap_or("api")
        .to_string();
    let servers = reader.servers();
    let paths = doc
        .get("paths")
        .and_then(Json::as_object)
        .ok_or_else(|| anyhow!("document has no `paths` object"))?;

    let mut operations = Vec::new();
    for (template, item) in paths {
        let item = reader.deref(item)?;
        let shared = item.get("parameters").and_then(Json::as_array);
        for method_name in ["get", "post", "put", "delete"] {
            let Some(node) = item.get(method_name) else {
                continue;
            };
            let Some(method) = Method::parse(method_name) else {
                continue;
            };
            let op = reader
                .operation(method, template, node, shared)
                .with_context(|| format!("operation {} {template}", method.as_str()))?;
            operations.push(op);
        }
    }
    tracing::info!(
        title = %title,
        operations = operations.len(),
        "api description loaded"
    );
    Ok(ApiDescription {
        title,
        servers,
        operations,
    })
}

struct Reader<'a> {
    doc: &'a Json,
    swagger2: bool,
}

fn parse_bound(val: Option<&Json>) -> Option<f64> {
    val.and_then(Json::as_f64)
}

impl<'a> Reader<'a> {
    fn servers(&self) -> Vec<String> {
        if self.swagger2 {
            let Some(host) = self.doc.get("host").and_then(Json::as_str) else {
                return Vec::new();
            };
            let scheme = self
                .doc
                .get("schemes")
                .and_then(Json::as_array)
                .and_then(|schemes| schemes.first())
                .and_then(Json::as_str)
                .unwrap_or("http");
            let base_path = self.doc.get("basePath").and_then(Json::as_str).unwrap_or("");
            return vec![format!("{scheme}://{host}{}", base_path.trim_end_matches('/'))];
        }
        self.doc
            .get("servers")
            .and_then(Json::as_array)
            .map(|servers| {
                servers
                    .iter()
                    .filter_map(|server| server.get("url").and_then(Json::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Follow `$ref` chains to the referenced node.
    fn deref<'n>(&self, node: &'n Json) -> Result<&'n Json>
    where
        'a: 'n,
    {
        let mut current = node;
        for _ in 0..MAX_REF_HOPS {
            let Some(reference) = current.get("$ref").and_then(Json::as_str) else {
                return Ok(current);
            };
            let pointer = reference
                .strip_prefix('#')
                .ok_or_else(|| anyhow!("only local $ref is supported (got {reference})"))?;
            current = self
                .doc
                .pointer(pointer)
                .ok_or_else(|| anyhow!("unresolvable $ref {reference}"))?;
        }
        Err(anyhow!("$ref chain longer than {MAX_REF_HOPS} hops"))
    }

    /// Resolve refs and combinators into one plain schema object.
    fn flatten(&self, schema: &Json, hops: usize) -> Result<Json> {
        if hops > MAX_REF_HOPS {
            bail!("schema composition nested deeper than {MAX_REF_HOPS}");
        }
        let schema = self.deref(schema)?;
        let Some(object) = schema.as_object() else {
            return Ok(schema.clone());
        };
        let mut merged: Map<String, Json> = object.clone();
        if let Some(branches) = object.get("allOf").and_then(Json::as_array) {
            merged.remove("allOf");
            let mut properties = merged
                .remove("properties")
                .and_then(|props| props.as_object().cloned())
                .unwrap_or_default();
            let mut required: Vec<Json> = merged
                .remove("required")
                .and_then(|req| req.as_array().cloned())
                .unwrap_or_default();
            for branch in branches {
                let branch = self.flatten(branch, hops + 1)?;
                let Some(branch) = branch.as_object() else {
                    continue;
                };
                for (key, val) in branch {
                    match key.as_str() {
                        "properties" => {
                            for (name, prop) in val.as_object().into_iter().flatten() {
                                properties.entry(name.clone()).or_insert_with(|| prop.clone());
                            }
                        }
                        "required" => {
                            for name in val.as_array().into_iter().flatten() {
                                if !required.contains(name) {
                                    required.push(name.clone());
                                }
                            }
                        }
                        _ => {
                            merged.entry(key.clone()).or_insert_with(|| val.clone());
                        }
                    }
                }
            }
            if !properties.is_empty() {
                merged.insert("properties".to_string(), Json::Object(properties));
                merged
                    .entry("type".to_string())
                    .or_insert_with(|| Json::String("object".to_string()));
            }
            if !required.is_empty() {
                merged.insert("required".to_string(), Json::Array(required));
            }
        }
        for combinator in ["oneOf", "anyOf"] {
            let Some(first) = object
                .get(combinator)
                .and_then(Json::as_array)
                .and_then(|branches| branches.first())
            else {
                continue;
            };
            merged.remove(combinator);
            let branch = self.flatten(first, hops + 1)?;
            for (key, val) in branch.as_object().into_iter().flatten() {
                merged.entry(key.clone()).or_insert_with(|| val.clone());
            }
        }
        Ok(Json::Object(merged))
    }

    fn schema_type(schema: &Json) -> String {
        match schema.get("type") {
            Some(Json::String(kind)) => kind.clone(),
            Some(Json::Array(kinds)) => kinds
                .iter()
                .filter_map(Json::as_str)
                .find(|kind| *kind != "null")
                .unwrap_or("string")
                .to_string(),
            _ if schema.get("properties").is_some() => "object".to_string(),
            _ if schema.get("items").is_some() => "array".to_string(),
            _ => "string".to_string(),
        }
    }

    /// Build a factor for `schema`. `None` when the nesting is cut off.
    fn factor(&self, name: &str, schema: &Json, depth: usize) -> Result<Option<Factor>> {
        if depth > MAX_SCHEMA_DEPTH {
            return Ok(None);
        }
        let schema = self.flatten(schema, 0)?;
        let kind = Self::schema_type(&schema);
        let enum_values = schema
            .get("enum")
            .and_then(Json::as_array)
            .map(|values| values.iter().filter(|val| !val.is_null()).cloned().collect::<Vec<_>>())
            .filter(|values| !values.is_empty());
        let factor = if let Some(values) = enum_values {
            Factor::enumeration(name, values)
        } else {
            match kind.as_str() {
                "integer" => {
                    let (minimum, maximum) = int_bounds(&schema)?;
                    Factor::integer(name, minimum, maximum)
                }
                "number" => {
                    let (minimum, maximum) = float_bounds(&schema)?;
                    Factor::number(name, minimum, maximum)
                }
                "boolean" => Factor::boolean(name),
                "array" => {
                    let item = match schema.get("items") {
                        Some(items) => self.factor(name, items, depth + 1)?,
                        None => Some(Factor::string(name)),
                    };
                    let Some(item) = item else {
                        return Ok(None);
                    };
                    Factor::array(name, item.required(true))
                }
                "object" => {
                    let required = required_names(&schema);
                    let mut children = Vec::new();
                    for (prop_name, prop) in schema
                        .get("properties")
                        .and_then(Json::as_object)
                        .into_iter()
                        .flatten()
                    {
                        if let Some(child) = self.factor(prop_name, prop, depth + 1)? {
                            children.push(child.required(required.contains(prop_name.as_str())));
                        }
                    }
                    Factor::object(name, children)
                }
                _ => match schema.get("format").and_then(Json::as_str) {
                    Some("date") => Factor::new(name, FactorKind::Date),
                    Some("date-time") => Factor::new(name, FactorKind::DateTime),
                    Some("time") => Factor::new(name, FactorKind::Time),
                    _ => string_factor(name, &schema)?,
                },
            }
        };
        let mut examples: Vec<Json> = Vec::new();
        if let Some(example) = schema.get("example").filter(|val| !val.is_null()) {
            examples.push(example.clone());
        }
        if let Some(listed) = schema.get("examples").and_then(Json::as_array) {
            examples.extend(listed.iter().filter(|val| !val.is_null()).cloned());
        }
        if factor.is_structural() {
            examples.clear();
        }
        Ok(Some(
            factor
                .with_description(
                    schema
                        .get("description")
                        .and_then(Json::as_str)
                        .map(str::to_string),
                )
                .with_default(schema.get("default").filter(|val| !val.is_null()).cloned())
                .with_examples(examples),
        ))
    }

    fn param_location(raw: &str) -> Option<Location> {
        match raw {
            "path" => Some(Location::Path),
            "query" => Some(Location::Query),
            "header" => Some(Location::Header),
            "body" | "formData" => Some(Location::Body),
            _ => None,
        }
    }

    fn operation(
        &self,
        method: Method,
        template: &str,
        node: &'a Json,
        shared: Option<&'a Vec<Json>>,
    ) -> Result<RestOperation> {
        let mut op = RestOperation::new(method, template);
        op.summary = node
            .get("summary")
            .or_else(|| node.get("description"))
            .and_then(Json::as_str)
            .map(str::to_string);

        let own = node.get("parameters").and_then(Json::as_array);
        let mut declared: Vec<&Json> = Vec::new();
        for param in own.into_iter().flatten() {
            declared.push(self.deref(param)?);
        }
        for param in shared.into_iter().flatten() {
            let param = self.deref(param)?;
            let key = (param.get("name"), param.get("in"));
            if !declared
                .iter()
                .any(|known| (known.get("name"), known.get("in")) == key)
            {
                declared.push(param);
            }
        }

        let mut form_fields = false;
        let mut has_file = false;
        for param in declared {
            let name = param
                .get("name")
                .and_then(Json::as_str)
                .ok_or_else(|| anyhow!("parameter without a name"))?;
            let raw_location = param.get("in").and_then(Json::as_str).unwrap_or("");
            let Some(location) = Self::param_location(raw_location) else {
                continue;
            };
            let required = location == Location::Path
                || param.get("required").and_then(Json::as_bool).unwrap_or(false);
            if raw_location == "body" {
                let schema = param
                    .get("schema")
                    .ok_or_else(|| anyhow!("body parameter {name} has no schema"))?;
                self.attach_body(&mut op, BodyKind::Json, schema, required)?;
                continue;
            }
            let is_file = param.get("type").and_then(Json::as_str) == Some("file");
            let schema = if self.swagger2 {
                param
            } else {
                param.get("schema").unwrap_or(param)
            };
            let factor = if is_file {
                Some(Factor::string(name))
            } else {
                self.factor(name, schema, 0)?
            };
            let Some(mut factor) = factor else {
                continue;
            };
            if factor.description.is_none() {
                factor.description = param
                    .get("description")
                    .and_then(Json::as_str)
                    .map(str::to_string);
            }
            if let Some(example) = param.get("example").filter(|val| !val.is_null()) {
                if !factor.is_structural() && !factor.examples.contains(example) {
                    factor.examples.push(example.clone());
                }
            }
            if raw_location == "formData" {
                form_fields = true;
                has_file |= is_file;
            }
            op.params.push(RestParam {
                location,
                factor: factor.required(required),
                is_file,
            });
        }
        if form_fields {
            let consumes_multipart = node
                .get("consumes")
                .or_else(|| self.doc.get("consumes"))
                .and_then(Json::as_array)
                .is_some_and(|types| {
                    types
                        .iter()
                        .filter_map(Json::as_str)
                        .any(|kind| kind.starts_with("multipart/"))
                });
            op.body_kind = Some(if has_file || consumes_multipart {
                BodyKind::Multipart
            } else {
                BodyKind::Form
            });
        }

        if let Some(body) = node.get("requestBody") {
            let body = self.deref(body)?;
            let required = body.get("required").and_then(Json::as_bool).unwrap_or(false);
            if let Some(content) = body.get("content").and_then(Json::as_object) {
                let chosen = [
                    ("application/json", BodyKind::Json),
                    ("application/x-www-form-urlencoded", BodyKind::Form),
                    ("multipart/form-data", BodyKind::Multipart),
                ]
                .into_iter()
                .find_map(|(content_type, kind)| content.get(content_type).map(|media| (media, kind)))
                .or_else(|| {
                    content
                        .iter()
                        .find(|(content_type, _)| content_type.contains("json"))
                        .map(|(_, media)| (media, BodyKind::Json))
                });
                if let Some((media, kind)) = chosen {
                    if let Some(schema) = media.get("schema") {
                        self.attach_body(&mut op, kind, schema, required)?;
                    }
                }
            }
        }

        for token in op.path.clone() {
            let PathToken::Param(name) = token else {
                continue;
            };
            if op.path_param_mut(&name).is_none() {
                op.params
                    .push(RestParam::new(Location::Path, Factor::string(name).required(true)));
            }
        }

        if let Some(responses) = node.get("responses").and_then(Json::as_object) {
            for (code, response) in responses {
                let response = self.deref(response)?;
                op.responses.push(self.response(code, response)?);
            }
        }

        if let Some(groups) = node.get("x-constraints") {
            op.static_groups = serde_json::from_value::<Vec<ConstraintGroup>>(groups.clone())
                .context("parse x-constraints")?;
        }
        Ok(op)
    }

    fn attach_body(
        &self,
        op: &mut RestOperation,
        kind: BodyKind,
        schema: &Json,
        required: bool,
    ) -> Result<()> {
        op.body_kind = Some(kind);
        let flattened = self.flatten(schema, 0)?;
        let properties = flattened.get("properties").and_then(Json::as_object);
        match properties {
            Some(properties) if Self::schema_type(&flattened) == "object" => {
                let required_props = required_names(&flattened);
                for (name, prop) in properties {
                    let Some(factor) = self.factor(name, prop, 1)? else {
                        continue;
                    };
                    let is_file = kind == BodyKind::Multipart
                        && prop.get("format").and_then(Json::as_str) == Some("binary");
                    op.params.push(RestParam {
                        location: Location::Body,
                        factor: factor.required(required_props.contains(name.as_str())),
                        is_file,
                    });
                }
            }
            _ => {
                op.raw_body = true;
                if let Some(factor) = self.factor("body", schema, 0)? {
                    op.params
                        .push(RestParam::new(Location::Body, factor.required(required)));
                }
            }
        }
        Ok(())
    }

    fn response(&self, code: &str, response: &Json) -> Result<RestResponse> {
        let status_code = code.parse::<u16>().ok();
        let mut contents = Vec::new();
        if self.swagger2 {
            if let Some(schema) = response.get("schema") {
                if let Some(shape) = self.factor("body", schema, 0)? {
                    contents.push(("application/json".to_string(), shape.required(true)));
                }
            }
        } else if let Some(content) = response.get("content").and_then(Json::as_object) {
            for (content_type, media) in content {
                let Some(schema) = media.get("schema") else {
                    continue;
                };
                if let Some(shape) = self.factor("body", schema, 0)? {
                    contents.push((content_type.clone(), shape.required(true)));
                }
            }
        }
        Ok(RestResponse {
            status_code,
            contents,
        })
    }
}

fn required_names(schema: &Json) -> BTreeSet<&str> {
    schema
        .get("required")
        .and_then(Json::as_array)
        .map(|names| names.iter().filter_map(Json::as_str).collect())
        .unwrap_or_default()
}

fn int_bounds(schema: &Json) -> Result<(Option<i64>, Option<i64>)> {
    let (minimum, maximum) = float_bounds(schema)?;
    let minimum = minimum.map(|val| val.ceil() as i64);
    let maximum = maximum.map(|val| val.floor() as i64);
    if let (Some(lo), Some(hi)) = (minimum, maximum) {
        if lo > hi {
            bail!("integer range is empty: minimum {lo} > maximum {hi}");
        }
    }
    Ok((minimum, maximum))
}

/// Bounds with exclusivity folded in, in both the boolean (3.0) and the
/// numeric (3.1) forms.
fn float_bounds(schema: &Json) -> Result<(Option<f64>, Option<f64>)> {
    let nudge = |val: f64| val.abs().max(1.0) * 1e-9;
    let integer = Reader::schema_type(schema) == "integer";
    let step = |val: f64| if integer { 1.0 } else { nudge(val) };

    let mut minimum = parse_bound(schema.get("minimum"));
    match schema.get("exclusiveMinimum") {
        Some(Json::Bool(true)) => minimum = minimum.map(|val| val + step(val)),
        Some(Json::Number(number)) => minimum = number.as_f64().map(|val| val + step(val)),
        _ => {}
    }
    let mut maximum = parse_bound(schema.get("maximum"));
    match schema.get("exclusiveMaximum") {
        Some(Json::Bool(true)) => maximum = maximum.map(|val| val - step(val)),
        Some(Json::Number(number)) => maximum = number.as_f64().map(|val| val - step(val)),
        _ => {}
    }
    if let (Some(lo), Some(hi)) = (minimum, maximum) {
        if lo > hi {
            bail!("numeric range is empty: minimum {lo} > maximum {hi}");
        }
    }
    Ok((minimum, maximum))
}

fn string_factor(name: &str, schema: &Json) -> Result<Factor> {
    let min_length = schema
        .get("minLength")
        .and_then(Json::as_u64)
        .map_or(0, |val| val as usize);
    let max_length = schema
        .get("maxLength")
        .and_then(Json::as_u64)
        .map(|val| val as usize);
    if let Some(max) = max_length {
        if min_length > max {
            bail!("string length range is empty: minLength {min_length} > maxLength {max}");
        }
    }
    let pattern = schema
        .get("pattern")
        .and_then(Json::as_str)
        .map(str::to_string);
    Ok(Factor::new(
        name,
        FactorKind::String {
            min_length,
            max_length,
            pattern,
        },
    ))
}

#[cfg(test)]
#[path = "ingest_tests.rs"]
mod tests;
