//! Turn a row assignment into a concrete HTTP request.
use super::{BodyKind, Location, PathToken, RestOperation};
use crate::http::{FormPart, HttpRequest, RequestBody};
use crate::model::{render_plain, Value};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn plain_values(val: &Json) -> Vec<String> {
    match val {
        Json::Array(items) => items.iter().map(render_plain).collect(),
        other => vec![render_plain(other)],
    }
}

pub fn build_request(
    op: &RestOperation,
    row: &BTreeMap<String, Value>,
    base_url: &str,
    extra_headers: &BTreeMap<String, String>,
) -> HttpRequest {
    let mut path = String::new();
    for token in &op.path {
        path.push('/');
        match token {
            PathToken::Literal(text) => path.push_str(text),
            PathToken::Param(name) => {
                let rendered = op
                    .params
                    .iter()
                    .find(|param| param.location == Location::Path && &param.factor.name == name)
                    .and_then(|param| param.factor.printable(row))
                    .map(|val| render_plain(&val))
                    .unwrap_or_default();
                path.push_str(&encode_component(&rendered));
            }
        }
    }
    if path.is_empty() {
        path.push('/');
    }

    let mut query = Vec::new();
    let mut headers: Vec<(String, String)> = extra_headers
        .iter()
        .map(|(key, val)| (key.clone(), val.clone()))
        .collect();
    let mut body_fields: Vec<(String, Json, bool)> = Vec::new();
    for param in &op.params {
        let Some(val) = param.factor.printable(row) else {
            continue;
        };
        match param.location {
            Location::Path => {}
            Location::Query => {
                for item in plain_values(&val) {
                    query.push((param.factor.name.clone(), item));
                }
            }
            Location::Header => headers.push((param.factor.name.clone(), render_plain(&val))),
            Location::Body => body_fields.push((param.factor.name.clone(), val, param.is_file)),
        }
    }

    let body = match op.body_kind {
        None => RequestBody::Empty,
        Some(BodyKind::Json) if op.raw_body => body_fields
            .into_iter()
            .next()
            .map_or(RequestBody::Empty, |(_, val, _)| RequestBody::Json(val)),
        Some(BodyKind::Json) => {
            let map: Map<String, Json> = body_fields
                .into_iter()
                .map(|(name, val, _)| (name, val))
                .collect();
            RequestBody::Json(Json::Object(map))
        }
        Some(BodyKind::Form) => RequestBody::Form(
            body_fields
                .iter()
                .flat_map(|(name, val, _)| {
                    plain_values(val)
                        .into_iter()
                        .map(move |item| (name.clone(), item))
                })
                .collect(),
        ),
        Some(BodyKind::Multipart) => RequestBody::Multipart(
            body_fields
                .into_iter()
                .map(|(name, val, is_file)| FormPart {
                    filename: is_file.then(|| format!("{name}.txt")),
                    name,
                    value: render_plain(&val),
                })
                .collect(),
        ),
    };

    HttpRequest {
        method: op.method,
        url: format!("{}{}", base_url.trim_end_matches('/'), path),
        query,
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Factor, Generator};
    use crate::rest::Method;
    use serde_json::json;

    fn value(val: Json) -> Value {
        Value::new(val, Generator::Random, DataType::String)
    }

    #[test]
    fn path_query_and_header_slots_are_filled() {
        let op = RestOperation::new(Method::Get, "/items/{id}")
            .with_param(Location::Path, Factor::string("id").required(true))
            .with_param(Location::Query, Factor::array("tag", Factor::string("t")))
            .with_param(Location::Header, Factor::string("X-Trace"))
            .with_param(Location::Query, Factor::string("unused"));
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), value(json!("a b/c")));
        row.insert("tag._item".to_string(), value(json!("red")));
        row.insert("X-Trace".to_string(), value(json!("t-1")));
        row.insert("unused".to_string(), Value::null(DataType::String));
        let mut extra = BTreeMap::new();
        extra.insert("Authorization".to_string(), "Bearer x".to_string());

        let request = build_request(&op, &row, "http://localhost:8080/", &extra);
        assert_eq!(request.url, "http://localhost:8080/items/a%20b%2Fc");
        assert_eq!(request.query, vec![("tag".to_string(), "red".to_string())]);
        assert_eq!(
            request.headers,
            vec![
                ("Authorization".to_string(), "Bearer x".to_string()),
                ("X-Trace".to_string(), "t-1".to_string()),
            ]
        );
        assert_eq!(request.body, RequestBody::Empty);
    }

    #[test]
    fn flattened_json_body_skips_null_properties() {
        let mut op = RestOperation::new(Method::Post, "/items")
            .with_param(Location::Body, Factor::string("name").required(true))
            .with_param(Location::Body, Factor::integer("count", None, None));
        op.body_kind = Some(BodyKind::Json);
        let mut row = BTreeMap::new();
        row.insert("name".to_string(), value(json!("rex")));
        row.insert("count".to_string(), Value::null(DataType::Integer));
        let request = build_request(&op, &row, "http://h", &BTreeMap::new());
        assert_eq!(request.body, RequestBody::Json(json!({"name": "rex"})));
        assert_eq!(request.url, "http://h/items");
    }

    #[test]
    fn raw_body_and_multipart_files() {
        let mut op = RestOperation::new(Method::Put, "/blob")
            .with_param(Location::Body, Factor::string("body").required(true));
        op.body_kind = Some(BodyKind::Json);
        op.raw_body = true;
        let mut row = BTreeMap::new();
        row.insert("body".to_string(), value(json!("payload")));
        let request = build_request(&op, &row, "http://h", &BTreeMap::new());
        assert_eq!(request.body, RequestBody::Json(json!("payload")));

        op.raw_body = false;
        op.body_kind = Some(BodyKind::Multipart);
        op.params[0].is_file = true;
        let request = build_request(&op, &row, "http://h", &BTreeMap::new());
        assert_eq!(
            request.body,
            RequestBody::Multipart(vec![FormPart {
                name: "body".to_string(),
                value: "payload".to_string(),
                filename: Some("body.txt".to_string()),
            }])
        );
    }
}
