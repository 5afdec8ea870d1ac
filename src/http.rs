//! HTTP dispatch to the system under test.
//!
//! Transport failures never surface as errors: they come back as responses
//! with sentinel status codes above 599 so statistics keep them apart from
//! real HTTP outcomes.
use crate::rest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Connection refused, DNS failure, malformed response, and similar.
pub const STATUS_TRANSPORT_FAILURE: u16 = 600;
pub const STATUS_TIMEOUT: u16 = 601;

const MULTIPART_BOUNDARY: &str = "----restcov-boundary-5f2c1e9a";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormPart {
    pub name: String,
    pub value: String,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "data", rename_all = "snake_case")]
pub enum RequestBody {
    Empty,
    Json(Json),
    Form(Vec<(String, String)>),
    Multipart(Vec<FormPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: Method,
    /// Base URL plus resolved path, without the query string.
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    /// URL including the encoded query string.
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query: Vec<String> = self
            .query
            .iter()
            .map(|(key, val)| {
                format!(
                    "{}={}",
                    crate::rest::encode_component(key),
                    crate::rest::encode_component(val)
                )
            })
            .collect();
        format!("{}?{}", self.url, query.join("&"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResponseBody {
    Empty,
    Json(Json),
    Text(String),
}

impl ResponseBody {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::Empty;
        }
        match serde_json::from_str(raw) {
            Ok(json) => Self::Json(json),
            Err(_) => Self::Text(raw.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Self::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Json(json) => json.to_string(),
            Self::Text(text) => text.clone(),
        }
    }

    /// Stable digest of the body's shape: JSON keys and value kinds, or the
    /// first line of text. Values are ignored so generated ids do not make
    /// every failure look new.
    pub fn signature(&self) -> String {
        let shape = match self {
            Self::Empty => "empty".to_string(),
            Self::Json(json) => json_shape(json),
            Self::Text(text) => text.lines().next().unwrap_or_default().to_string(),
        };
        let digest = Sha256::digest(shape.as_bytes());
        digest.iter().take(8).map(|byte| format!("{byte:02x}")).collect()
    }
}

fn json_shape(json: &Json) -> String {
    match json {
        Json::Null => "null".to_string(),
        Json::Bool(_) => "bool".to_string(),
        Json::Number(_) => "number".to_string(),
        Json::String(_) => "string".to_string(),
        Json::Array(items) => format!(
            "[{}]",
            items.first().map(json_shape).unwrap_or_default()
        ),
        Json::Object(map) => {
            let mut keys: Vec<String> = map
                .iter()
                .map(|(key, val)| format!("{key}:{}", json_shape(val)))
                .collect();
            keys.sort();
            format!("{{{}}}", keys.join(","))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn new(status: u16, body: ResponseBody) -> Self {
        Self { status, body }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Success,
    Redirect,
    ClientError,
    /// 5xx: recorded as a bug.
    ServerError,
    Transport,
}

pub fn classify(status: u16) -> StatusClass {
    match status {
        0..=299 => StatusClass::Success,
        300..=399 => StatusClass::Redirect,
        400..=499 => StatusClass::ClientError,
        500..=599 => StatusClass::ServerError,
        _ => StatusClass::Transport,
    }
}

pub trait Transport {
    fn send(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> Transport for F
where
    F: Fn(&HttpRequest) -> HttpResponse,
{
    fn send(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// Blocking `ureq` transport with one global timeout per request.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

fn decorate<B>(mut builder: ureq::RequestBuilder<B>, request: &HttpRequest) -> ureq::RequestBuilder<B> {
    for (key, val) in &request.query {
        builder = builder.query(key, val);
    }
    for (key, val) in &request.headers {
        builder = builder.header(key.as_str(), val.as_str());
    }
    builder
}

fn multipart_payload(parts: &[FormPart]) -> Vec<u8> {
    let mut out = String::new();
    for part in parts {
        out.push_str(&format!("--{MULTIPART_BOUNDARY}\r\n"));
        match &part.filename {
            Some(filename) => out.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                part.name
            )),
            None => out.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                part.name
            )),
        }
        out.push_str(&part.value);
        out.push_str("\r\n");
    }
    out.push_str(&format!("--{MULTIPART_BOUNDARY}--\r\n"));
    out.into_bytes()
}

impl Transport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> HttpResponse {
        let url = request.url.as_str();
        let result = match request.method {
            Method::Get => decorate(self.agent.get(url), request).call(),
            Method::Delete => decorate(self.agent.delete(url), request).call(),
            Method::Post | Method::Put => {
                let builder = match request.method {
                    Method::Post => self.agent.post(url),
                    _ => self.agent.put(url),
                };
                let builder = decorate(builder, request);
                match &request.body {
                    RequestBody::Empty => builder.send_empty(),
                    RequestBody::Json(json) => builder.send_json(json),
                    RequestBody::Form(fields) => builder.send_form(
                        fields.iter().map(|(key, val)| (key.as_str(), val.as_str())),
                    ),
                    RequestBody::Multipart(parts) => builder
                        .header(
                            "Content-Type",
                            format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
                        )
                        .send(multipart_payload(parts)),
                }
            }
        };
        match result {
            Ok(mut response) => {
                let status = response.status().as_u16();
                let body = match response.body_mut().read_to_string() {
                    Ok(raw) => ResponseBody::parse(&raw),
                    Err(err) => {
                        tracing::debug!(error = %err, url, "response body unreadable");
                        ResponseBody::Empty
                    }
                };
                HttpResponse::new(status, body)
            }
            Err(ureq::Error::Timeout(_)) => {
                tracing::debug!(url, "request timed out");
                HttpResponse::new(STATUS_TIMEOUT, ResponseBody::Empty)
            }
            Err(err) => {
                tracing::debug!(error = %err, url, "transport failure");
                HttpResponse::new(STATUS_TRANSPORT_FAILURE, ResponseBody::Text(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_codes_fall_into_buckets() {
        let cases = [
            (200, StatusClass::Success),
            (201, StatusClass::Success),
            (301, StatusClass::Redirect),
            (404, StatusClass::ClientError),
            (500, StatusClass::ServerError),
            (503, StatusClass::ServerError),
            (650, StatusClass::Transport),
            (STATUS_TIMEOUT, StatusClass::Transport),
        ];
        for (status, expected) in cases {
            assert_eq!(classify(status), expected, "status {status}");
        }
    }

    #[test]
    fn response_bodies_parse_json_text_or_empty() {
        assert_eq!(ResponseBody::parse("  "), ResponseBody::Empty);
        assert_eq!(
            ResponseBody::parse("{\"id\": 1}"),
            ResponseBody::Json(json!({"id": 1}))
        );
        assert_eq!(
            ResponseBody::parse("oops"),
            ResponseBody::Text("oops".to_string())
        );
    }

    #[test]
    fn signature_ignores_values_but_not_shape() {
        let first = ResponseBody::Json(json!({"error": "boom", "id": 1}));
        let second = ResponseBody::Json(json!({"id": 99, "error": "other"}));
        let third = ResponseBody::Json(json!({"message": "boom"}));
        assert_eq!(first.signature(), second.signature());
        assert_ne!(first.signature(), third.signature());
    }

    #[test]
    fn full_url_encodes_query() {
        let request = HttpRequest {
            method: Method::Get,
            url: "http://h/items".to_string(),
            query: vec![("q".to_string(), "a b".to_string())],
            headers: Vec::new(),
            body: RequestBody::Empty,
        };
        assert_eq!(request.full_url(), "http://h/items?q=a%20b");
    }

    #[test]
    fn multipart_payload_marks_file_parts() {
        let payload = multipart_payload(&[FormPart {
            name: "file".to_string(),
            value: "data".to_string(),
            filename: Some("file.txt".to_string()),
        }]);
        let text = String::from_utf8(payload).expect("utf8");
        assert!(text.contains("filename=\"file.txt\""));
        assert!(text.ends_with(&format!("--{MULTIPART_BOUNDARY}--\r\n")));
    }

    #[test]
    fn closures_act_as_transports() {
        let transport = |_: &HttpRequest| HttpResponse::new(204, ResponseBody::Empty);
        let request = HttpRequest {
            method: Method::Delete,
            url: "http://h/items/1".to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        };
        assert_eq!(transport.send(&request).status, 204);
    }
}
