//! Run artifacts written to the output directory.
//!
//! ```text
//! <out>/stats.json
//! <out>/sequences.json
//! <out>/runtime.json
//! <out>/oracle_log.jsonl
//! <out>/bugs/bug_001.json ...
//! <out>/bugs/collection.json   (Postman v2.1)
//! ```
use crate::executor::RunReport;
use crate::http::{HttpRequest, RequestBody};
use crate::rest::OperationId;
use crate::runtime::BugRecord;
use crate::util::{write_json, write_text};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value as Json};
use std::path::{Path, PathBuf};

pub const POSTMAN_SCHEMA: &str =
    "https://schema.getpostman.com/json/collection/v2.1.0/collection.json";

#[derive(Serialize)]
struct BugFile<'a> {
    id: String,
    #[serde(flatten)]
    bug: &'a BugRecord,
}

fn bug_id(number: usize) -> String {
    format!("bug_{number:03}")
}

/// Write every artifact of a finished run under `out`. Returns the files
/// written, relative to `out`.
pub fn write_reports(
    out: &Path,
    title: &str,
    sequences: &[Vec<OperationId>],
    report: &RunReport,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    let mut emit = |rel: &str| written.push(PathBuf::from(rel));

    write_json(out, "stats.json", &report.stats)?;
    emit("stats.json");
    write_json(out, "sequences.json", &sequences)?;
    emit("sequences.json");
    write_json(out, "runtime.json", &report.runtime.snapshot())?;
    emit("runtime.json");

    let mut lines = String::new();
    for entry in &report.oracle_log {
        lines.push_str(&serde_json::to_string(entry).context("serialize oracle log entry")?);
        lines.push('\n');
    }
    write_text(out, "oracle_log.jsonl", &lines)?;
    emit("oracle_log.jsonl");

    let bugs = report.runtime.bugs();
    for (idx, bug) in bugs.iter().enumerate() {
        let id = bug_id(idx + 1);
        let rel = format!("bugs/{id}.json");
        write_json(out, &rel, &BugFile { id, bug })?;
        emit(&rel);
    }
    if !bugs.is_empty() {
        write_json(out, "bugs/collection.json", &postman_collection(title, bugs))?;
        emit("bugs/collection.json");
    }
    tracing::info!(
        out = %out.display(),
        files = written.len(),
        bugs = bugs.len(),
        "reports written"
    );
    Ok(written)
}

/// A Postman v2.1 collection replaying every recorded bug.
pub fn postman_collection(title: &str, bugs: &[BugRecord]) -> Json {
    let items: Vec<Json> = bugs
        .iter()
        .enumerate()
        .map(|(idx, bug)| {
            json!({
                "name": format!("{} {} ({})", bug_id(idx + 1), bug.operation, bug.status),
                "request": postman_request(&bug.request),
            })
        })
        .collect();
    json!({
        "info": {
            "name": format!("{title} server errors"),
            "schema": POSTMAN_SCHEMA,
        },
        "item": items,
    })
}

fn postman_request(request: &HttpRequest) -> Json {
    let header: Vec<Json> = request
        .headers
        .iter()
        .map(|(key, value)| json!({"key": key, "value": value}))
        .collect();
    let query: Vec<Json> = request
        .query
        .iter()
        .map(|(key, value)| json!({"key": key, "value": value}))
        .collect();
    let mut out = json!({
        "method": request.method.as_str(),
        "header": header,
        "url": {"raw": request.full_url(), "query": query},
    });
    let body = match &request.body {
        RequestBody::Empty => None,
        RequestBody::Json(val) => Some(json!({
            "mode": "raw",
            "raw": val.to_string(),
            "options": {"raw": {"language": "json"}},
        })),
        RequestBody::Form(fields) => Some(json!({
            "mode": "urlencoded",
            "urlencoded": fields
                .iter()
                .map(|(key, value)| json!({"key": key, "value": value}))
                .collect::<Vec<_>>(),
        })),
        RequestBody::Multipart(parts) => Some(json!({
            "mode": "formdata",
            "formdata": parts
                .iter()
                .map(|part| match &part.filename {
                    Some(filename) => json!({"key": part.name, "type": "file", "src": filename}),
                    None => json!({"key": part.name, "type": "text", "value": part.value}),
                })
                .collect::<Vec<_>>(),
        })),
    };
    if let (Some(body), Some(map)) = (body, out.as_object_mut()) {
        map.insert("body".to_string(), body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RunStatistics;
    use crate::http::{FormPart, ResponseBody};
    use crate::rest::Method;
    use crate::runtime::{ResponseChain, RuntimeInfoManager};

    fn bug(url: &str, body: RequestBody) -> BugRecord {
        BugRecord {
            operation: OperationId::from("POST /items"),
            status: 500,
            signature: "abc".to_string(),
            sequence: vec![OperationId::from("POST /items")],
            assignment: Default::default(),
            request: HttpRequest {
                method: Method::Post,
                url: url.to_string(),
                query: vec![("dry".to_string(), "true".to_string())],
                headers: vec![("X-Trace".to_string(), "1".to_string())],
                body,
            },
            response: ResponseBody::Text("boom".to_string()),
            chain: ResponseChain::new(),
        }
    }

    #[test]
    fn collection_replays_each_bug() {
        let bugs = [
            bug("http://sut/items", RequestBody::Json(json!({"name": "x"}))),
            bug(
                "http://sut/upload",
                RequestBody::Multipart(vec![FormPart {
                    name: "file".to_string(),
                    value: "abc".to_string(),
                    filename: Some("file.txt".to_string()),
                }]),
            ),
        ];
        let collection = postman_collection("items", &bugs);
        assert_eq!(collection["info"]["schema"], POSTMAN_SCHEMA);
        let items = collection["item"].as_array().expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["name"], "bug_001 POST /items (500)");
        assert_eq!(items[0]["request"]["url"]["raw"], "http://sut/items?dry=true");
        assert_eq!(items[0]["request"]["body"]["mode"], "raw");
        assert_eq!(items[0]["request"]["header"][0]["key"], "X-Trace");
        assert_eq!(items[1]["request"]["body"]["formdata"][0]["type"], "file");
    }

    #[test]
    fn reports_land_in_the_output_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut runtime = RuntimeInfoManager::new(10, 3);
        runtime.record_bug(bug("http://sut/items", RequestBody::Empty));
        let report = RunReport {
            stats: RunStatistics::default(),
            runtime,
            oracle_log: Vec::new(),
        };
        let sequences = [vec![OperationId::from("POST /items")]];
        let written = write_reports(root.path(), "items", &sequences, &report).expect("write");
        for rel in [
            "stats.json",
            "sequences.json",
            "runtime.json",
            "oracle_log.jsonl",
            "bugs/bug_001.json",
            "bugs/collection.json",
        ] {
            assert!(root.path().join(rel).is_file(), "missing {rel}");
            assert!(written.contains(&PathBuf::from(rel)), "unlisted {rel}");
        }
        let bug_file: Json = serde_json::from_str(
            &std::fs::read_to_string(root.path().join("bugs/bug_001.json")).expect("read bug"),
        )
        .expect("parse bug");
        assert_eq!(bug_file["id"], "bug_001");
        assert_eq!(bug_file["status"], 500);
        assert_eq!(bug_file["request"]["body"]["mode"], "empty");
    }
}
