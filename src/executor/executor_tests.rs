use super::*;
use crate::ca::{cartesian, ToolModel};
use crate::http::{HttpResponse, ResponseBody};
use crate::model::Factor;
use crate::rest::{discover_bindings, parse_document, BodyKind, MatchThresholds};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type RequestLog = Rc<RefCell<Vec<HttpRequest>>>;

fn recording<F>(log: RequestLog, respond: F) -> impl Fn(&HttpRequest) -> HttpResponse
where
    F: Fn(&HttpRequest) -> HttpResponse,
{
    move |request: &HttpRequest| {
        log.borrow_mut().push(request.clone());
        respond(request)
    }
}

#[derive(Default)]
struct ProductTool {
    calls: Cell<usize>,
}

impl CoveringArrayTool for ProductTool {
    fn generate(&self, model: &ToolModel, _strength: usize) -> Result<Vec<Vec<usize>>> {
        self.calls.set(self.calls.get() + 1);
        let sizes: Vec<usize> = model.params.iter().map(|param| param.size).collect();
        Ok(cartesian(&sizes))
    }
}

struct BrokenTool;

impl CoveringArrayTool for BrokenTool {
    fn generate(&self, _model: &ToolModel, _strength: usize) -> Result<Vec<Vec<usize>>> {
        Err(anyhow!("tool exited with status 1"))
    }
}

fn settings() -> ExecutorSettings {
    ExecutorSettings {
        base_url: "http://sut".to_string(),
        headers: BTreeMap::new(),
        ca_strength: 2,
        budget: Duration::from_secs(60),
        chain_capacity: 10,
        chain_retries: 3,
        cleanup: false,
        seed: Some(7),
    }
}

fn json_response(status: u16, body: Json) -> HttpResponse {
    HttpResponse::new(status, ResponseBody::Json(body))
}

fn items_api() -> Vec<RestOperation> {
    let doc = json!({
        "openapi": "3.0.0",
        "info": {"title": "items"},
        "paths": {
            "/items": {"post": {"responses": {"201": {"description": "created", "content": {
                "application/json": {"schema": {"type": "object", "properties": {"id": {"type": "integer"}}}}
            }}}}},
            "/items/{id}": {
                "get": {
                    "parameters": [{"name": "id", "in": "path", "required": true, "schema": {"type": "integer"}}],
                    "responses": {"200": {"description": "ok"}}
                },
                "delete": {
                    "parameters": [{"name": "id", "in": "path", "required": true, "schema": {"type": "integer"}}],
                    "responses": {"204": {"description": "gone"}}
                }
            }
        }
    });
    let mut ops = parse_document(&doc).expect("parse items api").operations;
    discover_bindings(&mut ops, &MatchThresholds::default());
    ops
}

fn items_transport(log: RequestLog) -> impl Fn(&HttpRequest) -> HttpResponse {
    recording(log, |request: &HttpRequest| match (request.method, request.url.as_str()) {
        (Method::Post, "http://sut/items") => json_response(201, json!({"id": 42})),
        (_, "http://sut/items/42") => json_response(200, json!({"id": 42, "name": "widget"})),
        _ => json_response(404, json!({"message": "no such item"})),
    })
}

#[test]
fn path_params_resolve_from_the_response_chain() {
    let ops = items_api();
    let log = RequestLog::default();
    let transport = items_transport(log.clone());
    let tool = ProductTool::default();
    let sca = SequenceCoveringArray::new(&ops, 2);
    let sequence = vec![OperationId::from("POST /items"), OperationId::from("GET /items/{id}")];

    let report = Executor::new(ops, &transport, &tool, settings()).run(&sca, &[sequence]);

    let requests = log.borrow();
    assert_eq!(requests[0].method, Method::Post);
    let first_get = requests
        .iter()
        .find(|request| request.method == Method::Get)
        .expect("GET executed");
    assert_eq!(first_get.url, "http://sut/items/42");
    assert!(report
        .stats
        .succeeded_operations
        .contains(&OperationId::from("GET /items/{id}")));
    assert_eq!(report.stats.bugs, 0);
    assert_eq!(report.stats.unproductive_steps, 0);
    assert_eq!(report.runtime.created().len(), 1);
    assert_eq!(report.runtime.created()[0].id, json!(42));
}

#[test]
fn earlier_responses_survive_a_step_without_success() {
    let mut ops = items_api();
    ops.push(RestOperation::new(Method::Get, "/items"));
    let log = RequestLog::default();
    let transport = items_transport(log.clone());
    let tool = ProductTool::default();
    let sca = SequenceCoveringArray::new(&ops, 2);
    let sequence = vec![
        OperationId::from("POST /items"),
        OperationId::from("GET /items"),
        OperationId::from("GET /items/{id}"),
    ];

    let report = Executor::new(ops, &transport, &tool, settings()).run(&sca, &[sequence]);

    let urls: Vec<String> = log
        .borrow()
        .iter()
        .filter(|request| request.method == Method::Get)
        .map(|request| request.url.clone())
        .collect();
    assert_eq!(urls[0], "http://sut/items");
    assert!(
        urls.iter().any(|url| url == "http://sut/items/42"),
        "created id never requested: {urls:?}"
    );
    assert_eq!(report.stats.unproductive_steps, 1);
    assert!(report
        .stats
        .succeeded_operations
        .contains(&OperationId::from("GET /items/{id}")));
}

#[test]
fn full_phase_folds_essential_rows_as_history() {
    let mut op = RestOperation::new(Method::Post, "/orders")
        .with_param(
            Location::Body,
            Factor::enumeration("kind", vec![json!("a"), json!("b"), json!("c"), json!("d")])
                .required(true),
        )
        .with_param(Location::Body, Factor::boolean("gift"));
    op.body_kind = Some(BodyKind::Json);
    let log = RequestLog::default();
    let transport = recording(log.clone(), |_: &HttpRequest| {
        HttpResponse::new(200, ResponseBody::Empty)
    });
    let tool = ProductTool::default();
    let mut config = settings();
    config.ca_strength = 1;
    let sca = SequenceCoveringArray::new(std::slice::from_ref(&op), 1);

    let report = Executor::new(vec![op], &transport, &tool, config)
        .run(&sca, &[vec![OperationId::from("POST /orders")]]);

    let requests = log.borrow();
    assert_eq!(requests.len(), 4 + 4 * 3, "essential rows then history x gift classes");
    let essential: Vec<Json> = requests[..4]
        .iter()
        .map(|request| match &request.body {
            RequestBody::Json(body) => body["kind"].clone(),
            other => panic!("unexpected body {other:?}"),
        })
        .collect();
    for request in &requests[4..] {
        let RequestBody::Json(body) = &request.body else {
            panic!("unexpected body {:?}", request.body);
        };
        assert!(essential.contains(&body["kind"]), "{body}");
    }
    for kind in &essential {
        let repeats = requests[4..]
            .iter()
            .filter(|request| matches!(&request.body, RequestBody::Json(body) if &body["kind"] == kind))
            .count();
        assert_eq!(repeats, 3, "kind {kind}");
    }
    assert_eq!(tool.calls.get(), 1);
    assert_eq!(report.stats.ca_invocations, 2);
}

#[test]
fn server_errors_are_recorded_once_per_signature() {
    let op = RestOperation::new(Method::Get, "/boom");
    let log = RequestLog::default();
    let transport = recording(log.clone(), |_: &HttpRequest| {
        json_response(500, json!({"error": "NullPointerException"}))
    });
    let tool = ProductTool::default();
    let sca = SequenceCoveringArray::new(std::slice::from_ref(&op), 1);
    let boom = OperationId::from("GET /boom");

    let report = Executor::new(vec![op], &transport, &tool, settings())
        .run(&sca, &[vec![boom.clone()], vec![boom.clone()]]);

    assert_eq!(log.borrow().len(), 2);
    assert_eq!(report.stats.bugs, 1);
    assert_eq!(report.stats.unproductive_steps, 0);
    let bug = &report.runtime.bugs()[0];
    assert_eq!(bug.operation, boom);
    assert_eq!(bug.status, 500);
    assert_eq!(bug.request.url, "http://sut/boom");
}

#[test]
fn exhausted_budget_returns_partial_statistics() {
    let ops = items_api();
    let log = RequestLog::default();
    let transport = items_transport(log.clone());
    let tool = ProductTool::default();
    let mut config = settings();
    config.budget = Duration::ZERO;
    let sca = SequenceCoveringArray::new(&ops, 2);
    let sequence = vec![OperationId::from("POST /items")];

    let report = Executor::new(ops, &transport, &tool, config).run(&sca, &[sequence]);

    assert!(report.stats.aborted);
    assert_eq!(report.stats.requests, 0);
    assert!(log.borrow().is_empty());
    assert!(report.stats.coverage.iter().all(|entry| entry.executed == 0));
}

#[test]
fn tool_failures_skip_the_phase_without_aborting() {
    let op = RestOperation::new(Method::Get, "/search")
        .with_param(Location::Query, Factor::boolean("a").required(true))
        .with_param(Location::Query, Factor::boolean("b").required(true))
        .with_param(Location::Query, Factor::boolean("c").required(true));
    let log = RequestLog::default();
    let transport = recording(log.clone(), |_: &HttpRequest| {
        HttpResponse::new(200, ResponseBody::Empty)
    });
    let sca = SequenceCoveringArray::new(std::slice::from_ref(&op), 1);

    let report = Executor::new(vec![op], &transport, &BrokenTool, settings())
        .run(&sca, &[vec![OperationId::from("GET /search")]]);

    assert!(!report.stats.aborted);
    assert_eq!(report.stats.ca_failures, 1);
    assert_eq!(report.stats.unproductive_steps, 1);
    assert!(log.borrow().is_empty());
}

#[test]
fn oracle_hints_unblock_a_failing_step() {
    let op = RestOperation::new(Method::Get, "/search")
        .with_param(Location::Query, Factor::string("q").required(true));
    let log = RequestLog::default();
    let transport = recording(log.clone(), |request: &HttpRequest| {
        if request.query.iter().any(|(key, val)| key == "q" && val == "magic") {
            json_response(200, json!({"results": []}))
        } else {
            json_response(400, json!({"message": "q must be a known keyword"}))
        }
    });
    let tool = ProductTool::default();
    let prompts: Rc<RefCell<Vec<String>>> = Rc::default();
    let seen = prompts.clone();
    let oracle = Oracle::with_backend(
        Box::new(move |prompt: &str| {
            seen.borrow_mut().push(prompt.to_string());
            Ok(r#"{"params": ["q"], "values": {"q": ["magic"]}, "constraints": []}"#.to_string())
        }),
        10,
    );
    let sca = SequenceCoveringArray::new(std::slice::from_ref(&op), 1);
    let search = OperationId::from("GET /search");

    let report = Executor::new(vec![op], &transport, &tool, settings())
        .with_oracle(oracle)
        .run(&sca, &[vec![search.clone()]]);

    assert!(report.stats.succeeded_operations.contains(&search));
    assert_eq!(report.stats.oracle_calls, 3);
    assert_eq!(report.oracle_log.len(), 3);
    assert_eq!(report.stats.unproductive_steps, 0);
    assert!(report.runtime.problem_params(&search).contains("q"));
    assert!(prompts.borrow()[0].contains("q must be a known keyword"));
}

#[test]
fn cleanup_deletes_created_resources() {
    let ops = items_api();
    let log = RequestLog::default();
    let transport = items_transport(log.clone());
    let tool = ProductTool::default();
    let mut config = settings();
    config.cleanup = true;

    let (sequences, report) = run_all(ops, &transport, &tool, None, config, 1);

    assert!(!sequences.is_empty());
    assert_eq!(report.stats.cleanup_requests, 1);
    let last = log.borrow().last().cloned().expect("requests sent");
    assert_eq!(last.method, Method::Delete);
    assert_eq!(last.url, "http://sut/items/42");
    assert_eq!(report.stats.bugs, 0);
}

#[test]
fn array_names_are_tool_safe() {
    let name = array_name(&OperationId::from("GET /items/{id}"), Phase::All);
    assert_eq!(name, "GET__items__id__all");
}
