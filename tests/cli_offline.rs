//! End-to-end checks for the commands that never touch the network.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const PETSTORE: &str = r#"{
  "openapi": "3.0.3",
  "info": {"title": "Pet Store", "version": "1"},
  "servers": [{"url": "http://localhost:8080/api"}],
  "paths": {
    "/pets": {
      "get": {
        "parameters": [{"name": "limit", "in": "query", "schema": {"type": "integer", "minimum": 1}}],
        "responses": {"200": {"description": "ok"}}
      },
      "post": {
        "requestBody": {"content": {"application/json": {"schema": {
          "type": "object", "required": ["name"],
          "properties": {"name": {"type": "string"}, "tag": {"type": "string"}}
        }}}},
        "responses": {"201": {"description": "created"}}
      }
    },
    "/pets/{petId}": {
      "get": {
        "parameters": [{"name": "petId", "in": "path", "required": true, "schema": {"type": "integer"}}],
        "responses": {"200": {"description": "ok"}}
      },
      "delete": {
        "parameters": [{"name": "petId", "in": "path", "required": true, "schema": {"type": "integer"}}],
        "responses": {"204": {"description": "gone"}}
      }
    }
  }
}"#;

fn restcov(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_restcov"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn restcov")
}

fn write_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("petstore.json");
    std::fs::write(&path, PETSTORE).expect("write fixture");
    path
}

#[test]
fn sequences_json_covers_every_legal_pair() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = write_fixture(dir.path());
    let output = restcov(&[
        "sequences",
        "--spec",
        spec.to_str().expect("utf-8 path"),
        "--strength",
        "2",
        "--seed",
        "11",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload: Value = serde_json::from_slice(&output.stdout).expect("stdout is JSON");
    assert_eq!(payload["title"], "Pet Store");
    assert_eq!(payload["operations"], 4);
    assert_eq!(payload["strength"], 2);

    let known = ["GET /pets", "POST /pets", "GET /pets/{petId}", "DELETE /pets/{petId}"];
    let sequences = payload["sequences"].as_array().expect("sequences array");
    assert!(!sequences.is_empty());
    for sequence in sequences {
        for id in sequence.as_array().expect("sequence array") {
            let id = id.as_str().expect("operation id");
            assert!(known.contains(&id), "unexpected operation {id}");
        }
    }
    for entry in payload["coverage"].as_array().expect("coverage array") {
        assert_eq!(entry["covered"], entry["total"], "{entry}");
    }
}

#[test]
fn sequences_rejects_zero_strength() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = write_fixture(dir.path());
    let output = restcov(&[
        "sequences",
        "--spec",
        spec.to_str().expect("utf-8 path"),
        "--strength",
        "0",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("at least 1"));
}

#[test]
fn init_config_refuses_to_overwrite_without_force() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("conf").join("restcov.json");
    let path_arg = path.to_str().expect("utf-8 path");

    let first = restcov(&["init-config", "--out", path_arg]);
    assert!(first.status.success());
    let written: Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read config"))
            .expect("config is JSON");
    assert_eq!(written["base_url"], "http://localhost:8080");
    assert_eq!(written["sequence_strength"], 2);

    let second = restcov(&["init-config", "--out", path_arg]);
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = restcov(&["init-config", "--out", path_arg, "--force"]);
    assert!(forced.status.success());
}
