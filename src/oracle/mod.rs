//! Auxiliary LM oracle for stuck operations.
//!
//! When an operation never breaks out (only client errors), the executor can
//! ask a user-configured LM command which parameters are at fault, what
//! values might be accepted, and how parameters depend on each other. The
//! oracle is best effort: every failure is logged and swallowed by the
//! caller, and the number of calls per run is capped.
mod client;

pub use client::{extract_json, invoke_command};

use crate::model::{ConstraintGroup, DataType};
use crate::rest::{Location, OperationId, RestOperation};
use crate::util::truncate_string;
use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Retries after a parse or validation failure.
const MAX_LM_RETRIES: usize = 2;
/// Longest response excerpt placed in a prompt.
const RESPONSE_EXCERPT_BYTES: usize = 600;

const BASE_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/oracle_base.md"));
const PROBLEM_PARAMS_TASK: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/task_problem_params.md"
));
const PROPOSE_VALUES_TASK: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/task_propose_values.md"
));
const CONSTRAINT_GROUPING_TASK: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/task_constraint_grouping.md"
));
const RETRY_PROMPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/retry.md"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleTask {
    ExtractProblemParams,
    ProposeValues,
    ExtractConstraintGrouping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamInfo {
    pub name: String,
    pub location: Location,
    pub data_type: DataType,
    pub required: bool,
    pub description: Option<String>,
}

/// What the oracle is told about one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OracleContext {
    pub operation: OperationId,
    pub summary: Option<String>,
    pub params: Vec<ParamInfo>,
    pub responses: Vec<String>,
}

impl OracleContext {
    pub fn from_operation(op: &RestOperation, responses: Vec<String>) -> Self {
        let params = op
            .params
            .iter()
            .flat_map(|param| {
                param.factor.leaves().into_iter().map(move |leaf| ParamInfo {
                    name: leaf.global_name(),
                    location: param.location,
                    data_type: leaf.data_type(),
                    required: leaf.is_essential(),
                    description: leaf.description.clone(),
                })
            })
            .collect();
        Self {
            operation: op.id(),
            summary: op.summary.clone(),
            params,
            responses,
        }
    }

    fn known(&self) -> BTreeSet<&str> {
        self.params.iter().map(|param| param.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OracleLogEntry {
    pub task: OracleTask,
    pub operation: OperationId,
    pub attempts: usize,
    pub elapsed_ms: u128,
    pub ok: bool,
    pub error: Option<String>,
    pub response: Option<String>,
}

#[derive(Deserialize)]
struct ProblemParamsAnswer {
    params: Vec<String>,
}

#[derive(Deserialize)]
struct ProposedValuesAnswer {
    values: BTreeMap<String, Vec<Json>>,
}

#[derive(Deserialize)]
struct ConstraintAnswer {
    constraints: Vec<ConstraintGroup>,
}

/// Prompt in, raw answer out.
pub type Backend = Box<dyn Fn(&str) -> Result<String>>;

pub struct Oracle {
    backend: Backend,
    max_calls: usize,
    calls: usize,
    log: Vec<OracleLogEntry>,
}

impl Oracle {
    pub fn from_command(command: String, max_calls: usize) -> Self {
        Self::with_backend(
            Box::new(move |prompt: &str| invoke_command(&command, prompt)),
            max_calls,
        )
    }

    pub fn with_backend(backend: Backend, max_calls: usize) -> Self {
        Self {
            backend,
            max_calls,
            calls: 0,
            log: Vec::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn exhausted(&self) -> bool {
        self.calls >= self.max_calls
    }

    pub fn log(&self) -> &[OracleLogEntry] {
        &self.log
    }

    /// Parameters the observed failures point at.
    pub fn extract_problem_params(&mut self, ctx: &OracleContext) -> Result<Vec<String>> {
        let known = ctx.known();
        let task = PROBLEM_PARAMS_TASK.to_string();
        let answer: ProblemParamsAnswer =
            self.ask(OracleTask::ExtractProblemParams, ctx, &task)?;
        Ok(answer
            .params
            .into_iter()
            .filter(|name| known.contains(name.as_str()))
            .collect())
    }

    /// Example values for `focus` (all parameters when empty).
    pub fn propose_values(
        &mut self,
        ctx: &OracleContext,
        focus: &[String],
    ) -> Result<BTreeMap<String, Vec<Json>>> {
        let known = ctx.known();
        let focus_text = if focus.is_empty() {
            "all".to_string()
        } else {
            focus.join(", ")
        };
        let task = PROPOSE_VALUES_TASK.replace("{focus}", &focus_text);
        let answer: ProposedValuesAnswer = self.ask(OracleTask::ProposeValues, ctx, &task)?;
        Ok(answer
            .values
            .into_iter()
            .filter(|(name, values)| known.contains(name.as_str()) && !values.is_empty())
            .collect())
    }

    /// Dependency groups between parameters.
    pub fn extract_constraint_grouping(&mut self, ctx: &OracleContext) -> Result<Vec<ConstraintGroup>> {
        let known = ctx.known();
        let task = CONSTRAINT_GROUPING_TASK.to_string();
        let answer: ConstraintAnswer =
            self.ask(OracleTask::ExtractConstraintGrouping, ctx, &task)?;
        Ok(answer
            .constraints
            .into_iter()
            .filter(|group| group.params.len() >= 2)
            .filter(|group| group.params.iter().all(|name| known.contains(name.as_str())))
            .collect())
    }

    fn ask<T: DeserializeOwned>(&mut self, task: OracleTask, ctx: &OracleContext, task_text: &str) -> Result<T> {
        if self.exhausted() {
            bail!("oracle call budget of {} exhausted", self.max_calls);
        }
        self.calls += 1;
        let start = Instant::now();
        let base = build_prompt(ctx, task_text);
        let mut last_error: Option<String> = None;
        let mut last_response: Option<String> = None;

        for attempt in 0..=MAX_LM_RETRIES {
            let prompt = match (&last_error, &last_response) {
                (Some(error), Some(previous)) => format!(
                    "{base}{}",
                    RETRY_PROMPT
                        .replace("{error}", error)
                        .replace("{previous}", previous)
                ),
                _ => base.clone(),
            };
            let response = match (self.backend)(&prompt) {
                Ok(text) => text,
                Err(err) => {
                    self.push_log(task, ctx, attempt + 1, start, Err(err.to_string()), None);
                    return Err(err);
                }
            };
            let parsed = serde_json::from_str::<T>(extract_json(&response));
            match parsed {
                Ok(answer) => {
                    self.push_log(task, ctx, attempt + 1, start, Ok(()), Some(response));
                    return Ok(answer);
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "oracle answer rejected");
                    last_error = Some(err.to_string());
                    last_response = Some(response);
                }
            }
        }
        let error = last_error.unwrap_or_else(|| "unknown".to_string());
        self.push_log(
            task,
            ctx,
            MAX_LM_RETRIES + 1,
            start,
            Err(error.clone()),
            last_response,
        );
        Err(anyhow!(
            "oracle failed after {} attempts. Last error: {}",
            MAX_LM_RETRIES + 1,
            error
        ))
    }

    fn push_log(
        &mut self,
        task: OracleTask,
        ctx: &OracleContext,
        attempts: usize,
        start: Instant,
        outcome: std::result::Result<(), String>,
        response: Option<String>,
    ) {
        self.log.push(OracleLogEntry {
            task,
            operation: ctx.operation.clone(),
            attempts,
            elapsed_ms: start.elapsed().as_millis(),
            ok: outcome.is_ok(),
            error: outcome.err(),
            response,
        });
    }
}

fn excerpt(text: &str) -> String {
    let mut out = truncate_string(text, RESPONSE_EXCERPT_BYTES);
    if out.len() < text.len() {
        out.push_str(" ...");
    }
    out
}

fn build_prompt(ctx: &OracleContext, task_text: &str) -> String {
    let params = serde_json::to_string_pretty(&ctx.params).unwrap_or_else(|_| "[]".to_string());
    let responses = if ctx.responses.is_empty() {
        "(none)".to_string()
    } else {
        ctx.responses
            .iter()
            .map(|text| format!("- {}", excerpt(text)))
            .collect::<Vec<_>>()
            .join("\n")
    };
    BASE_PROMPT
        .replace("{operation}", ctx.operation.as_str())
        .replace("{summary}", ctx.summary.as_deref().unwrap_or(""))
        .replace("{params}", &params)
        .replace("{responses}", &responses)
        .replace("{task}", task_text.trim())
}
