//! Execution and feedback loop.
//!
//! Sequences run shortest first. Each operation in a sequence is one step:
//! the step tries the most recent response chains recorded for its prefix,
//! and for each chain covers the essential parameters first, then the rest
//! with the essential rows folded in as history. A step that sees neither a
//! success nor a server error may ask the oracle for help and retry once.
//! Only the time budget ends a run early.
mod stats;

pub use stats::RunStatistics;

use crate::ca::{covering_array, CoveringArrayTool, Row};
use crate::config::RunConfig;
use crate::http::{classify, HttpRequest, RequestBody, StatusClass, Transport};
use crate::model::{render_plain, Value};
use crate::oracle::{Oracle, OracleContext, OracleLogEntry};
use crate::rest::{
    build_request, encode_component, is_prefix, Location, Method, OperationId, PathToken,
    RestOperation,
};
use crate::runtime::{replay_row, BugRecord, Phase, ResponseChain, RuntimeInfoManager};
use crate::sca::SequenceCoveringArray;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Response texts kept per step for the oracle.
const MAX_OBSERVED_RESPONSES: usize = 5;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub base_url: String,
    pub headers: BTreeMap<String, String>,
    pub ca_strength: usize,
    pub budget: Duration,
    pub chain_capacity: usize,
    pub chain_retries: usize,
    pub cleanup: bool,
    pub seed: Option<u64>,
}

impl ExecutorSettings {
    pub fn from_config(config: &RunConfig, base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: config.headers.clone(),
            ca_strength: config.ca_strength,
            budget: config.budget(),
            chain_capacity: config.chain_capacity,
            chain_retries: config.chain_retries,
            cleanup: config.cleanup,
            seed: config.seed,
        }
    }
}

/// Where one chain attempt of a step currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    EssentialCovering,
    EssentialExecuted,
    FullCovering,
    FullExecuted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Some request succeeded or hit a server error.
    BrokeOut,
    NoBreakout,
    /// The time budget ran out.
    Aborted,
}

/// Everything a finished run leaves behind.
pub struct RunReport {
    pub stats: RunStatistics,
    pub runtime: RuntimeInfoManager,
    pub oracle_log: Vec<OracleLogEntry>,
}

#[derive(Debug, Default)]
struct StepTally {
    requests: usize,
    successes: usize,
    observed: Vec<String>,
}

impl StepTally {
    fn observe(&mut self, text: String) {
        if text.is_empty()
            || self.observed.len() >= MAX_OBSERVED_RESPONSES
            || self.observed.contains(&text)
        {
            return;
        }
        self.observed.push(text);
    }
}

#[derive(Debug, Default)]
struct Batch {
    executed: Vec<Row>,
    succeeded: Vec<Row>,
    broke_out: bool,
    aborted: bool,
}

impl Batch {
    /// Rows the next phase folds in: the successful ones, or all of them
    /// when none succeeded.
    fn history(self) -> Vec<Row> {
        if self.succeeded.is_empty() {
            self.executed
        } else {
            self.succeeded
        }
    }
}

#[derive(Debug, Default)]
struct SequenceTrace {
    executed: Vec<OperationId>,
    succeeded: Vec<OperationId>,
    aborted: bool,
}

pub struct Executor<'a> {
    operations: Vec<RestOperation>,
    index: BTreeMap<OperationId, usize>,
    transport: &'a dyn Transport,
    tool: &'a dyn CoveringArrayTool,
    oracle: Option<Oracle>,
    settings: ExecutorSettings,
    runtime: RuntimeInfoManager,
    stats: RunStatistics,
    rng: StdRng,
    started: Instant,
}

impl<'a> Executor<'a> {
    pub fn new(
        operations: Vec<RestOperation>,
        transport: &'a dyn Transport,
        tool: &'a dyn CoveringArrayTool,
        settings: ExecutorSettings,
    ) -> Self {
        let index = operations
            .iter()
            .enumerate()
            .map(|(idx, op)| (op.id(), idx))
            .collect();
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            operations,
            index,
            transport,
            tool,
            oracle: None,
            runtime: RuntimeInfoManager::new(settings.chain_capacity, settings.chain_retries),
            settings,
            stats: RunStatistics::default(),
            rng,
            started: Instant::now(),
        }
    }

    pub fn with_oracle(mut self, oracle: Oracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    fn over_budget(&self) -> bool {
        self.started.elapsed() >= self.settings.budget
    }

    /// Execute `sequences` and return the statistics and run context.
    pub fn run(mut self, sca: &SequenceCoveringArray, sequences: &[Vec<OperationId>]) -> RunReport {
        self.started = Instant::now();
        self.stats.operations = self.operations.len();
        self.stats.record_sequences(sequences, sca.strength());

        let mut ordered: Vec<&Vec<OperationId>> = sequences.iter().collect();
        ordered.sort_by_key(|sequence| sequence.len());

        let mut executed = Vec::new();
        let mut succeeded = Vec::new();
        for (number, sequence) in ordered.into_iter().enumerate() {
            if self.over_budget() {
                self.stats.aborted = true;
                break;
            }
            let trace = self.run_sequence(sequence);
            tracing::info!(
                sequence = number + 1,
                length = sequence.len(),
                executed = trace.executed.len(),
                succeeded = trace.succeeded.len(),
                requests = self.stats.requests,
                "sequence finished"
            );
            executed.push(trace.executed);
            succeeded.push(trace.succeeded);
            if trace.aborted {
                self.stats.aborted = true;
                break;
            }
        }
        if self.stats.aborted {
            tracing::warn!(
                elapsed_ms = self.started.elapsed().as_millis(),
                "time budget exhausted; reporting partial results"
            );
        }
        self.stats
            .record_coverage(&sca.coverage(&executed), &sca.coverage(&succeeded));

        if self.settings.cleanup {
            self.cleanup();
        }

        self.stats.bugs = self.runtime.bugs().len();
        self.stats.oracle_calls = self.oracle.as_ref().map_or(0, Oracle::calls);
        self.stats.cost_ms = self.started.elapsed().as_millis();
        RunReport {
            stats: self.stats,
            runtime: self.runtime,
            oracle_log: self
                .oracle
                .map(|oracle| oracle.log().to_vec())
                .unwrap_or_default(),
        }
    }

    fn run_sequence(&mut self, sequence: &[OperationId]) -> SequenceTrace {
        let mut trace = SequenceTrace::default();
        for position in 0..sequence.len() {
            let (outcome, tally) = self.run_step(sequence, position);
            if tally.requests > 0 {
                trace.executed.push(sequence[position].clone());
            }
            if tally.successes > 0 {
                trace.succeeded.push(sequence[position].clone());
            }
            match outcome {
                StepOutcome::Aborted => {
                    trace.aborted = true;
                    break;
                }
                StepOutcome::NoBreakout => {
                    self.stats.unproductive_steps += 1;
                    tracing::debug!(operation = %sequence[position], "step did not break out");
                }
                StepOutcome::BrokeOut => {}
            }
            if tally.successes == 0 {
                let carried = self
                    .runtime
                    .carry_chains(&sequence[..position], &sequence[position]);
                if carried > 0 {
                    tracing::debug!(operation = %sequence[position], carried, "response chains carried past step");
                }
            }
        }
        trace
    }

    fn run_step(&mut self, sequence: &[OperationId], position: usize) -> (StepOutcome, StepTally) {
        let mut tally = StepTally::default();
        let Some(&idx) = self.index.get(&sequence[position]) else {
            tracing::warn!(operation = %sequence[position], "unknown operation in sequence");
            return (StepOutcome::NoBreakout, tally);
        };
        let mut outcome = self.try_chains(sequence, position, idx, &mut tally);
        if outcome == StepOutcome::NoBreakout && self.escalate(idx, &tally) {
            outcome = self.try_chains(sequence, position, idx, &mut tally);
        }
        (outcome, tally)
    }

    fn try_chains(
        &mut self,
        sequence: &[OperationId],
        position: usize,
        idx: usize,
        tally: &mut StepTally,
    ) -> StepOutcome {
        for chain in self.runtime.chains_for(&sequence[..position]) {
            if self.over_budget() {
                return StepOutcome::Aborted;
            }
            match self.run_chain(sequence, position, idx, &chain, tally) {
                StepOutcome::NoBreakout => continue,
                outcome => return outcome,
            }
        }
        StepOutcome::NoBreakout
    }

    /// One attempt at a step against one response chain.
    fn run_chain(
        &mut self,
        sequence: &[OperationId],
        position: usize,
        idx: usize,
        chain: &ResponseChain,
        tally: &mut StepTally,
    ) -> StepOutcome {
        let mut op = self.operations[idx].clone();
        let id = op.id();
        op.prepare_round(&self.runtime.hints(&id), &self.runtime.groups(&id));
        let dropped = op.refresh_bindings(&|target: &OperationId| chain.get(target));
        let unresolved = op.generate_domains(&mut self.rng);
        self.runtime.clear_unresolved(&id);
        for (param, reason) in &unresolved {
            self.runtime.mark_unresolved(&id, param);
            tracing::debug!(operation = %id, param = %param, reason = %reason, "parameter unresolved");
        }
        self.stats.unresolved_params += unresolved.len();
        for leaf in op.leaves() {
            let classes: Vec<String> = leaf.equivalences.iter().map(|class| class.label()).collect();
            tracing::trace!(operation = %id, param = %leaf.global_name(), ?classes, "equivalence classes");
        }
        if dropped > 0 {
            tracing::debug!(operation = %id, dropped, "bindings dropped for this chain");
        }

        let key = &sequence[..=position];
        let essential_names: BTreeSet<String> = op
            .domain_map(true)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let mut state = StepState::NotStarted;
        let mut history: Vec<Row> = Vec::new();
        let mut broke_out = false;
        loop {
            tracing::trace!(operation = %id, ?state, "step state");
            state = match state {
                StepState::NotStarted => {
                    if op.leaves().is_empty() {
                        let batch = self.execute_rows(
                            &op,
                            sequence,
                            position,
                            chain,
                            Phase::Essential,
                            &[],
                            vec![Row::new()],
                            tally,
                        );
                        if batch.aborted {
                            return StepOutcome::Aborted;
                        }
                        broke_out |= batch.broke_out;
                        StepState::Done
                    } else {
                        StepState::EssentialCovering
                    }
                }
                StepState::EssentialCovering => {
                    let domains = op.domain_map(true);
                    if let Some(rows) = self.rows_for(&op, key, Phase::Essential, &domains, &[]) {
                        let batch = self.execute_rows(
                            &op,
                            sequence,
                            position,
                            chain,
                            Phase::Essential,
                            &domains,
                            rows,
                            tally,
                        );
                        if batch.aborted {
                            return StepOutcome::Aborted;
                        }
                        broke_out |= batch.broke_out;
                        history = batch.history();
                    }
                    StepState::EssentialExecuted
                }
                StepState::EssentialExecuted => {
                    if op.all_essential() {
                        StepState::Done
                    } else {
                        StepState::FullCovering
                    }
                }
                StepState::FullCovering => {
                    let domains = op.domain_map(false);
                    let adds_params = domains
                        .iter()
                        .any(|(name, _)| !essential_names.contains(name));
                    if adds_params {
                        if let Some(rows) = self.rows_for(&op, key, Phase::All, &domains, &history) {
                            let batch = self.execute_rows(
                                &op,
                                sequence,
                                position,
                                chain,
                                Phase::All,
                                &domains,
                                rows,
                                tally,
                            );
                            if batch.aborted {
                                return StepOutcome::Aborted;
                            }
                            broke_out |= batch.broke_out;
                        }
                    }
                    StepState::FullExecuted
                }
                StepState::FullExecuted => StepState::Done,
                StepState::Done => break,
            };
        }
        if broke_out {
            StepOutcome::BrokeOut
        } else {
            StepOutcome::NoBreakout
        }
    }

    /// Rows for one phase: replayed from the reuse cache when this exact
    /// sequence prefix already succeeded, otherwise a fresh covering array.
    /// `None` when the array could not be computed.
    fn rows_for(
        &mut self,
        op: &RestOperation,
        key: &[OperationId],
        phase: Phase,
        domains: &[(String, Vec<Value>)],
        history: &[Row],
    ) -> Option<Vec<Row>> {
        if let Some(cached) = self.runtime.cached_rows(key, phase) {
            self.stats.reuse_hits += 1;
            let accepts = |name: &str, val: &Json| {
                op.find_leaf(name).is_some_and(|leaf| leaf.accepts(val))
            };
            return Some(
                cached
                    .iter()
                    .map(|row| replay_row(row, domains, accepts))
                    .collect(),
            );
        }
        if domains.is_empty() {
            return Some(if history.is_empty() {
                vec![Row::new()]
            } else {
                history.to_vec()
            });
        }
        let id = op.id();
        let name = array_name(&id, phase);
        self.stats.ca_invocations += 1;
        let start = Instant::now();
        let domains = domains.to_vec();
        match covering_array(
            self.tool,
            &name,
            &domains,
            &op.constraints,
            history,
            self.settings.ca_strength,
        ) {
            Ok(rows) => {
                tracing::info!(
                    operation = %id,
                    ?phase,
                    params = domains.len(),
                    history = history.len(),
                    rows = rows.len(),
                    elapsed_ms = start.elapsed().as_millis(),
                    "covering array ready"
                );
                Some(rows)
            }
            Err(err) => {
                self.stats.ca_failures += 1;
                tracing::warn!(operation = %id, ?phase, error = %format!("{err:#}"), "covering array failed");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_rows(
        &mut self,
        op: &RestOperation,
        sequence: &[OperationId],
        position: usize,
        chain: &ResponseChain,
        phase: Phase,
        domains: &[(String, Vec<Value>)],
        rows: Vec<Row>,
        tally: &mut StepTally,
    ) -> Batch {
        let id = op.id();
        let mut batch = Batch::default();
        for mut row in rows {
            if self.over_budget() {
                batch.aborted = true;
                break;
            }
            op.apply_input_bindings(&mut row);
            let request = build_request(op, &row, &self.settings.base_url, &self.settings.headers);
            let response = self.transport.send(&request);
            self.stats.record_response(&id, response.status);
            tally.requests += 1;
            tracing::debug!(operation = %id, status = response.status, url = %request.full_url(), "request executed");

            match classify(response.status) {
                StatusClass::Success => {
                    tally.successes += 1;
                    batch.broke_out = true;
                    self.runtime
                        .remember(&sequence[..=position], phase, &row, domains);
                    let body = response.body.as_json().cloned().unwrap_or(Json::Null);
                    if op.method == Method::Post {
                        if let Some(created) = created_id(&body) {
                            self.runtime.record_created(&id, &request.url, created);
                        }
                    }
                    self.runtime
                        .push_chain(&sequence[..position], &id, chain, body);
                    batch.succeeded.push(row.clone());
                }
                StatusClass::ServerError => {
                    batch.broke_out = true;
                    let signature = response.body.signature();
                    let bug = BugRecord {
                        operation: id.clone(),
                        status: response.status,
                        signature,
                        sequence: sequence[..=position].to_vec(),
                        assignment: row.clone(),
                        request,
                        response: response.body,
                        chain: chain.clone(),
                    };
                    if self.runtime.record_bug(bug) {
                        tracing::warn!(operation = %id, status = response.status, "server error recorded");
                    }
                }
                _ => tally.observe(response.body.text()),
            }
            batch.executed.push(row);
        }
        batch
    }

    /// Ask the oracle about a step that saw only failures. Returns whether
    /// anything new was learned.
    fn escalate(&mut self, idx: usize, tally: &StepTally) -> bool {
        let Some(oracle) = self.oracle.as_mut() else {
            return false;
        };
        if oracle.exhausted() || tally.requests == 0 {
            return false;
        }
        let op = &self.operations[idx];
        let id = op.id();
        let ctx = OracleContext::from_operation(op, tally.observed.clone());
        let mut learned = false;

        let focus = match oracle.extract_problem_params(&ctx) {
            Ok(params) => {
                self.runtime.mark_problem_params(&id, &params);
                params
            }
            Err(err) => {
                tracing::warn!(operation = %id, error = %format!("{err:#}"), "oracle problem-param extraction failed");
                Vec::new()
            }
        };
        match oracle.propose_values(&ctx, &focus) {
            Ok(values) if !values.is_empty() => {
                self.runtime.add_hints(&id, &values);
                learned = true;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(operation = %id, error = %format!("{err:#}"), "oracle value proposal failed");
            }
        }
        match oracle.extract_constraint_grouping(&ctx) {
            Ok(groups) if !groups.is_empty() => {
                self.runtime.add_groups(&id, groups);
                learned = true;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(operation = %id, error = %format!("{err:#}"), "oracle constraint grouping failed");
            }
        }
        tracing::info!(operation = %id, learned, calls = oracle.calls(), "oracle consulted");
        learned
    }

    /// Delete resources created during the run through the matching
    /// `DELETE` operation, budget permitting.
    fn cleanup(&mut self) {
        let created = self.runtime.created().to_vec();
        for resource in created {
            if self.over_budget() {
                tracing::warn!(remaining = self.runtime.created().len(), "cleanup stopped by time budget");
                break;
            }
            let Some(&post_idx) = self.index.get(&resource.operation) else {
                continue;
            };
            let post_path = &self.operations[post_idx].path;
            let has_delete = self.operations.iter().any(|op| {
                op.method == Method::Delete
                    && op.path.len() == post_path.len() + 1
                    && is_prefix(post_path, &op.path)
                    && matches!(op.path.last(), Some(PathToken::Param(_)))
                    && op.params.iter().all(|param| {
                        param.location == Location::Path || !param.factor.is_essential()
                    })
            });
            if !has_delete {
                continue;
            }
            let request = HttpRequest {
                method: Method::Delete,
                url: format!(
                    "{}/{}",
                    resource.url.trim_end_matches('/'),
                    encode_component(&render_plain(&resource.id))
                ),
                query: Vec::new(),
                headers: self
                    .settings
                    .headers
                    .iter()
                    .map(|(key, val)| (key.clone(), val.clone()))
                    .collect(),
                body: RequestBody::Empty,
            };
            let response = self.transport.send(&request);
            self.stats.cleanup_requests += 1;
            tracing::info!(url = %request.url, status = response.status, "cleanup delete");
        }
    }
}

/// Identifier a creating POST returned at the top of its body.
fn created_id(body: &Json) -> Option<Json> {
    body.as_object()?
        .get("id")
        .filter(|id| id.is_string() || id.is_number())
        .cloned()
}

/// Tool-friendly name for a covering array.
fn array_name(id: &OperationId, phase: Phase) -> String {
    let mut name: String = id
        .as_str()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    name.push_str(match phase {
        Phase::Essential => "_essential",
        Phase::All => "_all",
    });
    name
}

/// Build the sequence covering array for `operations` and run it.
pub fn run_all(
    operations: Vec<RestOperation>,
    transport: &dyn Transport,
    tool: &dyn CoveringArrayTool,
    oracle: Option<Oracle>,
    settings: ExecutorSettings,
    sequence_strength: usize,
) -> (Vec<Vec<OperationId>>, RunReport) {
    let mut rng = match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut sca = SequenceCoveringArray::new(&operations, sequence_strength);
    let sequences = sca.build(&mut rng);
    tracing::info!(
        sequences = sequences.len(),
        strength = sca.strength(),
        "sequence covering array built"
    );
    let mut executor = Executor::new(operations, transport, tool, settings);
    if let Some(oracle) = oracle {
        executor = executor.with_oracle(oracle);
    }
    let report = executor.run(&sca, &sequences);
    (sequences, report)
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
