//! Per-run context: reuse cache, response chains, bugs and learned hints.
//!
//! One instance lives for one run and is passed by reference to the
//! executor; binding resolution reads the response chains it keeps.
use crate::ca::Row;
use crate::http::{HttpRequest, ResponseBody};
use crate::model::{ConstraintGroup, Generator, Hints, Value};
use crate::rest::OperationId;
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Latest response body per operation executed along one sequence prefix.
pub type ResponseChain = BTreeMap<OperationId, Json>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Essential,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedValue {
    /// Position in the domain the value was drawn from.
    pub index: usize,
    pub value: Value,
}

pub type CachedRow = BTreeMap<String, CachedValue>;

#[derive(Debug, Clone, Serialize)]
pub struct BugRecord {
    pub operation: OperationId,
    pub status: u16,
    pub signature: String,
    pub sequence: Vec<OperationId>,
    pub assignment: Row,
    pub request: HttpRequest,
    pub response: ResponseBody,
    pub chain: ResponseChain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedResource {
    pub operation: OperationId,
    /// Collection URL the creating request was sent to.
    pub url: String,
    pub id: Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub reuse: BTreeMap<String, usize>,
    pub chains: BTreeMap<String, Vec<ResponseChain>>,
    pub unresolved: BTreeMap<OperationId, BTreeSet<String>>,
    pub problem_params: BTreeMap<OperationId, BTreeSet<String>>,
    pub hints: BTreeMap<OperationId, Hints>,
    pub groups: BTreeMap<OperationId, Vec<ConstraintGroup>>,
    pub created: Vec<CreatedResource>,
    pub bugs: usize,
}

fn sequence_key(ops: &[OperationId]) -> String {
    ops.iter()
        .map(OperationId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone)]
pub struct RuntimeInfoManager {
    chain_capacity: usize,
    chain_retries: usize,
    reuse: BTreeMap<(Vec<OperationId>, Phase), Vec<CachedRow>>,
    chains: BTreeMap<Vec<OperationId>, VecDeque<ResponseChain>>,
    bugs: Vec<BugRecord>,
    bug_keys: BTreeSet<(OperationId, u16, String)>,
    unresolved: BTreeMap<OperationId, BTreeSet<String>>,
    problem_params: BTreeMap<OperationId, BTreeSet<String>>,
    hints: BTreeMap<OperationId, Hints>,
    groups: BTreeMap<OperationId, Vec<ConstraintGroup>>,
    created: Vec<CreatedResource>,
}

impl RuntimeInfoManager {
    pub fn new(chain_capacity: usize, chain_retries: usize) -> Self {
        Self {
            chain_capacity: chain_capacity.max(1),
            chain_retries: chain_retries.max(1),
            reuse: BTreeMap::new(),
            chains: BTreeMap::new(),
            bugs: Vec::new(),
            bug_keys: BTreeSet::new(),
            unresolved: BTreeMap::new(),
            problem_params: BTreeMap::new(),
            hints: BTreeMap::new(),
            groups: BTreeMap::new(),
            created: Vec::new(),
        }
    }

    /// Chains to try for an operation executed after `prefix`, newest
    /// first. A prefix with no recorded chain yields one empty chain.
    pub fn chains_for(&self, prefix: &[OperationId]) -> Vec<ResponseChain> {
        match self.chains.get(prefix) {
            Some(chains) if !chains.is_empty() => chains
                .iter()
                .rev()
                .take(self.chain_retries)
                .cloned()
                .collect(),
            _ => vec![ResponseChain::new()],
        }
    }

    /// Record `chain` extended with a new response under the longer prefix,
    /// evicting the oldest chain beyond capacity.
    pub fn push_chain(
        &mut self,
        prefix: &[OperationId],
        operation: &OperationId,
        chain: &ResponseChain,
        body: Json,
    ) {
        let mut key = prefix.to_vec();
        key.push(operation.clone());
        let mut extended = chain.clone();
        extended.insert(operation.clone(), body);
        let slot = self.chains.entry(key).or_default();
        slot.push_back(extended);
        while slot.len() > self.chain_capacity {
            slot.pop_front();
        }
    }

    /// Make the chains recorded after `prefix` visible after `operation`
    /// too, when `operation` recorded none of its own. Returns how many
    /// chains were carried.
    pub fn carry_chains(&mut self, prefix: &[OperationId], operation: &OperationId) -> usize {
        let mut key = prefix.to_vec();
        key.push(operation.clone());
        if self.chains.get(&key).is_some_and(|slot| !slot.is_empty()) {
            return 0;
        }
        let Some(inherited) = self
            .chains
            .get(prefix)
            .filter(|slot| !slot.is_empty())
            .cloned()
        else {
            return 0;
        };
        let carried = inherited.len();
        self.chains.insert(key, inherited);
        carried
    }

    pub fn cached_rows(&self, sequence: &[OperationId], phase: Phase) -> Option<&[CachedRow]> {
        self.reuse
            .get(&(sequence.to_vec(), phase))
            .map(Vec::as_slice)
            .filter(|rows| !rows.is_empty())
    }

    /// Remember a successful assignment, with each value's domain index.
    pub fn remember(
        &mut self,
        sequence: &[OperationId],
        phase: Phase,
        row: &Row,
        domains: &[(String, Vec<Value>)],
    ) {
        let cached: CachedRow = row
            .iter()
            .map(|(name, value)| {
                let index = domains
                    .iter()
                    .find(|(domain_name, _)| domain_name == name)
                    .and_then(|(_, domain)| domain.iter().position(|candidate| candidate == value))
                    .unwrap_or(0);
                (
                    name.clone(),
                    CachedValue {
                        index,
                        value: value.clone(),
                    },
                )
            })
            .collect();
        let slot = self.reuse.entry((sequence.to_vec(), phase)).or_default();
        if !slot.contains(&cached) {
            slot.push(cached);
        }
    }

    pub fn record_bug(&mut self, bug: BugRecord) -> bool {
        let key = (bug.operation.clone(), bug.status, bug.signature.clone());
        if !self.bug_keys.insert(key) {
            return false;
        }
        self.bugs.push(bug);
        true
    }

    pub fn bugs(&self) -> &[BugRecord] {
        &self.bugs
    }

    pub fn mark_unresolved(&mut self, operation: &OperationId, param: &str) {
        self.unresolved
            .entry(operation.clone())
            .or_default()
            .insert(param.to_string());
    }

    pub fn clear_unresolved(&mut self, operation: &OperationId) {
        self.unresolved.remove(operation);
    }

    pub fn mark_problem_params(&mut self, operation: &OperationId, params: &[String]) {
        self.problem_params
            .entry(operation.clone())
            .or_default()
            .extend(params.iter().cloned());
    }

    pub fn problem_params(&self, operation: &OperationId) -> BTreeSet<String> {
        self.problem_params
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_hints(&mut self, operation: &OperationId, values: &BTreeMap<String, Vec<Json>>) {
        let hints = self.hints.entry(operation.clone()).or_default();
        for (param, proposed) in values {
            let slot = hints.entry(param.clone()).or_default();
            for value in proposed {
                if !slot.contains(value) {
                    slot.push(value.clone());
                }
            }
        }
    }

    pub fn hints(&self, operation: &OperationId) -> Hints {
        self.hints.get(operation).cloned().unwrap_or_default()
    }

    pub fn add_groups(&mut self, operation: &OperationId, groups: Vec<ConstraintGroup>) {
        let known = self.groups.entry(operation.clone()).or_default();
        for group in groups {
            if !known.contains(&group) {
                known.push(group);
            }
        }
    }

    pub fn groups(&self, operation: &OperationId) -> Vec<ConstraintGroup> {
        self.groups.get(operation).cloned().unwrap_or_default()
    }

    pub fn record_created(&mut self, operation: &OperationId, url: &str, id: Json) {
        let resource = CreatedResource {
            operation: operation.clone(),
            url: url.to_string(),
            id,
        };
        if !self.created.contains(&resource) {
            self.created.push(resource);
        }
    }

    pub fn created(&self) -> &[CreatedResource] {
        &self.created
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            reuse: self
                .reuse
                .iter()
                .map(|((sequence, phase), rows)| {
                    let phase = match phase {
                        Phase::Essential => "essential",
                        Phase::All => "all",
                    };
                    (format!("{} [{phase}]", sequence_key(sequence)), rows.len())
                })
                .collect(),
            chains: self
                .chains
                .iter()
                .map(|(prefix, chains)| (sequence_key(prefix), chains.iter().cloned().collect()))
                .collect(),
            unresolved: self.unresolved.clone(),
            problem_params: self.problem_params.clone(),
            hints: self.hints.clone(),
            groups: self.groups.clone(),
            created: self.created.clone(),
            bugs: self.bugs.len(),
        }
    }
}

/// Rebuild a cached assignment against the current domains.
///
/// Dynamic values are re-resolved from the domain slot they came from, since
/// the ids they carried may be stale. Other values are replayed verbatim
/// while `accepts` still admits them, else they take their slot too.
/// Parameters new to the domain map take their first class.
pub fn replay_row<F>(cached: &CachedRow, domains: &[(String, Vec<Value>)], accepts: F) -> Row
where
    F: Fn(&str, &Json) -> bool,
{
    let mut row = Row::new();
    for (name, entry) in cached {
        let current = domains
            .iter()
            .find(|(domain_name, _)| domain_name == name)
            .map(|(_, domain)| domain);
        if entry.value.generator != Generator::Dynamic && accepts(name, &entry.value.val) {
            row.insert(name.clone(), entry.value.reused());
            continue;
        }
        if let Some(fresh) = current.and_then(|domain| domain.get(entry.index)) {
            row.insert(name.clone(), fresh.clone());
        }
    }
    for (name, domain) in domains {
        if row.contains_key(name) {
            continue;
        }
        if let Some(first) = domain.first() {
            row.insert(name.clone(), first.clone());
        }
    }
    row
}
