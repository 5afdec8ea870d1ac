//! Aggregate run statistics, serialized to `stats.json`.
use crate::http::{classify, StatusClass};
use crate::rest::OperationId;
use crate::sca::LengthCoverage;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Sequence permutations of one length: how many exist, how many appeared
/// in executed sequences, and how many in their successful parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrengthCoverage {
    pub length: usize,
    pub total: usize,
    pub executed: usize,
    pub succeeded: usize,
}

impl StrengthCoverage {
    pub fn executed_ratio(&self) -> f64 {
        ratio(self.executed, self.total)
    }

    pub fn succeeded_ratio(&self) -> f64 {
        ratio(self.succeeded, self.total)
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    part as f64 / total as f64
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatistics {
    pub operations: usize,
    pub sequences: usize,
    pub avg_sequence_length: f64,
    pub max_sequence_length: usize,
    pub sequence_strength: usize,
    pub coverage: Vec<StrengthCoverage>,
    pub requests: usize,
    pub status_classes: BTreeMap<StatusClass, usize>,
    pub status_codes: BTreeMap<u16, usize>,
    pub executed_operations: BTreeSet<OperationId>,
    pub succeeded_operations: BTreeSet<OperationId>,
    pub bugs: usize,
    pub ca_invocations: usize,
    pub ca_failures: usize,
    pub reuse_hits: usize,
    pub unresolved_params: usize,
    pub unproductive_steps: usize,
    pub oracle_calls: usize,
    pub cleanup_requests: usize,
    pub cost_ms: u128,
    pub aborted: bool,
}

impl RunStatistics {
    pub fn record_sequences(&mut self, sequences: &[Vec<OperationId>], strength: usize) {
        self.sequences = sequences.len();
        self.sequence_strength = strength;
        self.max_sequence_length = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let total: usize = sequences.iter().map(Vec::len).sum();
        self.avg_sequence_length = if sequences.is_empty() {
            0.0
        } else {
            total as f64 / sequences.len() as f64
        };
    }

    pub fn record_response(&mut self, operation: &OperationId, status: u16) {
        self.requests += 1;
        *self.status_codes.entry(status).or_default() += 1;
        let class = classify(status);
        *self.status_classes.entry(class).or_default() += 1;
        self.executed_operations.insert(operation.clone());
        if class == StatusClass::Success {
            self.succeeded_operations.insert(operation.clone());
        }
    }

    /// Zip per-length coverage of the executed and succeeded sequences.
    pub fn record_coverage(&mut self, executed: &[LengthCoverage], succeeded: &[LengthCoverage]) {
        self.coverage = executed
            .iter()
            .map(|entry| StrengthCoverage {
                length: entry.length,
                total: entry.total,
                executed: entry.covered,
                succeeded: succeeded
                    .iter()
                    .find(|other| other.length == entry.length)
                    .map_or(0, |other| other.covered),
            })
            .collect();
    }

    pub fn count(&self, class: StatusClass) -> usize {
        self.status_classes.get(&class).copied().unwrap_or(0)
    }

    /// One-line human summary.
    pub fn summary_line(&self) -> String {
        let coverage = self
            .coverage
            .iter()
            .map(|entry| {
                format!(
                    "t{}={:.0}%/{:.0}%",
                    entry.length,
                    entry.executed_ratio() * 100.0,
                    entry.succeeded_ratio() * 100.0
                )
            })
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} sequences, {} requests ({} ok, {} 4xx, {} 5xx, {} transport), {}/{} operations succeeded, {} bugs, coverage {}{}",
            self.sequences,
            self.requests,
            self.count(StatusClass::Success),
            self.count(StatusClass::ClientError),
            self.count(StatusClass::ServerError),
            self.count(StatusClass::Transport),
            self.succeeded_operations.len(),
            self.operations,
            self.bugs,
            if coverage.is_empty() { "n/a" } else { coverage.as_str() },
            if self.aborted { " (budget exhausted)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_are_bucketed() {
        let mut stats = RunStatistics::default();
        let get = OperationId::from("GET /items");
        let post = OperationId::from("POST /items");
        for status in [200, 201, 404, 500, 601] {
            stats.record_response(&get, status);
        }
        stats.record_response(&post, 400);
        assert_eq!(stats.requests, 6);
        assert_eq!(stats.count(StatusClass::Success), 2);
        assert_eq!(stats.count(StatusClass::ClientError), 2);
        assert_eq!(stats.count(StatusClass::ServerError), 1);
        assert_eq!(stats.count(StatusClass::Transport), 1);
        assert_eq!(stats.executed_operations.len(), 2);
        assert!(stats.succeeded_operations.contains(&get));
        assert!(!stats.succeeded_operations.contains(&post));
    }

    #[test]
    fn sequence_shape_and_coverage() {
        let mut stats = RunStatistics::default();
        let a = OperationId::from("POST /a");
        let b = OperationId::from("GET /a");
        stats.record_sequences(&[vec![a, b.clone()], vec![b]], 2);
        assert_eq!(stats.max_sequence_length, 2);
        assert!((stats.avg_sequence_length - 1.5).abs() < 1e-9);

        let executed = [
            LengthCoverage { length: 1, total: 2, covered: 2 },
            LengthCoverage { length: 2, total: 2, covered: 1 },
        ];
        let succeeded = [LengthCoverage { length: 1, total: 2, covered: 1 }];
        stats.record_coverage(&executed, &succeeded);
        assert_eq!(stats.coverage[1].succeeded, 0);
        assert!((stats.coverage[0].succeeded_ratio() - 0.5).abs() < 1e-9);
        let line = stats.summary_line();
        assert!(line.contains("t1=100%/50%"), "{line}");
    }

    #[test]
    fn serializes_status_maps_with_string_keys() {
        let mut stats = RunStatistics::default();
        stats.record_response(&OperationId::from("GET /x"), 503);
        let json = serde_json::to_value(&stats).expect("serialize");
        assert_eq!(json["status_codes"]["503"], 1);
        assert_eq!(json["status_classes"]["server_error"], 1);
    }
}
