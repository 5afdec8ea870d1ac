//! Sequence covering arrays over same-resource operations.
//!
//! Every legal ordered t-tuple of operations from one resource family must
//! appear (as a subsequence) in some emitted sequence. Sequences are grown
//! greedily and only ever hold legal orderings: no POST after an operation
//! on a resource below it, nothing on a resource after it was deleted.
use crate::rest::{
    cluster_paths, is_descendant, is_same_or_descendant, Method, OperationId, PathToken,
    RestOperation,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LengthCoverage {
    pub length: usize,
    pub total: usize,
    pub covered: usize,
}

#[derive(Debug, Clone)]
pub struct SequenceCoveringArray {
    ids: Vec<OperationId>,
    methods: Vec<Method>,
    paths: Vec<Vec<PathToken>>,
    requested: usize,
    strength: usize,
    /// Valid permutations per length (index = length - 1).
    permutations: Vec<Vec<Vec<usize>>>,
    uncovered: Vec<BTreeSet<Vec<usize>>>,
}

fn is_subsequence(needle: &[usize], haystack: &[usize]) -> bool {
    let mut rest = haystack.iter();
    needle.iter().all(|item| rest.any(|candidate| candidate == item))
}

fn permutations_of(items: &[usize], length: usize) -> Vec<Vec<usize>> {
    fn walk(items: &[usize], length: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == length {
            out.push(current.clone());
            return;
        }
        for &item in items {
            if current.contains(&item) {
                continue;
            }
            current.push(item);
            walk(items, length, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    walk(items, length, &mut Vec::with_capacity(length), &mut out);
    out
}

impl SequenceCoveringArray {
    pub fn new(ops: &[RestOperation], strength: usize) -> Self {
        let requested = strength.max(1);
        let mut model = Self {
            ids: ops.iter().map(RestOperation::id).collect(),
            methods: ops.iter().map(|op| op.method).collect(),
            paths: ops.iter().map(|op| op.path.clone()).collect(),
            requested,
            strength: 0,
            permutations: vec![Vec::new(); requested],
            uncovered: vec![BTreeSet::new(); requested],
        };
        for cluster in cluster_paths(&model.paths) {
            for length in 1..=cluster.len().min(requested) {
                for perm in permutations_of(&cluster, length) {
                    if model.is_valid(&perm) {
                        model.permutations[length - 1].push(perm);
                    }
                }
            }
        }
        model.strength = model
            .permutations
            .iter()
            .rposition(|bucket| !bucket.is_empty())
            .map_or(0, |idx| idx + 1);
        model.permutations.truncate(model.strength);
        model.uncovered = model
            .permutations
            .iter()
            .map(|bucket| bucket.iter().cloned().collect())
            .collect();
        if model.strength < requested {
            tracing::info!(
                requested,
                effective = model.strength,
                "sequence strength degraded to largest feasible"
            );
        }
        model
    }

    /// Strength actually guaranteed (at most the requested one).
    pub fn strength(&self) -> usize {
        self.strength
    }

    pub fn requested_strength(&self) -> usize {
        self.requested
    }

    pub fn uncovered_count(&self) -> usize {
        self.uncovered.iter().map(BTreeSet::len).sum()
    }

    pub fn total_count(&self) -> usize {
        self.permutations.iter().map(Vec::len).sum()
    }

    pub fn id(&self, idx: usize) -> &OperationId {
        &self.ids[idx]
    }

    /// Lifecycle legality of an ordering.
    pub fn is_valid(&self, perm: &[usize]) -> bool {
        perm.iter().enumerate().all(|(pos, &op)| match self.methods[op] {
            Method::Post => !perm[..pos]
                .iter()
                .any(|&prev| is_descendant(&self.paths[prev], &self.paths[op])),
            Method::Delete => !perm[pos + 1..]
                .iter()
                .any(|&next| is_same_or_descendant(&self.paths[next], &self.paths[op])),
            _ => true,
        })
    }

    fn can_append(&self, seq: &[usize], op: usize) -> bool {
        if seq.contains(&op) {
            return false;
        }
        let destroyed = seq.iter().any(|&prev| {
            self.methods[prev] == Method::Delete
                && is_same_or_descendant(&self.paths[op], &self.paths[prev])
        });
        if destroyed {
            return false;
        }
        self.methods[op] != Method::Post
            || !seq
                .iter()
                .any(|&prev| is_descendant(&self.paths[prev], &self.paths[op]))
    }

    /// Missing POSTs on ancestor resources of `op`, shallowest first, that
    /// can legally precede it.
    fn prerequisites(&self, seq: &[usize], op: usize) -> Vec<usize> {
        let mut needed: Vec<usize> = (0..self.ids.len())
            .filter(|&q| self.methods[q] == Method::Post)
            .filter(|&q| is_descendant(&self.paths[op], &self.paths[q]))
            .filter(|q| !seq.contains(q))
            .collect();
        needed.sort_by_key(|&q| (self.paths[q].len(), q));
        let mut scratch = seq.to_vec();
        let mut out = Vec::new();
        for q in needed {
            if self.can_append(&scratch, q) {
                scratch.push(q);
                out.push(q);
            }
        }
        out
    }

    /// One greedy step: append the operation completing the most uncovered
    /// permutations (longest first), with its POST prerequisites spliced in
    /// before it. Returns the sequence unchanged when nothing helps.
    pub fn extend<R: Rng + ?Sized>(&self, seq: &[usize], rng: &mut R) -> Vec<usize> {
        let candidates: Vec<usize> = (0..self.ids.len())
            .filter(|&op| self.can_append(seq, op))
            .collect();
        for c_len in (0..self.strength).rev() {
            let bucket = &self.uncovered[c_len];
            if bucket.is_empty() || c_len > seq.len() {
                continue;
            }
            let mut best_count = 0;
            let mut best: Vec<usize> = Vec::new();
            for &candidate in &candidates {
                let count = bucket
                    .iter()
                    .filter(|perm| perm[c_len] == candidate && is_subsequence(&perm[..c_len], seq))
                    .count();
                if count > best_count {
                    best_count = count;
                    best = vec![candidate];
                } else if count == best_count && count > 0 {
                    best.push(candidate);
                }
            }
            let Some(&chosen) = best.choose(rng) else {
                continue;
            };
            let mut next = seq.to_vec();
            next.extend(self.prerequisites(seq, chosen));
            next.push(chosen);
            return next;
        }
        seq.to_vec()
    }

    fn covered_by(&self, seq: &[usize]) -> Vec<(usize, Vec<usize>)> {
        self.uncovered
            .iter()
            .enumerate()
            .flat_map(|(idx, bucket)| {
                bucket
                    .iter()
                    .filter(|perm| is_subsequence(perm, seq))
                    .map(move |perm| (idx, perm.clone()))
            })
            .collect()
    }

    /// Drop every permutation `seq` covers; returns how many were dropped.
    pub fn mark_covered(&mut self, seq: &[usize]) -> usize {
        let covered = self.covered_by(seq);
        for (idx, perm) in &covered {
            self.uncovered[*idx].remove(perm);
        }
        covered.len()
    }

    /// Shortest uncovered permutation, with prerequisites spliced in.
    fn seed(&self) -> Option<Vec<usize>> {
        let perm = self.uncovered.iter().find_map(|bucket| bucket.iter().next())?;
        let mut seq = Vec::new();
        for &op in perm {
            let prereqs = self.prerequisites(&seq, op);
            seq.extend(prereqs);
            if self.can_append(&seq, op) {
                seq.push(op);
            }
        }
        if is_subsequence(perm, &seq) {
            Some(seq)
        } else {
            Some(perm.clone())
        }
    }

    fn grow<R: Rng + ?Sized>(&self, mut seq: Vec<usize>, rng: &mut R) -> Vec<usize> {
        loop {
            let next = self.extend(&seq, rng);
            if next.len() == seq.len() {
                return seq;
            }
            seq = next;
        }
    }

    /// Build sequences until every valid permutation is covered.
    pub fn build<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<Vec<OperationId>> {
        let mut sequences = Vec::new();
        while self.uncovered_count() > 0 {
            let mut seq = self.grow(Vec::new(), rng);
            if self.covered_by(&seq).is_empty() {
                let Some(seed) = self.seed() else {
                    break;
                };
                seq = self.grow(seed, rng);
            }
            let dropped = self.mark_covered(&seq);
            tracing::debug!(
                length = seq.len(),
                dropped,
                remaining = self.uncovered_count(),
                "sequence finalized"
            );
            if dropped == 0 {
                break;
            }
            sequences.push(seq.iter().map(|&idx| self.ids[idx].clone()).collect());
        }
        sequences
    }

    /// Permutations (per length) appearing in at least one of `sequences`.
    pub fn coverage(&self, sequences: &[Vec<OperationId>]) -> Vec<LengthCoverage> {
        let index: BTreeMap<&OperationId, usize> =
            self.ids.iter().enumerate().map(|(idx, id)| (id, idx)).collect();
        let resolved: Vec<Vec<usize>> = sequences
            .iter()
            .map(|seq| seq.iter().filter_map(|id| index.get(id).copied()).collect())
            .collect();
        self.permutations
            .iter()
            .enumerate()
            .map(|(idx, bucket)| LengthCoverage {
                length: idx + 1,
                total: bucket.len(),
                covered: bucket
                    .iter()
                    .filter(|perm| resolved.iter().any(|seq| is_subsequence(perm, seq)))
                    .count(),
            })
            .collect()
    }
}
