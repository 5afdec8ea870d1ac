//! Templated URL paths and same-resource clustering.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathToken {
    Literal(String),
    Param(String),
}

impl PathToken {
    /// Literals match by text; any parameter matches any parameter.
    pub fn matches(&self, other: &PathToken) -> bool {
        match (self, other) {
            (Self::Literal(left), Self::Literal(right)) => left == right,
            (Self::Param(_), Self::Param(_)) => true,
            _ => false,
        }
    }

    pub fn param_name(&self) -> Option<&str> {
        match self {
            Self::Param(name) => Some(name),
            Self::Literal(_) => None,
        }
    }
}

/// Split `/items/{id}/tags` into literal and parameter tokens.
pub fn parse_template(path: &str) -> Vec<PathToken> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            match segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(name) => PathToken::Param(name.to_string()),
                None => PathToken::Literal(segment.to_string()),
            }
        })
        .collect()
}

pub fn render_template(tokens: &[PathToken]) -> String {
    if tokens.is_empty() {
        return "/".to_string();
    }
    tokens
        .iter()
        .map(|token| match token {
            PathToken::Literal(text) => format!("/{text}"),
            PathToken::Param(name) => format!("/{{{name}}}"),
        })
        .collect()
}

/// Whether `prefix` is a (non-strict) token prefix of `path`.
pub fn is_prefix(prefix: &[PathToken], path: &[PathToken]) -> bool {
    prefix.len() <= path.len()
        && prefix
            .iter()
            .zip(path)
            .all(|(left, right)| left.matches(right))
}

pub fn same_path(left: &[PathToken], right: &[PathToken]) -> bool {
    left.len() == right.len() && is_prefix(left, right)
}

/// `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &[PathToken], ancestor: &[PathToken]) -> bool {
    path.len() > ancestor.len() && is_prefix(ancestor, path)
}

pub fn is_same_or_descendant(path: &[PathToken], ancestor: &[PathToken]) -> bool {
    is_prefix(ancestor, path)
}

/// Group paths into same-resource families: two paths share a family when
/// one is a token prefix of the other (transitively).
pub fn cluster_paths(paths: &[Vec<PathToken>]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..paths.len()).collect();
    fn root(parent: &mut [usize], mut idx: usize) -> usize {
        while parent[idx] != idx {
            parent[idx] = parent[parent[idx]];
            idx = parent[idx];
        }
        idx
    }
    for left in 0..paths.len() {
        for right in left + 1..paths.len() {
            if is_prefix(&paths[left], &paths[right]) || is_prefix(&paths[right], &paths[left]) {
                let (a, b) = (root(&mut parent, left), root(&mut parent, right));
                if a != b {
                    parent[b.max(a)] = a.min(b);
                }
            }
        }
    }
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root = std::collections::BTreeMap::new();
    for idx in 0..paths.len() {
        let r = root(&mut parent, idx);
        let slot = *slot_of_root.entry(r).or_insert_with(|| {
            clusters.push(Vec::new());
            clusters.len() - 1
        });
        clusters[slot].push(idx);
    }
    clusters
}
