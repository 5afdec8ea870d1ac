//! Producer/consumer discovery over same-resource operation groups.
use super::matching::{best_field, MatchThresholds};
use super::path::{cluster_paths, is_prefix, same_path, PathToken};
use super::{Method, RestOperation};
use crate::model::{BindingTarget, DataType, Factor, ARRAY_ITEM_NAME};

/// Dotted field paths (root and array markers stripped) with their types.
pub fn response_fields(shape: &Factor) -> Vec<(String, DataType)> {
    let mut fields: Vec<(String, DataType)> = Vec::new();
    for leaf in shape.leaves() {
        let mut segments: Vec<String> = leaf.parent_path.iter().skip(1).cloned().collect();
        if !leaf.parent_path.is_empty() {
            segments.push(leaf.name.clone());
        }
        segments.retain(|segment| segment != ARRAY_ITEM_NAME);
        if segments.is_empty() {
            continue;
        }
        let field = segments.join(".");
        if !fields.iter().any(|(known, _)| known == &field) {
            fields.push((field, leaf.data_type()));
        }
    }
    fields
}

/// Register response bindings on consumer path parameters.
///
/// Returns the number of bindings registered.
pub fn discover_bindings(ops: &mut [RestOperation], thresholds: &MatchThresholds) -> usize {
    let paths: Vec<Vec<PathToken>> = ops.iter().map(|op| op.path.clone()).collect();
    let mut registered = 0;
    for group in cluster_paths(&paths) {
        let Some(&longest) = group.iter().max_by_key(|&&idx| (paths[idx].len(), usize::MAX - idx))
        else {
            continue;
        };
        let spine = paths[longest].clone();
        for (position, token) in spine.iter().enumerate() {
            if token.param_name().is_none() {
                continue;
            }
            let prefix = &spine[..position];
            let with_param = &spine[..=position];
            let resource = position
                .checked_sub(1)
                .and_then(|prev| match &spine[prev] {
                    PathToken::Literal(text) => Some(text.clone()),
                    PathToken::Param(_) => None,
                });
            let producers: Vec<usize> = group
                .iter()
                .copied()
                .filter(|&idx| ops[idx].method != Method::Delete)
                .filter(|&idx| same_path(&paths[idx], prefix) || same_path(&paths[idx], with_param))
                .collect();
            let consumers: Vec<usize> = group
                .iter()
                .copied()
                .filter(|&idx| paths[idx].len() > position && is_prefix(with_param, &paths[idx]))
                .collect();
            for &producer in &producers {
                let producer_id = ops[producer].id();
                let fields: Vec<(String, DataType)> = ops[producer]
                    .success_shapes()
                    .into_iter()
                    .flat_map(response_fields)
                    .collect();
                let names: Vec<String> = fields.iter().map(|(name, _)| name.clone()).collect();
                for &consumer in &consumers {
                    if consumer == producer {
                        continue;
                    }
                    let Some(param) = paths[consumer][position].param_name().map(str::to_string)
                    else {
                        continue;
                    };
                    let Some(field) = best_field(&param, &names, resource.as_deref(), thresholds)
                    else {
                        continue;
                    };
                    let data_type = fields
                        .iter()
                        .find(|(name, _)| name == field)
                        .map(|(_, data_type)| *data_type)
                        .unwrap_or(DataType::String);
                    let target = BindingTarget::Response {
                        operation: producer_id.clone(),
                        field: field.to_string(),
                        data_type,
                    };
                    let consumer_id = ops[consumer].id();
                    let Some(factor) = ops[consumer].path_param_mut(&param) else {
                        continue;
                    };
                    if factor.bindings.contains(&target) {
                        continue;
                    }
                    tracing::debug!(
                        consumer = %consumer_id,
                        param = %param,
                        target = %target.describe(),
                        "registered response binding"
                    );
                    factor.bindings.push(target);
                    registered += 1;
                }
            }
        }
    }
    registered
}
