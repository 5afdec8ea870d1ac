//! Covering arrays over equivalence-class indices.
//!
//! Each parameter becomes an integer pseudo-variable over `[0, domain size)`.
//! An external tool computes the array; rows come back as indices and are
//! mapped through the domains to concrete values. A previously computed
//! array can be folded in as one `history` pseudo-variable whose values are
//! its row numbers, so a second phase only covers interactions with the new
//! parameters.
mod acts;

pub use acts::ActsTool;

use crate::model::{Condition, Value};
use anyhow::{anyhow, bail, Result};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// `(global name, ordered domain)` pairs entering an array.
pub type DomainMap = [(String, Vec<Value>)];
/// One assignment, keyed by global name.
pub type Row = BTreeMap<String, Value>;

pub const HISTORY_PARAM: &str = "history";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolParam {
    pub pseudo: String,
    pub size: usize,
}

/// The model handed to a covering-array tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolModel {
    pub name: String,
    pub params: Vec<ToolParam>,
    pub constraints: Vec<String>,
}

impl ToolModel {
    /// Render in the tool's sectioned text grammar.
    pub fn render(&self) -> String {
        let mut out = format!("[System]\nName: {}\n\n[Parameter]\n", self.name);
        for param in &self.params {
            let values: Vec<String> = (0..param.size).map(|idx| idx.to_string()).collect();
            out.push_str(&format!("{}(int): {}\n", param.pseudo, values.join(",")));
        }
        if !self.constraints.is_empty() {
            out.push_str("\n[Constraint]\n");
            for constraint in &self.constraints {
                out.push_str(constraint);
                out.push('\n');
            }
        }
        out
    }
}

pub trait CoveringArrayTool {
    /// Rows of value indices, one column per `model.params` entry in order.
    fn generate(&self, model: &ToolModel, strength: usize) -> Result<Vec<Vec<usize>>>;
}

/// Parse tool output: `#` comments, a header of pseudo names, then rows of
/// indices. Columns are reordered to match `model.params`.
pub fn parse_output(text: &str, model: &ToolModel) -> Result<Vec<Vec<usize>>> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("covering-array output has no header"))?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let mut positions = Vec::with_capacity(model.params.len());
    for param in &model.params {
        let position = columns
            .iter()
            .position(|column| *column == param.pseudo)
            .ok_or_else(|| anyhow!("covering-array output lacks column {}", param.pseudo))?;
        positions.push(position);
    }
    let mut rows = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        if cells.len() != columns.len() {
            bail!("covering-array row {} has {} cells", line_no + 1, cells.len());
        }
        let mut row = Vec::with_capacity(positions.len());
        for (param, &position) in model.params.iter().zip(&positions) {
            let idx: usize = cells[position]
                .parse()
                .map_err(|_| anyhow!("covering-array cell {:?} is not an index", cells[position]))?;
            if idx >= param.size {
                bail!("index {idx} out of range for {}", param.pseudo);
            }
            row.push(idx);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Every combination of indices (used when the array is the full product).
pub fn cartesian(sizes: &[usize]) -> Vec<Vec<usize>> {
    let mut rows = vec![Vec::new()];
    for &size in sizes {
        let mut next = Vec::with_capacity(rows.len() * size);
        for row in &rows {
            for idx in 0..size {
                let mut extended = row.clone();
                extended.push(idx);
                next.push(extended);
            }
        }
        rows = next;
    }
    rows
}

/// A pseudo-variable and, per index, the value each original parameter takes.
struct Column {
    pseudo: String,
    values: BTreeMap<String, Vec<Json>>,
    size: usize,
}

enum Expr {
    Const(bool),
    Atom(String),
}

impl Expr {
    fn negate(self) -> Self {
        match self {
            Self::Const(flag) => Self::Const(!flag),
            Self::Atom(text) => Self::Atom(format!("!({text})")),
        }
    }

    fn join(terms: Vec<Expr>, op: &str, absorbing: bool) -> Self {
        let mut atoms = Vec::new();
        for term in terms {
            match term {
                Self::Const(flag) if flag == absorbing => return Self::Const(absorbing),
                Self::Const(_) => {}
                Self::Atom(text) => atoms.push(text),
            }
        }
        match atoms.len() {
            0 => Self::Const(!absorbing),
            1 => Self::Atom(atoms.remove(0)),
            _ => Self::Atom(format!("({})", atoms.join(&format!(" {op} ")))),
        }
    }
}

fn column_matching<'a, F>(columns: &'a [Column], param: &str, keep: F) -> Option<(&'a Column, Vec<usize>)>
where
    F: Fn(&Json) -> bool,
{
    let column = columns.iter().find(|column| column.values.contains_key(param))?;
    let indices = column.values[param]
        .iter()
        .enumerate()
        .filter(|(_, val)| keep(val))
        .map(|(idx, _)| idx)
        .collect();
    Some((column, indices))
}

fn index_set(column: &Column, indices: Vec<usize>) -> Expr {
    if indices.is_empty() {
        return Expr::Const(false);
    }
    if indices.len() == column.size {
        return Expr::Const(true);
    }
    Expr::join(
        indices
            .into_iter()
            .map(|idx| Expr::Atom(format!("{} = {idx}", column.pseudo)))
            .collect(),
        "||",
        true,
    )
}

fn translate(condition: &Condition, columns: &[Column]) -> Expr {
    match condition {
        Condition::Eq { param, value } if value.is_null() => {
            translate(&Condition::is_null(param), columns)
        }
        Condition::Eq { param, value } => {
            match column_matching(columns, param, |val| val == value) {
                Some((column, indices)) => index_set(column, indices),
                None => Expr::Const(false),
            }
        }
        Condition::Ne { param, value } if value.is_null() => {
            translate(&Condition::not_null(param), columns)
        }
        Condition::Ne { param, value } => {
            match column_matching(columns, param, |val| val != value) {
                Some((column, indices)) => index_set(column, indices),
                None => Expr::Const(true),
            }
        }
        Condition::IsNull { param } => match column_matching(columns, param, Json::is_null) {
            Some((column, indices)) => index_set(column, indices),
            None => Expr::Const(true),
        },
        Condition::NotNull { param } => {
            match column_matching(columns, param, |val| !val.is_null()) {
                Some((column, indices)) => index_set(column, indices),
                None => Expr::Const(false),
            }
        }
        Condition::And { terms } => Expr::join(
            terms.iter().map(|term| translate(term, columns)).collect(),
            "&&",
            false,
        ),
        Condition::Or { terms } => Expr::join(
            terms.iter().map(|term| translate(term, columns)).collect(),
            "||",
            true,
        ),
        Condition::Not { term } => translate(term, columns).negate(),
        Condition::Implies {
            premise,
            conclusion,
        } => match (translate(premise, columns), translate(conclusion, columns)) {
            (Expr::Const(false), _) | (_, Expr::Const(true)) => Expr::Const(true),
            (Expr::Const(true), conclusion) => conclusion,
            (premise, Expr::Const(false)) => premise.negate(),
            (Expr::Atom(premise), Expr::Atom(conclusion)) => {
                Expr::Atom(format!("({premise} => {conclusion})"))
            }
        },
    }
}

/// Compute a covering array of `strength` over `domains`.
///
/// With a non-empty `history`, the parameters it assigns are folded into a
/// single history column and only the remaining parameters are added.
/// Constraints are passed to the tool and re-checked on every returned row.
/// An empty domain map yields no rows.
pub fn covering_array(
    tool: &dyn CoveringArrayTool,
    name: &str,
    domains: &DomainMap,
    constraints: &[Condition],
    history: &[Row],
    strength: usize,
) -> Result<Vec<Row>> {
    let mut columns: Vec<Column> = Vec::new();
    if !history.is_empty() {
        let mut values: BTreeMap<String, Vec<Json>> = BTreeMap::new();
        for (name, _) in domains {
            if history.iter().any(|row| row.contains_key(name)) {
                let per_row = history
                    .iter()
                    .map(|row| row.get(name).map(|value| value.val.clone()).unwrap_or(Json::Null))
                    .collect();
                values.insert(name.clone(), per_row);
            }
        }
        columns.push(Column {
            pseudo: HISTORY_PARAM.to_string(),
            values,
            size: history.len(),
        });
    }
    let folded = |name: &str| history.iter().any(|row| row.contains_key(name));
    let fresh: Vec<&(String, Vec<Value>)> = domains
        .iter()
        .filter(|(name, _)| history.is_empty() || !folded(name.as_str()))
        .collect();
    for (idx, (name, domain)) in fresh.iter().enumerate() {
        let mut values = BTreeMap::new();
        values.insert(
            name.clone(),
            domain.iter().map(|value| value.val.clone()).collect(),
        );
        columns.push(Column {
            pseudo: format!("p{idx}"),
            values,
            size: domain.len(),
        });
    }
    if columns.is_empty() {
        return Ok(Vec::new());
    }
    if !history.is_empty() && fresh.is_empty() {
        return Ok(history.to_vec());
    }

    let mut rendered = Vec::new();
    for condition in constraints {
        match translate(condition, &columns) {
            Expr::Atom(text) => rendered.push(text),
            Expr::Const(true) => {}
            Expr::Const(false) => {
                tracing::warn!(array = name, ?condition, "unsatisfiable constraint dropped");
            }
        }
    }
    let model = ToolModel {
        name: name.to_string(),
        params: columns
            .iter()
            .map(|column| ToolParam {
                pseudo: column.pseudo.clone(),
                size: column.size,
            })
            .collect(),
        constraints: rendered,
    };

    let sizes: Vec<usize> = columns.iter().map(|column| column.size).collect();
    let index_rows = if columns.len() <= strength.max(1) {
        cartesian(&sizes)
    } else {
        tool.generate(&model, strength)?
    };

    let mut rows = Vec::with_capacity(index_rows.len());
    for index_row in index_rows {
        let mut row = Row::new();
        for (position, idx) in index_row.into_iter().enumerate() {
            if !history.is_empty() && position == 0 {
                row.extend(history[idx].clone());
                continue;
            }
            let offset = usize::from(!history.is_empty());
            let (name, domain) = fresh[position - offset];
            row.insert(name.clone(), domain[idx].clone());
        }
        if constraints.iter().all(|condition| condition.holds(&row)) {
            rows.push(row);
        }
    }
    Ok(rows)
}
