//! Factor and equivalence-class model.
//!
//! Every API parameter becomes a factor tree; each leaf partitions its value
//! space into a handful of equivalence classes and generates one concrete
//! value per class. Covering arrays work over the indices of those values.
mod constraint;
mod equivalence;
mod factor;
mod value;

pub use constraint::{Condition, ConstraintGroup, GroupKind};
pub use equivalence::{Binding, BindingTarget, Unresolved};
pub use factor::{Factor, FactorKind, Hints, ARRAY_ITEM_NAME};
pub use value::{render_plain, DataType, Generator, Value};
