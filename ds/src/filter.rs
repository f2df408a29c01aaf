//! Dotted-path filters over JSON documents
//!
//! A `Filter` is a small predicate tree evaluated against a
//! `serde_json::Value`. Paths use dots to traverse nested objects and
//! transparently flatten arrays: `extensions.active == true` matches a
//! document when *any* element of the `extensions` array has
//! `active: true`.

use serde_json::Value;

/// Comparison operator for a single condition
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// At least one value at the path equals the operand
    Eq,
    /// No value at the path equals the operand (missing paths match)
    Ne,
    /// At least one value at the path is strictly less than the operand
    Lt,
    /// At least one value at the path is strictly greater than the operand
    Gt,
    /// At least one value at the path is contained in the operand array
    In,
    /// Path presence; operand is a boolean
    Exists,
}

/// A single `(path, op, value)` condition
#[derive(Debug, Clone)]
pub struct Condition {
    pub path: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Predicate tree over a JSON document
#[derive(Debug, Clone)]
pub enum Filter {
    /// Every sub-filter must match
    All(Vec<Filter>),
    /// At least one sub-filter must match
    Any(Vec<Filter>),
    /// Negation
    Not(Box<Filter>),
    /// Leaf condition
    Cond(Condition),
}

impl Filter {
    pub fn all(filters: Vec<Filter>) -> Self {
        Filter::All(filters)
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        Filter::Any(filters)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cond(Condition {
            path: path.into(),
            op: FilterOp::Eq,
            value: value.into(),
        })
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cond(Condition {
            path: path.into(),
            op: FilterOp::Ne,
            value: value.into(),
        })
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cond(Condition {
            path: path.into(),
            op: FilterOp::Lt,
            value: value.into(),
        })
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cond(Condition {
            path: path.into(),
            op: FilterOp::Gt,
            value: value.into(),
        })
    }

    pub fn is_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::Cond(Condition {
            path: path.into(),
            op: FilterOp::In,
            value: Value::Array(values),
        })
    }

    pub fn exists(path: impl Into<String>, present: bool) -> Self {
        Filter::Cond(Condition {
            path: path.into(),
            op: FilterOp::Exists,
            value: Value::Bool(present),
        })
    }

    /// Evaluate the filter against a document
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Any(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
            Filter::Cond(cond) => cond.matches(doc),
        }
    }
}

impl Condition {
    fn matches(&self, doc: &Value) -> bool {
        let mut found = Vec::new();
        resolve(doc, &self.path, &mut found);

        match self.op {
            FilterOp::Eq => found.iter().any(|v| **v == self.value),
            FilterOp::Ne => !found.iter().any(|v| **v == self.value),
            FilterOp::Lt => found
                .iter()
                .any(|v| compare(v, &self.value).is_some_and(|o| o == std::cmp::Ordering::Less)),
            FilterOp::Gt => found
                .iter()
                .any(|v| compare(v, &self.value).is_some_and(|o| o == std::cmp::Ordering::Greater)),
            FilterOp::In => match &self.value {
                Value::Array(candidates) => found.iter().any(|v| candidates.contains(v)),
                _ => false,
            },
            FilterOp::Exists => {
                let present = found.iter().any(|v| !v.is_null());
                present == self.value.as_bool().unwrap_or(true)
            }
        }
    }
}

/// Collect every value reachable at `path`, flattening arrays along the way
fn resolve<'a>(value: &'a Value, path: &str, out: &mut Vec<&'a Value>) {
    if let Value::Array(items) = value {
        for item in items {
            resolve(item, path, out);
        }
        return;
    }

    match path.split_once('.') {
        Some((head, rest)) => {
            if let Some(next) = value.get(head) {
                resolve(next, rest, out);
            }
        }
        None => {
            if let Some(leaf) = value.get(path) {
                if let Value::Array(items) = leaf {
                    out.extend(items.iter());
                } else {
                    out.push(leaf);
                }
            }
        }
    }
}

/// Ordering between two JSON scalars, if they are comparable
///
/// Strings that both parse as RFC 3339 timestamps compare as instants,
/// which keeps mixed fractional-second precision ordered correctly;
/// other strings compare lexically. Numbers compare numerically. Mixed
/// types are not comparable.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            if let (Ok(x), Ok(y)) = (
                chrono::DateTime::parse_from_rfc3339(x),
                chrono::DateTime::parse_from_rfc3339(y),
            ) {
                return Some(x.cmp(&y));
            }
            Some(x.as_str().cmp(y.as_str()))
        }
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64()?, y.as_f64()?);
            x.partial_cmp(&y)
        }
        _ => None,
    }
}
