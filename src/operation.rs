//! Operations describing one atomic mutation of a replicant value.
//!
//! An [`Operation`] is addressed by a JSON-pointer-like path (`/` is the root) and carries
//! an [`OpKind`]. Array mutators are not diffed: the receiver re-invokes the same mutator
//! with the same arguments, which keeps payloads small and avoids index-shift ambiguity.
//!
//! The wire form is `{ "path": .., "method": .., "args": .. }`, see [`Operation`]'s serde
//! implementation.

use std::cmp::Ordering;

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::{Backtrace, OptionExt, Snafu};

/// Path of the root node.
pub const ROOT: &str = "/";

/// Errors applying an [`Operation`] to a value.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ApplyError {
    #[snafu(display("no value at path {path}"))]
    PathNotFound { path: String },
    #[snafu(display("value at {path} is not an object or array"))]
    NotAContainer { path: String },
    #[snafu(display("value at {path} is not an array"))]
    NotAnArray { path: String },
    #[snafu(display("invalid array index {prop:?} at {path}"))]
    InvalidIndex { path: String, prop: String },
    #[snafu(display("invalid arguments for {method}: {reason}"))]
    InvalidArguments { method: String, reason: String },
    #[snafu(display("unknown method {method:?}"))]
    UnknownMethod { method: String },
}

/// One atomic mutation of a replicant value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub struct Operation {
    /// Path of the node the mutation applies to.
    pub path: String,
    /// What happens to the node.
    pub kind: OpKind,
}

/// The mutation an [`Operation`] performs, keyed by its method.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Set a property (or array index) to a new value.
    ///
    /// Setting a previously absent key is also an update.
    Update {
        /// Property name, or the decimal index for arrays.
        prop: String,
        /// The value after the mutation.
        new_value: Value,
    },
    /// Add a new property.
    ///
    /// Accepted from peers and applied like [`OpKind::Update`], never emitted locally.
    Add {
        /// Property name.
        prop: String,
        /// The value after the mutation.
        new_value: Value,
    },
    /// Remove a property.
    Delete {
        /// Property name, or the decimal index for arrays.
        prop: String,
    },
    /// Invoke an array mutator.
    Array(ArrayMutation),
}

/// An array mutator call with its original arguments.
#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum ArrayMutation {
    /// Append items, returns the new length.
    Push(Vec<Value>),
    /// Remove the last item.
    Pop,
    /// Remove the first item.
    Shift,
    /// Prepend items, returns the new length.
    Unshift(Vec<Value>),
    /// Remove `delete_count` items at `start` and insert `items` in their place.
    Splice {
        start: i64,
        delete_count: Option<i64>,
        items: Vec<Value>,
    },
    /// Sort with the default ordering: by string conversion, stable.
    Sort,
    /// Reverse in place.
    Reverse,
    /// Overwrite `start..end` with `value`.
    Fill {
        value: Value,
        start: Option<i64>,
        end: Option<i64>,
    },
    /// Copy `start..end` to `target`, within the same array.
    CopyWithin {
        target: i64,
        start: Option<i64>,
        end: Option<i64>,
    },
}

impl Operation {
    /// Create a new operation.
    pub fn new(path: impl Into<String>, kind: OpKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// The method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        self.kind.method()
    }

    /// Apply this operation to `root`, returning the mutator's return value.
    ///
    /// Property updates and deletes return [`Value::Null`].
    pub fn apply(&self, root: &mut Value) -> Result<Value, ApplyError> {
        let path = self.path.as_str();
        let target = resolve_mut(root, path)?;
        match &self.kind {
            OpKind::Update { prop, new_value } | OpKind::Add { prop, new_value } => {
                set_prop(target, path, prop, new_value.clone())?;
                Ok(Value::Null)
            }
            OpKind::Delete { prop } => {
                delete_prop(target, path, prop)?;
                Ok(Value::Null)
            }
            OpKind::Array(mutation) => {
                let array = target.as_array_mut().context(NotAnArraySnafu { path })?;
                Ok(mutation.apply(array))
            }
        }
    }
}

/// Apply `operations` in order.
///
/// On error `root` may be partially mutated, so callers apply to a scratch copy.
pub fn apply_operations(root: &mut Value, operations: &[Operation]) -> Result<(), ApplyError> {
    for op in operations {
        op.apply(root)?;
    }
    Ok(())
}

impl OpKind {
    /// The method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            OpKind::Update { .. } => "update",
            OpKind::Add { .. } => "add",
            OpKind::Delete { .. } => "delete",
            OpKind::Array(mutation) => mutation.into(),
        }
    }
}

impl ArrayMutation {
    /// The arguments of the original mutator call.
    pub fn mutator_args(&self) -> Vec<Value> {
        match self {
            ArrayMutation::Push(items) | ArrayMutation::Unshift(items) => items.clone(),
            ArrayMutation::Pop
            | ArrayMutation::Shift
            | ArrayMutation::Sort
            | ArrayMutation::Reverse => Vec::new(),
            ArrayMutation::Splice {
                start,
                delete_count,
                items,
            } => {
                let mut args = vec![Value::from(*start)];
                if let Some(count) = delete_count {
                    args.push(Value::from(*count));
                    args.extend(items.iter().cloned());
                }
                args
            }
            ArrayMutation::Fill { value, start, end } => {
                with_range(vec![value.clone()], *start, *end)
            }
            ArrayMutation::CopyWithin { target, start, end } => {
                with_range(vec![Value::from(*target)], *start, *end)
            }
        }
    }

    /// Rebuild a mutator call from its name and original arguments.
    pub fn from_args(method: &str, args: Vec<Value>) -> Result<Self, ApplyError> {
        let mutation = match method {
            "push" => ArrayMutation::Push(args),
            "unshift" => ArrayMutation::Unshift(args),
            "pop" => ArrayMutation::Pop,
            "shift" => ArrayMutation::Shift,
            "sort" => {
                // a comparator cannot travel over the wire
                if args.first().is_some_and(|a| !a.is_null()) {
                    return InvalidArgumentsSnafu {
                        method,
                        reason: "custom comparators are not supported",
                    }
                    .fail();
                }
                ArrayMutation::Sort
            }
            "reverse" => ArrayMutation::Reverse,
            "splice" => {
                // `splice()` without arguments removes nothing
                let no_args = args.is_empty();
                let mut args = args.into_iter();
                let start = index_arg(method, args.next())?.unwrap_or(0);
                let delete_count = index_arg(method, args.next())?;
                ArrayMutation::Splice {
                    start,
                    delete_count: if no_args { Some(0) } else { delete_count },
                    items: args.collect(),
                }
            }
            "fill" => {
                let mut args = args.into_iter();
                ArrayMutation::Fill {
                    value: args.next().unwrap_or(Value::Null),
                    start: index_arg(method, args.next())?,
                    end: index_arg(method, args.next())?,
                }
            }
            "copyWithin" => {
                let mut args = args.into_iter();
                ArrayMutation::CopyWithin {
                    target: index_arg(method, args.next())?.unwrap_or(0),
                    start: index_arg(method, args.next())?,
                    end: index_arg(method, args.next())?,
                }
            }
            other => return UnknownMethodSnafu { method: other }.fail(),
        };
        Ok(mutation)
    }

    /// Run the mutator on `array` and return what the mutator returns.
    ///
    /// `pop`/`shift` on an empty array return [`Value::Null`].
    pub fn apply(&self, array: &mut Vec<Value>) -> Value {
        match self {
            ArrayMutation::Push(items) => {
                array.extend(items.iter().cloned());
                Value::from(array.len())
            }
            ArrayMutation::Pop => array.pop().unwrap_or(Value::Null),
            ArrayMutation::Shift => {
                if array.is_empty() {
                    Value::Null
                } else {
                    array.remove(0)
                }
            }
            ArrayMutation::Unshift(items) => {
                array.splice(0..0, items.iter().cloned());
                Value::from(array.len())
            }
            ArrayMutation::Splice {
                start,
                delete_count,
                items,
            } => {
                let len = array.len();
                let start = relative_index(*start, len);
                let count = match delete_count {
                    None => len - start,
                    Some(count) => (*count).clamp(0, (len - start) as i64) as usize,
                };
                let removed: Vec<Value> = array
                    .splice(start..start + count, items.iter().cloned())
                    .collect();
                Value::Array(removed)
            }
            ArrayMutation::Sort => {
                // stable, so equal keys keep their order
                array.sort_by(|a, b| compare_default(a, b));
                Value::Null
            }
            ArrayMutation::Reverse => {
                array.reverse();
                Value::Null
            }
            ArrayMutation::Fill { value, start, end } => {
                let len = array.len();
                let start = relative_index(start.unwrap_or(0), len);
                let end = relative_index(end.unwrap_or(len as i64), len);
                for slot in array.iter_mut().take(end).skip(start) {
                    *slot = value.clone();
                }
                Value::Null
            }
            ArrayMutation::CopyWithin { target, start, end } => {
                let len = array.len();
                let to = relative_index(*target, len);
                let from = relative_index(start.unwrap_or(0), len);
                let end = relative_index(end.unwrap_or(len as i64), len);
                let count = end.saturating_sub(from).min(len - to);
                let copied: Vec<Value> = array[from..from + count].to_vec();
                array.splice(to..to + count, copied);
                Value::Null
            }
        }
    }
}

/// Path of the child `prop` of the node at `parent`.
///
/// Property names are escaped as in RFC 6901 (`~` as `~0`, `/` as `~1`).
pub fn child_path(parent: &str, prop: &str) -> String {
    let escaped = prop.replace('~', "~0").replace('/', "~1");
    if parent == ROOT {
        format!("/{escaped}")
    } else {
        format!("{parent}/{escaped}")
    }
}

/// Resolve `path` below `root`.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path == ROOT {
        Some(root)
    } else {
        root.pointer(path)
    }
}

/// Resolve `path` below `root` for mutation.
pub fn resolve_mut<'a>(root: &'a mut Value, path: &str) -> Result<&'a mut Value, ApplyError> {
    if path == ROOT {
        return Ok(root);
    }
    root.pointer_mut(path).context(PathNotFoundSnafu { path })
}

fn set_prop(target: &mut Value, path: &str, prop: &str, new_value: Value) -> Result<(), ApplyError> {
    match target {
        Value::Object(map) => {
            map.insert(prop.to_string(), new_value);
            Ok(())
        }
        Value::Array(array) => {
            let index = array_index(path, prop)?;
            match index.cmp(&array.len()) {
                Ordering::Less => array[index] = new_value,
                Ordering::Equal => array.push(new_value),
                // no holes: an index past the end is refused
                Ordering::Greater => return InvalidIndexSnafu { path, prop }.fail(),
            }
            Ok(())
        }
        _ => NotAContainerSnafu { path }.fail(),
    }
}

fn delete_prop(target: &mut Value, path: &str, prop: &str) -> Result<bool, ApplyError> {
    match target {
        Value::Object(map) => Ok(map.remove(prop).is_some()),
        Value::Array(array) => {
            let index = array_index(path, prop)?;
            match array.get_mut(index) {
                // deleting an element leaves a hole, the length is unchanged
                Some(slot) => Ok(!std::mem::replace(slot, Value::Null).is_null()),
                None => Ok(false),
            }
        }
        _ => NotAContainerSnafu { path }.fail(),
    }
}

/// Read property `prop` of `target`, if `target` is a container holding it.
pub(crate) fn get_prop<'a>(target: &'a Value, prop: &str) -> Option<&'a Value> {
    match target {
        Value::Object(map) => map.get(prop),
        Value::Array(array) => prop.parse::<usize>().ok().and_then(|i| array.get(i)),
        _ => None,
    }
}

fn array_index(path: &str, prop: &str) -> Result<usize, ApplyError> {
    // "01" is a property name, not an index
    match prop.parse::<usize>() {
        Ok(index) if index.to_string() == prop => Ok(index),
        _ => InvalidIndexSnafu { path, prop }.fail(),
    }
}

/// Append optional `start`/`end` arguments, keeping `end` positional.
fn with_range(mut args: Vec<Value>, start: Option<i64>, end: Option<i64>) -> Vec<Value> {
    match (start, end) {
        (None, None) => {}
        (start, None) => args.extend(start.map(Value::from)),
        (start, Some(end)) => {
            args.push(start.map(Value::from).unwrap_or(Value::Null));
            args.push(Value::from(end));
        }
    }
    args
}

fn index_arg(method: &str, arg: Option<Value>) -> Result<Option<i64>, ApplyError> {
    match arg {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Some(i)),
            None => Ok(n.as_f64().map(|f| f.trunc() as i64)),
        },
        Some(other) => InvalidArgumentsSnafu {
            method,
            reason: format!("expected an index, got {other}"),
        }
        .fail(),
    }
}

/// Clamp a possibly negative index into `0..=len`.
fn relative_index(index: i64, len: usize) -> usize {
    if index < 0 {
        (len as i64 + index).max(0) as usize
    } else {
        (index as usize).min(len)
    }
}

/// The default sort order of arrays: compare the string conversions by UTF-16 code units.
fn compare_default(a: &Value, b: &Value) -> Ordering {
    sort_key(a).encode_utf16().cmp(sort_key(b).encode_utf16())
}

fn sort_key(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => format!("{f:.0}"),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => sort_key(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireOperation {
    path: String,
    method: String,
    #[serde(default)]
    args: Value,
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> Self {
        let method = op.method().to_string();
        let args = match op.kind {
            OpKind::Update { prop, new_value } | OpKind::Add { prop, new_value } => {
                json!({ "prop": prop, "newValue": new_value })
            }
            OpKind::Delete { prop } => json!({ "prop": prop }),
            OpKind::Array(mutation) => json!({ "mutatorArgs": mutation.mutator_args() }),
        };
        WireOperation {
            path: op.path,
            method,
            args,
        }
    }
}

impl TryFrom<WireOperation> for Operation {
    type Error = ApplyError;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        let WireOperation {
            path,
            method,
            mut args,
        } = wire;
        let method = method.as_str();
        let kind = match method {
            "update" | "add" => {
                let prop = prop_arg(method, &args)?;
                let new_value = args
                    .get_mut("newValue")
                    .map(Value::take)
                    .context(InvalidArgumentsSnafu {
                        method,
                        reason: "missing newValue",
                    })?;
                if method == "add" {
                    OpKind::Add { prop, new_value }
                } else {
                    OpKind::Update { prop, new_value }
                }
            }
            "delete" => OpKind::Delete {
                prop: prop_arg(method, &args)?,
            },
            _ => {
                let mutator_args = match args.get_mut("mutatorArgs").map(Value::take) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return InvalidArgumentsSnafu {
                            method,
                            reason: "mutatorArgs must be an array",
                        }
                        .fail();
                    }
                };
                OpKind::Array(ArrayMutation::from_args(method, mutator_args)?)
            }
        };
        Ok(Operation { path, kind })
    }
}

fn prop_arg(method: &str, args: &Value) -> Result<String, ApplyError> {
    match args.get("prop") {
        Some(Value::String(prop)) => Ok(prop.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => InvalidArgumentsSnafu {
            method,
            reason: "missing prop",
        }
        .fail(),
    }
}
