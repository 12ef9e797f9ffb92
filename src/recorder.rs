//! Records in-place mutation of a value as a list of [`Operation`]s.
//!
//! A mutation turn is a closure receiving a [`NodeMut`] for the root. Every mutating call on
//! a [`NodeMut`] is applied to a scratch copy of the value and appended to the batch, so the
//! batch replayed with [`apply_operations`](crate::operation::apply_operations) on the
//! original value yields the scratch copy.
//!
//! Nodes do not hold references back into their replicant. A node is identified by its path
//! from the root, and values leaving one tree for another travel as [`NodeRef`] handles that
//! remember their owner.

use nested_enum_utils::common_fields;
use serde_json::Value;
use snafu::{Backtrace, Snafu};

use crate::{
    operation::{self, ApplyError, ArrayMutation, OpKind, Operation, ROOT},
    replicant::ReplicantKey,
};

/// Errors raised while recording a mutation turn.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum MutationError {
    /// The object or array belongs to another replicant's tree.
    #[snafu(display("value at {path} belongs to replicant {owner}, it cannot be assigned into {target}"))]
    Ownership {
        owner: ReplicantKey,
        target: ReplicantKey,
        path: String,
    },
    #[snafu(transparent)]
    Apply { source: ApplyError },
    /// The server refused to declare the replicant, there is nothing to change.
    #[snafu(display("replicant {replicant} was not declared"))]
    Undeclared { replicant: ReplicantKey },
}

/// A handle to a node of a replicant's value.
///
/// Carries a snapshot of the node's value and the replicant that owns it. Assigning a handle
/// into a different replicant fails with [`MutationError::Ownership`]; assigning it within the
/// same replicant copies the value.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRef {
    owner: ReplicantKey,
    path: String,
    value: Value,
}

impl NodeRef {
    pub(crate) fn new(owner: ReplicantKey, path: impl Into<String>, value: Value) -> Self {
        Self {
            owner,
            path: path.into(),
            value,
        }
    }

    /// The replicant owning this node.
    pub fn owner(&self) -> &ReplicantKey {
        &self.owner
    }

    /// The path of this node inside its owner.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The value of this node when the handle was taken.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// A value to be placed into a replicant's tree.
#[derive(Debug, Clone, PartialEq, derive_more::From)]
pub enum Assign {
    /// A fresh value, not part of any replicant yet.
    Value(Value),
    /// A node taken from a replicant.
    Node(NodeRef),
}

impl Assign {
    /// Resolve into a plain value owned by `target`.
    ///
    /// Primitive values carry no identity and may always be copied.
    pub(crate) fn into_owned_by(self, target: &ReplicantKey) -> Result<Value, MutationError> {
        match self {
            Assign::Value(value) => Ok(value),
            Assign::Node(node) => {
                let is_container = node.value.is_object() || node.value.is_array();
                if is_container && &node.owner != target {
                    return OwnershipSnafu {
                        owner: node.owner,
                        target: target.clone(),
                        path: node.path,
                    }
                    .fail();
                }
                Ok(node.value)
            }
        }
    }
}

/// Collects the operations of one mutation turn.
#[derive(Debug)]
pub struct Recorder {
    owner: ReplicantKey,
    value: Option<Value>,
    operations: Vec<Operation>,
}

impl Recorder {
    /// Start a turn on a scratch copy of `value`.
    pub fn new(owner: ReplicantKey, value: Option<Value>) -> Self {
        Self {
            owner,
            value,
            operations: Vec::new(),
        }
    }

    /// The cursor for the root node.
    pub fn root(&mut self) -> NodeMut<'_> {
        NodeMut {
            recorder: self,
            path: ROOT.to_string(),
        }
    }

    /// Finish the turn, returning the mutated scratch value and the operations.
    pub fn finish(self) -> (Option<Value>, Vec<Operation>) {
        (self.value, self.operations)
    }

    fn current(&self, path: &str) -> Option<&Value> {
        self.value.as_ref().and_then(|v| operation::resolve(v, path))
    }

    /// Apply `op` to the scratch value and append it to the batch.
    fn record(&mut self, op: Operation) -> Result<Value, MutationError> {
        let root = match self.value.as_mut() {
            Some(root) => root,
            None => {
                return Err(operation::PathNotFoundSnafu { path: op.path }
                    .build()
                    .into());
            }
        };
        let ret = op.apply(root)?;
        self.operations.push(op);
        Ok(ret)
    }
}

/// Run `f` on a scratch copy of `value`, returning its result, the mutated copy and the
/// operations it produced.
///
/// Equivalent mutations always produce equivalent operations.
pub fn record_operations<R>(
    owner: &ReplicantKey,
    value: Option<Value>,
    f: impl FnOnce(NodeMut<'_>) -> Result<R, MutationError>,
) -> Result<(R, Option<Value>, Vec<Operation>), MutationError> {
    let mut recorder = Recorder::new(owner.clone(), value);
    let out = f(recorder.root())?;
    let (value, operations) = recorder.finish();
    Ok((out, value, operations))
}

/// Mutation cursor for one node of the value being recorded.
///
/// Reads go straight to the scratch value. Every mutating call records exactly one
/// operation, except [`NodeMut::set`] with an unchanged value and [`NodeMut::delete`] of an
/// absent property, which record nothing.
#[derive(Debug)]
pub struct NodeMut<'r> {
    recorder: &'r mut Recorder,
    path: String,
}

impl<'r> NodeMut<'r> {
    /// The path of this node.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The current value of this node, `None` if it does not exist.
    pub fn get(&self) -> Option<&Value> {
        self.recorder.current(&self.path)
    }

    /// The current value of property `prop` of this node.
    pub fn get_prop(&self, prop: impl ToString) -> Option<&Value> {
        self.get()
            .and_then(|node| operation::get_prop(node, &prop.to_string()))
    }

    /// A handle to this node, for assigning it elsewhere in the same replicant.
    pub fn node_ref(&self) -> Option<NodeRef> {
        let value = self.get()?.clone();
        Some(NodeRef::new(
            self.recorder.owner.clone(),
            self.path.clone(),
            value,
        ))
    }

    /// A cursor for property `prop` of this node.
    ///
    /// The child is not checked for existence until it is used.
    pub fn child(&mut self, prop: impl ToString) -> NodeMut<'_> {
        NodeMut {
            path: operation::child_path(&self.path, &prop.to_string()),
            recorder: self.recorder,
        }
    }

    /// Like [`NodeMut::child`], consuming this cursor.
    pub fn into_child(self, prop: impl ToString) -> NodeMut<'r> {
        NodeMut {
            path: operation::child_path(&self.path, &prop.to_string()),
            recorder: self.recorder,
        }
    }

    /// Set property `prop` (or an array index) to `value`.
    ///
    /// Returns whether anything changed.
    pub fn set(&mut self, prop: impl ToString, value: impl Into<Assign>) -> Result<bool, MutationError> {
        let prop = prop.to_string();
        let new_value = value.into().into_owned_by(&self.recorder.owner)?;
        if self.get_prop(&prop) == Some(&new_value) {
            return Ok(false);
        }
        self.record(OpKind::Update { prop, new_value })?;
        Ok(true)
    }

    /// Delete property `prop`.
    ///
    /// Deleting an absent property succeeds without recording anything. Returns whether the
    /// property existed.
    pub fn delete(&mut self, prop: impl ToString) -> Result<bool, MutationError> {
        let prop = prop.to_string();
        match self.get() {
            Some(Value::Object(map)) if map.contains_key(&prop) => {}
            Some(Value::Array(items))
                if prop.parse::<usize>().is_ok_and(|i| i < items.len()) => {}
            Some(Value::Object(_)) | Some(Value::Array(_)) => return Ok(false),
            _ => {
                return Err(operation::NotAContainerSnafu { path: self.path.clone() }
                    .build()
                    .into());
            }
        }
        self.record(OpKind::Delete { prop })?;
        Ok(true)
    }

    /// Append `items`, returning the new length.
    pub fn push<I, A>(&mut self, items: I) -> Result<usize, MutationError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Assign>,
    {
        let items = self.resolve_all(items)?;
        let len = self.record(OpKind::Array(ArrayMutation::Push(items)))?;
        Ok(as_len(&len))
    }

    /// Remove and return the last item.
    pub fn pop(&mut self) -> Result<Option<Value>, MutationError> {
        let was_empty = self.is_empty_array();
        let removed = self.record(OpKind::Array(ArrayMutation::Pop))?;
        Ok((!was_empty).then_some(removed))
    }

    /// Remove and return the first item.
    pub fn shift(&mut self) -> Result<Option<Value>, MutationError> {
        let was_empty = self.is_empty_array();
        let removed = self.record(OpKind::Array(ArrayMutation::Shift))?;
        Ok((!was_empty).then_some(removed))
    }

    /// Prepend `items`, returning the new length.
    pub fn unshift<I, A>(&mut self, items: I) -> Result<usize, MutationError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Assign>,
    {
        let items = self.resolve_all(items)?;
        let len = self.record(OpKind::Array(ArrayMutation::Unshift(items)))?;
        Ok(as_len(&len))
    }

    /// Remove `delete_count` items at `start` (all remaining when `None`) and insert `items`
    /// in their place. Returns the removed items.
    pub fn splice<I, A>(
        &mut self,
        start: i64,
        delete_count: Option<i64>,
        items: I,
    ) -> Result<Vec<Value>, MutationError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Assign>,
    {
        let items = self.resolve_all(items)?;
        // inserting needs an explicit count to stay positional on the wire
        let delete_count = match delete_count {
            None if !items.is_empty() => Some(i64::MAX),
            count => count,
        };
        let removed = self.record(OpKind::Array(ArrayMutation::Splice {
            start,
            delete_count,
            items,
        }))?;
        match removed {
            Value::Array(removed) => Ok(removed),
            _ => Ok(Vec::new()),
        }
    }

    /// Sort by the default ordering: string conversion, stable.
    pub fn sort(&mut self) -> Result<(), MutationError> {
        self.record(OpKind::Array(ArrayMutation::Sort))?;
        Ok(())
    }

    /// Reverse in place.
    pub fn reverse(&mut self) -> Result<(), MutationError> {
        self.record(OpKind::Array(ArrayMutation::Reverse))?;
        Ok(())
    }

    /// Overwrite `start..end` with `value`.
    pub fn fill(
        &mut self,
        value: impl Into<Assign>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<(), MutationError> {
        let value = value.into().into_owned_by(&self.recorder.owner)?;
        self.record(OpKind::Array(ArrayMutation::Fill { value, start, end }))?;
        Ok(())
    }

    /// Copy `start..end` over the items at `target`.
    pub fn copy_within(
        &mut self,
        target: i64,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<(), MutationError> {
        self.record(OpKind::Array(ArrayMutation::CopyWithin { target, start, end }))?;
        Ok(())
    }

    fn record(&mut self, kind: OpKind) -> Result<Value, MutationError> {
        self.recorder
            .record(Operation::new(self.path.clone(), kind))
    }

    fn is_empty_array(&self) -> bool {
        self.get()
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty)
    }

    fn resolve_all<I, A>(&self, items: I) -> Result<Vec<Value>, MutationError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Assign>,
    {
        items
            .into_iter()
            .map(|item| item.into().into_owned_by(&self.recorder.owner))
            .collect()
    }
}

fn as_len(value: &Value) -> usize {
    value.as_u64().unwrap_or_default() as usize
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::operation::apply_operations;

    fn key(name: &str) -> ReplicantKey {
        ReplicantKey::new("ns", name)
    }

    #[test]
    fn push_records_one_operation() {
        let (len, value, ops) = record_operations(&key("arr"), Some(json!(["starting"])), |mut root| {
            root.push([json!("arrPushOK")])
        })
        .unwrap();
        assert_eq!(len, 2);
        assert_eq!(value, Some(json!(["starting", "arrPushOK"])));
        assert_eq!(ops.len(), 1);
        assert_eq!(
            serde_json::to_value(&ops[0]).unwrap(),
            json!({ "path": "/", "method": "push", "args": { "mutatorArgs": ["arrPushOK"] } })
        );
    }

    #[test]
    fn nested_set_records_child_path() {
        let (_, value, ops) = record_operations(&key("obj"), Some(json!({ "a": { "b": 1 } })), |mut root| {
            root.child("a").set("b", json!(2))?;
            root.set("c", json!([1]))?;
            root.child("c").push([json!(2)])
        })
        .unwrap();
        assert_eq!(value, Some(json!({ "a": { "b": 2 }, "c": [1, 2] })));
        let paths: Vec<_> = ops.iter().map(|op| (op.path.as_str(), op.method())).collect();
        assert_eq!(paths, vec![("/a", "update"), ("/", "update"), ("/c", "push")]);
    }

    #[test]
    fn unchanged_set_and_absent_delete_record_nothing() {
        let (res, _, ops) = record_operations(&key("obj"), Some(json!({ "a": 1 })), |mut root| {
            let changed = root.set("a", json!(1))?;
            let existed = root.delete("missing")?;
            Ok((changed, existed))
        })
        .unwrap();
        assert_eq!(res, (false, false));
        assert!(ops.is_empty());
    }

    #[test]
    fn pop_on_empty_array_still_records() {
        let (popped, _, ops) =
            record_operations(&key("arr"), Some(json!([])), |mut root| root.pop()).unwrap();
        assert_eq!(popped, None);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn foreign_node_is_rejected() {
        let shared = NodeRef::new(key("a"), "/x", json!({}));
        let res = record_operations(&key("b"), Some(json!({})), |mut root| {
            root.set("y", shared.clone())
        });
        assert!(matches!(res, Err(MutationError::Ownership { .. })));

        // primitives have no identity
        let primitive = NodeRef::new(key("a"), "/n", json!(3));
        let (_, value, _) =
            record_operations(&key("b"), Some(json!({})), |mut root| root.set("n", primitive))
                .unwrap();
        assert_eq!(value, Some(json!({ "n": 3 })));
    }

    #[test]
    fn own_node_is_copied() {
        let (_, value, _) = record_operations(&key("a"), Some(json!({ "x": { "k": 1 } })), |mut root| {
            let x = root.child("x").node_ref().expect("exists");
            root.set("y", x)?;
            root.child("y").set("k", json!(2))
        })
        .unwrap();
        assert_eq!(value, Some(json!({ "x": { "k": 1 }, "y": { "k": 2 } })));
    }

    #[test]
    fn mutating_undefined_fails() {
        let res = record_operations(&key("u"), None, |mut root| root.set("a", json!(1)));
        assert!(matches!(
            res,
            Err(MutationError::Apply {
                source: ApplyError::PathNotFound { .. },
                ..
            })
        ));
    }

    #[test]
    fn replay_matches_scratch_copy() {
        let start = json!({ "list": [3, 1, 2], "meta": { "title": "t" } });
        let (_, value, ops) = record_operations(&key("r"), Some(start.clone()), |mut root| {
            let mut list = root.child("list");
            list.sort()?;
            list.splice(1, Some(1), [json!("x")])?;
            list.reverse()?;
            list.fill(json!(0), Some(-1), None)?;
            list.copy_within(0, Some(1), Some(2))?;
            root.delete("meta")?;
            Ok(())
        })
        .unwrap();

        let mut replayed = start;
        apply_operations(&mut replayed, &ops).unwrap();
        assert_eq!(Some(replayed), value);
    }

    #[test]
    fn splice_with_items_and_no_count_stays_positional() {
        let (removed, value, ops) = record_operations(&key("s"), Some(json!([1, 2, 3])), |mut root| {
            root.splice(1, None, [json!("a")])
        })
        .unwrap();
        assert_eq!(removed, vec![json!(2), json!(3)]);
        assert_eq!(value, Some(json!([1, "a"])));

        let wire = serde_json::to_string(&ops).unwrap();
        let decoded: Vec<Operation> = serde_json::from_str(&wire).unwrap();
        let mut replayed = json!([1, 2, 3]);
        apply_operations(&mut replayed, &decoded).unwrap();
        assert_eq!(Some(replayed), value);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::from),
                any::<i32>().prop_map(Value::from),
                "[a-z]{0,6}".prop_map(Value::from),
            ]
        }

        proptest! {
            #[test]
            fn recorded_array_ops_replay(
                start in prop::collection::vec(leaf(), 0..8),
                pushed in prop::collection::vec(leaf(), 0..4),
                splice_start in -10i64..10,
                splice_count in prop::option::of(0i64..5),
            ) {
                let start = Value::Array(start);
                let (_, value, ops) = record_operations(&key("p"), Some(start.clone()), |mut root| {
                    root.push(pushed.clone())?;
                    root.splice(splice_start, splice_count, Vec::<Value>::new())?;
                    root.sort()?;
                    root.shift()?;
                    Ok(())
                })
                .unwrap();
                let wire = serde_json::to_string(&ops).unwrap();
                let decoded: Vec<Operation> = serde_json::from_str(&wire).unwrap();
                let mut replayed = start;
                apply_operations(&mut replayed, &decoded).unwrap();
                prop_assert_eq!(Some(replayed), value);
            }
        }
    }
}
