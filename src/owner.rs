//! Lifetime management for expression graph nodes.
//!
//! A [`GraphOwner`] holds every live node of one execution context. Nodes
//! are freed either one discarded subtree at a time ([`GraphOwner::free_set`]),
//! all at once ([`GraphOwner::free_all`]), or by reconciling against a
//! snapshot taken when the engine branched ([`GraphOwner::reconcile`]).
//!
//! Callers must only free nodes that no live root still reaches; the owner
//! performs no reachability checks of its own.
use std::sync::Arc;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use num_bigint::BigUint;
use smallvec::SmallVec;
use thiserror::Error;

use crate::engine::{ExprId, SymbolicVariable};
use crate::node::{BinaryOp, Node, NodeId, NodeKind, Payload, UnaryOp, VariableLeaf};

#[derive(Debug, Error)]
pub enum Error {
    #[error("variable `{0}` is already registered")]
    DuplicateVariable(Arc<str>),
    #[error("node {0} is not owned by this graph")]
    UnknownNode(NodeId),
}

pub struct GraphOwner {
    nodes: HashMap<NodeId, Arc<Node>>,
    variables: HashMap<Arc<str>, NodeId>,
    borrowed: bool,
}

impl Default for GraphOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphOwner {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::default(),
            variables: HashMap::default(),
            borrowed: false,
        }
    }

    /// Takes ownership of `node`. Registering the same node twice is a
    /// caller error; the second registration replaces the first.
    pub fn register(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, Arc::new(node));
        id
    }

    pub fn register_variable<S: Into<Arc<str>>>(&mut self, name: S, node: NodeId) -> Result<(), Error> {
        let name = name.into();
        if self.variables.contains_key(&name) {
            return Err(Error::DuplicateVariable(name));
        }
        self.variables.insert(name, node);
        Ok(())
    }

    /// Frees exactly the nodes in `nodes`, which the caller guarantees are
    /// unreachable from every remaining root. The set is emptied.
    pub fn free_set(&mut self, nodes: &mut HashSet<NodeId>) {
        let requested = nodes.len();
        let mut freed = 0;

        for id in nodes.drain() {
            if let Some(node) = self.nodes.remove(&id) {
                if let Some(var) = node.variable() {
                    let name = var.name_arc();
                    if self.variables.get(&name) == Some(&id) {
                        self.variables.remove(&name);
                    }
                }
                freed += 1;
            }
        }

        tracing::debug!(requested, freed, remaining = self.nodes.len(), "freed node set");
    }

    pub fn free_all(&mut self) {
        tracing::debug!(nodes = self.nodes.len(), "freeing all nodes");
        self.variables.clear();
        self.nodes.clear();
    }

    /// Every distinct node reachable from `root` through child edges.
    /// References are not followed: the expressions they point to belong
    /// to the engine's history, not to the subtree being discarded.
    pub fn collect_reachable(&self, root: NodeId) -> HashSet<NodeId> {
        let mut reachable = HashSet::default();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(
                    node.children()
                        .iter()
                        .copied()
                        .filter(|child| !reachable.contains(child)),
                );
            }
        }

        reachable
    }

    /// Replaces this owner's state with `snapshot`'s: nodes owned here but
    /// absent from the snapshot are freed, the snapshot's nodes and
    /// variables are adopted, and this owner becomes a borrowed instance.
    /// Returns the number of nodes freed.
    pub fn reconcile(&mut self, snapshot: &GraphOwner) -> usize {
        let freed = self.release_missing(&snapshot.nodes);

        self.nodes = snapshot.nodes.clone();
        self.variables = snapshot.variables.clone();
        self.borrowed = true;

        tracing::debug!(freed, adopted = self.nodes.len(), "reconciled with snapshot");
        freed
    }

    fn release_missing(&mut self, keep: &HashMap<NodeId, Arc<Node>>) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|id, _| keep.contains_key(id));
        before - self.nodes.len()
    }

    pub fn set_nodes(&mut self, nodes: HashMap<NodeId, Arc<Node>>) -> usize {
        let freed = self.release_missing(&nodes);
        self.nodes = nodes;
        freed
    }

    pub fn set_variables(&mut self, variables: HashMap<Arc<str>, NodeId>) {
        self.variables = variables;
    }

    pub fn nodes(&self) -> &HashMap<NodeId, Arc<Node>> {
        &self.nodes
    }

    pub fn variables(&self) -> &HashMap<Arc<str>, NodeId> {
        &self.variables
    }

    pub fn variable_node(&self, name: &str) -> Option<NodeId> {
        self.variables.get(name).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id).map(|node| &**node)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// A borrowed owner is a snapshot, or an owner that adopted one through
    /// [`reconcile`](Self::reconcile); it does not tear the pool down on drop.
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }

    fn children(&self, ids: &[NodeId]) -> Result<SmallVec<[&Node; 3]>, Error> {
        ids.iter()
            .map(|id| self.get(*id).ok_or(Error::UnknownNode(*id)))
            .collect()
    }

    /// Builds and registers an operator node over already owned children.
    pub fn node(&mut self, kind: NodeKind, children: &[NodeId]) -> Result<NodeId, Error> {
        let node = Node::new(kind, Payload::None, self.children(children)?);
        Ok(self.register(node))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> Result<NodeId, Error> {
        let kind = match op {
            BinaryOp::Add => NodeKind::BvAdd,
            BinaryOp::Sub => NodeKind::BvSub,
            BinaryOp::Mul => NodeKind::BvMul,
            BinaryOp::And => NodeKind::BvAnd,
            BinaryOp::Or => NodeKind::BvOr,
            BinaryOp::Xor => NodeKind::BvXor,
            BinaryOp::Nand => NodeKind::BvNand,
            BinaryOp::Nor => NodeKind::BvNor,
            BinaryOp::Xnor => NodeKind::BvXnor,
            BinaryOp::Shl => NodeKind::BvShl,
            BinaryOp::Lshr => NodeKind::BvLshr,
            BinaryOp::Ashr => NodeKind::BvAshr,
            BinaryOp::Udiv => NodeKind::BvUdiv,
            BinaryOp::Urem => NodeKind::BvUrem,
            BinaryOp::Sdiv => NodeKind::BvSdiv,
            BinaryOp::Srem => NodeKind::BvSrem,
            BinaryOp::Smod => NodeKind::BvSmod,
            BinaryOp::Uge => NodeKind::BvUge,
            BinaryOp::Ugt => NodeKind::BvUgt,
            BinaryOp::Ule => NodeKind::BvUle,
            BinaryOp::Ult => NodeKind::BvUlt,
            BinaryOp::Sge => NodeKind::BvSge,
            BinaryOp::Sgt => NodeKind::BvSgt,
            BinaryOp::Sle => NodeKind::BvSle,
            BinaryOp::Slt => NodeKind::BvSlt,
            BinaryOp::Eq => NodeKind::Equal,
        };
        self.node(kind, &[lhs, rhs])
    }

    pub fn unary(&mut self, op: UnaryOp, expr: NodeId) -> Result<NodeId, Error> {
        let kind = match op {
            UnaryOp::Neg => NodeKind::BvNeg,
            UnaryOp::Not => NodeKind::BvNot,
        };
        self.node(kind, &[expr])
    }

    pub fn decimal<V: Into<BigUint>>(&mut self, value: V) -> NodeId {
        self.register(Node::leaf(NodeKind::Decimal, Payload::Decimal(value.into())))
    }

    pub fn string<S: AsRef<str>>(&mut self, name: S) -> NodeId {
        self.register(Node::leaf(NodeKind::String, Payload::String(Arc::from(name.as_ref()))))
    }

    /// `(_ bv<value> <bits>)`
    pub fn bv<V: Into<BigUint>>(&mut self, value: V, bits: u32) -> NodeId {
        let value = Node::leaf(NodeKind::Decimal, Payload::Decimal(value.into()));
        let size = Node::leaf(NodeKind::Decimal, Payload::Decimal(BigUint::from(bits)));
        let node = Node::new(NodeKind::Bv, Payload::None, [&value, &size]);

        self.register(value);
        self.register(size);
        self.register(node)
    }

    fn indexed(&mut self, kind: NodeKind, indices: &[u32], expr: NodeId) -> Result<NodeId, Error> {
        let mut children = SmallVec::<[NodeId; 3]>::new();
        for index in indices {
            children.push(self.decimal(*index));
        }
        children.push(expr);
        self.node(kind, &children)
    }

    pub fn extract(&mut self, high: u32, low: u32, expr: NodeId) -> Result<NodeId, Error> {
        self.indexed(NodeKind::Extract, &[high, low], expr)
    }

    pub fn sx(&mut self, bits: u32, expr: NodeId) -> Result<NodeId, Error> {
        self.indexed(NodeKind::Sx, &[bits], expr)
    }

    pub fn zx(&mut self, bits: u32, expr: NodeId) -> Result<NodeId, Error> {
        self.indexed(NodeKind::Zx, &[bits], expr)
    }

    pub fn rol(&mut self, amount: u32, expr: NodeId) -> Result<NodeId, Error> {
        self.indexed(NodeKind::BvRol, &[amount], expr)
    }

    pub fn ror(&mut self, amount: u32, expr: NodeId) -> Result<NodeId, Error> {
        self.indexed(NodeKind::BvRor, &[amount], expr)
    }

    pub fn ite(&mut self, cond: NodeId, texpr: NodeId, fexpr: NodeId) -> Result<NodeId, Error> {
        self.node(NodeKind::Ite, &[cond, texpr, fexpr])
    }

    /// Concatenation; the first expression is the least significant.
    pub fn concat(&mut self, exprs: &[NodeId]) -> Result<NodeId, Error> {
        self.node(NodeKind::Concat, exprs)
    }

    pub fn land(&mut self, exprs: &[NodeId]) -> Result<NodeId, Error> {
        self.node(NodeKind::Land, exprs)
    }

    pub fn lor(&mut self, exprs: &[NodeId]) -> Result<NodeId, Error> {
        self.node(NodeKind::Lor, exprs)
    }

    pub fn lnot(&mut self, expr: NodeId) -> Result<NodeId, Error> {
        self.node(NodeKind::Lnot, &[expr])
    }

    pub fn let_in<S: AsRef<str>>(&mut self, name: S, bound: NodeId, body: NodeId) -> Result<NodeId, Error> {
        let name = self.string(name);
        self.node(NodeKind::Let, &[name, bound, body])
    }

    pub fn reference(&mut self, expr: ExprId) -> NodeId {
        self.register(Node::leaf(NodeKind::Reference, Payload::Reference(expr)))
    }

    /// Variable leaf for `var`, reusing the node already registered under
    /// the variable's name if there is one.
    pub fn variable(&mut self, var: &SymbolicVariable) -> Result<NodeId, Error> {
        if let Some(id) = self.variable_node(var.name()) {
            return Ok(id);
        }

        let id = self.register(Node::leaf(NodeKind::Variable, Payload::Variable(VariableLeaf::new(var))));
        self.register_variable(var.name_arc(), id)?;
        Ok(id)
    }
}

impl Clone for GraphOwner {
    /// Snapshot sharing this owner's nodes; the copy is borrowed and never
    /// frees on its own account.
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            variables: self.variables.clone(),
            borrowed: true,
        }
    }
}

/// Only an owning instance tears the pool down (and logs it). A borrowed
/// snapshot lets go of its handles without touching the pool, so nodes it
/// shares with a live owner stay alive.
impl Drop for GraphOwner {
    fn drop(&mut self) {
        if !self.borrowed {
            self.free_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SymbolicStore;

    #[test]
    fn duplicate_variable_rejected() {
        let mut owner = GraphOwner::new();
        let a = owner.decimal(1u32);
        let b = owner.decimal(2u32);

        owner.register_variable("x", a).unwrap();
        assert!(matches!(
            owner.register_variable("x", b),
            Err(Error::DuplicateVariable(ref name)) if &**name == "x"
        ));
        assert_eq!(owner.variable_node("x"), Some(a));
    }

    #[test]
    fn variable_leaves_deduplicate() {
        let mut store = SymbolicStore::new();
        let var = store.new_variable(8, 5u32).clone();
        let mut owner = GraphOwner::new();

        let v1 = owner.variable(&var).unwrap();
        let v2 = owner.variable(&var).unwrap();

        assert_eq!(v1, v2);
        assert_eq!(owner.len(), 1);
        assert_eq!(owner.variable_node(var.name()), Some(v1));
    }

    #[test]
    fn unknown_child_rejected() {
        let mut owner = GraphOwner::new();
        let a = owner.decimal(1u32);
        let mut gone = owner.collect_reachable(a);
        owner.free_set(&mut gone);

        assert!(matches!(owner.lnot(a), Err(Error::UnknownNode(id)) if id == a));
    }

    #[test]
    fn collect_follows_children_once() {
        let mut owner = GraphOwner::new();
        let x = owner.bv(3u32, 8);
        let sum = owner.binary(BinaryOp::Add, x, x).unwrap();
        let other = owner.bv(4u32, 8);

        let reachable = owner.collect_reachable(sum);

        // sum, bv, value and width
        assert_eq!(reachable.len(), 4);
        assert!(reachable.contains(&x));
        assert!(!reachable.contains(&other));
    }

    #[test]
    fn free_set_removes_nodes_and_variables() {
        let mut store = SymbolicStore::new();
        let var = store.new_variable(32, 0u32).clone();

        let mut owner = GraphOwner::new();
        let keep = owner.bv(1u32, 32);
        let v = owner.variable(&var).unwrap();
        let sum = owner.binary(BinaryOp::Add, v, keep).unwrap();

        let mut discard = owner.collect_reachable(sum);
        for id in owner.collect_reachable(keep) {
            discard.remove(&id);
        }
        let freed: Vec<_> = discard.iter().copied().collect();

        owner.free_set(&mut discard);

        assert!(discard.is_empty());
        for id in freed {
            assert!(!owner.contains(id));
        }
        assert!(owner.contains(keep));
        assert_eq!(owner.variable_node(var.name()), None);
        assert!(owner.variables().is_empty());
    }

    #[test]
    fn free_all_clears_everything() {
        let mut store = SymbolicStore::new();
        let var = store.new_variable(8, 0u32).clone();
        let mut owner = GraphOwner::new();
        owner.variable(&var).unwrap();
        owner.bv(1u32, 8);

        owner.free_all();

        assert!(owner.is_empty());
        assert!(owner.variables().is_empty());
    }

    #[test]
    fn reconcile_frees_nodes_unique_to_self() {
        let mut owner = GraphOwner::new();
        let shared = owner.bv(1u32, 8);

        let snapshot = owner.clone();
        assert!(snapshot.is_borrowed());
        assert!(!owner.is_borrowed());

        let unique = owner.bv(2u32, 8);
        let unique_nodes = owner.collect_reachable(unique);
        let weak: Vec<_> = unique_nodes
            .iter()
            .map(|id| Arc::downgrade(&owner.nodes[id]))
            .collect();

        let freed = owner.reconcile(&snapshot);

        assert_eq!(freed, unique_nodes.len());
        assert!(owner.is_borrowed());
        assert!(weak.iter().all(|w| w.upgrade().is_none()));
        assert!(owner.contains(shared));
        assert_eq!(
            owner.nodes().keys().collect::<HashSet<_>>(),
            snapshot.nodes().keys().collect::<HashSet<_>>()
        );
    }

    #[test]
    fn reconcile_adopts_snapshot_variables() {
        let mut store = SymbolicStore::new();
        let x = store.new_variable(8, 0u32).clone();
        let y = store.new_variable(8, 0u32).clone();

        let mut base = GraphOwner::new();
        base.variable(&x).unwrap();

        let mut branch = base.clone();
        branch.variable(&y).unwrap();

        base.reconcile(&branch);

        assert!(base.variable_node(y.name()).is_some());
        assert_eq!(base.variables().len(), 2);
    }

    #[test]
    fn borrowed_drop_keeps_shared_nodes() {
        let mut owner = GraphOwner::new();
        let node = owner.bv(7u32, 8);
        let weak = Arc::downgrade(&owner.nodes[&node]);
        let len = owner.len();

        let snapshot = owner.clone();
        assert!(snapshot.is_borrowed());
        drop(snapshot);

        assert!(weak.upgrade().is_some());
        assert_eq!(owner.len(), len);
        assert!(owner.contains(node));
        drop(owner);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn set_nodes_releases_missing() {
        let mut owner = GraphOwner::new();
        let a = owner.decimal(1u32);
        let b = owner.decimal(2u32);

        let mut keep = HashMap::default();
        keep.insert(a, owner.nodes[&a].clone());

        assert_eq!(owner.set_nodes(keep), 1);
        assert!(owner.contains(a));
        assert!(!owner.contains(b));
    }
}
