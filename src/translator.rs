//! Translation of expression graphs into solver-native expressions.
//!
//! Graphs built by forward execution can be far deeper than the host stack
//! allows, and they share subtrees both directly and through references
//! into the engine's history. Translation therefore happens in two passes:
//!
//! 1. [`Translator::schedule`] walks the graph with an explicit work stack
//!    and produces a flat processing order in which every node follows its
//!    dependencies (its children, or for a reference the root of the
//!    referenced expression). Each node appears once, at the position of
//!    the first path that reaches it.
//! 2. The order is replayed against the backend. Operands are always taken
//!    from the per-node cache, so shared subtrees are built exactly once.
//!
//! `LET` bindings live in a flat symbol table for the whole call: a later
//! `LET` reusing a name replaces the earlier binding, including for nodes
//! processed afterwards outside its body.
use std::sync::Arc;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use fxhash::FxHashMap;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

use crate::backend::SolverBackend;
use crate::engine::{ExprId, SymbolicEngine, VariableId};
use crate::hooks::{NodeObserver, TracingObserver};
use crate::node::{Arity, Node, NodeId, NodeKind};
use crate::owner::GraphOwner;

#[derive(Debug, Error)]
pub enum Error {
    #[error("translation root is absent from the graph")]
    NullInput,
    #[error("node {0} has unsupported kind `{1}`")]
    UnsupportedNodeKind(NodeId, NodeKind),
    #[error("operand {operand} of node {node} is not boolean-sorted")]
    TypeError { node: NodeId, operand: NodeId },
    #[error("symbol `{0}` is not bound by a let")]
    UnresolvedSymbol(Arc<str>),
    #[error("symbolic variable {0} is unknown to the engine")]
    UnresolvedVariable(VariableId),
    #[error("symbolic expression {0} is unknown to the engine")]
    UnresolvedExpression(ExprId),
    #[error("`{kind}` node {node} expects {expected} children but has {found}")]
    Arity {
        node: NodeId,
        kind: NodeKind,
        expected: Arity,
        found: usize,
    },
    #[error("malformed node {node}: {reason}")]
    Malformed { node: NodeId, reason: &'static str },
    #[error("operand {0} does not read back as a numeral")]
    NotNumeral(NodeId),
    #[error("node {0} is not owned by the graph")]
    DanglingNode(NodeId),
    #[error("dependency cycle through node {0}")]
    Cycle(NodeId),
}

#[derive(Clone, Default)]
pub struct TranslatorConfig {
    concretize: bool,
    persist_session: bool,
    observer: Option<Box<dyn NodeObserver>>,
}

impl TranslatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace variables by their current concrete values.
    pub fn concretize(mut self, concretize: bool) -> Self {
        self.concretize = concretize;
        self
    }

    /// Keep the translation cache and symbol table across calls.
    pub fn persist_session(mut self, persist: bool) -> Self {
        self.persist_session = persist;
        self
    }

    pub fn observer<O: NodeObserver + 'static>(mut self, observer: O) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn traced(self) -> Self {
        self.observer(TracingObserver)
    }

    pub fn is_concretizing(&self) -> bool {
        self.concretize
    }

    pub fn is_persistent(&self) -> bool {
        self.persist_session
    }
}

/// One entry of the processing order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    Translate(NodeId),
    /// Bind the name of a `LET` node to its bound subtree. Emitted after the
    /// bound subtree and before the body.
    Bind(NodeId),
}

#[derive(Debug, Copy, Clone)]
enum Dependency {
    Node(NodeId),
    Bind,
}

struct Frame {
    id: NodeId,
    deps: SmallVec<[Dependency; 4]>,
    next: usize,
}

pub struct Translator<'a, E, B>
where
    E: SymbolicEngine + ?Sized,
    B: SolverBackend,
{
    graph: &'a GraphOwner,
    engine: &'a E,
    backend: B,
    config: TranslatorConfig,
    cache: FxHashMap<NodeId, B::Expr>,
    symbols: HashMap<Arc<str>, NodeId>,
}

impl<'a, E, B> Translator<'a, E, B>
where
    E: SymbolicEngine + ?Sized,
    B: SolverBackend,
{
    pub fn new(graph: &'a GraphOwner, engine: &'a E, backend: B, concretize: bool) -> Self {
        Self::new_with(graph, engine, backend, TranslatorConfig::new().concretize(concretize))
    }

    pub fn new_with(graph: &'a GraphOwner, engine: &'a E, backend: B, config: TranslatorConfig) -> Self {
        Self {
            graph,
            engine,
            backend,
            config,
            cache: FxHashMap::default(),
            symbols: HashMap::default(),
        }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Translation of `id` produced by the last call (or, for a persistent
    /// session, by any earlier call).
    pub fn cached(&self, id: NodeId) -> Option<&B::Expr> {
        self.cache.get(&id)
    }

    pub fn translate(&mut self, root: NodeId) -> Result<B::Expr, Error> {
        if !self.config.persist_session {
            self.cache.clear();
            self.symbols.clear();
        }

        let root_node = self.graph.get(root).ok_or(Error::NullInput)?;
        let steps = self.schedule(root)?;

        tracing::debug!(
            root = %root,
            steps = steps.len(),
            concretize = self.config.concretize,
            "translating expression graph"
        );

        if let Some(observer) = self.config.observer.as_mut() {
            observer.scheduled(root_node, steps.len());
        }

        for step in steps {
            match step {
                Step::Bind(id) => {
                    let node = self.node(id)?;
                    self.bind(node)?;
                }
                Step::Translate(id) => {
                    let node = self.node(id)?;
                    let expr = self.translate_node(node)?;
                    self.cache.insert(id, expr);

                    if let Some(observer) = self.config.observer.as_mut() {
                        observer.translated(node);
                    }
                }
            }
        }

        self.lookup(root)
    }

    /// Processing order for `root`. Nodes already present in the cache (only
    /// possible for a persistent session) are not scheduled again.
    pub fn schedule(&self, root: NodeId) -> Result<Vec<Step>, Error> {
        let mut steps = Vec::new();
        let mut done = self.cache.keys().copied().collect::<HashSet<_>>();
        let mut active = HashSet::default();
        let mut stack = Vec::new();

        if !done.contains(&root) {
            stack.push(self.frame(root)?);
            active.insert(root);
        }

        while let Some(frame) = stack.last_mut() {
            if let Some(dep) = frame.deps.get(frame.next).copied() {
                frame.next += 1;
                match dep {
                    Dependency::Bind => steps.push(Step::Bind(frame.id)),
                    Dependency::Node(id) => {
                        if done.contains(&id) {
                            continue;
                        }
                        if !active.insert(id) {
                            return Err(Error::Cycle(id));
                        }
                        stack.push(self.frame(id)?);
                    }
                }
            } else {
                let id = frame.id;
                stack.pop();
                active.remove(&id);
                done.insert(id);
                steps.push(Step::Translate(id));
            }
        }

        Ok(steps)
    }

    fn frame(&self, id: NodeId) -> Result<Frame, Error> {
        let node = self.node(id)?;
        Ok(Frame {
            id,
            deps: self.dependencies(node)?,
            next: 0,
        })
    }

    fn dependencies(&self, node: &Node) -> Result<SmallVec<[Dependency; 4]>, Error> {
        let kind = node.kind();
        let children = node.children();

        let expected = kind.arity();
        if !expected.accepts(children.len()) {
            return Err(Error::Arity {
                node: node.id(),
                kind,
                expected,
                found: children.len(),
            });
        }

        Ok(match kind {
            // the name child is a literal, never translated
            NodeKind::Let => smallvec![
                Dependency::Node(children[1]),
                Dependency::Bind,
                Dependency::Node(children[2]),
            ],
            NodeKind::Reference => smallvec![Dependency::Node(self.referenced(node)?)],
            _ => children.iter().map(|id| Dependency::Node(*id)).collect(),
        })
    }

    fn node(&self, id: NodeId) -> Result<&'a Node, Error> {
        self.graph.get(id).ok_or(Error::DanglingNode(id))
    }

    fn referenced(&self, node: &Node) -> Result<NodeId, Error> {
        let expr = node.reference().ok_or(Error::Malformed {
            node: node.id(),
            reason: "reference leaf without an expression",
        })?;
        self.engine
            .expression(expr)
            .ok_or(Error::UnresolvedExpression(expr))
    }

    fn bind(&mut self, node: &Node) -> Result<(), Error> {
        let name = self
            .node(self.child(node, 0)?)?
            .string_arc()
            .ok_or(Error::Malformed {
                node: node.id(),
                reason: "let name is not a string leaf",
            })?;
        let bound = self.child(node, 1)?;

        self.symbols.insert(name, bound);
        Ok(())
    }

    fn child(&self, node: &Node, index: usize) -> Result<NodeId, Error> {
        node.children().get(index).copied().ok_or(Error::Arity {
            node: node.id(),
            kind: node.kind(),
            expected: node.kind().arity(),
            found: node.children().len(),
        })
    }

    fn lookup(&self, id: NodeId) -> Result<B::Expr, Error> {
        self.cache.get(&id).cloned().ok_or(Error::DanglingNode(id))
    }

    fn operand(&self, node: &Node, index: usize) -> Result<B::Expr, Error> {
        self.lookup(self.child(node, index)?)
    }

    fn boolean(&self, node: &Node, index: usize) -> Result<B::Expr, Error> {
        let child = self.child(node, index)?;
        let expr = self.lookup(child)?;
        if self.backend.is_bool(&expr) {
            Ok(expr)
        } else {
            Err(Error::TypeError {
                node: node.id(),
                operand: child,
            })
        }
    }

    fn unsigned(&self, node: &Node, index: usize) -> Result<u32, Error> {
        let child = self.child(node, index)?;
        let expr = self.lookup(child)?;
        self.backend
            .to_u64(&expr)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(Error::NotNumeral(child))
    }

    fn bit_vector(&self, node: &Node, index: usize) -> Result<(B::Expr, u32), Error> {
        let expr = self.operand(node, index)?;
        let bits = self.backend.bits(&expr).ok_or(Error::Malformed {
            node: node.id(),
            reason: "operand is not a bit-vector",
        })?;
        Ok((expr, bits))
    }

    fn widen(node: &Node, width: u32, extra: u32) -> Result<u32, Error> {
        width.checked_add(extra).ok_or(Error::Malformed {
            node: node.id(),
            reason: "bit-vector width overflows",
        })
    }

    // rotation amounts are read from the decimal leaf itself
    fn literal(&self, node: &Node, index: usize) -> Result<u32, Error> {
        self.node(self.child(node, index)?)?
            .decimal()
            .and_then(|v| v.to_u32())
            .ok_or(Error::Malformed {
                node: node.id(),
                reason: "rotation amount is not a decimal leaf",
            })
    }

    fn translate_node(&mut self, node: &Node) -> Result<B::Expr, Error> {
        let id = node.id();
        let kind = node.kind();

        if let Some(op) = kind.binary_op() {
            let lhs = self.operand(node, 0)?;
            let rhs = self.operand(node, 1)?;
            return Ok(self.backend.binary(op, &lhs, &rhs));
        }

        if let Some(op) = kind.unary_op() {
            let expr = self.operand(node, 0)?;
            return Ok(self.backend.unary(op, &expr));
        }

        Ok(match kind {
            NodeKind::BvRol | NodeKind::BvRor => {
                let amount = self.literal(node, 0)?;
                let expr = self.operand(node, 1)?;
                if kind == NodeKind::BvRol {
                    self.backend.rotate_left(amount, &expr)
                } else {
                    self.backend.rotate_right(amount, &expr)
                }
            }
            NodeKind::Bv => {
                let value_id = self.child(node, 0)?;
                let value = self.lookup(value_id)?;
                let decimal = self
                    .backend
                    .to_decimal(&value)
                    .ok_or(Error::NotNumeral(value_id))?;
                let bits = self.unsigned(node, 1)?;
                self.backend
                    .bv_numeral(&decimal, bits)
                    .ok_or(Error::NotNumeral(id))?
            }
            NodeKind::Concat => {
                // first child is the least significant chunk
                let (mut acc, mut width) = self.bit_vector(node, 0)?;
                for index in 1..node.children().len() {
                    let (high, bits) = self.bit_vector(node, index)?;
                    width = Self::widen(node, width, bits)?;
                    acc = self.backend.concat(&high, &acc);
                }
                acc
            }
            NodeKind::Decimal => {
                let value = node.decimal().ok_or(Error::Malformed {
                    node: id,
                    reason: "decimal leaf without a value",
                })?;
                self.backend
                    .int_numeral(&value.to_str_radix(10))
                    .ok_or(Error::NotNumeral(id))?
            }
            NodeKind::Distinct => {
                let lhs = self.operand(node, 0)?;
                let rhs = self.operand(node, 1)?;
                self.backend.distinct(&lhs, &rhs)
            }
            NodeKind::Extract => {
                let high = self.unsigned(node, 0)?;
                let low = self.unsigned(node, 1)?;
                let (expr, bits) = self.bit_vector(node, 2)?;
                if high < low {
                    return Err(Error::Malformed {
                        node: id,
                        reason: "extract high below low",
                    });
                }
                if high >= bits {
                    return Err(Error::Malformed {
                        node: id,
                        reason: "extract index beyond operand width",
                    });
                }
                self.backend.extract(high, low, &expr)
            }
            NodeKind::Ite => {
                let cond = self.boolean(node, 0)?;
                let texpr = self.operand(node, 1)?;
                let fexpr = self.operand(node, 2)?;
                self.backend.ite(&cond, &texpr, &fexpr)
            }
            NodeKind::Land | NodeKind::Lor => {
                let mut acc = self.boolean(node, 0)?;
                for index in 1..node.children().len() {
                    let next = self.boolean(node, index)?;
                    acc = if kind == NodeKind::Land {
                        self.backend.and(&acc, &next)
                    } else {
                        self.backend.or(&acc, &next)
                    };
                }
                acc
            }
            NodeKind::Lnot => {
                let expr = self.boolean(node, 0)?;
                self.backend.not(&expr)
            }
            NodeKind::Let => self.operand(node, 2)?,
            NodeKind::String => {
                let name = node.string_arc().ok_or(Error::Malformed {
                    node: id,
                    reason: "string leaf without a name",
                })?;
                let bound = self
                    .symbols
                    .get(&name)
                    .copied()
                    .ok_or(Error::UnresolvedSymbol(name))?;
                self.lookup(bound)?
            }
            NodeKind::Sx | NodeKind::Zx => {
                let bits = self.unsigned(node, 0)?;
                let (expr, width) = self.bit_vector(node, 1)?;
                Self::widen(node, width, bits)?;
                if kind == NodeKind::Sx {
                    self.backend.sign_extend(bits, &expr)
                } else {
                    self.backend.zero_extend(bits, &expr)
                }
            }
            NodeKind::Variable => self.variable(node)?,
            NodeKind::Reference => self.lookup(self.referenced(node)?)?,
            _ => return Err(Error::UnsupportedNodeKind(id, kind)),
        })
    }

    fn variable(&mut self, node: &Node) -> Result<B::Expr, Error> {
        let leaf = node.variable().ok_or(Error::Malformed {
            node: node.id(),
            reason: "variable leaf without a variable",
        })?;
        let var = self
            .engine
            .variable(leaf.id())
            .ok_or(Error::UnresolvedVariable(leaf.id()))?;

        if self.config.concretize {
            let mask = (BigUint::one() << var.bits() as usize) - BigUint::one();
            let value = leaf.concrete_value() & mask;
            self.backend
                .bv_numeral(&value.to_str_radix(10), var.bits())
                .ok_or(Error::NotNumeral(node.id()))
        } else {
            Ok(self.backend.bv_symbol(var.name(), var.bits()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::backend::smtlib::SmtBackend;
    use crate::engine::SymbolicStore;
    use crate::node::BinaryOp;

    fn position(steps: &[Step], id: NodeId) -> usize {
        steps
            .iter()
            .position(|s| *s == Step::Translate(id))
            .unwrap()
    }

    #[test]
    fn schedule_orders_dependencies_first() {
        let store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let a = graph.bv(1u32, 8);
        let b = graph.bv(2u32, 8);
        let sum = graph.binary(BinaryOp::Add, a, b).unwrap();
        let prod = graph.binary(BinaryOp::Mul, sum, a).unwrap();

        let translator = Translator::new(&graph, &store, SmtBackend::new(), false);
        let steps = translator.schedule(prod).unwrap();

        // prod, sum and two bv nodes with two leaves each
        assert_eq!(steps.len(), 8);
        assert!(position(&steps, a) < position(&steps, sum));
        assert!(position(&steps, b) < position(&steps, sum));
        assert!(position(&steps, sum) < position(&steps, prod));
        assert_eq!(steps.last(), Some(&Step::Translate(prod)));
    }

    #[test]
    fn references_expand_as_dependencies() {
        let mut store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let value = graph.bv(5u32, 8);
        let expr = store.record_expression(value);
        let r = graph.reference(expr);
        let neg = graph.unary(crate::node::UnaryOp::Neg, r).unwrap();

        let translator = Translator::new(&graph, &store, SmtBackend::new(), false);
        let steps = translator.schedule(neg).unwrap();

        assert!(position(&steps, value) < position(&steps, r));
        assert!(position(&steps, r) < position(&steps, neg));
    }

    #[test]
    fn let_binds_between_bound_and_body() {
        let store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let bound = graph.bv(3u32, 8);
        let x = graph.string("x");
        let body = graph.binary(BinaryOp::Add, x, x).unwrap();
        let let_ = graph.let_in("x", bound, body).unwrap();

        let translator = Translator::new(&graph, &store, SmtBackend::new(), false);
        let steps = translator.schedule(let_).unwrap();
        let bind = steps.iter().position(|s| *s == Step::Bind(let_)).unwrap();

        assert!(position(&steps, bound) < bind);
        assert!(bind < position(&steps, x));
        assert!(position(&steps, body) < position(&steps, let_));
        // the name leaf is never scheduled
        let name = graph.get(let_).unwrap().children()[0];
        assert!(!steps.contains(&Step::Translate(name)));
    }

    #[test]
    fn reference_cycles_are_reported() {
        let mut store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let r = graph.reference(ExprId(0));
        assert_eq!(store.record_expression(r), ExprId(0));

        let mut translator = Translator::new(&graph, &store, SmtBackend::new(), false);
        assert!(matches!(translator.translate(r), Err(Error::Cycle(id)) if id == r));
    }

    #[test]
    fn arity_checked_before_backend_calls() {
        let store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let a = graph.bv(1u32, 8);
        let bad = graph.node(NodeKind::BvAdd, &[a]).unwrap();

        let mut translator = Translator::new(&graph, &store, SmtBackend::new(), false);
        let err = translator.translate(bad).unwrap_err();

        assert!(matches!(
            err,
            Error::Arity { kind: NodeKind::BvAdd, expected: Arity::Exact(2), found: 1, .. }
        ));
        assert_eq!(translator.backend().total_calls(), 0);
    }

    #[test]
    fn observer_sees_each_node_once() {
        #[derive(Clone, Default)]
        struct Record(Rc<RefCell<Vec<NodeId>>>);

        impl NodeObserver for Record {
            fn translated(&mut self, node: &Node) {
                self.0.borrow_mut().push(node.id());
            }
        }

        let store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let a = graph.bv(1u32, 8);
        let sum = graph.binary(BinaryOp::Add, a, a).unwrap();
        let twice = graph.binary(BinaryOp::Add, sum, sum).unwrap();

        let record = Record::default();
        let config = TranslatorConfig::new().observer(record.clone());
        let mut translator = Translator::new_with(&graph, &store, SmtBackend::new(), config);
        translator.translate(twice).unwrap();

        let seen = record.0.borrow();
        let unique = seen.iter().collect::<HashSet<_>>();
        assert_eq!(seen.len(), unique.len());
        assert_eq!(seen.len(), graph.collect_reachable(twice).len());
    }

    #[test]
    fn persistent_session_reuses_cache() {
        let store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let a = graph.bv(7u32, 8);
        let b = graph.unary(crate::node::UnaryOp::Not, a).unwrap();

        let config = TranslatorConfig::new().persist_session(true);
        let mut translator = Translator::new_with(&graph, &store, SmtBackend::new(), config);
        translator.translate(a).unwrap();
        let calls = translator.backend().total_calls();

        translator.translate(b).unwrap();
        assert_eq!(translator.backend().total_calls(), calls + 1);
        assert!(translator.schedule(b).unwrap().is_empty());
    }

    #[test]
    fn fresh_session_forgets_symbols() {
        let store = SymbolicStore::new();
        let mut graph = GraphOwner::new();
        let bound = graph.bv(1u32, 8);
        let x = graph.string("x");
        let let_ = graph.let_in("x", bound, x).unwrap();
        let lone = graph.string("x");

        let mut translator = Translator::new(&graph, &store, SmtBackend::new(), false);
        translator.translate(let_).unwrap();

        assert!(matches!(
            translator.translate(lone),
            Err(Error::UnresolvedSymbol(ref name)) if &**name == "x"
        ));
    }
}
