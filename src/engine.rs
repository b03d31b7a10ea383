//! Symbolic engine collaborator.
//!
//! The translator only needs two lookups from the engine that drives
//! execution: symbolic variables by id and previously recorded expressions
//! by id. [`SymbolicStore`] is an in-memory engine providing both.
use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use num_bigint::BigUint;
use num_traits::One;
use parking_lot::RwLock;

use crate::node::NodeId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VariableId(pub u64);

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ExprId(pub u64);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared cell holding the last known concrete value of a variable.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct ConcreteValue(Arc<RwLock<BigUint>>);

impl ConcreteValue {
    pub fn new(value: BigUint) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn get(&self) -> BigUint {
        self.0.read().clone()
    }

    pub fn set(&self, value: BigUint) {
        *self.0.write() = value;
    }
}

#[derive(Debug, Clone)]
pub struct SymbolicVariable {
    id: VariableId,
    name: Arc<str>,
    bits: u32,
    value: ConcreteValue,
}

impl SymbolicVariable {
    pub fn new<S: AsRef<str>>(id: VariableId, name: S, bits: u32, value: BigUint) -> Self {
        Self {
            id,
            name: Arc::from(name.as_ref()),
            bits,
            value: ConcreteValue::new(value),
        }
    }

    pub fn id(&self) -> VariableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn concrete(&self) -> &ConcreteValue {
        &self.value
    }
}

impl fmt::Display for SymbolicVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.bits)
    }
}

pub trait SymbolicEngine {
    fn variable(&self, id: VariableId) -> Option<&SymbolicVariable>;

    /// Root node of a previously recorded symbolic expression.
    fn expression(&self, id: ExprId) -> Option<NodeId>;
}

#[derive(Debug, Default)]
pub struct SymbolicStore {
    variables: HashMap<VariableId, SymbolicVariable>,
    expressions: HashMap<ExprId, NodeId>,
    next_variable: u64,
    next_expression: u64,
}

impl SymbolicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh variable named `SymVar_<id>`.
    pub fn new_variable(&mut self, bits: u32, value: impl Into<BigUint>) -> &SymbolicVariable {
        let id = VariableId(self.next_variable);
        self.next_variable += 1;

        let value: BigUint = value.into();
        let mask = (BigUint::one() << bits as usize) - BigUint::one();
        let var = SymbolicVariable::new(id, format!("SymVar_{}", id), bits, value & mask);

        self.variables.entry(id).or_insert(var)
    }

    pub fn set_concrete_value(&self, id: VariableId, value: impl Into<BigUint>) -> bool {
        if let Some(var) = self.variables.get(&id) {
            var.concrete().set(value.into());
            true
        } else {
            false
        }
    }

    pub fn record_expression(&mut self, root: NodeId) -> ExprId {
        let id = ExprId(self.next_expression);
        self.next_expression += 1;
        self.expressions.insert(id, root);
        id
    }

    pub fn forget_expression(&mut self, id: ExprId) -> Option<NodeId> {
        self.expressions.remove(&id)
    }
}

impl SymbolicEngine for SymbolicStore {
    fn variable(&self, id: VariableId) -> Option<&SymbolicVariable> {
        self.variables.get(&id)
    }

    fn expression(&self, id: ExprId) -> Option<NodeId> {
        self.expressions.get(&id).copied()
    }
}
