use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use fxhash::FxHasher64;
use itertools::Itertools;
use num_bigint::BigUint;
use smallvec::SmallVec;

use crate::engine::{ConcreteValue, ExprId, SymbolicVariable, VariableId};

static NODE_FACTORY: AtomicU64 = AtomicU64::new(0);

/// Identity of a node in the expression graph.
///
/// Identities are process-unique and never reused, so a stale id can be
/// detected (it is simply no longer owned) but never aliases a newer node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NodeId(u64);

impl NodeId {
    fn fresh() -> Self {
        Self(NODE_FACTORY.fetch_add(1, SeqCst))
    }

    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeKind {
    Assert,
    Bv,
    BvAdd,
    BvAnd,
    BvAshr,
    BvLshr,
    BvMul,
    BvNand,
    BvNeg,
    BvNor,
    BvNot,
    BvOr,
    BvRol,
    BvRor,
    BvSdiv,
    BvSge,
    BvSgt,
    BvShl,
    BvSle,
    BvSlt,
    BvSmod,
    BvSrem,
    BvSub,
    BvUdiv,
    BvUge,
    BvUgt,
    BvUle,
    BvUlt,
    BvUrem,
    BvXnor,
    BvXor,
    Compound,
    Concat,
    Decimal,
    Declare,
    Distinct,
    Equal,
    Extract,
    Ite,
    Land,
    Let,
    Lnot,
    Lor,
    Reference,
    String,
    Sx,
    Variable,
    Zx,
}

/// Number of children a node kind expects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(m) => n == m,
            Arity::AtLeast(m) => n >= m,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

/// Binary operations a solver backend must provide; bit-vector operators
/// plus equality, which is defined on every sort.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Xnor,
    Shl,
    Lshr,
    Ashr,
    Udiv,
    Urem,
    Sdiv,
    Srem,
    Smod,
    Uge,
    Ugt,
    Ule,
    Ult,
    Sge,
    Sgt,
    Sle,
    Slt,
    Eq,
}

impl BinaryOp {
    pub fn is_predicate(&self) -> bool {
        use BinaryOp::*;
        matches!(self, Uge | Ugt | Ule | Ult | Sge | Sgt | Sle | Slt | Eq)
    }

    pub fn smtlib_name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "bvadd",
            BinaryOp::Sub => "bvsub",
            BinaryOp::Mul => "bvmul",
            BinaryOp::And => "bvand",
            BinaryOp::Or => "bvor",
            BinaryOp::Xor => "bvxor",
            BinaryOp::Nand => "bvnand",
            BinaryOp::Nor => "bvnor",
            BinaryOp::Xnor => "bvxnor",
            BinaryOp::Shl => "bvshl",
            BinaryOp::Lshr => "bvlshr",
            BinaryOp::Ashr => "bvashr",
            BinaryOp::Udiv => "bvudiv",
            BinaryOp::Urem => "bvurem",
            BinaryOp::Sdiv => "bvsdiv",
            BinaryOp::Srem => "bvsrem",
            BinaryOp::Smod => "bvsmod",
            BinaryOp::Uge => "bvuge",
            BinaryOp::Ugt => "bvugt",
            BinaryOp::Ule => "bvule",
            BinaryOp::Ult => "bvult",
            BinaryOp::Sge => "bvsge",
            BinaryOp::Sgt => "bvsgt",
            BinaryOp::Sle => "bvsle",
            BinaryOp::Slt => "bvslt",
            BinaryOp::Eq => "=",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn smtlib_name(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "bvneg",
            UnaryOp::Not => "bvnot",
        }
    }
}

impl NodeKind {
    pub fn arity(&self) -> Arity {
        use NodeKind::*;
        match self {
            Decimal | String | Variable | Reference | Declare => Arity::Exact(0),
            BvNeg | BvNot | Lnot | Assert => Arity::Exact(1),
            Bv | BvRol | BvRor | Sx | Zx | Distinct => Arity::Exact(2),
            Extract | Ite | Let => Arity::Exact(3),
            Concat | Land | Lor => Arity::AtLeast(2),
            Compound => Arity::AtLeast(1),
            _ => Arity::Exact(2),
        }
    }

    /// Backend operation for the plain two-operand kinds.
    pub fn binary_op(&self) -> Option<BinaryOp> {
        Some(match self {
            NodeKind::BvAdd => BinaryOp::Add,
            NodeKind::BvAnd => BinaryOp::And,
            NodeKind::BvAshr => BinaryOp::Ashr,
            NodeKind::BvLshr => BinaryOp::Lshr,
            NodeKind::BvMul => BinaryOp::Mul,
            NodeKind::BvNand => BinaryOp::Nand,
            NodeKind::BvNor => BinaryOp::Nor,
            NodeKind::BvOr => BinaryOp::Or,
            NodeKind::BvSdiv => BinaryOp::Sdiv,
            NodeKind::BvSge => BinaryOp::Sge,
            NodeKind::BvSgt => BinaryOp::Sgt,
            NodeKind::BvShl => BinaryOp::Shl,
            NodeKind::BvSle => BinaryOp::Sle,
            NodeKind::BvSlt => BinaryOp::Slt,
            NodeKind::BvSmod => BinaryOp::Smod,
            NodeKind::BvSrem => BinaryOp::Srem,
            NodeKind::BvSub => BinaryOp::Sub,
            NodeKind::BvUdiv => BinaryOp::Udiv,
            NodeKind::BvUge => BinaryOp::Uge,
            NodeKind::BvUgt => BinaryOp::Ugt,
            NodeKind::BvUle => BinaryOp::Ule,
            NodeKind::BvUlt => BinaryOp::Ult,
            NodeKind::BvUrem => BinaryOp::Urem,
            NodeKind::BvXnor => BinaryOp::Xnor,
            NodeKind::BvXor => BinaryOp::Xor,
            NodeKind::Equal => BinaryOp::Eq,
            _ => return None,
        })
    }

    pub fn unary_op(&self) -> Option<UnaryOp> {
        match self {
            NodeKind::BvNeg => Some(UnaryOp::Neg),
            NodeKind::BvNot => Some(UnaryOp::Not),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            NodeKind::Decimal | NodeKind::String | NodeKind::Variable | NodeKind::Reference
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Assert => "assert",
            NodeKind::Bv => "bv",
            NodeKind::Compound => "compound",
            NodeKind::Concat => "concat",
            NodeKind::Decimal => "decimal",
            NodeKind::Declare => "declare",
            NodeKind::Distinct => "distinct",
            NodeKind::Extract => "extract",
            NodeKind::Ite => "ite",
            NodeKind::Land => "and",
            NodeKind::Let => "let",
            NodeKind::Lnot => "not",
            NodeKind::Lor => "or",
            NodeKind::Reference => "ref",
            NodeKind::String => "string",
            NodeKind::Sx => "sx",
            NodeKind::Variable => "var",
            NodeKind::Zx => "zx",
            NodeKind::BvRol => "bvrol",
            NodeKind::BvRor => "bvror",
            kind => kind
                .binary_op()
                .map(|op| op.smtlib_name())
                .or_else(|| kind.unary_op().map(|op| op.smtlib_name()))
                .unwrap_or("?"),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A variable leaf: the engine-side identity of the variable plus a handle
/// on its current concrete value.
#[derive(Debug, Clone)]
pub struct VariableLeaf {
    id: VariableId,
    name: Arc<str>,
    value: ConcreteValue,
}

impl VariableLeaf {
    pub fn new(var: &SymbolicVariable) -> Self {
        Self {
            id: var.id(),
            name: var.name_arc(),
            value: var.concrete().clone(),
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

    pub fn concrete_value(&self) -> BigUint {
        self.value.get()
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Decimal(BigUint),
    String(Arc<str>),
    Variable(VariableLeaf),
    Reference(ExprId),
}

impl Hash for Payload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Payload::None => 0u8.hash(state),
            Payload::Decimal(v) => {
                1u8.hash(state);
                v.hash(state)
            }
            Payload::String(s) => {
                2u8.hash(state);
                s.hash(state)
            }
            Payload::Variable(v) => {
                3u8.hash(state);
                v.id.hash(state)
            }
            Payload::Reference(e) => {
                4u8.hash(state);
                e.hash(state)
            }
        }
    }
}

/// A node of the expression graph. Immutable once built; children are held
/// by identity and owned by a [`GraphOwner`](crate::owner::GraphOwner).
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    children: SmallVec<[NodeId; 3]>,
    payload: Payload,
    hash: u64,
}

impl Node {
    pub fn new<'a, I>(kind: NodeKind, payload: Payload, children: I) -> Self
    where
        I: IntoIterator<Item = &'a Node>,
    {
        let mut hasher = FxHasher64::default();
        kind.hash(&mut hasher);
        payload.hash(&mut hasher);

        let children = children
            .into_iter()
            .map(|child| {
                child.hash.hash(&mut hasher);
                child.id
            })
            .collect();

        Self {
            id: NodeId::fresh(),
            kind,
            children,
            payload,
            hash: hasher.finish(),
        }
    }

    pub fn leaf(kind: NodeKind, payload: Payload) -> Self {
        Self::new(kind, payload, std::iter::empty())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Content-derived hash; equal structure yields equal hashes.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn decimal(&self) -> Option<&BigUint> {
        if let Payload::Decimal(ref v) = self.payload {
            Some(v)
        } else {
            None
        }
    }

    pub fn string(&self) -> Option<&str> {
        if let Payload::String(ref s) = self.payload {
            Some(s)
        } else {
            None
        }
    }

    pub(crate) fn string_arc(&self) -> Option<Arc<str>> {
        if let Payload::String(ref s) = self.payload {
            Some(s.clone())
        } else {
            None
        }
    }

    pub fn variable(&self) -> Option<&VariableLeaf> {
        if let Payload::Variable(ref v) = self.payload {
            Some(v)
        } else {
            None
        }
    }

    pub fn reference(&self) -> Option<ExprId> {
        if let Payload::Reference(e) = self.payload {
            Some(e)
        } else {
            None
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            Payload::Decimal(ref v) => write!(f, "{}", v),
            Payload::String(ref s) => write!(f, "{}", s),
            Payload::Variable(ref v) => write!(f, "{}", v.name),
            Payload::Reference(e) => write!(f, "ref!{}", e),
            Payload::None => write!(f, "({} {})", self.kind, self.children.iter().join(" ")),
        }
    }
}
