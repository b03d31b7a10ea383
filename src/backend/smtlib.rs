//! Hash-consed SMT-LIB2 terms.
//!
//! [`SmtBackend`] builds terms bottom-up and folds every application whose
//! operands are all constants, following the SMT-LIB bit-vector semantics
//! (including division by zero). Terms that stay symbolic render as
//! SMT-LIB2 s-expressions.
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use hashconsing::{consign, HConsed, HashConsign};

use fnv::FnvHashMap as HashMap;
use itertools::Itertools;
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};
use smallvec::SmallVec;

use crate::backend::SolverBackend;
use crate::node::{BinaryOp, UnaryOp};

consign! {
    let TERM = consign(10 * 1024 /* = capacity */) for TermKind;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sort {
    Bool,
    Int,
    BitVec(u32),
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sort::Bool => write!(f, "Bool"),
            Sort::Int => write!(f, "Int"),
            Sort::BitVec(bits) => write!(f, "(_ BitVec {})", bits),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Binary(BinaryOp),
    Unary(UnaryOp),
    And,
    Or,
    Not,
    Distinct,
    Ite,
    Concat,
    Extract(u32, u32),
    SignExtend(u32),
    ZeroExtend(u32),
    RotateLeft(u32),
    RotateRight(u32),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Binary(op) => f.write_str(op.smtlib_name()),
            Op::Unary(op) => f.write_str(op.smtlib_name()),
            Op::And => f.write_str("and"),
            Op::Or => f.write_str("or"),
            Op::Not => f.write_str("not"),
            Op::Distinct => f.write_str("distinct"),
            Op::Ite => f.write_str("ite"),
            Op::Concat => f.write_str("concat"),
            Op::Extract(high, low) => write!(f, "(_ extract {} {})", high, low),
            Op::SignExtend(bits) => write!(f, "(_ sign_extend {})", bits),
            Op::ZeroExtend(bits) => write!(f, "(_ zero_extend {})", bits),
            Op::RotateLeft(bits) => write!(f, "(_ rotate_left {})", bits),
            Op::RotateRight(bits) => write!(f, "(_ rotate_right {})", bits),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TermKind {
    Bool(bool),
    Int(BigUint),
    BitVec(BigUint, u32),
    Symbol(Arc<str>, u32),
    App(Op, SmallVec<[Term; 3]>, Sort),
}

impl fmt::Display for TermKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermKind::Bool(b) => write!(f, "{}", b),
            TermKind::Int(v) => write!(f, "{}", v),
            TermKind::BitVec(v, bits) => write!(f, "(_ bv{} {})", v, bits),
            TermKind::Symbol(name, _) => f.write_str(name),
            TermKind::App(op, args, _) => write!(f, "({} {})", op, args.iter().join(" ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Term(HConsed<TermKind>);

impl Deref for Term {
    type Target = TermKind;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl From<TermKind> for Term {
    fn from(kind: TermKind) -> Self {
        Self(TERM.mk(kind))
    }
}

impl Term {
    pub fn sort(&self) -> Sort {
        match &**self {
            TermKind::Bool(_) => Sort::Bool,
            TermKind::Int(_) => Sort::Int,
            TermKind::BitVec(_, bits) | TermKind::Symbol(_, bits) => Sort::BitVec(*bits),
            TermKind::App(_, _, sort) => *sort,
        }
    }

    pub fn bits(&self) -> u32 {
        if let Sort::BitVec(bits) = self.sort() {
            bits
        } else {
            0
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(&**self, TermKind::Bool(_) | TermKind::Int(_) | TermKind::BitVec(_, _))
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let TermKind::Bool(b) = &**self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_bv(&self) -> Option<(&BigUint, u32)> {
        if let TermKind::BitVec(v, bits) = &**self {
            Some((v, *bits))
        } else {
            None
        }
    }

    pub fn as_numeral(&self) -> Option<&BigUint> {
        match &**self {
            TermKind::Int(v) | TermKind::BitVec(v, _) => Some(v),
            _ => None,
        }
    }

    fn app<I: IntoIterator<Item = Term>>(op: Op, args: I, sort: Sort) -> Term {
        TermKind::App(op, args.into_iter().collect(), sort).into()
    }
}

fn modulus(bits: u32) -> BigUint {
    BigUint::one() << bits as usize
}

fn mask(bits: u32) -> BigUint {
    modulus(bits) - 1u32
}

fn to_signed(v: &BigUint, bits: u32) -> BigInt {
    if bits > 0 && v.bit(bits as u64 - 1) {
        BigInt::from(v.clone()) - BigInt::from(modulus(bits))
    } else {
        BigInt::from(v.clone())
    }
}

fn from_signed(v: &BigInt, bits: u32) -> BigUint {
    let m = BigInt::from(modulus(bits));
    let r = ((v % &m) + &m) % &m;
    r.magnitude().clone()
}

fn shift_amount(amount: &BigUint, bits: u32) -> Option<usize> {
    amount.to_usize().filter(|n| *n < bits as usize)
}

fn rotate_left(v: &BigUint, amount: u32, bits: u32) -> BigUint {
    if bits == 0 {
        return v.clone();
    }
    let n = (amount % bits) as usize;
    ((v << n) | (v >> (bits as usize - n))) & mask(bits)
}

fn fold_binary(op: BinaryOp, a: &BigUint, b: &BigUint, bits: u32) -> TermKind {
    let m = modulus(bits);
    let bv = |v: BigUint| TermKind::BitVec(v % &m, bits);

    match op {
        BinaryOp::Add => bv(a + b),
        BinaryOp::Sub => bv(a + (&m - (b % &m))),
        BinaryOp::Mul => bv(a * b),
        BinaryOp::And => bv(a & b),
        BinaryOp::Or => bv(a | b),
        BinaryOp::Xor => bv(a ^ b),
        BinaryOp::Nand => bv(mask(bits) ^ (a & b)),
        BinaryOp::Nor => bv(mask(bits) ^ (a | b)),
        BinaryOp::Xnor => bv(mask(bits) ^ (a ^ b)),
        BinaryOp::Shl => bv(shift_amount(b, bits).map(|n| a << n).unwrap_or_default()),
        BinaryOp::Lshr => bv(shift_amount(b, bits).map(|n| a >> n).unwrap_or_default()),
        BinaryOp::Ashr => {
            let n = shift_amount(b, bits).unwrap_or(bits as usize);
            bv(from_signed(&(to_signed(a, bits) >> n), bits))
        }
        BinaryOp::Udiv => bv(if b.is_zero() { mask(bits) } else { a / b }),
        BinaryOp::Urem => bv(if b.is_zero() { a.clone() } else { a % b }),
        BinaryOp::Sdiv => {
            let (sa, sb) = (to_signed(a, bits), to_signed(b, bits));
            bv(if sb.is_zero() {
                if sa.sign() == Sign::Minus {
                    BigUint::one()
                } else {
                    mask(bits)
                }
            } else {
                from_signed(&(sa / sb), bits)
            })
        }
        BinaryOp::Srem => {
            let (sa, sb) = (to_signed(a, bits), to_signed(b, bits));
            bv(if sb.is_zero() { a.clone() } else { from_signed(&(sa % sb), bits) })
        }
        BinaryOp::Smod => {
            let (sa, sb) = (to_signed(a, bits), to_signed(b, bits));
            bv(if sb.is_zero() {
                a.clone()
            } else {
                let mut r = &sa % &sb;
                if !r.is_zero() && r.sign() != sb.sign() {
                    r += &sb;
                }
                from_signed(&r, bits)
            })
        }
        BinaryOp::Uge => TermKind::Bool(a >= b),
        BinaryOp::Ugt => TermKind::Bool(a > b),
        BinaryOp::Ule => TermKind::Bool(a <= b),
        BinaryOp::Ult => TermKind::Bool(a < b),
        BinaryOp::Sge => TermKind::Bool(to_signed(a, bits) >= to_signed(b, bits)),
        BinaryOp::Sgt => TermKind::Bool(to_signed(a, bits) > to_signed(b, bits)),
        BinaryOp::Sle => TermKind::Bool(to_signed(a, bits) <= to_signed(b, bits)),
        BinaryOp::Slt => TermKind::Bool(to_signed(a, bits) < to_signed(b, bits)),
        BinaryOp::Eq => TermKind::Bool(a == b),
    }
}

/// Reference backend producing [`Term`]s. Every capability call is counted
/// by operation name.
#[derive(Debug, Clone, Default)]
pub struct SmtBackend {
    calls: HashMap<&'static str, usize>,
}

impl SmtBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.values().sum()
    }

    pub fn reset_calls(&mut self) {
        self.calls.clear();
    }

    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }
}

impl SolverBackend for SmtBackend {
    type Expr = Term;

    fn int_numeral(&mut self, decimal: &str) -> Option<Term> {
        self.record("int");
        let v = BigUint::parse_bytes(decimal.as_bytes(), 10)?;
        Some(TermKind::Int(v).into())
    }

    fn bv_numeral(&mut self, decimal: &str, bits: u32) -> Option<Term> {
        self.record("bv");
        let v = BigUint::parse_bytes(decimal.as_bytes(), 10)?;
        Some(TermKind::BitVec(v % modulus(bits), bits).into())
    }

    fn bv_symbol(&mut self, name: &str, bits: u32) -> Term {
        self.record("declare-const");
        TermKind::Symbol(Arc::from(name), bits).into()
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Term, rhs: &Term) -> Term {
        self.record(op.smtlib_name());

        if let (Some((a, bits)), Some((b, _))) = (lhs.as_bv(), rhs.as_bv()) {
            fold_binary(op, a, b, bits).into()
        } else if op == BinaryOp::Eq && lhs.is_const() && rhs.is_const() {
            TermKind::Bool(lhs == rhs).into()
        } else {
            let sort = if op.is_predicate() { Sort::Bool } else { lhs.sort() };
            Term::app(Op::Binary(op), [lhs.clone(), rhs.clone()], sort)
        }
    }

    fn unary(&mut self, op: UnaryOp, expr: &Term) -> Term {
        self.record(op.smtlib_name());

        if let Some((v, bits)) = expr.as_bv() {
            let folded = match op {
                UnaryOp::Neg => (modulus(bits) - v) % modulus(bits),
                UnaryOp::Not => mask(bits) ^ v,
            };
            TermKind::BitVec(folded, bits).into()
        } else {
            Term::app(Op::Unary(op), [expr.clone()], expr.sort())
        }
    }

    fn and(&mut self, lhs: &Term, rhs: &Term) -> Term {
        self.record("and");
        match (lhs.as_bool(), rhs.as_bool()) {
            (Some(a), Some(b)) => TermKind::Bool(a && b).into(),
            _ => Term::app(Op::And, [lhs.clone(), rhs.clone()], Sort::Bool),
        }
    }

    fn or(&mut self, lhs: &Term, rhs: &Term) -> Term {
        self.record("or");
        match (lhs.as_bool(), rhs.as_bool()) {
            (Some(a), Some(b)) => TermKind::Bool(a || b).into(),
            _ => Term::app(Op::Or, [lhs.clone(), rhs.clone()], Sort::Bool),
        }
    }

    fn not(&mut self, expr: &Term) -> Term {
        self.record("not");
        match expr.as_bool() {
            Some(b) => TermKind::Bool(!b).into(),
            None => Term::app(Op::Not, [expr.clone()], Sort::Bool),
        }
    }

    fn distinct(&mut self, lhs: &Term, rhs: &Term) -> Term {
        self.record("distinct");
        if lhs.is_const() && rhs.is_const() {
            TermKind::Bool(lhs != rhs).into()
        } else {
            Term::app(Op::Distinct, [lhs.clone(), rhs.clone()], Sort::Bool)
        }
    }

    fn ite(&mut self, cond: &Term, texpr: &Term, fexpr: &Term) -> Term {
        self.record("ite");
        match cond.as_bool() {
            Some(true) => texpr.clone(),
            Some(false) => fexpr.clone(),
            None => Term::app(Op::Ite, [cond.clone(), texpr.clone(), fexpr.clone()], texpr.sort()),
        }
    }

    fn rotate_left(&mut self, amount: u32, expr: &Term) -> Term {
        self.record("rotate_left");
        match expr.as_bv() {
            Some((v, bits)) => TermKind::BitVec(rotate_left(v, amount, bits), bits).into(),
            None => Term::app(Op::RotateLeft(amount), [expr.clone()], expr.sort()),
        }
    }

    fn rotate_right(&mut self, amount: u32, expr: &Term) -> Term {
        self.record("rotate_right");
        match expr.as_bv() {
            Some((v, bits)) => {
                let amount = if bits == 0 { 0 } else { bits - amount % bits };
                TermKind::BitVec(rotate_left(v, amount, bits), bits).into()
            }
            None => Term::app(Op::RotateRight(amount), [expr.clone()], expr.sort()),
        }
    }

    fn sign_extend(&mut self, bits: u32, expr: &Term) -> Term {
        self.record("sign_extend");
        let width = expr.bits().saturating_add(bits);
        match expr.as_bv() {
            Some((v, from)) => TermKind::BitVec(from_signed(&to_signed(v, from), width), width).into(),
            None => Term::app(Op::SignExtend(bits), [expr.clone()], Sort::BitVec(width)),
        }
    }

    fn zero_extend(&mut self, bits: u32, expr: &Term) -> Term {
        self.record("zero_extend");
        let width = expr.bits().saturating_add(bits);
        match expr.as_bv() {
            Some((v, _)) => TermKind::BitVec(v.clone(), width).into(),
            None => Term::app(Op::ZeroExtend(bits), [expr.clone()], Sort::BitVec(width)),
        }
    }

    fn extract(&mut self, high: u32, low: u32, expr: &Term) -> Term {
        self.record("extract");
        let width = high.saturating_sub(low).saturating_add(1);
        match expr.as_bv() {
            Some((v, _)) => TermKind::BitVec((v >> low as usize) & mask(width), width).into(),
            None => Term::app(Op::Extract(high, low), [expr.clone()], Sort::BitVec(width)),
        }
    }

    fn concat(&mut self, high: &Term, low: &Term) -> Term {
        self.record("concat");
        let width = high.bits().saturating_add(low.bits());
        match (high.as_bv(), low.as_bv()) {
            (Some((h, _)), Some((l, lbits))) => TermKind::BitVec((h << lbits as usize) | l, width).into(),
            _ => Term::app(Op::Concat, [high.clone(), low.clone()], Sort::BitVec(width)),
        }
    }

    fn is_bool(&self, expr: &Term) -> bool {
        expr.sort() == Sort::Bool
    }

    fn bits(&self, expr: &Term) -> Option<u32> {
        if let Sort::BitVec(bits) = expr.sort() {
            Some(bits)
        } else {
            None
        }
    }

    fn to_u64(&self, expr: &Term) -> Option<u64> {
        expr.as_numeral().and_then(|v| v.to_u64())
    }

    fn to_decimal(&self, expr: &Term) -> Option<String> {
        expr.as_numeral().map(|v| v.to_str_radix(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bv(backend: &mut SmtBackend, v: u64, bits: u32) -> Term {
        backend.bv_numeral(&v.to_string(), bits).unwrap()
    }

    fn value(t: &Term) -> u64 {
        t.as_bv().and_then(|(v, _)| v.to_u64()).unwrap()
    }

    #[test]
    fn arithmetic_wraps() {
        let mut b = SmtBackend::new();
        let x = bv(&mut b, 0xff, 8);
        let one = bv(&mut b, 1, 8);

        assert_eq!(value(&b.binary(BinaryOp::Add, &x, &one)), 0);
        assert_eq!(value(&b.binary(BinaryOp::Sub, &one, &x)), 2);
        assert_eq!(value(&b.unary(UnaryOp::Neg, &one)), 0xff);
        assert_eq!(value(&b.unary(UnaryOp::Not, &one)), 0xfe);
        assert_eq!(value(&b.binary(BinaryOp::Nand, &x, &one)), 0xfe);
    }

    #[test]
    fn signed_division_semantics() {
        let mut b = SmtBackend::new();
        let m7 = bv(&mut b, 0xf9, 8); // -7
        let two = bv(&mut b, 2, 8);
        let m2 = bv(&mut b, 0xfe, 8);
        let zero = bv(&mut b, 0, 8);

        assert_eq!(value(&b.binary(BinaryOp::Sdiv, &m7, &two)), 0xfd); // -3
        assert_eq!(value(&b.binary(BinaryOp::Srem, &m7, &two)), 0xff); // -1
        assert_eq!(value(&b.binary(BinaryOp::Smod, &m7, &two)), 1);
        assert_eq!(value(&b.binary(BinaryOp::Smod, &two, &m2)), 0);
        assert_eq!(value(&b.binary(BinaryOp::Sdiv, &m7, &zero)), 1);
        assert_eq!(value(&b.binary(BinaryOp::Sdiv, &two, &zero)), 0xff);
        assert_eq!(value(&b.binary(BinaryOp::Udiv, &two, &zero)), 0xff);
        assert_eq!(value(&b.binary(BinaryOp::Urem, &m7, &zero)), 0xf9);
        assert_eq!(value(&b.binary(BinaryOp::Ashr, &m7, &two)), 0xfe);
        assert_eq!(b.binary(BinaryOp::Slt, &m7, &two).as_bool(), Some(true));
        assert_eq!(b.binary(BinaryOp::Ult, &m7, &two).as_bool(), Some(false));
    }

    #[test]
    fn structural_operations_fold() {
        let mut b = SmtBackend::new();
        let x = bv(&mut b, 0x1234, 16);
        let lo = b.extract(7, 0, &x);
        assert_eq!(lo.sort(), Sort::BitVec(8));
        assert_eq!(value(&lo), 0x34);

        let h = bv(&mut b, 0x02, 8);
        let cat = b.concat(&h, &lo);
        assert_eq!(cat.sort(), Sort::BitVec(16));
        assert_eq!(value(&cat), 0x0234);

        let neg = bv(&mut b, 0x80, 8);
        assert_eq!(value(&b.sign_extend(8, &neg)), 0xff80);
        assert_eq!(value(&b.zero_extend(8, &neg)), 0x0080);
        assert_eq!(value(&b.rotate_left(1, &neg)), 0x01);
        assert_eq!(value(&b.rotate_right(1, &neg)), 0x40);
        assert_eq!(value(&b.rotate_left(8, &neg)), 0x80);
    }

    #[test]
    fn symbolic_terms_render() {
        let mut b = SmtBackend::new();
        let x = b.bv_symbol("SymVar_0", 8);
        let one = bv(&mut b, 1, 8);
        let sum = b.binary(BinaryOp::Add, &x, &one);
        let lo = b.extract(3, 0, &sum);
        let cmp = b.binary(BinaryOp::Eq, &sum, &one);

        assert_eq!(sum.sort(), Sort::BitVec(8));
        assert_eq!(lo.to_string(), "((_ extract 3 0) (bvadd SymVar_0 (_ bv1 8)))");
        assert!(b.is_bool(&cmp));
        assert_eq!(b.to_u64(&sum), None);
    }

    #[test]
    fn terms_are_shared() {
        let mut b = SmtBackend::new();
        let x = b.bv_symbol("a", 32);
        let y = b.bv_symbol("a", 32);
        let l = b.binary(BinaryOp::Mul, &x, &y);
        let r = b.binary(BinaryOp::Mul, &y, &x);

        assert_eq!(x, y);
        assert_eq!(l, r);
    }

    #[test]
    fn readback_and_counts() {
        let mut b = SmtBackend::new();
        let n = b.int_numeral("340282366920938463463374607431768211456").unwrap();

        assert_eq!(b.to_decimal(&n).as_deref(), Some("340282366920938463463374607431768211456"));
        assert_eq!(b.to_u64(&n), None);
        assert_eq!(b.bits(&n), None);
        assert!(b.int_numeral("12a").is_none());

        let x = b.bv_symbol("x", 12);
        assert_eq!(b.bits(&x), Some(12));
        assert_eq!(b.calls("int"), 2);
        assert_eq!(b.total_calls(), 3);
    }
}
