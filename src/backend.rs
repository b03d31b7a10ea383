use crate::node::{BinaryOp, UnaryOp};

pub mod smtlib;

/// Operations the translator needs from a solver.
///
/// Constructors never fail except for numerals, whose textual input is
/// validated by the backend. Readback is only expected to succeed on
/// numeral expressions.
pub trait SolverBackend {
    type Expr: Clone;

    /// Unbounded integer numeral from its decimal representation.
    fn int_numeral(&mut self, decimal: &str) -> Option<Self::Expr>;

    /// Bit-vector numeral of width `bits`; the value is reduced modulo 2^bits.
    fn bv_numeral(&mut self, decimal: &str, bits: u32) -> Option<Self::Expr>;

    fn bv_symbol(&mut self, name: &str, bits: u32) -> Self::Expr;

    fn binary(&mut self, op: BinaryOp, lhs: &Self::Expr, rhs: &Self::Expr) -> Self::Expr;
    fn unary(&mut self, op: UnaryOp, expr: &Self::Expr) -> Self::Expr;

    fn and(&mut self, lhs: &Self::Expr, rhs: &Self::Expr) -> Self::Expr;
    fn or(&mut self, lhs: &Self::Expr, rhs: &Self::Expr) -> Self::Expr;
    fn not(&mut self, expr: &Self::Expr) -> Self::Expr;
    fn distinct(&mut self, lhs: &Self::Expr, rhs: &Self::Expr) -> Self::Expr;

    fn ite(&mut self, cond: &Self::Expr, texpr: &Self::Expr, fexpr: &Self::Expr) -> Self::Expr;

    fn rotate_left(&mut self, amount: u32, expr: &Self::Expr) -> Self::Expr;
    fn rotate_right(&mut self, amount: u32, expr: &Self::Expr) -> Self::Expr;
    fn sign_extend(&mut self, bits: u32, expr: &Self::Expr) -> Self::Expr;
    fn zero_extend(&mut self, bits: u32, expr: &Self::Expr) -> Self::Expr;
    fn extract(&mut self, high: u32, low: u32, expr: &Self::Expr) -> Self::Expr;

    /// `high ++ low`; the result is `high`'s width plus `low`'s width.
    fn concat(&mut self, high: &Self::Expr, low: &Self::Expr) -> Self::Expr;

    fn is_bool(&self, expr: &Self::Expr) -> bool;

    /// Width of a bit-vector sorted expression; `None` for other sorts.
    fn bits(&self, expr: &Self::Expr) -> Option<u32>;

    fn to_u64(&self, expr: &Self::Expr) -> Option<u64>;
    fn to_decimal(&self, expr: &Self::Expr) -> Option<String>;
}
