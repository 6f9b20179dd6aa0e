use crate::mdl::symbols::SymbolKind;
use std::collections::HashMap;

/// Index of an expression node in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// Index into the interned number pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NumId(pub(crate) u32);

/// Reference to a declared operand: its kind and the index within the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymRef {
    pub kind: SymbolKind,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Lg,
    Sqrt,
    Abs,
    Sgn,
    Erf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    And,
    Or,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

/// One node of the expression graph. Children are pool indices, so the
/// graph is a DAG by construction and sharing costs nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Num(NumId),
    Sym(SymRef),
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
    Cond {
        cond: NodeId,
        then: NodeId,
        otherwise: NodeId,
    },
}

/// Bytecode immediates are 24 bits wide; pools must stay below this.
pub const MAX_POOL_INDEX: usize = 1 << 24;

/// Arena for expression nodes and the interned number pool.
///
/// Identical constructions return the identical node id (hash consing), so
/// common subexpressions are shared without a separate pass. Every
/// constructor runs the algebraic simplifier, which keeps the graph in a
/// fixed point: rebuilding an already simplified tree reproduces the same
/// ids.
#[derive(Default)]
pub struct ExprPool {
    nodes: Vec<Node>,
    interned: HashMap<Node, NodeId>,
    numbers: Vec<f64>,
    number_ids: HashMap<u64, NumId>,
    overflowed: bool,
}

impl ExprPool {
    pub fn new() -> ExprPool {
        ExprPool::default()
    }

    pub fn node(&self, id: NodeId) -> Node {
        self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn numbers(&self) -> &[f64] {
        &self.numbers
    }

    pub fn number_value(&self, id: NumId) -> f64 {
        self.numbers[id.0 as usize]
    }

    /// True once any pool outgrew the bytecode immediate width. The
    /// compilation must then fail with an out-of-memory diagnostic.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    fn intern(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.interned.get(&node) {
            return *id;
        }
        if self.nodes.len() >= MAX_POOL_INDEX {
            self.overflowed = true;
            return NodeId(0);
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.interned.insert(node, id);
        id
    }

    fn num_id(&mut self, value: f64) -> NumId {
        if let Some(id) = self.number_ids.get(&value.to_bits()) {
            return *id;
        }
        if self.numbers.len() >= MAX_POOL_INDEX {
            self.overflowed = true;
            return NumId(0);
        }
        let id = NumId(self.numbers.len() as u32);
        self.numbers.push(value);
        self.number_ids.insert(value.to_bits(), id);
        id
    }

    pub fn number(&mut self, value: f64) -> NodeId {
        let id = self.num_id(value);
        self.intern(Node::Num(id))
    }

    pub fn sym(&mut self, sym: SymRef) -> NodeId {
        self.intern(Node::Sym(sym))
    }

    /// The constant value of a node, if it is a number leaf.
    pub fn as_const(&self, id: NodeId) -> Option<f64> {
        match self.node(id) {
            Node::Num(num) => Some(self.number_value(num)),
            _ => None,
        }
    }

    pub fn unary(&mut self, op: UnaryOp, child: NodeId) -> NodeId {
        if let Some(value) = self.as_const(child) {
            return self.number(apply_unary(op, value));
        }
        match (op, self.node(child)) {
            (UnaryOp::Neg, Node::Unary(UnaryOp::Neg, inner)) => return inner,
            (UnaryOp::Log, Node::Unary(UnaryOp::Exp, inner)) => return inner,
            _ => {}
        }
        self.intern(Node::Unary(op, child))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        let lc = self.as_const(lhs);
        let rc = self.as_const(rhs);
        if let (Some(l), Some(r)) = (lc, rc) {
            return self.number(apply_binary(op, l, r));
        }
        match op {
            BinaryOp::Add => {
                if lc == Some(0.0) {
                    return rhs;
                }
                if rc == Some(0.0) {
                    return lhs;
                }
                // constants lead, so equal sums intern identically
                if rc.is_some() {
                    return self.intern(Node::Binary(op, rhs, lhs));
                }
            }
            BinaryOp::Sub => {
                if rc == Some(0.0) {
                    return lhs;
                }
                if lc == Some(0.0) {
                    return self.unary(UnaryOp::Neg, rhs);
                }
            }
            BinaryOp::Mul => {
                if lc == Some(0.0) || rc == Some(0.0) {
                    return self.number(0.0);
                }
                if lc == Some(1.0) {
                    return rhs;
                }
                if rc == Some(1.0) {
                    return lhs;
                }
                if rc.is_some() {
                    return self.intern(Node::Binary(op, rhs, lhs));
                }
            }
            BinaryOp::Div => {
                if rc == Some(1.0) {
                    return lhs;
                }
            }
            BinaryOp::Pow => {
                if rc == Some(0.0) {
                    return self.number(1.0);
                }
                if rc == Some(1.0) {
                    return lhs;
                }
            }
            _ => {}
        }
        self.intern(Node::Binary(op, lhs, rhs))
    }

    pub fn cond(&mut self, cond: NodeId, then: NodeId, otherwise: NodeId) -> NodeId {
        if let Some(value) = self.as_const(cond) {
            return if value != 0.0 { then } else { otherwise };
        }
        self.intern(Node::Cond {
            cond,
            then,
            otherwise,
        })
    }
}

pub(crate) fn sgn(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn bool_to_f64(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

pub(crate) fn apply_unary(op: UnaryOp, v: f64) -> f64 {
    use UnaryOp::*;
    match op {
        Neg => -v,
        Not => bool_to_f64(v == 0.0),
        Sin => v.sin(),
        Cos => v.cos(),
        Tan => v.tan(),
        Asin => v.asin(),
        Acos => v.acos(),
        Atan => v.atan(),
        Sinh => v.sinh(),
        Cosh => v.cosh(),
        Tanh => v.tanh(),
        Exp => v.exp(),
        Log => v.ln(),
        Lg => v.log10(),
        Sqrt => v.sqrt(),
        Abs => v.abs(),
        Sgn => sgn(v),
        Erf => libm::erf(v),
    }
}

pub(crate) fn apply_binary(op: BinaryOp, l: f64, r: f64) -> f64 {
    use BinaryOp::*;
    match op {
        Add => l + r,
        Sub => l - r,
        Mul => l * r,
        Div => l / r,
        Pow => l.powf(r),
        And => bool_to_f64(l != 0.0 && r != 0.0),
        Or => bool_to_f64(l != 0.0 || r != 0.0),
        Lt => bool_to_f64(l < r),
        Gt => bool_to_f64(l > r),
        Le => bool_to_f64(l <= r),
        Ge => bool_to_f64(l >= r),
        Eq => bool_to_f64(l == r),
        Ne => bool_to_f64(l != r),
    }
}

#[cfg(test)]
mod tests {
    use super::{BinaryOp, ExprPool, Node, NodeId, SymRef, UnaryOp};
    use crate::mdl::symbols::SymbolKind;

    fn var(pool: &mut ExprPool, index: u32) -> NodeId {
        pool.sym(SymRef {
            kind: SymbolKind::Var,
            index,
        })
    }

    #[test]
    fn constant_folding() {
        let mut pool = ExprPool::new();
        let two = pool.number(2.0);
        let three = pool.number(3.0);
        let sum = pool.binary(BinaryOp::Add, two, three);
        assert_eq!(pool.as_const(sum), Some(5.0));
        let product = pool.binary(BinaryOp::Mul, two, three);
        assert_eq!(pool.as_const(product), Some(6.0));
        let sine = pool.unary(UnaryOp::Sin, two);
        assert_eq!(pool.as_const(sine), Some(2.0_f64.sin()));
    }

    #[test]
    fn additive_identities() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let zero = pool.number(0.0);
        assert_eq!(pool.binary(BinaryOp::Add, x, zero), x);
        assert_eq!(pool.binary(BinaryOp::Add, zero, x), x);
        assert_eq!(pool.binary(BinaryOp::Sub, x, zero), x);
        let negated = pool.binary(BinaryOp::Sub, zero, x);
        assert_eq!(pool.node(negated), Node::Unary(UnaryOp::Neg, x));
    }

    #[test]
    fn multiplicative_identities() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let zero = pool.number(0.0);
        let one = pool.number(1.0);
        assert_eq!(pool.binary(BinaryOp::Mul, x, one), x);
        assert_eq!(pool.binary(BinaryOp::Mul, one, x), x);
        assert_eq!(pool.binary(BinaryOp::Mul, x, zero), zero);
        assert_eq!(pool.binary(BinaryOp::Mul, zero, x), zero);
        assert_eq!(pool.binary(BinaryOp::Div, x, one), x);
    }

    #[test]
    fn power_identities() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let zero = pool.number(0.0);
        let one = pool.number(1.0);
        let raised = pool.binary(BinaryOp::Pow, x, zero);
        assert_eq!(pool.as_const(raised), Some(1.0));
        assert_eq!(pool.binary(BinaryOp::Pow, x, one), x);
    }

    #[test]
    fn involutions() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let neg = pool.unary(UnaryOp::Neg, x);
        assert_eq!(pool.unary(UnaryOp::Neg, neg), x);
        let exp = pool.unary(UnaryOp::Exp, x);
        assert_eq!(pool.unary(UnaryOp::Log, exp), x);
        // exp(log x) is not rewritten; log x may be undefined
        let log = pool.unary(UnaryOp::Log, x);
        let back = pool.unary(UnaryOp::Exp, log);
        assert_eq!(pool.node(back), Node::Unary(UnaryOp::Exp, log));
    }

    #[test]
    fn unsound_real_identities_are_not_applied() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let diff = pool.binary(BinaryOp::Sub, x, x);
        assert_eq!(pool.node(diff), Node::Binary(BinaryOp::Sub, x, x));
        let quotient = pool.binary(BinaryOp::Div, x, x);
        assert_eq!(pool.node(quotient), Node::Binary(BinaryOp::Div, x, x));
    }

    #[test]
    fn constants_are_canonicalized_to_the_left() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let two = pool.number(2.0);
        assert_eq!(
            pool.binary(BinaryOp::Add, x, two),
            pool.binary(BinaryOp::Add, two, x)
        );
        assert_eq!(
            pool.binary(BinaryOp::Mul, x, two),
            pool.binary(BinaryOp::Mul, two, x)
        );
    }

    #[test]
    fn common_subexpressions_share_nodes() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let sin_a = pool.unary(UnaryOp::Sin, x);
        let sin_b = pool.unary(UnaryOp::Sin, x);
        assert_eq!(sin_a, sin_b);
        assert_eq!(pool.number(2.5), pool.number(2.5));
    }

    #[test]
    fn conditions_on_constants_select_a_branch() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let y = var(&mut pool, 1);
        let one = pool.number(1.0);
        let zero = pool.number(0.0);
        assert_eq!(pool.cond(one, x, y), x);
        assert_eq!(pool.cond(zero, x, y), y);
    }

    /// Rebuild `id` bottom-up through the public constructors.
    fn rebuild(pool: &mut ExprPool, id: NodeId) -> NodeId {
        match pool.node(id) {
            Node::Num(num) => {
                let value = pool.number_value(num);
                pool.number(value)
            }
            Node::Sym(sym) => pool.sym(sym),
            Node::Unary(op, child) => {
                let child = rebuild(pool, child);
                pool.unary(op, child)
            }
            Node::Binary(op, lhs, rhs) => {
                let lhs = rebuild(pool, lhs);
                let rhs = rebuild(pool, rhs);
                pool.binary(op, lhs, rhs)
            }
            Node::Cond {
                cond,
                then,
                otherwise,
            } => {
                let cond = rebuild(pool, cond);
                let then = rebuild(pool, then);
                let otherwise = rebuild(pool, otherwise);
                pool.cond(cond, then, otherwise)
            }
        }
    }

    #[test]
    fn simplification_is_idempotent() {
        let mut pool = ExprPool::new();
        let x = var(&mut pool, 0);
        let a = pool.sym(SymRef {
            kind: SymbolKind::Par,
            index: 0,
        });
        let two = pool.number(2.0);
        let sin = pool.unary(UnaryOp::Sin, x);
        let pow = pool.binary(BinaryOp::Pow, sin, two);
        let scaled = pool.binary(BinaryOp::Mul, a, pow);
        let cos = pool.unary(UnaryOp::Cos, x);
        let expr = pool.binary(BinaryOp::Add, scaled, cos);
        assert_eq!(rebuild(&mut pool, expr), expr);
        let nodes_before = pool.len();
        assert_eq!(rebuild(&mut pool, expr), expr);
        assert_eq!(pool.len(), nodes_before, "rebuilding allocated no nodes");
    }
}
