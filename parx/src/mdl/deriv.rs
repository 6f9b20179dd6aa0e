use crate::mdl::expr::{BinaryOp, ExprPool, Node, NodeId, SymRef, UnaryOp};
use crate::mdl::symbols::SymbolKind;
use std::collections::HashMap;
use std::f64::consts::FRAC_2_SQRT_PI;

/// Replace references to assigned auxiliaries by their definition trees.
/// Sharing keeps this cheap: the rebuilt graph reuses interned nodes, and
/// the code generator later materializes shared subtrees once. Auxiliaries
/// without a definition stay as operands backed by the `a` input vector.
pub(crate) fn resolve_aux(
    pool: &mut ExprPool,
    aux_defs: &[Option<NodeId>],
    memo: &mut HashMap<NodeId, NodeId>,
    id: NodeId,
) -> NodeId {
    if let Some(resolved) = memo.get(&id) {
        return *resolved;
    }
    let resolved = match pool.node(id) {
        Node::Num(_) => id,
        Node::Sym(sym) => match aux_defs.get(sym.index as usize) {
            Some(Some(def)) if sym.kind == SymbolKind::Aux => {
                let def = *def;
                resolve_aux(pool, aux_defs, memo, def)
            }
            _ => id,
        },
        Node::Unary(op, child) => {
            let child = resolve_aux(pool, aux_defs, memo, child);
            pool.unary(op, child)
        }
        Node::Binary(op, lhs, rhs) => {
            let lhs = resolve_aux(pool, aux_defs, memo, lhs);
            let rhs = resolve_aux(pool, aux_defs, memo, rhs);
            pool.binary(op, lhs, rhs)
        }
        Node::Cond {
            cond,
            then,
            otherwise,
        } => {
            let cond = resolve_aux(pool, aux_defs, memo, cond);
            let then = resolve_aux(pool, aux_defs, memo, then);
            let otherwise = resolve_aux(pool, aux_defs, memo, otherwise);
            pool.cond(cond, then, otherwise)
        }
    };
    memo.insert(id, resolved);
    resolved
}

/// Builds derivative trees. Every created node goes through the pool
/// constructors, so derivatives come out simplified, and the memo shares
/// one derivative instance wherever a subexpression repeats.
pub(crate) struct Differentiator<'a> {
    pool: &'a mut ExprPool,
    memo: HashMap<(NodeId, SymRef), NodeId>,
}

impl<'a> Differentiator<'a> {
    pub fn new(pool: &'a mut ExprPool) -> Differentiator<'a> {
        Differentiator {
            pool,
            memo: HashMap::new(),
        }
    }

    /// ∂`id`/∂`wrt`. Expects an aux-resolved tree.
    pub fn derive(&mut self, id: NodeId, wrt: SymRef) -> NodeId {
        if let Some(derivative) = self.memo.get(&(id, wrt)) {
            return *derivative;
        }
        let derivative = match self.pool.node(id) {
            Node::Num(_) => self.pool.number(0.0),
            Node::Sym(sym) => {
                let value = if sym == wrt { 1.0 } else { 0.0 };
                self.pool.number(value)
            }
            Node::Unary(op, u) => {
                let du = self.derive(u, wrt);
                self.unary_rule(op, u, du)
            }
            Node::Binary(op, u, v) => {
                let du = self.derive(u, wrt);
                let dv = self.derive(v, wrt);
                self.binary_rule(op, u, v, du, dv)
            }
            Node::Cond {
                cond,
                then,
                otherwise,
            } => {
                // the condition gates which branch's derivative applies
                let dthen = self.derive(then, wrt);
                let delse = self.derive(otherwise, wrt);
                self.pool.cond(cond, dthen, delse)
            }
        };
        self.memo.insert((id, wrt), derivative);
        derivative
    }

    fn unary_rule(&mut self, op: UnaryOp, u: NodeId, du: NodeId) -> NodeId {
        use BinaryOp::*;
        use UnaryOp::*;
        let pool = &mut *self.pool;
        match op {
            Neg => pool.unary(Neg, du),
            // booleans are piecewise constant
            Not | Sgn => pool.number(0.0),
            Sin => {
                let cos = pool.unary(Cos, u);
                pool.binary(Mul, cos, du)
            }
            Cos => {
                let sin = pool.unary(Sin, u);
                let product = pool.binary(Mul, sin, du);
                pool.unary(Neg, product)
            }
            Tan => {
                let cos = pool.unary(Cos, u);
                let cos2 = pool.binary(Mul, cos, cos);
                pool.binary(Div, du, cos2)
            }
            Asin | Acos => {
                let u2 = pool.binary(Mul, u, u);
                let one = pool.number(1.0);
                let inner = pool.binary(Sub, one, u2);
                let root = pool.unary(Sqrt, inner);
                let quotient = pool.binary(Div, du, root);
                if op == Asin {
                    quotient
                } else {
                    pool.unary(Neg, quotient)
                }
            }
            Atan => {
                let u2 = pool.binary(Mul, u, u);
                let one = pool.number(1.0);
                let denom = pool.binary(Add, one, u2);
                pool.binary(Div, du, denom)
            }
            Sinh => {
                let cosh = pool.unary(Cosh, u);
                pool.binary(Mul, cosh, du)
            }
            Cosh => {
                let sinh = pool.unary(Sinh, u);
                pool.binary(Mul, sinh, du)
            }
            Tanh => {
                let cosh = pool.unary(Cosh, u);
                let cosh2 = pool.binary(Mul, cosh, cosh);
                pool.binary(Div, du, cosh2)
            }
            Exp => {
                let exp = pool.unary(Exp, u);
                pool.binary(Mul, exp, du)
            }
            Log => pool.binary(Div, du, u),
            Lg => {
                let ln10 = pool.number(std::f64::consts::LN_10);
                let denom = pool.binary(Mul, ln10, u);
                pool.binary(Div, du, denom)
            }
            Sqrt => {
                let root = pool.unary(Sqrt, u);
                let two = pool.number(2.0);
                let denom = pool.binary(Mul, two, root);
                pool.binary(Div, du, denom)
            }
            Abs => {
                let sign = pool.unary(Sgn, u);
                pool.binary(Mul, sign, du)
            }
            Erf => {
                let scale = pool.number(FRAC_2_SQRT_PI);
                let u2 = pool.binary(Mul, u, u);
                let negated = pool.unary(Neg, u2);
                let gauss = pool.unary(Exp, negated);
                let factor = pool.binary(Mul, scale, gauss);
                pool.binary(Mul, factor, du)
            }
        }
    }

    fn binary_rule(
        &mut self,
        op: BinaryOp,
        u: NodeId,
        v: NodeId,
        du: NodeId,
        dv: NodeId,
    ) -> NodeId {
        use BinaryOp::*;
        let pool = &mut *self.pool;
        match op {
            Add => pool.binary(Add, du, dv),
            Sub => pool.binary(Sub, du, dv),
            Mul => {
                let left = pool.binary(Mul, du, v);
                let right = pool.binary(Mul, u, dv);
                pool.binary(Add, left, right)
            }
            Div => {
                let left = pool.binary(Mul, du, v);
                let right = pool.binary(Mul, u, dv);
                let numer = pool.binary(Sub, left, right);
                let denom = pool.binary(Mul, v, v);
                pool.binary(Div, numer, denom)
            }
            Pow => match pool.as_const(v) {
                Some(exponent) => {
                    // v·u^(v−1)·u' for a constant exponent
                    let c = pool.number(exponent);
                    let reduced = pool.number(exponent - 1.0);
                    let power = pool.binary(Pow, u, reduced);
                    let scaled = pool.binary(Mul, c, power);
                    pool.binary(Mul, scaled, du)
                }
                None => {
                    // u^v·(v'·ln u + v·u'/u)
                    let power = pool.binary(Pow, u, v);
                    let log = pool.unary(UnaryOp::Log, u);
                    let left = pool.binary(Mul, dv, log);
                    let vdu = pool.binary(Mul, v, du);
                    let right = pool.binary(Div, vdu, u);
                    let inner = pool.binary(Add, left, right);
                    pool.binary(Mul, power, inner)
                }
            },
            // comparisons and logicals are piecewise constant
            And | Or | Lt | Gt | Le | Ge | Eq | Ne => pool.number(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve_aux, Differentiator};
    use crate::mdl::expr::{BinaryOp, ExprPool, Node, NodeId, SymRef, UnaryOp};
    use crate::mdl::symbols::SymbolKind;
    use std::collections::HashMap;

    fn var(pool: &mut ExprPool, index: u32) -> (NodeId, SymRef) {
        let sym = SymRef {
            kind: SymbolKind::Var,
            index,
        };
        (pool.sym(sym), sym)
    }

    fn par(pool: &mut ExprPool, index: u32) -> (NodeId, SymRef) {
        let sym = SymRef {
            kind: SymbolKind::Par,
            index,
        };
        (pool.sym(sym), sym)
    }

    #[test]
    fn derivative_of_an_operand_is_the_kronecker_delta() {
        let mut pool = ExprPool::new();
        let (x, x_ref) = var(&mut pool, 0);
        let (_, y_ref) = var(&mut pool, 1);
        let mut diff = Differentiator::new(&mut pool);
        let dx = diff.derive(x, x_ref);
        let dy = diff.derive(x, y_ref);
        assert_eq!(pool.as_const(dx), Some(1.0));
        assert_eq!(pool.as_const(dy), Some(0.0));
    }

    #[test]
    fn linear_residual_has_constant_derivatives() {
        // r = a*x + b
        let mut pool = ExprPool::new();
        let (x, x_ref) = var(&mut pool, 0);
        let (a, a_ref) = par(&mut pool, 0);
        let (b, b_ref) = par(&mut pool, 1);
        let ax = pool.binary(BinaryOp::Mul, a, x);
        let r = pool.binary(BinaryOp::Add, ax, b);
        let mut diff = Differentiator::new(&mut pool);
        let dr_dx = diff.derive(r, x_ref);
        let dr_da = diff.derive(r, a_ref);
        let dr_db = diff.derive(r, b_ref);
        // the simplifier collapses the product rule to the surviving factor
        assert_eq!(dr_dx, a);
        assert_eq!(dr_da, x);
        assert_eq!(pool.as_const(dr_db), Some(1.0));
    }

    #[test]
    fn chain_rule_through_sin() {
        let mut pool = ExprPool::new();
        let (x, x_ref) = var(&mut pool, 0);
        let sin = pool.unary(UnaryOp::Sin, x);
        let mut diff = Differentiator::new(&mut pool);
        let derivative = diff.derive(sin, x_ref);
        assert_eq!(pool.node(derivative), Node::Unary(UnaryOp::Cos, x));
    }

    #[test]
    fn constant_power_rule() {
        let mut pool = ExprPool::new();
        let (x, x_ref) = var(&mut pool, 0);
        let two = pool.number(2.0);
        let square = pool.binary(BinaryOp::Pow, x, two);
        let mut diff = Differentiator::new(&mut pool);
        let derivative = diff.derive(square, x_ref);
        // 2·x^1·1 simplifies to 2·x with the constant on the left
        assert_eq!(pool.node(derivative), Node::Binary(BinaryOp::Mul, two, x));
    }

    #[test]
    fn quotient_rule() {
        let mut pool = ExprPool::new();
        let (x, x_ref) = var(&mut pool, 0);
        let (a, _) = par(&mut pool, 0);
        let quotient = pool.binary(BinaryOp::Div, a, x);
        let mut diff = Differentiator::new(&mut pool);
        let derivative = diff.derive(quotient, x_ref);
        // (0·x − a·1)/x² = −a/x²
        let x2 = pool.binary(BinaryOp::Mul, x, x);
        let neg_a = pool.unary(UnaryOp::Neg, a);
        let expected = pool.binary(BinaryOp::Div, neg_a, x2);
        assert_eq!(derivative, expected);
    }

    #[test]
    fn conditionals_gate_the_branch_derivative() {
        let mut pool = ExprPool::new();
        let (x, _) = var(&mut pool, 0);
        let (p, p_ref) = par(&mut pool, 0);
        let flag = pool.sym(SymRef {
            kind: SymbolKind::Flg,
            index: 0,
        });
        let minus = pool.binary(BinaryOp::Sub, x, p);
        let plus = pool.binary(BinaryOp::Add, x, p);
        let cond = pool.cond(flag, minus, plus);
        let mut diff = Differentiator::new(&mut pool);
        let derivative = diff.derive(cond, p_ref);
        match pool.node(derivative) {
            Node::Cond {
                cond,
                then,
                otherwise,
            } => {
                assert_eq!(cond, flag);
                assert_eq!(pool.as_const(then), Some(-1.0));
                assert_eq!(pool.as_const(otherwise), Some(1.0));
            }
            other => panic!("expected a conditional derivative, got {other:?}"),
        }
    }

    #[test]
    fn derivatives_share_subtrees() {
        let mut pool = ExprPool::new();
        let (x, x_ref) = var(&mut pool, 0);
        let sin = pool.unary(UnaryOp::Sin, x);
        let double = pool.binary(BinaryOp::Add, sin, sin);
        let mut diff = Differentiator::new(&mut pool);
        let first = diff.derive(sin, x_ref);
        let again = diff.derive(double, x_ref);
        // d(sin+sin)/dx = cos + cos reuses the memoized cos instance
        assert_eq!(pool.node(again), Node::Binary(BinaryOp::Add, first, first));
    }

    #[test]
    fn aux_resolution_substitutes_definitions() {
        let mut pool = ExprPool::new();
        let (x, x_ref) = var(&mut pool, 0);
        let y = pool.sym(SymRef {
            kind: SymbolKind::Aux,
            index: 0,
        });
        // y = x*x; r = y + x
        let y_def = pool.binary(BinaryOp::Mul, x, x);
        let r = pool.binary(BinaryOp::Add, y, x);
        let mut memo = HashMap::new();
        let resolved = resolve_aux(&mut pool, &[Some(y_def)], &mut memo, r);
        assert_eq!(
            pool.node(resolved),
            Node::Binary(BinaryOp::Add, y_def, x)
        );
        // chain rule flows through the substituted tree: d r/d x = 2x + 1... as trees
        let mut diff = Differentiator::new(&mut pool);
        let derivative = diff.derive(resolved, x_ref);
        let dx2 = diff.derive(y_def, x_ref);
        let one = pool.number(1.0);
        let expected = pool.binary(BinaryOp::Add, dx2, one);
        assert_eq!(derivative, expected);
    }

    #[test]
    fn unassigned_aux_keeps_its_operand() {
        let mut pool = ExprPool::new();
        let aux = SymRef {
            kind: SymbolKind::Aux,
            index: 0,
        };
        let y = pool.sym(aux);
        let (x, _) = var(&mut pool, 0);
        let r = pool.binary(BinaryOp::Add, y, x);
        let mut memo = HashMap::new();
        let resolved = resolve_aux(&mut pool, &[None], &mut memo, r);
        assert_eq!(resolved, r);
        let mut diff = Differentiator::new(&mut pool);
        let da = diff.derive(resolved, aux);
        assert_eq!(pool.as_const(da), Some(1.0));
    }
}
