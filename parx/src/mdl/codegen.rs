use crate::mdl::code::{Code, Opr, Tables, Typ};
use crate::mdl::deriv::{resolve_aux, Differentiator};
use crate::mdl::expr::{BinaryOp, ExprPool, Node, NodeId, SymRef, UnaryOp};
use crate::mdl::symbols::SymbolKind;
use std::collections::HashMap;

/// Linearize the residual and derivative trees into the interpreter
/// program. Layout:
///
/// ```text
/// CHKL/CHKG for every parameter with a finite limit
/// SOK
/// per residual: value RET, then one block per VAR, AUX and PAR column,
///               each ending in RET
/// EOD
/// ```
///
/// Shared subtrees are stored into temporary slots on first use (`ASS`) and
/// loaded afterwards (`OPD TMP`). Slots taken inside derivative blocks are
/// reclaimed when the block ends; only value blocks, which always execute,
/// may own slots that later blocks read.
pub(crate) fn generate(
    pool: &mut ExprPool,
    tables: &Tables,
    res_defs: &[NodeId],
    aux_defs: &[Option<NodeId>],
) -> (Vec<Code>, u32) {
    let mut memo = HashMap::new();
    let roots: Vec<NodeId> = res_defs
        .iter()
        .map(|id| resolve_aux(pool, aux_defs, &mut memo, *id))
        .collect();

    let mut blocks: Vec<Vec<NodeId>> = Vec::new();
    {
        let mut diff = Differentiator::new(pool);
        for root in &roots {
            let mut group = vec![*root];
            for index in 0..tables.var.len() {
                group.push(diff.derive(
                    *root,
                    SymRef {
                        kind: SymbolKind::Var,
                        index: index as u32,
                    },
                ));
            }
            for index in 0..tables.aux.len() {
                group.push(diff.derive(
                    *root,
                    SymRef {
                        kind: SymbolKind::Aux,
                        index: index as u32,
                    },
                ));
            }
            for index in 0..tables.par.len() {
                group.push(diff.derive(
                    *root,
                    SymRef {
                        kind: SymbolKind::Par,
                        index: index as u32,
                    },
                ));
            }
            blocks.push(group);
        }
    }

    let mut emitter = Emitter::new(pool);
    for (index, par) in tables.par.iter().enumerate() {
        if par.lower_limit.is_finite() {
            emitter.code.push(Code::Op(Opr::Chkl));
            emitter.code.push(Code::Idx(index as u32));
        }
        if par.upper_limit.is_finite() {
            emitter.code.push(Code::Op(Opr::Chkg));
            emitter.code.push(Code::Idx(index as u32));
        }
    }
    emitter.code.push(Code::Op(Opr::Sok));

    emitter.value_counts = count_refs(pool, &roots, &HashMap::new());
    for group in &blocks {
        let (value, derivs) = group.split_first().expect("value block present");
        emitter.emit_value_block(*value);
        for deriv in derivs {
            emitter.emit_deriv_block(*deriv);
        }
    }
    emitter.code.push(Code::Op(Opr::Eod));
    let number_of_temp = emitter.high_water;
    (emitter.code, number_of_temp)
}

/// Direct reference counts of every node reachable from `roots`. Nodes in
/// `stop_at` are treated as leaves, they are loads from a slot.
fn count_refs(
    pool: &ExprPool,
    roots: &[NodeId],
    stop_at: &HashMap<NodeId, u32>,
) -> HashMap<NodeId, usize> {
    let mut counts: HashMap<NodeId, usize> = HashMap::new();
    let mut visited = std::collections::HashSet::new();
    let mut stack: Vec<NodeId> = Vec::new();
    for root in roots {
        *counts.entry(*root).or_insert(0) += 1;
        stack.push(*root);
    }
    while let Some(id) = stack.pop() {
        if stop_at.contains_key(&id) || !visited.insert(id) {
            continue;
        }
        for child in children(pool.node(id)) {
            *counts.entry(child).or_insert(0) += 1;
            stack.push(child);
        }
    }
    counts
}

fn children(node: Node) -> Vec<NodeId> {
    match node {
        Node::Num(_) | Node::Sym(_) => Vec::new(),
        Node::Unary(_, child) => vec![child],
        Node::Binary(_, lhs, rhs) => vec![lhs, rhs],
        Node::Cond {
            cond,
            then,
            otherwise,
        } => vec![cond, then, otherwise],
    }
}

struct Emitter<'a> {
    pool: &'a ExprPool,
    code: Vec<Code>,
    /// Reference counts over the value universe (all residual value trees).
    value_counts: HashMap<NodeId, usize>,
    /// Counts local to the derivative block being emitted.
    local_counts: HashMap<NodeId, usize>,
    /// Slots written by value blocks; readable for the rest of the program.
    persistent: HashMap<NodeId, u32>,
    /// Slots local to the current derivative block.
    locals: HashMap<NodeId, u32>,
    next_slot: u32,
    high_water: u32,
    cond_depth: usize,
    in_value: bool,
}

impl<'a> Emitter<'a> {
    fn new(pool: &'a ExprPool) -> Emitter<'a> {
        Emitter {
            pool,
            code: Vec::new(),
            value_counts: HashMap::new(),
            local_counts: HashMap::new(),
            persistent: HashMap::new(),
            locals: HashMap::new(),
            next_slot: 0,
            high_water: 0,
            cond_depth: 0,
            in_value: false,
        }
    }

    fn emit_value_block(&mut self, root: NodeId) {
        self.in_value = true;
        self.emit(root);
        self.code.push(Code::Op(Opr::Ret));
        self.in_value = false;
    }

    fn emit_deriv_block(&mut self, root: NodeId) {
        self.local_counts = count_refs(self.pool, &[root], &self.persistent);
        self.locals.clear();
        let saved_slot = self.next_slot;
        self.emit(root);
        self.code.push(Code::Op(Opr::Ret));
        // block-local temporaries die with the block
        self.next_slot = saved_slot;
        self.locals.clear();
    }

    fn alloc_slot(&mut self) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.high_water = self.high_water.max(self.next_slot);
        slot
    }

    fn emit(&mut self, id: NodeId) {
        if let Some(slot) = self
            .persistent
            .get(&id)
            .or_else(|| self.locals.get(&id))
            .copied()
        {
            self.code.push(Code::Op(Opr::Opd));
            self.code.push(Code::Typ(Typ::Tmp));
            self.code.push(Code::Idx(slot));
            return;
        }
        let node = self.pool.node(id);
        match node {
            Node::Num(num) => {
                self.code.push(Code::Op(Opr::Num));
                self.code.push(Code::Num(num.0));
            }
            Node::Sym(sym) => self.emit_operand(sym),
            Node::Unary(op, child) => {
                self.emit(child);
                self.code.push(Code::Op(unary_opr(op)));
            }
            Node::Binary(op, lhs, rhs) => {
                self.emit(lhs);
                self.emit(rhs);
                self.code.push(Code::Op(binary_opr(op)));
            }
            Node::Cond {
                cond,
                then,
                otherwise,
            } => {
                self.emit(cond);
                self.code.push(Code::Op(Opr::If));
                let if_patch = self.code.len();
                self.code.push(Code::Jmp(0));
                self.cond_depth += 1;
                self.emit(then);
                self.code.push(Code::Op(Opr::Jmp));
                let end_patch = self.code.len();
                self.code.push(Code::Jmp(0));
                self.code.push(Code::Op(Opr::Else));
                self.code[if_patch] = Code::Jmp(self.code.len() as u32);
                self.emit(otherwise);
                self.code.push(Code::Op(Opr::Fi));
                self.code[end_patch] = Code::Jmp((self.code.len() - 1) as u32);
                self.cond_depth -= 1;
            }
        }
        self.store_if_shared(id, node);
    }

    /// Materialize a shared compound node into a temp slot. Stores are only
    /// sound outside conditional branches, where execution is certain.
    fn store_if_shared(&mut self, id: NodeId, node: Node) {
        if self.cond_depth > 0 || matches!(node, Node::Num(_) | Node::Sym(_)) {
            return;
        }
        let shared = if self.in_value {
            self.value_counts.get(&id).copied().unwrap_or(0) > 1
        } else {
            self.local_counts.get(&id).copied().unwrap_or(0) > 1
        };
        if !shared {
            return;
        }
        let slot = self.alloc_slot();
        self.code.push(Code::Op(Opr::Ass));
        self.code.push(Code::Typ(Typ::Tmp));
        self.code.push(Code::Idx(slot));
        if self.in_value {
            self.persistent.insert(id, slot);
        } else {
            self.locals.insert(id, slot);
        }
    }

    fn emit_operand(&mut self, sym: SymRef) {
        match sym.kind {
            SymbolKind::Flg => {
                self.code.push(Code::Op(Opr::Ldf));
                self.code.push(Code::Idx(sym.index));
            }
            kind => {
                let typ = match kind {
                    SymbolKind::Var => Typ::Var,
                    SymbolKind::Aux => Typ::Aux,
                    SymbolKind::Par => Typ::Par,
                    SymbolKind::Con => Typ::Con,
                    _ => unreachable!("resolved trees only load inputs"),
                };
                self.code.push(Code::Op(Opr::Opd));
                self.code.push(Code::Typ(typ));
                self.code.push(Code::Idx(sym.index));
            }
        }
    }
}

fn unary_opr(op: UnaryOp) -> Opr {
    match op {
        UnaryOp::Neg => Opr::Neg,
        UnaryOp::Not => Opr::Not,
        UnaryOp::Sin => Opr::Sin,
        UnaryOp::Cos => Opr::Cos,
        UnaryOp::Tan => Opr::Tan,
        UnaryOp::Asin => Opr::Asin,
        UnaryOp::Acos => Opr::Acos,
        UnaryOp::Atan => Opr::Atan,
        UnaryOp::Sinh => Opr::Sinh,
        UnaryOp::Cosh => Opr::Cosh,
        UnaryOp::Tanh => Opr::Tanh,
        UnaryOp::Exp => Opr::Exp,
        UnaryOp::Log => Opr::Log,
        UnaryOp::Lg => Opr::Lg,
        UnaryOp::Sqrt => Opr::Sqrt,
        UnaryOp::Abs => Opr::Abs,
        UnaryOp::Sgn => Opr::Sgn,
        UnaryOp::Erf => Opr::Erf,
    }
}

fn binary_opr(op: BinaryOp) -> Opr {
    match op {
        BinaryOp::Add => Opr::Add,
        BinaryOp::Sub => Opr::Sub,
        BinaryOp::Mul => Opr::Mul,
        BinaryOp::Div => Opr::Div,
        BinaryOp::Pow => Opr::Pow,
        BinaryOp::And => Opr::And,
        BinaryOp::Or => Opr::Or,
        BinaryOp::Lt => Opr::Lt,
        BinaryOp::Gt => Opr::Gt,
        BinaryOp::Le => Opr::Le,
        BinaryOp::Ge => Opr::Ge,
        BinaryOp::Eq => Opr::Eq,
        BinaryOp::Ne => Opr::Ne,
    }
}
