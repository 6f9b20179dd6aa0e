use crate::mdl::code::{Code, ModelCode, Opr, Typ};
use std::fmt::{Display, Formatter};

/// Numeric failures during evaluation. The evaluator stops at the failing
/// operation; outputs written before it keep their values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalError {
    DivisionByZero,
    LogNonPositive,
    SqrtNegative,
    PowDomain,
    StackOverflow,
    /// A parameter violated its declared limit (CHKL/CHKG).
    LimitViolation { parameter: u32 },
}

impl Display for EvalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::DivisionByZero => write!(f, "division by zero"),
            EvalError::LogNonPositive => write!(f, "logarithm of a non-positive number"),
            EvalError::SqrtNegative => write!(f, "square root of a negative number"),
            EvalError::PowDomain => write!(f, "power with a domain violation"),
            EvalError::StackOverflow => write!(f, "operand stack overflow"),
            EvalError::LimitViolation { parameter } => {
                write!(f, "parameter {parameter} violates its declared limit")
            }
        }
    }
}

/// Stack-machine evaluator over a compiled model.
///
/// The program is read-only; all mutable state lives in this instance, so
/// one `ModelCode` can back any number of evaluators on different threads.
/// Evaluation never allocates.
pub struct Evaluator<'c> {
    code: &'c ModelCode,
    stack: Vec<f64>,
    stack_limit: usize,
    temps: Vec<f64>,
}

impl<'c> Evaluator<'c> {
    pub fn new(code: &'c ModelCode) -> Evaluator<'c> {
        let stack_limit = code.max_stack_depth().max(1);
        Evaluator {
            code,
            stack: Vec::with_capacity(stack_limit),
            stack_limit,
            temps: vec![0.0; code.number_of_temp as usize],
        }
    }

    /// Evaluate the residual vector `r` and the requested Jacobians.
    ///
    /// Inputs must match the declared counts. `var_flags[j]` selects column
    /// j of `jac_x`; selected columns are packed left, so the row stride of
    /// `jac_x` is the number of selected variables. `jac_a` always carries
    /// all auxiliary columns when `jac_x_flag` is set; `par_flags` selects
    /// the columns of `jac_p` the same way.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &mut self,
        x: &[f64],
        a: &[f64],
        p: &[f64],
        c: &[f64],
        f: &[f64],
        r: &mut [f64],
        jac_x_flag: bool,
        var_flags: Option<&[bool]>,
        mut jac_x: Option<&mut [f64]>,
        mut jac_a: Option<&mut [f64]>,
        jac_p_flag: bool,
        par_flags: Option<&[bool]>,
        mut jac_p: Option<&mut [f64]>,
    ) -> Result<(), EvalError> {
        let [n_var, n_aux, n_par, n_con, n_flg, n_res] = self.code.tables.counts();
        assert_eq!(x.len(), n_var as usize, "variable vector length");
        assert_eq!(a.len(), n_aux as usize, "auxiliary vector length");
        assert_eq!(p.len(), n_par as usize, "parameter vector length");
        assert_eq!(c.len(), n_con as usize, "constant vector length");
        assert_eq!(f.len(), n_flg as usize, "flag vector length");
        assert_eq!(r.len(), n_res as usize, "residual vector length");
        if let Some(flags) = var_flags {
            assert_eq!(flags.len(), n_var as usize, "variable selection length");
        }
        if let Some(flags) = par_flags {
            assert_eq!(flags.len(), n_par as usize, "parameter selection length");
        }
        let sel_x = match var_flags {
            Some(flags) => flags.iter().filter(|flag| **flag).count(),
            None => n_var as usize,
        };
        let sel_p = match par_flags {
            Some(flags) => flags.iter().filter(|flag| **flag).count(),
            None => n_par as usize,
        };

        let mut pc = 0usize;
        // parameter range checks run once, before the first residual
        loop {
            match self.code.code[pc] {
                Code::Op(Opr::Chkl) => {
                    let index = self.read_idx(pc + 1);
                    if p[index as usize] < self.code.tables.par[index as usize].lower_limit {
                        return Err(EvalError::LimitViolation { parameter: index });
                    }
                    pc += 2;
                }
                Code::Op(Opr::Chkg) => {
                    let index = self.read_idx(pc + 1);
                    if p[index as usize] > self.code.tables.par[index as usize].upper_limit {
                        return Err(EvalError::LimitViolation { parameter: index });
                    }
                    pc += 2;
                }
                Code::Op(Opr::Sok) => {
                    pc += 1;
                    break;
                }
                other => unreachable!("unexpected word {other:?} in the check prelude"),
            }
        }

        for k in 0..n_res as usize {
            r[k] = self.exec_block(&mut pc, x, a, p, c, f)?;

            let mut col = 0;
            for j in 0..n_var as usize {
                let selected = jac_x_flag && var_flags.map_or(true, |flags| flags[j]);
                if !selected {
                    self.skip_block(&mut pc);
                    continue;
                }
                match jac_x.as_deref_mut() {
                    Some(out) => {
                        out[k * sel_x + col] = self.exec_block(&mut pc, x, a, p, c, f)?;
                    }
                    None => self.skip_block(&mut pc),
                }
                col += 1;
            }

            for j in 0..n_aux as usize {
                if !jac_x_flag {
                    self.skip_block(&mut pc);
                    continue;
                }
                match jac_a.as_deref_mut() {
                    Some(out) => {
                        out[k * n_aux as usize + j] = self.exec_block(&mut pc, x, a, p, c, f)?;
                    }
                    None => self.skip_block(&mut pc),
                }
            }

            let mut col = 0;
            for m in 0..n_par as usize {
                let selected = jac_p_flag && par_flags.map_or(true, |flags| flags[m]);
                if !selected {
                    self.skip_block(&mut pc);
                    continue;
                }
                match jac_p.as_deref_mut() {
                    Some(out) => {
                        out[k * sel_p + col] = self.exec_block(&mut pc, x, a, p, c, f)?;
                    }
                    None => self.skip_block(&mut pc),
                }
                col += 1;
            }
        }
        debug_assert_eq!(self.code.code[pc], Code::Op(Opr::Eod));
        Ok(())
    }

    fn read_idx(&self, pc: usize) -> u32 {
        match self.code.code[pc] {
            Code::Idx(index) => index,
            other => unreachable!("expected an index word, found {other:?}"),
        }
    }

    fn read_typ(&self, pc: usize) -> Typ {
        match self.code.code[pc] {
            Code::Typ(typ) => typ,
            other => unreachable!("expected a type word, found {other:?}"),
        }
    }

    fn push(&mut self, value: f64) -> Result<(), EvalError> {
        if self.stack.len() >= self.stack_limit {
            return Err(EvalError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> f64 {
        self.stack.pop().expect("operand stack underflow")
    }

    /// Execute one RET-delimited block and return its value.
    fn exec_block(
        &mut self,
        pc: &mut usize,
        x: &[f64],
        a: &[f64],
        p: &[f64],
        c: &[f64],
        f: &[f64],
    ) -> Result<f64, EvalError> {
        self.stack.clear();
        loop {
            let word = self.code.code[*pc];
            *pc += 1;
            let Code::Op(op) = word else {
                unreachable!("operand word {word:?} outside an operator");
            };
            use Opr::*;
            match op {
                Opd => {
                    let typ = self.read_typ(*pc);
                    let index = self.read_idx(*pc + 1) as usize;
                    *pc += 2;
                    let value = match typ {
                        Typ::Var => x[index],
                        Typ::Aux => a[index],
                        Typ::Par => p[index],
                        Typ::Con => c[index],
                        Typ::Tmp => self.temps[index],
                        other => unreachable!("operand type {other:?}"),
                    };
                    self.push(value)?;
                }
                Ldf => {
                    let index = self.read_idx(*pc) as usize;
                    *pc += 1;
                    self.push(f[index])?;
                }
                Num => {
                    let index = match self.code.code[*pc] {
                        Code::Num(index) => index as usize,
                        other => unreachable!("expected a number word, found {other:?}"),
                    };
                    *pc += 1;
                    self.push(self.code.numbers[index])?;
                }
                Ass => {
                    let index = self.read_idx(*pc + 1) as usize;
                    debug_assert_eq!(self.read_typ(*pc), Typ::Tmp);
                    *pc += 2;
                    self.temps[index] = *self.stack.last().expect("value to store");
                }
                Ret => return Ok(self.pop()),
                If => {
                    let cond = self.pop();
                    let target = match self.code.code[*pc] {
                        Code::Jmp(target) => target as usize,
                        other => unreachable!("IF without a jump target: {other:?}"),
                    };
                    if cond == 0.0 {
                        *pc = target;
                    } else {
                        *pc += 1;
                    }
                }
                Jmp => {
                    let target = match self.code.code[*pc] {
                        Code::Jmp(target) => target as usize,
                        other => unreachable!("JMP without a jump target: {other:?}"),
                    };
                    *pc = target;
                }
                Else | Fi => {}
                Neg => {
                    let v = self.pop();
                    self.push(-v)?;
                }
                Not => {
                    let v = self.pop();
                    self.push(bool_value(v == 0.0))?;
                }
                Sin => self.apply(f64::sin)?,
                Cos => self.apply(f64::cos)?,
                Tan => self.apply(f64::tan)?,
                Asin => self.apply(f64::asin)?,
                Acos => self.apply(f64::acos)?,
                Atan => self.apply(f64::atan)?,
                Sinh => self.apply(f64::sinh)?,
                Cosh => self.apply(f64::cosh)?,
                Tanh => self.apply(f64::tanh)?,
                Exp => self.apply(f64::exp)?,
                Erf => self.apply(libm::erf)?,
                Abs => self.apply(f64::abs)?,
                Sgn => self.apply(crate::mdl::expr::sgn)?,
                Log => {
                    let v = self.pop();
                    if v <= 0.0 {
                        return Err(EvalError::LogNonPositive);
                    }
                    self.push(v.ln())?;
                }
                Lg => {
                    let v = self.pop();
                    if v <= 0.0 {
                        return Err(EvalError::LogNonPositive);
                    }
                    self.push(v.log10())?;
                }
                Sqrt => {
                    let v = self.pop();
                    if v < 0.0 {
                        return Err(EvalError::SqrtNegative);
                    }
                    self.push(v.sqrt())?;
                }
                Add => self.apply2(|l, r| l + r)?,
                Sub => self.apply2(|l, r| l - r)?,
                Mul => self.apply2(|l, r| l * r)?,
                Div => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    if rhs == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    self.push(lhs / rhs)?;
                }
                Pow => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    if lhs < 0.0 && rhs.fract() != 0.0 {
                        return Err(EvalError::PowDomain);
                    }
                    if lhs == 0.0 && rhs < 0.0 {
                        return Err(EvalError::PowDomain);
                    }
                    self.push(lhs.powf(rhs))?;
                }
                And => self.apply2(|l, r| bool_value(l != 0.0 && r != 0.0))?,
                Or => self.apply2(|l, r| bool_value(l != 0.0 || r != 0.0))?,
                Lt => self.apply2(|l, r| bool_value(l < r))?,
                Gt => self.apply2(|l, r| bool_value(l > r))?,
                Le => self.apply2(|l, r| bool_value(l <= r))?,
                Ge => self.apply2(|l, r| bool_value(l >= r))?,
                Eq => self.apply2(|l, r| bool_value(l == r))?,
                Ne => self.apply2(|l, r| bool_value(l != r))?,
                other => unreachable!("reserved operator {other:?} in program"),
            }
        }
    }

    fn apply(&mut self, f: impl FnOnce(f64) -> f64) -> Result<(), EvalError> {
        let v = self.pop();
        self.push(f(v))
    }

    fn apply2(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), EvalError> {
        let rhs = self.pop();
        let lhs = self.pop();
        self.push(f(lhs, rhs))
    }

    /// Skip one RET-delimited block without executing it.
    fn skip_block(&self, pc: &mut usize) {
        while self.code.code[*pc] != Code::Op(Opr::Ret) {
            *pc += 1;
        }
        *pc += 1;
    }
}

fn bool_value(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
