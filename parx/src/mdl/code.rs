use std::io;
use std::io::{Read, Write};
use strum::{AsRefStr, FromRepr};

/// Magic string at the head of a persisted code file.
pub const FILE_ID: &[u8] = b"ParX interpreter code\0";
/// Artifact version, major times 100 plus minor.
pub const CODE_VERSION: u16 = 420;

/// Operator tags of the stack machine. The compiler emits a subset; the
/// remaining tags are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Opr {
    Inval,
    And,
    Or,
    Not,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Rev,
    Sqr,
    Inc,
    Dec,
    Equ,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Erf,
    Exp,
    Log,
    Lg,
    Sqrt,
    Abs,
    Sgn,
    Ret,
    Chkl,
    Chkg,
    Opd,
    Num,
    Dopd,
    Ldf,
    Ass,
    Nass,
    Clr,
    Jmp,
    If,
    Else,
    Fi,
    Eod,
    Sok,
    Stop,
}

/// Operand type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Typ {
    Var,
    Aux,
    Par,
    Con,
    Flg,
    Res,
    Tmp,
    Dres,
    Dtmp,
}

/// One word of the interpreter program: an operator, an operand type, a
/// table or pool index, or a jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Op(Opr),
    Typ(Typ),
    Idx(u32),
    Num(u32),
    Jmp(u32),
}

const PAYLOAD_MASK: u32 = (1 << 24) - 1;

impl Code {
    /// Pack into a 32-bit word: tag byte in the high bits, 24-bit immediate
    /// below.
    pub fn encode(self) -> u32 {
        match self {
            Code::Op(op) => op as u32,
            Code::Typ(typ) => (1 << 24) | typ as u32,
            Code::Idx(idx) => (2 << 24) | (idx & PAYLOAD_MASK),
            Code::Num(idx) => (3 << 24) | (idx & PAYLOAD_MASK),
            Code::Jmp(target) => (4 << 24) | (target & PAYLOAD_MASK),
        }
    }

    pub fn decode(word: u32) -> Option<Code> {
        let payload = word & PAYLOAD_MASK;
        Some(match word >> 24 {
            0 => Code::Op(Opr::from_repr(u8::try_from(payload).ok()?)?),
            1 => Code::Typ(Typ::from_repr(u8::try_from(payload).ok()?)?),
            2 => Code::Idx(payload),
            3 => Code::Num(payload),
            4 => Code::Jmp(payload),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VarDecl {
    pub name: String,
    pub abstol: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuxDecl {
    pub name: String,
    pub abstol: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParDecl {
    pub name: String,
    pub default: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConDecl {
    pub name: String,
    pub default: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlgDecl {
    pub name: String,
    pub default: f64,
}

/// The declared tables, one row per symbol in declaration order. Bytecode
/// operands index into these.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tables {
    pub var: Vec<VarDecl>,
    pub aux: Vec<AuxDecl>,
    pub par: Vec<ParDecl>,
    pub con: Vec<ConDecl>,
    pub flg: Vec<FlgDecl>,
    pub res: Vec<String>,
}

impl Tables {
    pub fn counts(&self) -> [u32; 6] {
        [
            self.var.len() as u32,
            self.aux.len() as u32,
            self.par.len() as u32,
            self.con.len() as u32,
            self.flg.len() as u32,
            self.res.len() as u32,
        ]
    }
}

/// The compiled artifact: immutable after compilation and shareable
/// between evaluator instances.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelCode {
    pub model: String,
    pub author: String,
    pub date: String,
    pub version: String,
    pub ident: String,
    pub tables: Tables,
    pub code: Vec<Code>,
    pub numbers: Vec<f64>,
    pub number_of_temp: u32,
}

impl ModelCode {
    /// Upper bound for the operand stack any evaluation of this program
    /// can need. A linear scan that accumulates both branches of every
    /// conditional over-approximates each real execution path.
    pub fn max_stack_depth(&self) -> usize {
        let mut depth: usize = 0;
        let mut max = 0;
        for word in &self.code {
            let Code::Op(op) = word else { continue };
            use Opr::*;
            match op {
                Opd | Ldf | Num => {
                    depth += 1;
                    max = max.max(depth);
                }
                And | Or | Lt | Gt | Le | Ge | Eq | Ne | Add | Sub | Mul | Div | Pow | If => {
                    depth = depth.saturating_sub(1);
                }
                Ret => depth = 0,
                _ => {}
            }
        }
        max
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(FILE_ID)?;
        writer.write_all(&CODE_VERSION.to_le_bytes())?;
        writer.write_all(&(self.code.len() as u32).to_le_bytes())?;
        writer.write_all(&(self.numbers.len() as u32).to_le_bytes())?;
        writer.write_all(&self.number_of_temp.to_le_bytes())?;
        for count in self.tables.counts() {
            writer.write_all(&count.to_le_bytes())?;
        }

        for var in &self.tables.var {
            write_str(writer, &var.name)?;
        }
        for var in &self.tables.var {
            write_str(writer, &var.unit)?;
        }
        for aux in &self.tables.aux {
            write_str(writer, &aux.name)?;
        }
        for par in &self.tables.par {
            write_str(writer, &par.name)?;
        }
        for par in &self.tables.par {
            write_str(writer, &par.unit)?;
        }
        for con in &self.tables.con {
            write_str(writer, &con.name)?;
        }
        for con in &self.tables.con {
            write_str(writer, &con.unit)?;
        }
        for flg in &self.tables.flg {
            write_str(writer, &flg.name)?;
        }
        for res in &self.tables.res {
            write_str(writer, res)?;
        }

        for var in &self.tables.var {
            write_f64s(writer, &[var.abstol, var.lower_limit, var.upper_limit])?;
        }
        for aux in &self.tables.aux {
            write_f64s(writer, &[aux.abstol, aux.lower_limit, aux.upper_limit])?;
        }
        for par in &self.tables.par {
            write_f64s(
                writer,
                &[
                    par.default,
                    par.lower_bound,
                    par.upper_bound,
                    par.lower_limit,
                    par.upper_limit,
                ],
            )?;
        }
        for con in &self.tables.con {
            write_f64s(writer, &[con.default])?;
        }
        for flg in &self.tables.flg {
            write_f64s(writer, &[flg.default])?;
        }

        for word in &self.code {
            writer.write_all(&word.encode().to_le_bytes())?;
        }
        for number in &self.numbers {
            writer.write_all(&number.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read an artifact back. The model header strings are not part of the
    /// persisted format and come back empty.
    pub fn read<R: Read>(reader: &mut R) -> io::Result<ModelCode> {
        let mut magic = [0u8; FILE_ID.len()];
        reader.read_exact(&mut magic)?;
        if magic != *FILE_ID {
            return Err(bad_format("not a ParX interpreter code file"));
        }
        let version = read_u16(reader)?;
        if version != CODE_VERSION {
            return Err(bad_format(format!(
                "unsupported code version {version}, expected {CODE_VERSION}"
            )));
        }
        let n_code = read_u32(reader)? as usize;
        let n_numbers = read_u32(reader)? as usize;
        let number_of_temp = read_u32(reader)?;
        let mut counts = [0usize; 6];
        for count in counts.iter_mut() {
            *count = read_u32(reader)? as usize;
        }
        let [n_var, n_aux, n_par, n_con, n_flg, n_res] = counts;

        let mut tables = Tables::default();
        tables.var = (0..n_var)
            .map(|_| {
                Ok(VarDecl {
                    name: read_str(reader)?,
                    ..VarDecl::default()
                })
            })
            .collect::<io::Result<_>>()?;
        for var in tables.var.iter_mut() {
            var.unit = read_str(reader)?;
        }
        tables.aux = (0..n_aux)
            .map(|_| {
                Ok(AuxDecl {
                    name: read_str(reader)?,
                    ..AuxDecl::default()
                })
            })
            .collect::<io::Result<_>>()?;
        tables.par = (0..n_par)
            .map(|_| {
                Ok(ParDecl {
                    name: read_str(reader)?,
                    ..ParDecl::default()
                })
            })
            .collect::<io::Result<_>>()?;
        for par in tables.par.iter_mut() {
            par.unit = read_str(reader)?;
        }
        tables.con = (0..n_con)
            .map(|_| {
                Ok(ConDecl {
                    name: read_str(reader)?,
                    ..ConDecl::default()
                })
            })
            .collect::<io::Result<_>>()?;
        for con in tables.con.iter_mut() {
            con.unit = read_str(reader)?;
        }
        tables.flg = (0..n_flg)
            .map(|_| {
                Ok(FlgDecl {
                    name: read_str(reader)?,
                    ..FlgDecl::default()
                })
            })
            .collect::<io::Result<_>>()?;
        tables.res = (0..n_res)
            .map(|_| read_str(reader))
            .collect::<io::Result<_>>()?;

        for var in tables.var.iter_mut() {
            [var.abstol, var.lower_limit, var.upper_limit] = read_f64s(reader)?;
        }
        for aux in tables.aux.iter_mut() {
            [aux.abstol, aux.lower_limit, aux.upper_limit] = read_f64s(reader)?;
        }
        for par in tables.par.iter_mut() {
            [
                par.default,
                par.lower_bound,
                par.upper_bound,
                par.lower_limit,
                par.upper_limit,
            ] = read_f64s(reader)?;
        }
        for con in tables.con.iter_mut() {
            [con.default] = read_f64s(reader)?;
        }
        for flg in tables.flg.iter_mut() {
            [flg.default] = read_f64s(reader)?;
        }

        let code = (0..n_code)
            .map(|_| {
                let word = read_u32(reader)?;
                Code::decode(word).ok_or_else(|| bad_format(format!("bad code word {word:#x}")))
            })
            .collect::<io::Result<_>>()?;
        let numbers = (0..n_numbers)
            .map(|_| {
                let mut bytes = [0u8; 8];
                reader.read_exact(&mut bytes)?;
                Ok(f64::from_le_bytes(bytes))
            })
            .collect::<io::Result<_>>()?;

        Ok(ModelCode {
            model: String::new(),
            author: String::new(),
            date: String::new(),
            version: String::new(),
            ident: String::new(),
            tables,
            code,
            numbers,
            number_of_temp,
        })
    }

    /// Human-readable program listing.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let [n_var, n_aux, n_par, n_con, n_flg, n_res] = self.tables.counts();
        let _ = writeln!(
            out,
            "model {:?}: {n_var} var, {n_aux} aux, {n_par} par, {n_con} con, {n_flg} flg, {n_res} res, {} temp",
            self.model, self.number_of_temp
        );
        for (addr, word) in self.code.iter().enumerate() {
            let _ = match word {
                Code::Op(op) => writeln!(out, "{addr:5}  {}", op.as_ref()),
                Code::Typ(typ) => writeln!(out, "{addr:5}    .{}", typ.as_ref()),
                Code::Idx(idx) => writeln!(out, "{addr:5}    #{idx}"),
                Code::Num(idx) => {
                    writeln!(out, "{addr:5}    [{idx}] = {}", self.numbers[*idx as usize])
                }
                Code::Jmp(target) => writeln!(out, "{addr:5}    ->{target}"),
            };
        }
        out
    }
}

fn bad_format(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn read_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn write_str<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    let len = u16::try_from(text.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(text.as_bytes())
}

fn read_str<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = read_u16(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| bad_format("string is not UTF-8"))
}

fn write_f64s<W: Write>(writer: &mut W, values: &[f64]) -> io::Result<()> {
    for value in values {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_f64s<R: Read, const N: usize>(reader: &mut R) -> io::Result<[f64; N]> {
    let mut values = [0.0; N];
    for value in values.iter_mut() {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes)?;
        *value = f64::from_le_bytes(bytes);
    }
    Ok(values)
}
