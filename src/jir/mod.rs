//! Linear three-address IR.
//!
//! The first lowering stage turns a method's bytecode into a flat list of
//! instructions in which the JVM operand stack is explicit: every stack
//! slot and local-variable slot is a pseudo-variable. Branch targets are
//! positions in the instruction list, resolved by the builder.

mod build;

pub use build::{build_program, LowerError};

use std::fmt;

/// Where a pseudo-variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    Stack,
    Locals,
}

/// A (location, index) pseudo-variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable {
    pub location: Location,
    pub index: u64,
}

impl Variable {
    pub fn stack(index: u64) -> Self {
        Self { location: Location::Stack, index }
    }

    pub fn local(index: u64) -> Self {
        Self { location: Location::Locals, index }
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Constant(u64),
    Var(Variable),
}

/// Arithmetic operators of the subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Shl,
    Shr,
}

/// Comparison operators used by conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Host output routines reachable through `invokevirtual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardKind {
    PrintInt,
    PrintChar,
    PrintlnInt,
    PrintlnChar,
    PrintlnVoid,
}

impl StandardKind {
    pub fn nargs(self) -> usize {
        match self {
            StandardKind::PrintlnVoid => 0,
            _ => 1,
        }
    }
}

/// Index of a function within a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub usize);

/// Position of an instruction within a [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrId(pub usize);

/// Instruction payload. Branch targets are `None` until the builder links
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrKind {
    Move {
        source: Value,
        dest: Variable,
    },
    BinaryOp {
        op: ArithOp,
        left: Value,
        right: Value,
        dest: Variable,
    },
    Branch {
        op: CmpOp,
        left: Value,
        right: Value,
        target: Option<InstrId>,
    },
    UnconditionalBranch {
        target: Option<InstrId>,
    },
    Return {
        value: Value,
    },
    ReturnVoid,
    FunctionCall {
        callee: FuncId,
        args: Vec<Value>,
        dest: Option<Variable>,
    },
    StandardCall {
        kind: StandardKind,
        args: Vec<Value>,
    },
}

/// One linear instruction plus its branch-target flag.
#[derive(Debug, Clone)]
pub struct Instr {
    pub kind: InstrKind,
    /// Set when some branch names this instruction as its destination.
    pub is_branch_target: bool,
}

/// A lowered method body.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub nargs: usize,
    pub nreturn: usize,
    pub insts: Vec<Instr>,
}

impl Function {
    pub fn new(name: impl Into<String>, nargs: usize, nreturn: usize) -> Self {
        Self {
            name: name.into(),
            nargs,
            nreturn,
            insts: Vec::new(),
        }
    }
}

/// All lowered methods of a class.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0]
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Stack => write!(f, "stack"),
            Location::Locals => write!(f, "local"),
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.location, self.index)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Constant(c) => write!(f, "{}", *c as i64),
            Value::Var(v) => write!(f, "{}", v),
        }
    }
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
        };
        write!(f, "{}", text)
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", text)
    }
}

impl fmt::Display for StandardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StandardKind::PrintInt | StandardKind::PrintChar => write!(f, "print"),
            _ => write!(f, "println"),
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
                writeln!(f)?;
            }
            self.fmt_function(f, func)?;
        }
        Ok(())
    }
}

impl Program {
    fn fmt_function(&self, f: &mut fmt::Formatter<'_>, func: &Function) -> fmt::Result {
        writeln!(f, "function {} ({}) {{", func.name, func.nargs)?;
        for (i, inst) in func.insts.iter().enumerate() {
            let flag = if inst.is_branch_target { 'T' } else { '-' };
            write!(f, "    [{:3}] {} ", i, flag)?;
            self.fmt_instr(f, &inst.kind)?;
            writeln!(f)?;
        }
        write!(f, "}}")
    }

    fn fmt_instr(&self, f: &mut fmt::Formatter<'_>, kind: &InstrKind) -> fmt::Result {
        match kind {
            InstrKind::Move { source, dest } => write!(f, "{} = {}", dest, source),
            InstrKind::BinaryOp { op, left, right, dest } => {
                write!(f, "{} = {} {} {}", dest, left, op, right)
            }
            InstrKind::Branch { op, left, right, target } => {
                write!(f, "{} {} {} => goto ", left, op, right)?;
                fmt_target(f, *target)
            }
            InstrKind::UnconditionalBranch { target } => {
                write!(f, "goto ")?;
                fmt_target(f, *target)
            }
            InstrKind::Return { value } => write!(f, "return {}", value),
            InstrKind::ReturnVoid => write!(f, "return"),
            InstrKind::FunctionCall { callee, args, dest } => {
                if let Some(dest) = dest {
                    write!(f, "{} = ", dest)?;
                }
                write!(f, "call {}(", self.function(*callee).name)?;
                fmt_args(f, args)?;
                write!(f, ")")
            }
            InstrKind::StandardCall { kind, args } => {
                write!(f, "call {}(", kind)?;
                fmt_args(f, args)?;
                write!(f, ")")
            }
        }
    }
}

fn fmt_target(f: &mut fmt::Formatter<'_>, target: Option<InstrId>) -> fmt::Result {
    match target {
        Some(id) => write!(f, "[{}]", id.0),
        None => write!(f, "<unlinked>"),
    }
}

fn fmt_args(f: &mut fmt::Formatter<'_>, args: &[Value]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}
