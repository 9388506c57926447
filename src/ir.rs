use crate::op::{Op0, Op1, Op2, Op3, Op4};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual or physical integer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reg(pub u8);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Memory reference: `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Mem {
    pub base: Option<Reg>,
    pub index: Option<(Reg, u8)>,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Reg) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp: 0,
        }
    }

    pub fn with_index(mut self, index: Reg, scale: u8) -> Self {
        self.index = Some((index, scale));
        self
    }

    pub fn with_disp(mut self, disp: i32) -> Self {
        self.disp = disp;
        self
    }

    /// Number of independently specified address fields.
    pub fn fields(&self) -> u8 {
        self.base.is_some() as u8 + self.index.is_some() as u8 + (self.disp != 0) as u8
    }

    pub fn uses(&self, reg: Reg) -> bool {
        self.base == Some(reg) || matches!(self.index, Some((r, _)) if r == reg)
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        if let Some(base) = self.base {
            write!(f, "{}", base)?;
            first = false;
        }
        if let Some((index, scale)) = self.index {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{}", index)?;
            if scale != 1 {
                write!(f, "*{}", scale)?;
            }
            first = false;
        }
        if self.disp != 0 || first {
            if first {
                write!(f, "{}", self.disp)?;
            } else if self.disp < 0 {
                write!(f, "-{}", (self.disp as i64).unsigned_abs())?;
            } else {
                write!(f, "+{}", self.disp)?;
            }
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Reg(Reg),
    Mem(Mem),
    Imm(i64),
}

impl Operand {
    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// True if the register is read or written through this operand.
    pub fn uses(&self, reg: Reg) -> bool {
        match self {
            Operand::Reg(r) => *r == reg,
            Operand::Mem(m) => m.uses(reg),
            Operand::Imm(_) => false,
        }
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl From<Mem> for Operand {
    fn from(m: Mem) -> Self {
        Operand::Mem(m)
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Operand::Imm(v)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Mem(m) => write!(f, "{}", m),
            Operand::Imm(v) => write!(f, "{}", v),
        }
    }
}

/// One instruction. The variant fixes both the opcode tier and the operand
/// count, so a tier-2 opcode paired with three operands cannot be built.
///
/// Operand slots: 0 = destination, 1 = first source, 2 = second source,
/// 3 = scale of the tier-4 scaled index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instruction {
    Nullary {
        op: Op0,
    },
    Unary {
        op: Op1,
        dst: Operand,
    },
    Binary {
        op: Op2,
        dst: Operand,
        src: Operand,
    },
    Ternary {
        op: Op3,
        dst: Operand,
        a: Operand,
        b: Operand,
    },
    /// `dst = &base + index*scale`. Displacement travels inside `base`.
    Quaternary {
        op: Op4,
        dst: Operand,
        base: Operand,
        index: Operand,
        scale: Operand,
    },
}

impl Instruction {
    pub fn op0(op: Op0) -> Self {
        Instruction::Nullary { op }
    }

    pub fn op1(op: Op1, dst: impl Into<Operand>) -> Self {
        Instruction::Unary {
            op,
            dst: dst.into(),
        }
    }

    pub fn op2(op: Op2, dst: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Instruction::Binary {
            op,
            dst: dst.into(),
            src: src.into(),
        }
    }

    pub fn op3(
        op: Op3,
        dst: impl Into<Operand>,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> Self {
        Instruction::Ternary {
            op,
            dst: dst.into(),
            a: a.into(),
            b: b.into(),
        }
    }

    pub fn op4(
        op: Op4,
        dst: impl Into<Operand>,
        base: impl Into<Operand>,
        index: impl Into<Operand>,
        scale: i64,
    ) -> Self {
        Instruction::Quaternary {
            op,
            dst: dst.into(),
            base: base.into(),
            index: index.into(),
            scale: Operand::Imm(scale),
        }
    }

    pub fn tier(&self) -> u8 {
        match self {
            Instruction::Nullary { .. } => 0,
            Instruction::Unary { .. } => 1,
            Instruction::Binary { .. } => 2,
            Instruction::Ternary { .. } => 3,
            Instruction::Quaternary { .. } => 4,
        }
    }

    /// Always equal to the tier.
    pub fn operand_count(&self) -> usize {
        self.tier() as usize
    }

    pub fn code(&self) -> u8 {
        match self {
            Instruction::Nullary { op } => op.code(),
            Instruction::Unary { op, .. } => op.code(),
            Instruction::Binary { op, .. } => op.code(),
            Instruction::Ternary { op, .. } => op.code(),
            Instruction::Quaternary { op, .. } => op.code(),
        }
    }

    pub fn mnemonic(&self) -> String {
        match self {
            Instruction::Nullary { op } => op.to_string(),
            Instruction::Unary { op, .. } => op.to_string(),
            Instruction::Binary { op, .. } => op.to_string(),
            Instruction::Ternary { op, .. } => op.to_string(),
            Instruction::Quaternary { op, .. } => op.to_string(),
        }
    }

    pub fn dst(&self) -> Option<&Operand> {
        match self {
            Instruction::Nullary { .. } => None,
            Instruction::Unary { dst, .. }
            | Instruction::Binary { dst, .. }
            | Instruction::Ternary { dst, .. }
            | Instruction::Quaternary { dst, .. } => Some(dst),
        }
    }

    /// Source operands. Tier 1 has none: its destination doubles as source.
    pub fn sources(&self) -> Vec<&Operand> {
        match self {
            Instruction::Nullary { .. } | Instruction::Unary { .. } => Vec::new(),
            Instruction::Binary { src, .. } => vec![src],
            Instruction::Ternary { a, b, .. } => vec![a, b],
            Instruction::Quaternary {
                base, index, scale, ..
            } => vec![base, index, scale],
        }
    }

    pub fn operands(&self) -> Vec<&Operand> {
        let mut all: Vec<&Operand> = self.dst().into_iter().collect();
        all.extend(self.sources());
        all
    }

    pub fn operand(&self, n: usize) -> Option<&Operand> {
        self.operands().get(n).copied()
    }

    pub fn uses(&self, reg: Reg) -> bool {
        self.operands().iter().any(|o| o.uses(reg))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())?;
        for (i, operand) in self.operands().iter().enumerate() {
            if i == 0 {
                write!(f, " {}", operand)?;
            } else {
                write!(f, ", {}", operand)?;
            }
        }
        Ok(())
    }
}

/// One instruction of a lowered stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lowered {
    pub instruction: Instruction,
    /// The encoder may rely on this instruction leaving the flags untouched.
    pub flag_preserving: bool,
    /// Index of the input instruction this one was lowered from.
    pub origin: usize,
}

/// Lowered basic block: only tier 0..=2 instructions, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoweredBlock {
    pub instructions: Vec<Lowered>,
}

impl LoweredBlock {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, lowered: Lowered) {
        self.instructions.push(lowered);
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lowered> {
        self.instructions.iter()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().map(|l| &l.instruction)
    }

    pub fn origins(&self) -> Vec<usize> {
        self.instructions.iter().map(|l| l.origin).collect()
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions.into_iter().map(|l| l.instruction).collect()
    }
}

impl fmt::Display for LoweredBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for lowered in &self.instructions {
            writeln!(f, "{}", lowered.instruction)?;
        }
        Ok(())
    }
}
