//! Arity lowering: rewrites tier-3/4 virtual instructions into the
//! destructive two-operand forms of the target, one basic block at a time.

use crate::config::{AddressingMode, TargetDescriptor};
use crate::error::{LowerError, Result};
use crate::flags::{self, carry_demand, CarryLink, FlagTracker};
use crate::ir::{Instruction, Lowered, LoweredBlock, Mem, Operand, Reg};
use crate::op::{self, Op0, Op1, Op2, Op3, Op4};
use tracing::{debug, trace};

/// Lowers blocks for one target. Holds no per-block state, so a single
/// `Lowerer` can be shared by reference across threads; every call to
/// [`Lowerer::lower_block`] owns its own [`FlagTracker`].
#[derive(Debug, Clone)]
pub struct Lowerer {
    target: TargetDescriptor,
}

impl Lowerer {
    pub fn new(target: TargetDescriptor) -> Result<Self> {
        op::tables_verified()?;
        target.validate()?;
        Ok(Self { target })
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Lowers one basic block. Carry chains are checked across the whole
    /// output; the first violation aborts the block.
    pub fn lower_block(&self, block: &[Instruction]) -> Result<LoweredBlock> {
        let result = self.lower_block_inner(block);
        match &result {
            Ok(out) => {
                metrics::increment_counter!("lowerforge_blocks_total");
                metrics::counter!("lowerforge_instructions_emitted_total", out.len() as u64);
            }
            Err(e) => {
                metrics::increment_counter!("lowerforge_errors_total", "kind" => e.kind());
            }
        }
        result
    }

    fn lower_block_inner(&self, block: &[Instruction]) -> Result<LoweredBlock> {
        self.target.check_block_len(block.len())?;
        let demanded = carry_demand(block);
        let mut tracker = FlagTracker::new();
        let mut out = LoweredBlock::new();

        for (origin, ins) in block.iter().enumerate() {
            let group = self.lower_instruction(ins)?;
            let link = CarryLink::of(ins);
            // the link travels on the last instruction carrying the link's opcode
            let link_at = link.and_then(|l| {
                group.iter().rposition(
                    |g| matches!(g, Instruction::Binary { op, .. } if *op == l.target_op()),
                )
            });
            for (k, lowered) in group.into_iter().enumerate() {
                let this_link = if Some(k) == link_at { link } else { None };
                tracker.observe(origin, &lowered, this_link, demanded[origin])?;
                let flag_preserving = flags::preserves_flags(&lowered);
                trace!("#{} -> {}", origin, lowered);
                out.push(Lowered {
                    instruction: lowered,
                    flag_preserving,
                    origin,
                });
            }
        }
        tracker.finish()?;
        debug!(
            "lowered block of {} instructions into {}",
            block.len(),
            out.len()
        );
        Ok(out)
    }

    /// Lowers one instruction on its own, without carry-chain context.
    /// The result only uses tier 0..=2 opcodes.
    pub fn lower_instruction(&self, ins: &Instruction) -> Result<Vec<Instruction>> {
        match ins {
            Instruction::Nullary { op } => {
                declared0(*op)?;
                Ok(vec![ins.clone()])
            }
            Instruction::Unary { op, dst } => {
                declared1(*op, ins)?;
                mutable(dst, ins)?;
                Ok(vec![ins.clone()])
            }
            Instruction::Binary { op, dst, src } => self.lower2(*op, dst, src, ins),
            Instruction::Ternary { op, dst, a, b } => self.lower3(*op, dst, a, b, ins),
            Instruction::Quaternary {
                op,
                dst,
                base,
                index,
                scale,
            } => self.lower4(*op, dst, base, index, scale, ins),
        }
    }

    fn lower2(
        &self,
        op: Op2,
        dst: &Operand,
        src: &Operand,
        ins: &Instruction,
    ) -> Result<Vec<Instruction>> {
        if !op.is_declared() {
            return Err(unsupported(2, op.code(), ins));
        }
        mutable(dst, ins)?;
        if op == Op2::LEA {
            let mode = self.addressing(2, op.code(), ins)?;
            let mem = match src {
                Operand::Mem(m) => m,
                _ => {
                    return Err(LowerError::InvalidOperand(format!(
                        "{}: LEA source must be a memory reference",
                        ins
                    )))
                }
            };
            lea_destination(dst, ins)?;
            mode.check(mem)?;
            return Ok(vec![ins.clone()]);
        }
        if let Some(op1) = op.lower() {
            debug!("{}: lowering to one-operand {}", ins, op1);
            if dst == src {
                return Ok(vec![Instruction::op1(op1, *dst)]);
            }
            let mut seq = self.binary(Op2::MOV, dst, src, ins)?;
            seq.push(Instruction::op1(op1, *dst));
            return Ok(seq);
        }
        self.binary(op, dst, src, ins)
    }

    fn lower3(
        &self,
        op3: Op3,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        ins: &Instruction,
    ) -> Result<Vec<Instruction>> {
        let op = op3.lower().ok_or_else(|| unsupported(3, op3.code(), ins))?;
        mutable(dst, ins)?;

        if dst == a {
            debug!("{}: destructive reuse", ins);
            return self.binary(op, dst, b, ins);
        }

        if op == Op2::ADD || op == Op2::SUB {
            if let Some(mem) = self.fuse(op, dst, a, b) {
                debug!("{}: fused into LEA", ins);
                metrics::increment_counter!("lowerforge_lea_fusions_total");
                return Ok(vec![Instruction::op2(Op2::LEA, *dst, mem)]);
            }
        }

        // Writing dst first would change b, either b itself or a register
        // its address is computed from. Two memory operands may name the
        // same address.
        let a_reads_dst = reads_register_of(a, dst) || (dst.is_mem() && a.is_mem());
        if dst == b {
            if op.is_commutative() {
                debug!("{}: commuted onto aliased source", ins);
                return self.binary(op, dst, a, ins);
            }
            if op == Op2::SUB && !a_reads_dst {
                debug!("{}: negate then add", ins);
                let mut seq = vec![Instruction::op1(Op1::NEG, *dst)];
                seq.extend(self.binary(Op2::ADD, dst, a, ins)?);
                return Ok(seq);
            }
            debug!("{}: destination aliases second source, via scratch", ins);
            return self.through_scratch(op, dst, a, b, ins);
        }
        if reads_register_of(b, dst) {
            if op.is_commutative() && !a_reads_dst {
                debug!("{}: second source addressed through destination, commuted", ins);
                return Ok(vec![
                    Instruction::op2(Op2::MOV, *dst, *b),
                    Instruction::op2(op, *dst, *a),
                ]);
            }
            debug!("{}: second source addressed through destination, via scratch", ins);
            return self.through_scratch(op, dst, a, b, ins);
        }

        if dst.is_mem() && b.is_mem() {
            debug!("{}: second source may overlap destination, via scratch", ins);
            return self.through_scratch(op, dst, a, b, ins);
        }

        if !self.target.memory_to_memory && dst.is_mem() && a.is_mem() {
            debug!("{}: memory operands, via scratch", ins);
            return self.through_scratch(op, dst, a, b, ins);
        }

        debug!("{}: move then operate", ins);
        Ok(vec![Instruction::op2(Op2::MOV, *dst, *a), Instruction::op2(op, *dst, *b)])
    }

    fn lower4(
        &self,
        op4: Op4,
        dst: &Operand,
        base: &Operand,
        index: &Operand,
        scale: &Operand,
        ins: &Instruction,
    ) -> Result<Vec<Instruction>> {
        let op = op4.lower().ok_or_else(|| unsupported(4, op4.code(), ins))?;
        let mode = self.addressing(4, op4.code(), ins)?;
        mutable(dst, ins)?;
        lea_destination(dst, ins)?;

        let scale = match scale {
            Operand::Imm(s) => u8::try_from(*s)
                .ok()
                .filter(|s| mode.supports_scale(*s))
                .ok_or_else(|| {
                    LowerError::AddressingOverflow(format!(
                        "{}: scale {} is not encodable",
                        ins, s
                    ))
                })?,
            other => {
                return Err(LowerError::InvalidOperand(format!(
                    "{}: scale must be an immediate, got {}",
                    ins, other
                )))
            }
        };

        let mut mem = match base {
            Operand::Reg(r) => Mem::base(*r),
            Operand::Mem(m) if m.index.is_none() => *m,
            Operand::Mem(m) => {
                return Err(LowerError::AddressingOverflow(format!(
                    "{}: base {} is already indexed",
                    ins, m
                )))
            }
            Operand::Imm(k) => Mem::default().with_disp(disp32(*k, ins)?),
        };

        match index {
            Operand::Reg(r) => mem.index = Some((*r, scale)),
            Operand::Imm(k) => {
                let folded = k
                    .checked_mul(scale as i64)
                    .and_then(|v| v.checked_add(mem.disp as i64))
                    .ok_or_else(|| overflow_disp(ins))?;
                mem.disp = disp32(folded, ins)?;
            }
            Operand::Mem(m) => {
                return Err(LowerError::InvalidOperand(format!(
                    "{}: index must be a register or immediate, got {}",
                    ins, m
                )))
            }
        }

        mode.check(&mem)?;
        Ok(vec![Instruction::op2(op, *dst, mem)])
    }

    /// `a + b` or `a - b` as an address, when the target can compute it
    /// with `LEA`.
    fn fuse(&self, op: Op2, dst: &Operand, a: &Operand, b: &Operand) -> Option<Mem> {
        if !self.target.lea_fusion {
            return None;
        }
        let mode = self.target.addressing.as_ref()?;
        dst.as_reg()?;
        let mem = match (op, a, b) {
            (Op2::ADD, Operand::Reg(x), Operand::Reg(y)) => Mem::base(*x).with_index(*y, 1),
            (Op2::ADD, Operand::Reg(x), Operand::Imm(k))
            | (Op2::ADD, Operand::Imm(k), Operand::Reg(x)) => {
                Mem::base(*x).with_disp(i32::try_from(*k).ok()?)
            }
            (Op2::SUB, Operand::Reg(x), Operand::Imm(k)) => {
                Mem::base(*x).with_disp(i32::try_from(k.checked_neg()?).ok()?)
            }
            _ => return None,
        };
        mode.check(&mem).ok()?;
        Some(mem)
    }

    /// `OP dst, src`, routed through the scratch register when the target
    /// cannot take two memory operands.
    fn binary(
        &self,
        op: Op2,
        dst: &Operand,
        src: &Operand,
        ins: &Instruction,
    ) -> Result<Vec<Instruction>> {
        if self.target.memory_to_memory || !(dst.is_mem() && src.is_mem()) {
            return Ok(vec![Instruction::op2(op, *dst, *src)]);
        }
        let s = self.scratch(ins)?;
        Ok(vec![
            Instruction::op2(Op2::MOV, s, *src),
            Instruction::op2(op, *dst, s),
        ])
    }

    /// `MOV s, a; OP s, b; MOV dst, s`
    fn through_scratch(
        &self,
        op: Op2,
        dst: &Operand,
        a: &Operand,
        b: &Operand,
        ins: &Instruction,
    ) -> Result<Vec<Instruction>> {
        let s = self.scratch(ins)?;
        Ok(vec![
            Instruction::op2(Op2::MOV, s, *a),
            Instruction::op2(op, s, *b),
            Instruction::op2(Op2::MOV, *dst, s),
        ])
    }

    fn scratch(&self, ins: &Instruction) -> Result<Reg> {
        let s = self.target.scratch.ok_or_else(|| {
            LowerError::InvalidOperand(format!(
                "{}: needs a scratch register, target {} reserves none",
                ins, self.target.name
            ))
        })?;
        if ins.uses(s) {
            return Err(LowerError::InvalidOperand(format!(
                "{}: operand uses reserved scratch register {}",
                ins, s
            )));
        }
        Ok(s)
    }

    fn addressing(&self, tier: u8, code: u8, ins: &Instruction) -> Result<&AddressingMode> {
        self.target
            .addressing
            .as_ref()
            .ok_or_else(|| unsupported(tier, code, ins))
    }
}

fn declared0(op: Op0) -> Result<()> {
    if op.is_declared() {
        Ok(())
    } else {
        Err(LowerError::UnsupportedOpcode {
            tier: 0,
            code: op.code(),
            context: op.to_string(),
        })
    }
}

fn declared1(op: Op1, ins: &Instruction) -> Result<()> {
    if op.is_declared() {
        Ok(())
    } else {
        Err(unsupported(1, op.code(), ins))
    }
}

fn unsupported(tier: u8, code: u8, ins: &Instruction) -> LowerError {
    LowerError::UnsupportedOpcode {
        tier,
        code,
        context: ins.to_string(),
    }
}

fn mutable(dst: &Operand, ins: &Instruction) -> Result<()> {
    if dst.is_imm() {
        return Err(LowerError::ImmutableDestination {
            instruction: ins.to_string(),
        });
    }
    Ok(())
}

/// Whether `src` reads the register `dst` names, directly or in an address.
fn reads_register_of(src: &Operand, dst: &Operand) -> bool {
    dst.as_reg().map_or(false, |r| src.uses(r))
}

fn lea_destination(dst: &Operand, ins: &Instruction) -> Result<()> {
    if dst.as_reg().is_none() {
        return Err(LowerError::InvalidOperand(format!(
            "{}: LEA destination must be a register",
            ins
        )));
    }
    Ok(())
}

fn disp32(value: i64, ins: &Instruction) -> Result<i32> {
    i32::try_from(value).map_err(|_| overflow_disp(ins))
}

fn overflow_disp(ins: &Instruction) -> LowerError {
    LowerError::AddressingOverflow(format!("{}: displacement does not fit in 32 bits", ins))
}
