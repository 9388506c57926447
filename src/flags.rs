//! Flag-dependency tracking for carry/borrow chains.
//!
//! `ADC`/`SBB` read the carry flag left by the previous link of the chain.
//! The tracker follows, for one basic block, whether the flags register
//! currently holds a carry that a not-yet-emitted link still needs, and
//! rejects every instruction that would overwrite it in the meantime.
//! One tracker belongs to one lowering pass over one block.

use crate::error::{LowerError, Result};
use crate::ir::Instruction;
use crate::op::{Op2, Op3};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryFamily {
    /// ADD / ADC
    Add,
    /// SUB / SBB
    Sub,
}

/// Role an input instruction plays in a carry chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryLink {
    /// Starts a chain: tier-2 `ADD`/`SUB`.
    Produce(CarryFamily),
    /// Continues a chain: tier-2 `ADC`/`SBB`, tier-3 `ADC3`/`SBB3`.
    Consume(CarryFamily),
}

impl CarryLink {
    /// Tier-3 `ADD3`/`SUB3` are plain virtual adds and never link; that is
    /// what lets LEA fusion place them inside a chain.
    pub fn of(ins: &Instruction) -> Option<CarryLink> {
        match ins {
            Instruction::Binary { op, .. } => match *op {
                Op2::ADD => Some(CarryLink::Produce(CarryFamily::Add)),
                Op2::SUB => Some(CarryLink::Produce(CarryFamily::Sub)),
                Op2::ADC => Some(CarryLink::Consume(CarryFamily::Add)),
                Op2::SBB => Some(CarryLink::Consume(CarryFamily::Sub)),
                _ => None,
            },
            Instruction::Ternary { op, .. } => match *op {
                Op3::ADC3 => Some(CarryLink::Consume(CarryFamily::Add)),
                Op3::SBB3 => Some(CarryLink::Consume(CarryFamily::Sub)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn family(self) -> CarryFamily {
        match self {
            CarryLink::Produce(f) | CarryLink::Consume(f) => f,
        }
    }

    /// Tier-2 opcode that carries this link in the lowered stream.
    pub fn target_op(self) -> Op2 {
        match self {
            CarryLink::Produce(CarryFamily::Add) => Op2::ADD,
            CarryLink::Produce(CarryFamily::Sub) => Op2::SUB,
            CarryLink::Consume(CarryFamily::Add) => Op2::ADC,
            CarryLink::Consume(CarryFamily::Sub) => Op2::SBB,
        }
    }
}

/// Whether a lowered (tier 0..=2) instruction is guaranteed to leave flags alone.
pub fn preserves_flags(ins: &Instruction) -> bool {
    match ins {
        Instruction::Nullary { op } => op.preserves_flags(),
        Instruction::Binary { op, .. } => op.preserves_flags(),
        _ => false,
    }
}

/// For every input index, whether a carry is demanded right after it: the
/// next chain link further down the block is a consumer.
pub fn carry_demand(block: &[Instruction]) -> Vec<bool> {
    let mut demanded = vec![false; block.len()];
    let mut demand = false;
    for (i, ins) in block.iter().enumerate().rev() {
        demanded[i] = demand;
        match CarryLink::of(ins) {
            Some(CarryLink::Consume(_)) => demand = true,
            Some(CarryLink::Produce(_)) => demand = false,
            None => {}
        }
    }
    demanded
}

#[derive(Debug, Clone)]
struct Pending {
    producer: usize,
    family: CarryFamily,
    text: String,
}

#[derive(Debug, Default)]
pub struct FlagTracker {
    pending: Option<Pending>,
}

impl FlagTracker {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// True while some not-yet-emitted link still needs the current carry.
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Input index of the instruction whose carry is pending.
    pub fn pending_producer(&self) -> Option<usize> {
        self.pending.as_ref().map(|p| p.producer)
    }

    /// Feeds one lowered instruction, in emission order.
    ///
    /// `origin` is the input index it was lowered from; `link` is set only
    /// on the instruction that carries the chain link of that input;
    /// `demanded` tells whether a later consumer needs the carry it leaves.
    pub fn observe(
        &mut self,
        origin: usize,
        ins: &Instruction,
        link: Option<CarryLink>,
        demanded: bool,
    ) -> Result<()> {
        match link {
            None => {
                if preserves_flags(ins) {
                    return Ok(());
                }
                if let Some(pending) = &self.pending {
                    return Err(broken(
                        Some(pending.producer),
                        origin,
                        format!("{} clobbers the carry left by {}", ins, pending.text),
                    ));
                }
            }
            Some(CarryLink::Produce(family)) => {
                if let Some(pending) = &self.pending {
                    return Err(broken(
                        Some(pending.producer),
                        origin,
                        format!("{} overwrites the carry left by {}", ins, pending.text),
                    ));
                }
                self.arm(origin, family, ins, demanded);
            }
            Some(CarryLink::Consume(family)) => {
                match &self.pending {
                    None => {
                        return Err(broken(
                            None,
                            origin,
                            format!("{} has no carry producer in this block", ins),
                        ))
                    }
                    Some(pending) if pending.family != family => {
                        return Err(broken(
                            Some(pending.producer),
                            origin,
                            format!(
                                "{} cannot consume the {:?} carry left by {}",
                                ins, pending.family, pending.text
                            ),
                        ))
                    }
                    Some(_) => {}
                }
                self.arm(origin, family, ins, demanded);
            }
        }
        Ok(())
    }

    fn arm(&mut self, origin: usize, family: CarryFamily, ins: &Instruction, demanded: bool) {
        self.pending = if demanded {
            Some(Pending {
                producer: origin,
                family,
                text: ins.to_string(),
            })
        } else {
            None
        };
    }

    /// Ends the block. A carry still pending means a consumer was dropped.
    pub fn finish(self) -> Result<()> {
        match self.pending {
            Some(pending) => Err(broken(
                Some(pending.producer),
                pending.producer,
                format!("carry left by {} is never consumed", pending.text),
            )),
            None => Ok(()),
        }
    }
}

fn broken(producer: Option<usize>, offender: usize, detail: String) -> LowerError {
    warn!("carry chain broken at #{}: {}", offender, detail);
    metrics::increment_counter!("lowerforge_carry_chain_violations_total");
    LowerError::CarryChainBroken {
        producer,
        offender,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Mem, Reg};
    use crate::op::Op1;

    fn add(d: u8, s: u8) -> Instruction {
        Instruction::op2(Op2::ADD, Reg(d), Reg(s))
    }

    fn adc(d: u8, s: u8) -> Instruction {
        Instruction::op2(Op2::ADC, Reg(d), Reg(s))
    }

    #[test]
    fn test_link_roles() {
        assert_eq!(
            CarryLink::of(&add(0, 1)),
            Some(CarryLink::Produce(CarryFamily::Add))
        );
        assert_eq!(
            CarryLink::of(&Instruction::op3(Op3::SBB3, Reg(0), Reg(1), Reg(2))),
            Some(CarryLink::Consume(CarryFamily::Sub))
        );
        assert_eq!(
            CarryLink::of(&Instruction::op3(Op3::ADD3, Reg(0), Reg(1), Reg(2))),
            None
        );
        assert_eq!(CarryLink::Consume(CarryFamily::Sub).target_op(), Op2::SBB);
    }

    #[test]
    fn test_carry_demand() {
        let block = vec![
            add(0, 3),
            Instruction::op3(Op3::ADD3, Reg(6), Reg(7), Reg(8)),
            adc(1, 4),
            adc(2, 5),
            Instruction::op2(Op2::XOR, Reg(0), Reg(0)),
        ];
        assert_eq!(carry_demand(&block), vec![true, true, true, false, false]);
    }

    #[test]
    fn test_chain_accepted() {
        let mut tracker = FlagTracker::new();
        let produce = Some(CarryLink::Produce(CarryFamily::Add));
        let consume = Some(CarryLink::Consume(CarryFamily::Add));
        tracker.observe(0, &add(0, 3), produce, true).unwrap();
        assert_eq!(tracker.pending_producer(), Some(0));
        let lea = Instruction::op2(Op2::LEA, Reg(6), Mem::base(Reg(7)).with_index(Reg(8), 1));
        tracker.observe(1, &lea, None, true).unwrap();
        tracker.observe(2, &adc(1, 4), consume, true).unwrap();
        tracker.observe(3, &adc(2, 5), consume, false).unwrap();
        assert!(!tracker.is_armed());
        tracker.finish().unwrap();
    }

    #[test]
    fn test_clobber_between_links() {
        let mut tracker = FlagTracker::new();
        tracker
            .observe(0, &add(0, 3), Some(CarryLink::Produce(CarryFamily::Add)), true)
            .unwrap();
        let mov = Instruction::op2(Op2::MOV, Reg(1), Reg(4));
        let err = tracker.observe(1, &mov, None, true).unwrap_err();
        match err {
            LowerError::CarryChainBroken {
                producer, offender, ..
            } => {
                assert_eq!(producer, Some(0));
                assert_eq!(offender, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_consumer_without_producer() {
        let mut tracker = FlagTracker::new();
        let inc = Instruction::op1(Op1::INC, Reg(0));
        tracker.observe(0, &inc, None, false).unwrap();
        let err = tracker
            .observe(1, &adc(1, 2), Some(CarryLink::Consume(CarryFamily::Add)), false)
            .unwrap_err();
        assert_eq!(err.kind(), "carry-chain-broken");
    }

    #[test]
    fn test_family_mismatch() {
        let mut tracker = FlagTracker::new();
        let sub = Instruction::op2(Op2::SUB, Reg(0), Reg(1));
        tracker
            .observe(0, &sub, Some(CarryLink::Produce(CarryFamily::Sub)), true)
            .unwrap();
        assert!(tracker
            .observe(1, &adc(2, 3), Some(CarryLink::Consume(CarryFamily::Add)), false)
            .is_err());
    }

    #[test]
    fn test_unneeded_carry_does_not_arm() {
        let mut tracker = FlagTracker::new();
        tracker
            .observe(0, &add(0, 1), Some(CarryLink::Produce(CarryFamily::Add)), false)
            .unwrap();
        assert!(!tracker.is_armed());
        let xor = Instruction::op2(Op2::XOR, Reg(2), Reg(2));
        tracker.observe(1, &xor, None, false).unwrap();
        tracker.finish().unwrap();
    }
}
