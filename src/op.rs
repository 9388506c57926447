//! Opcode tables, one type per arity tier.
//!
//! Every tier is an independent 8-bit code space. Codes are assigned once
//! and kept stable; raw values collide across tiers (`ADD` and `ADD3` are
//! both 12) but the tier is always known from context, so the collision is
//! harmless. Semantic identity across tiers is carried only by the explicit
//! lowering tables at the bottom of this file.

use crate::error::{LowerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

macro_rules! opcode_tier {
    (
        $(#[$meta:meta])*
        $ty:ident, tier $tier:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $text:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $ty(pub u8);

        #[allow(non_upper_case_globals)]
        impl $ty {
            $( $(#[$vmeta])* pub const $variant: $ty = $ty($code); )*

            pub const TIER: u8 = $tier;

            /// Declared opcodes of this tier with their canonical names.
            pub const DECLARED: &'static [($ty, &'static str)] = &[ $( ($ty($code), $text), )* ];

            pub const fn code(self) -> u8 {
                self.0
            }

            /// Canonical name, `None` for an undeclared code.
            pub fn name(self) -> Option<&'static str> {
                Self::DECLARED
                    .iter()
                    .find(|(op, _)| *op == self)
                    .map(|(_, name)| *name)
            }

            pub fn is_declared(self) -> bool {
                self.name().is_some()
            }

            /// Looks up a declared opcode by its canonical name.
            pub fn from_name(name: &str) -> Option<Self> {
                Self::DECLARED
                    .iter()
                    .find(|(_, n)| *n == name)
                    .map(|(op, _)| *op)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.name() {
                    Some(name) => f.write_str(name),
                    None => write!(f, "Op{}({})", $tier, self.0),
                }
            }
        }
    };
}

opcode_tier! {
    /// Instructions without operands.
    Op0, tier 0 {
        NOP = 57 => "NOP",
        RET = 80 => "RET",
    }
}

opcode_tier! {
    /// One operand: destination is also the source.
    Op1, tier 1 {
        ZERO = 66 => "ZERO",
        INC = 37 => "INC",
        DEC = 38 => "DEC",
        NEG = 1 => "NEG",
        NOT = 2 => "NOT",
    }
}

opcode_tier! {
    /// Destructive two-operand form: `dst OP= src`.
    Op2, tier 2 {
        ADD = 12 => "ADD",
        SUB = 13 => "SUB",
        /// add with carry
        ADC = 97 => "ADC",
        /// subtract with borrow
        SBB = 98 => "SBB",
        MUL = 14 => "MUL",
        DIV = 15 => "DIV",
        REM = 16 => "REM",
        AND = 17 => "AND",
        OR = 18 => "OR",
        XOR = 19 => "XOR",
        SHL = 20 => "SHL",
        SHR = 21 => "SHR",
        AND_NOT = 22 => "AND_NOT",
        /// short-circuit &&
        LAND = 34 => "LAND",
        /// short-circuit ||
        LOR = 35 => "LOR",
        MOV = 42 => "MOV",
        CAST = 84 => "CAST",
        /// load effective address
        LEA = 36 => "LEA",
        NEG2 = 1 => "NEG2",
        NOT2 = 2 => "NOT2",
    }
}

opcode_tier! {
    /// Non-destructive three-address form: `dst = a OP b`.
    Op3, tier 3 {
        ADD3 = 12 => "ADD3",
        SUB3 = 13 => "SUB3",
        ADC3 = 97 => "ADC3",
        SBB3 = 98 => "SBB3",
        MUL3 = 14 => "MUL3",
        DIV3 = 15 => "DIV3",
        REM3 = 16 => "REM3",
        AND3 = 17 => "AND3",
        OR3 = 18 => "OR3",
        XOR3 = 19 => "XOR3",
        SHL3 = 20 => "SHL3",
        SHR3 = 21 => "SHR3",
        AND_NOT3 = 22 => "AND_NOT3",
        LAND3 = 34 => "LAND3",
        LOR3 = 35 => "LOR3",
    }
}

opcode_tier! {
    /// Four operands: general addressing form only.
    Op4, tier 4 {
        LEA4 = 36 => "LEA4",
    }
}

impl Op2 {
    /// Alias for `DIV`. Not a separate table entry.
    pub const QUO: Op2 = Op2::DIV;

    /// Like `from_name`, also accepting the `QUO` alias.
    pub fn from_mnemonic(name: &str) -> Option<Self> {
        match name {
            "QUO" => Some(Op2::QUO),
            _ => Op2::from_name(name),
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Op2::ADD | Op2::ADC | Op2::MUL | Op2::AND | Op2::OR | Op2::XOR
        )
    }

    /// Only address computation leaves the flags register alone. `MOV` and
    /// `CAST` are treated as clobbering: the encoder is free to pick forms
    /// (zeroing idioms, sign extension through flags-setting sequences)
    /// that touch flags.
    pub fn preserves_flags(self) -> bool {
        self == Op2::LEA
    }

    /// Declared one-operand counterpart, if any.
    pub fn lower(self) -> Option<Op1> {
        lookup(OP2_TO_OP1, self)
    }
}

impl Op0 {
    pub fn preserves_flags(self) -> bool {
        matches!(self, Op0::NOP | Op0::RET)
    }
}

impl Op3 {
    /// Declared two-operand counterpart, if any.
    pub fn lower(self) -> Option<Op2> {
        lookup(OP3_TO_OP2, self)
    }
}

impl Op4 {
    /// Declared two-operand counterpart, if any.
    pub fn lower(self) -> Option<Op2> {
        lookup(OP4_TO_OP2, self)
    }
}

fn lookup<S: PartialEq + Copy, T: Copy>(table: &[(S, T)], op: S) -> Option<T> {
    table.iter().find(|(from, _)| *from == op).map(|(_, to)| *to)
}

/// Tier-3 → tier-2: same semantic operation, one operand fewer.
pub const OP3_TO_OP2: &[(Op3, Op2)] = &[
    (Op3::ADD3, Op2::ADD),
    (Op3::SUB3, Op2::SUB),
    (Op3::ADC3, Op2::ADC),
    (Op3::SBB3, Op2::SBB),
    (Op3::MUL3, Op2::MUL),
    (Op3::DIV3, Op2::DIV),
    (Op3::REM3, Op2::REM),
    (Op3::AND3, Op2::AND),
    (Op3::OR3, Op2::OR),
    (Op3::XOR3, Op2::XOR),
    (Op3::SHL3, Op2::SHL),
    (Op3::SHR3, Op2::SHR),
    (Op3::AND_NOT3, Op2::AND_NOT),
    (Op3::LAND3, Op2::LAND),
    (Op3::LOR3, Op2::LOR),
];

/// Tier-4 → tier-2.
pub const OP4_TO_OP2: &[(Op4, Op2)] = &[(Op4::LEA4, Op2::LEA)];

/// Tier-2 → tier-1 for the two-operand forms of the unary operators.
pub const OP2_TO_OP1: &[(Op2, Op1)] = &[(Op2::NEG2, Op1::NEG), (Op2::NOT2, Op1::NOT)];

fn check_table<S, T>(
    label: &str,
    table: &[(S, T)],
    sources: &[(S, &'static str)],
    targets: &[(T, &'static str)],
    suffix: &str,
) -> Result<()>
where
    S: PartialEq + Copy + fmt::Display,
    T: PartialEq + Copy + fmt::Display,
{
    for (from, _) in sources {
        let count = table.iter().filter(|(s, _)| s == from).count();
        if count != 1 {
            return Err(LowerError::TableError(format!(
                "{}: {} has {} entries, expected exactly one",
                label, from, count
            )));
        }
    }
    for (from, to) in table {
        let from_name = sources
            .iter()
            .find(|(op, _)| op == from)
            .map(|(_, n)| *n)
            .ok_or_else(|| {
                LowerError::TableError(format!("{}: source {} is not declared", label, from))
            })?;
        let to_name = targets
            .iter()
            .find(|(op, _)| op == to)
            .map(|(_, n)| *n)
            .ok_or_else(|| {
                LowerError::TableError(format!("{}: target {} is not declared", label, to))
            })?;
        if from_name.strip_suffix(suffix) != Some(to_name) {
            return Err(LowerError::TableError(format!(
                "{}: {} maps to unrelated {}",
                label, from_name, to_name
            )));
        }
    }
    Ok(())
}

/// Checks the cross-tier lowering tables for totality and consistency.
pub fn verify_lowering_tables() -> Result<()> {
    check_table("Op3->Op2", OP3_TO_OP2, Op3::DECLARED, Op2::DECLARED, "3")?;
    check_table("Op4->Op2", OP4_TO_OP2, Op4::DECLARED, Op2::DECLARED, "4")?;
    // Only NEG2/NOT2 have a tier-1 form, so this table is not total over Op2.
    for (from, to) in OP2_TO_OP1 {
        let ok = match (from.name(), to.name()) {
            (Some(f), Some(t)) => f.strip_suffix('2') == Some(t),
            _ => false,
        };
        if !ok {
            return Err(LowerError::TableError(format!(
                "Op2->Op1: {} maps to unrelated {}",
                from, to
            )));
        }
    }
    Ok(())
}

/// Verifies the tables once per process and caches the outcome.
pub fn tables_verified() -> Result<()> {
    static VERIFIED: OnceLock<Result<()>> = OnceLock::new();
    VERIFIED.get_or_init(verify_lowering_tables).clone()
}
