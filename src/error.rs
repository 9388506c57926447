//! Error Types for lowerforge
//!
//! Every failure is detected while lowering, never at run time of the
//! generated code. Nothing here is ever silently recovered: the caller
//! decides whether to fall back to the tree-walking evaluator.

use std::fmt;

/// Unified error type for lowering operations
#[derive(Debug, Clone, PartialEq)]
pub enum LowerError {
    /// A tier-3/4 opcode has no declared lowering, or the opcode is undeclared
    UnsupportedOpcode { tier: u8, code: u8, context: String },
    /// An addressing computation needs more than the target's addressing mode offers
    AddressingOverflow(String),
    /// The destination operand is an immediate
    ImmutableDestination { instruction: String },
    /// A non flag-preserving instruction sits between a carry producer and its consumer
    CarryChainBroken {
        producer: Option<usize>,
        offender: usize,
        detail: String,
    },
    /// An operand has a shape the instruction cannot accept on this target
    InvalidOperand(String),
    /// Block exceeds the configured limits
    ResourceLimitExceeded(String),
    /// The cross-tier lowering tables are inconsistent
    TableError(String),
    /// Failed to parse textual assembly
    ParseError { line: usize, message: String },
    /// Invalid target descriptor
    ConfigError(String),
    /// I/O operation failed
    IoError(String),
    /// A lowering worker thread panicked
    WorkerPanicked(String),
}

impl LowerError {
    /// Short stable label, used for metrics and test expectations.
    pub fn kind(&self) -> &'static str {
        match self {
            LowerError::UnsupportedOpcode { .. } => "unsupported-opcode",
            LowerError::AddressingOverflow(_) => "addressing-overflow",
            LowerError::ImmutableDestination { .. } => "immutable-destination",
            LowerError::CarryChainBroken { .. } => "carry-chain-broken",
            LowerError::InvalidOperand(_) => "invalid-operand",
            LowerError::ResourceLimitExceeded(_) => "resource-limit",
            LowerError::TableError(_) => "table-error",
            LowerError::ParseError { .. } => "parse-error",
            LowerError::ConfigError(_) => "config-error",
            LowerError::IoError(_) => "io-error",
            LowerError::WorkerPanicked(_) => "worker-panicked",
        }
    }

    /// True when the error points at a bug in the lowering engine itself
    /// rather than at malformed input.
    pub fn is_engine_fault(&self) -> bool {
        matches!(
            self,
            LowerError::CarryChainBroken { .. } | LowerError::TableError(_)
        )
    }
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::UnsupportedOpcode {
                tier,
                code,
                context,
            } => write!(
                f,
                "Unsupported opcode: Op{}({}) in {}",
                tier, code, context
            ),
            LowerError::AddressingOverflow(msg) => write!(f, "Addressing overflow: {}", msg),
            LowerError::ImmutableDestination { instruction } => {
                write!(f, "Immutable destination: {}", instruction)
            }
            LowerError::CarryChainBroken {
                producer,
                offender,
                detail,
            } => match producer {
                Some(p) => write!(
                    f,
                    "Carry chain broken: instruction #{} interrupts carry from #{}: {}",
                    offender, p, detail
                ),
                None => write!(
                    f,
                    "Carry chain broken at instruction #{}: {}",
                    offender, detail
                ),
            },
            LowerError::InvalidOperand(msg) => write!(f, "Invalid operand: {}", msg),
            LowerError::ResourceLimitExceeded(msg) => {
                write!(f, "Resource limit exceeded: {}", msg)
            }
            LowerError::TableError(msg) => write!(f, "Lowering table error: {}", msg),
            LowerError::ParseError { line, message } => {
                write!(f, "Parse error at line {}: {}", line, message)
            }
            LowerError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            LowerError::IoError(msg) => write!(f, "I/O error: {}", msg),
            LowerError::WorkerPanicked(msg) => write!(f, "Worker panicked: {}", msg),
        }
    }
}

impl std::error::Error for LowerError {}

/// Result type alias for lowering operations
pub type Result<T> = std::result::Result<T, LowerError>;

// Conversion from std::io::Error
impl From<std::io::Error> for LowerError {
    fn from(err: std::io::Error) -> Self {
        LowerError::IoError(err.to_string())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for LowerError {
    fn from(err: serde_json::Error) -> Self {
        LowerError::ConfigError(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LowerError::ParseError {
            line: 3,
            message: "unexpected token".to_string(),
        };
        assert!(err.to_string().contains("Parse error at line 3"));
    }

    #[test]
    fn test_carry_chain_is_engine_fault() {
        let err = LowerError::CarryChainBroken {
            producer: Some(0),
            offender: 1,
            detail: "XOR R3, R4".to_string(),
        };
        assert!(err.is_engine_fault());
        assert_eq!(err.kind(), "carry-chain-broken");
        assert!(err.to_string().contains("from #0"));

        let err = LowerError::ImmutableDestination {
            instruction: "MOV 1, R0".to_string(),
        };
        assert!(!err.is_engine_fault());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: LowerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), "config-error");
    }
}
