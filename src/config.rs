//! Target-family descriptor
//!
//! Describes what the one supported two-operand, explicit-flags target can
//! express: its addressing mode, whether LEA fusion is enabled, the
//! scratch register the allocator reserves for the lowering pass (if any),
//! and per-block limits.

use crate::error::{LowerError, Result};
use crate::ir::{Mem, Reg};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Addressing capability of the target's `LEA`/memory operands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressingMode {
    /// Independent fields one address can carry (base, scaled index, displacement).
    pub max_fields: u8,
    /// Encodable index scales.
    pub scales: Vec<u8>,
}

impl AddressingMode {
    /// base + index*{1,2,4,8} + disp32
    pub fn amd64() -> Self {
        Self {
            max_fields: 3,
            scales: vec![1, 2, 4, 8],
        }
    }

    pub fn supports_scale(&self, scale: u8) -> bool {
        self.scales.contains(&scale)
    }

    /// Checks that one memory reference fits this addressing mode.
    pub fn check(&self, mem: &Mem) -> Result<()> {
        if let Some((_, scale)) = mem.index {
            if !self.supports_scale(scale) {
                return Err(LowerError::AddressingOverflow(format!(
                    "scale {} in {} is not encodable (supported: {:?})",
                    scale, mem, self.scales
                )));
            }
        }
        if mem.fields() > self.max_fields {
            return Err(LowerError::AddressingOverflow(format!(
                "{} needs {} address fields, target supports {}",
                mem,
                mem.fields(),
                self.max_fields
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub name: String,
    /// `None` when the target has no address-computation instruction.
    pub addressing: Option<AddressingMode>,
    /// Fuse non-destructive ADD/SUB into `LEA`.
    pub lea_fusion: bool,
    /// Register reserved for the lowering pass; never handed out by the allocator.
    pub scratch: Option<Reg>,
    /// Whether a two-operand instruction may take two memory operands.
    pub memory_to_memory: bool,
    /// Maximum number of input instructions per basic block.
    pub max_block_len: usize,
}

impl Default for TargetDescriptor {
    fn default() -> Self {
        Self::amd64()
    }
}

impl TargetDescriptor {
    pub fn amd64() -> Self {
        Self {
            name: "amd64".to_string(),
            addressing: Some(AddressingMode::amd64()),
            lea_fusion: true,
            scratch: None,
            memory_to_memory: false,
            max_block_len: 10_000,
        }
    }

    /// amd64 with a register reserved for aliasing and memory-to-memory fixups.
    pub fn amd64_with_scratch(scratch: Reg) -> Self {
        Self {
            scratch: Some(scratch),
            ..Self::amd64()
        }
    }

    /// Two-operand target without any address computation.
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            addressing: None,
            lea_fusion: false,
            scratch: None,
            memory_to_memory: false,
            max_block_len: 1_000,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let target: TargetDescriptor = serde_json::from_str(text)?;
        target.validate()?;
        Ok(target)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(mode) = &self.addressing {
            if mode.max_fields == 0 || mode.max_fields > 3 {
                return Err(LowerError::ConfigError(format!(
                    "{}: max_fields must be 1..=3, got {}",
                    self.name, mode.max_fields
                )));
            }
            if mode.scales.is_empty() {
                return Err(LowerError::ConfigError(format!(
                    "{}: addressing mode lists no scales",
                    self.name
                )));
            }
            if let Some(bad) = mode
                .scales
                .iter()
                .find(|s| !matches!(**s, 1 | 2 | 4 | 8))
            {
                return Err(LowerError::ConfigError(format!(
                    "{}: unsupported scale {}",
                    self.name, bad
                )));
            }
        } else if self.lea_fusion {
            return Err(LowerError::ConfigError(format!(
                "{}: lea_fusion requires an addressing mode",
                self.name
            )));
        }
        if self.max_block_len == 0 {
            return Err(LowerError::ConfigError(format!(
                "{}: max_block_len must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Check if block length is within limits
    pub fn check_block_len(&self, len: usize) -> Result<()> {
        if len > self.max_block_len {
            return Err(LowerError::ResourceLimitExceeded(format!(
                "Block of {} instructions exceeds limit {}",
                len, self.max_block_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(TargetDescriptor::default().validate().is_ok());
        assert!(TargetDescriptor::minimal().validate().is_ok());
        assert_eq!(
            TargetDescriptor::amd64_with_scratch(Reg(15)).scratch,
            Some(Reg(15))
        );
    }

    #[test]
    fn test_json_round_trip() {
        let target = TargetDescriptor::amd64_with_scratch(Reg(15));
        let json = target.to_json().unwrap();
        assert_eq!(TargetDescriptor::from_json(&json).unwrap(), target);
    }

    #[test]
    fn test_rejects_bad_descriptors() {
        let mut target = TargetDescriptor::amd64();
        target.addressing = Some(AddressingMode {
            max_fields: 3,
            scales: vec![1, 3],
        });
        assert!(target.validate().is_err());

        let mut target = TargetDescriptor::minimal();
        target.lea_fusion = true;
        assert_eq!(target.validate().unwrap_err().kind(), "config-error");

        assert!(TargetDescriptor::from_json("{\"name\": 1}").is_err());
    }

    #[test]
    fn test_block_limit() {
        let target = TargetDescriptor::minimal();
        assert!(target.check_block_len(10).is_ok());
        assert_eq!(
            target.check_block_len(5000).unwrap_err().kind(),
            "resource-limit"
        );
    }

    #[test]
    fn test_addressing_check() {
        let mode = AddressingMode::amd64();
        let mem = Mem::base(Reg(0)).with_index(Reg(1), 8).with_disp(-4);
        assert!(mode.check(&mem).is_ok());
        let mem = Mem::base(Reg(0)).with_index(Reg(1), 16);
        assert_eq!(mode.check(&mem).unwrap_err().kind(), "addressing-overflow");
        let narrow = AddressingMode {
            max_fields: 2,
            scales: vec![1],
        };
        let mem = Mem::base(Reg(0)).with_index(Reg(1), 1).with_disp(4);
        assert!(narrow.check(&mem).is_err());
    }
}
