use crate::error::{LowerError, Result};
use crate::ir::{Instruction, Mem, Operand, Reg};
use crate::op::{Op0, Op1, Op2, Op3, Op4};

/// Separates blocks in a multi-block listing.
pub const BLOCK_SEPARATOR: &str = "---";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mnemonic {
    T0(Op0),
    T1(Op1),
    T2(Op2),
    T3(Op3),
    T4(Op4),
}

impl Mnemonic {
    fn arity(self) -> usize {
        match self {
            Mnemonic::T0(_) => 0,
            Mnemonic::T1(_) => 1,
            Mnemonic::T2(_) => 2,
            Mnemonic::T3(_) => 3,
            Mnemonic::T4(_) => 4,
        }
    }

    /// Declared names are unique across all tiers, so the name alone picks
    /// the tier. `Op<tier>(<code>)` spells an undeclared code.
    fn resolve(word: &str) -> Option<Self> {
        if let Some(op) = Op0::from_name(word) {
            return Some(Mnemonic::T0(op));
        }
        if let Some(op) = Op1::from_name(word) {
            return Some(Mnemonic::T1(op));
        }
        if let Some(op) = Op2::from_mnemonic(word) {
            return Some(Mnemonic::T2(op));
        }
        if let Some(op) = Op3::from_name(word) {
            return Some(Mnemonic::T3(op));
        }
        if let Some(op) = Op4::from_name(word) {
            return Some(Mnemonic::T4(op));
        }
        let rest = word.strip_prefix("Op")?;
        let (tier, code) = rest.strip_suffix(')')?.split_once('(')?;
        let code: u8 = code.parse().ok()?;
        match tier {
            "0" => Some(Mnemonic::T0(Op0(code))),
            "1" => Some(Mnemonic::T1(Op1(code))),
            "2" => Some(Mnemonic::T2(Op2(code))),
            "3" => Some(Mnemonic::T3(Op3(code))),
            "4" => Some(Mnemonic::T4(Op4(code))),
            _ => None,
        }
    }
}

/// Parses one basic block, one instruction per line. `#` starts a comment.
pub fn parse_block(source: &str) -> Result<Vec<Instruction>> {
    parse_lines(source, 0)
}

/// Parses a listing of blocks separated by `---` lines.
pub fn parse_blocks(source: &str) -> Result<Vec<Vec<Instruction>>> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut first_line = 0;
    for (n, line) in source.lines().enumerate() {
        if line.trim() == BLOCK_SEPARATOR {
            blocks.push(parse_lines(&current, first_line)?);
            current.clear();
            first_line = n + 1;
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    let last = parse_lines(&current, first_line)?;
    if !last.is_empty() || blocks.is_empty() {
        blocks.push(last);
    }
    Ok(blocks)
}

fn parse_lines(source: &str, line_offset: usize) -> Result<Vec<Instruction>> {
    let mut block = Vec::new();
    for (n, raw) in source.lines().enumerate() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_offset + n + 1;
        block.push(parse_instruction(line).map_err(|message| LowerError::ParseError {
            line: line_no,
            message,
        })?);
    }
    Ok(block)
}

/// Parses the textual form produced by `Instruction`'s `Display`.
pub fn parse_instruction(line: &str) -> std::result::Result<Instruction, String> {
    let line = line.trim();
    let (word, rest) = match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim()),
        None => (line, ""),
    };
    let mnemonic =
        Mnemonic::resolve(word).ok_or_else(|| format!("unknown mnemonic '{}'", word))?;

    let operands: Vec<Operand> = if rest.is_empty() {
        Vec::new()
    } else {
        split_operands(rest)?
            .into_iter()
            .map(parse_operand)
            .collect::<std::result::Result<_, _>>()?
    };

    if operands.len() != mnemonic.arity() {
        return Err(format!(
            "{} takes {} operands, got {}",
            word,
            mnemonic.arity(),
            operands.len()
        ));
    }

    let mut it = operands.into_iter();
    let mut next = || it.next().ok_or_else(|| "missing operand".to_string());
    Ok(match mnemonic {
        Mnemonic::T0(op) => Instruction::op0(op),
        Mnemonic::T1(op) => Instruction::op1(op, next()?),
        Mnemonic::T2(op) => {
            let dst = next()?;
            Instruction::op2(op, dst, next()?)
        }
        Mnemonic::T3(op) => {
            let dst = next()?;
            let a = next()?;
            Instruction::op3(op, dst, a, next()?)
        }
        Mnemonic::T4(op) => {
            let dst = next()?;
            let base = next()?;
            let index = next()?;
            Instruction::Quaternary {
                op,
                dst,
                base,
                index,
                scale: next()?,
            }
        }
    })
}

// Commas inside brackets do not occur, but brackets must balance.
fn split_operands(text: &str) -> std::result::Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 || depth > 1 {
            return Err(format!("unbalanced brackets in '{}'", text));
        }
    }
    if depth != 0 {
        return Err(format!("unbalanced brackets in '{}'", text));
    }
    parts.push(text[start..].trim());
    if parts.iter().any(|p| p.is_empty()) {
        return Err(format!("empty operand in '{}'", text));
    }
    Ok(parts)
}

fn parse_operand(text: &str) -> std::result::Result<Operand, String> {
    if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        return parse_mem(inner).map(Operand::Mem);
    }
    if let Some(reg) = parse_reg(text) {
        return Ok(Operand::Reg(reg?));
    }
    parse_int(text)
        .map(Operand::Imm)
        .ok_or_else(|| format!("bad operand '{}'", text))
}

fn parse_reg(text: &str) -> Option<std::result::Result<Reg, String>> {
    let digits = text.strip_prefix('R')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(
        digits
            .parse::<u8>()
            .map(Reg)
            .map_err(|_| format!("register out of range '{}'", text)),
    )
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match body.strip_prefix("0x") {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => body.parse::<i128>().ok()?,
    };
    let value = if negative { magnitude.checked_neg()? } else { magnitude };
    i64::try_from(value).ok()
}

/// `base`, `index*scale` and signed displacement terms joined by `+`/`-`.
fn parse_mem(text: &str) -> std::result::Result<Mem, String> {
    let mut mem = Mem::default();
    let mut disp: i64 = 0;
    let mut term = String::new();
    let mut negative = false;
    let mut terms = Vec::new();
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        if (c == '+' || c == '-') && !term.is_empty() {
            terms.push((negative, std::mem::take(&mut term)));
            negative = c == '-';
        } else if c == '-' {
            negative = !negative;
        } else if c != '+' {
            term.push(c);
        }
    }
    if term.is_empty() {
        return Err(format!("empty address term in [{}]", text));
    }
    terms.push((negative, term));

    for (negative, term) in terms {
        if let Some((reg, scale)) = term.split_once('*') {
            let reg = parse_reg(reg)
                .ok_or_else(|| format!("bad index register in [{}]", text))??;
            let scale: u8 = scale
                .parse()
                .map_err(|_| format!("bad scale in [{}]", text))?;
            if negative || mem.index.is_some() {
                return Err(format!("unsupported index in [{}]", text));
            }
            mem.index = Some((reg, scale));
        } else if let Some(reg) = parse_reg(&term) {
            let reg = reg?;
            if negative {
                return Err(format!("negative register term in [{}]", text));
            }
            if mem.base.is_none() {
                mem.base = Some(reg);
            } else if mem.index.is_none() {
                mem.index = Some((reg, 1));
            } else {
                return Err(format!("too many registers in [{}]", text));
            }
        } else {
            let value = parse_int(&term).ok_or_else(|| format!("bad term '{}'", term))?;
            let value = if negative { value.checked_neg() } else { Some(value) };
            disp = value
                .and_then(|v| disp.checked_add(v))
                .ok_or_else(|| out_of_range(text))?;
        }
    }
    mem.disp = i32::try_from(disp).map_err(|_| out_of_range(text))?;
    Ok(mem)
}

fn out_of_range(text: &str) -> String {
    format!("displacement out of range in [{}]", text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tiers() {
        let block = parse_block(
            "# carry chain\n\
             ADD R0, R3\n\
             ADD3 R2, R0, R1   # fused\n\
             LEA4 R0, [R1+16], R2, 4\n\
             NEG R5\n\
             RET\n",
        )
        .unwrap();
        assert_eq!(block.len(), 5);
        assert_eq!(block[0], Instruction::op2(Op2::ADD, Reg(0), Reg(3)));
        assert_eq!(block[1], Instruction::op3(Op3::ADD3, Reg(2), Reg(0), Reg(1)));
        assert_eq!(
            block[2],
            Instruction::op4(Op4::LEA4, Reg(0), Mem::base(Reg(1)).with_disp(16), Reg(2), 4)
        );
        assert_eq!(block[3], Instruction::op1(Op1::NEG, Reg(5)));
        assert_eq!(block[4], Instruction::op0(Op0::RET));
    }

    #[test]
    fn test_display_round_trip() {
        let samples = vec![
            Instruction::op2(Op2::LEA, Reg(2), Mem::base(Reg(0)).with_index(Reg(1), 1)),
            Instruction::op2(
                Op2::MOV,
                Mem::base(Reg(3)).with_index(Reg(4), 8).with_disp(-16),
                Operand::Imm(-7),
            ),
            Instruction::op2(Op2::MOV, Reg(1), Mem::default().with_disp(4096)),
            Instruction::op1(Op1(9), Reg(0)),
            Instruction::op3(Op3::AND_NOT3, Reg(1), Reg(2), Operand::Imm(0xff)),
        ];
        for ins in samples {
            assert_eq!(parse_instruction(&ins.to_string()).unwrap(), ins);
        }
    }

    #[test]
    fn test_quo_alias_and_hex() {
        assert_eq!(
            parse_instruction("QUO R1, 0x10").unwrap(),
            Instruction::op2(Op2::DIV, Reg(1), Operand::Imm(16))
        );
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_block("NOP\nADD R0\n").unwrap_err();
        assert_eq!(
            err,
            LowerError::ParseError {
                line: 2,
                message: "ADD takes 2 operands, got 1".to_string()
            }
        );
        assert!(parse_block("FROB R0").is_err());
        assert!(parse_block("MOV R0, [R1").is_err());
        assert!(parse_block("MOV R999, R1").is_err());
    }

    #[test]
    fn test_displacement_overflow_is_an_error() {
        for line in [
            "MOV R0, [0x7fffffffffffffff+0x7fffffffffffffff]",
            "MOV R0, [-0x7fffffffffffffff-0x7fffffffffffffff]",
            "MOV R0, [R1+0x80000000]",
        ] {
            let err = parse_instruction(line).unwrap_err();
            assert!(err.starts_with("displacement out of range"), "{}: {}", line, err);
        }
        assert!(parse_instruction("MOV R0, --170141183460469231731687303715884105728").is_err());
        assert_eq!(
            parse_instruction("MOV R0, [R1+0x7fffffffffffffff-0x7fffffffffffff00]").unwrap(),
            Instruction::op2(Op2::MOV, Reg(0), Mem::base(Reg(1)).with_disp(0xff))
        );
    }

    #[test]
    fn test_parse_blocks() {
        let blocks = parse_blocks("ADD R0, R1\n---\nSUB3 R0, R0, R1\nRET\n").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].len(), 2);
        let err = parse_blocks("NOP\n---\nNOP\nBAD\n").unwrap_err();
        assert!(matches!(err, LowerError::ParseError { line: 4, .. }));
    }
}
