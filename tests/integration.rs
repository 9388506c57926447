use lowerforge::ir::Reg;
use lowerforge::parser::{parse_block, parse_instruction};
use lowerforge::{Lowerer, TargetDescriptor};
use std::fs;
use std::path::Path;

const EXPECT: &str = "==>";

/// `#! target <name>` picks the target a listing is lowered for.
fn target_for(content: &str) -> Result<TargetDescriptor, String> {
    let name = content
        .lines()
        .find_map(|l| l.trim().strip_prefix("#! target"))
        .map(str::trim)
        .unwrap_or("amd64");
    match name {
        "amd64" => Ok(TargetDescriptor::amd64()),
        "amd64-scratch" => Ok(TargetDescriptor::amd64_with_scratch(Reg(15))),
        "minimal" => Ok(TargetDescriptor::minimal()),
        other => Err(format!("unknown target '{}'", other)),
    }
}

fn run_test_file(path: &Path) -> Result<(), String> {
    println!("Running test: {:?}", path);
    let content = fs::read_to_string(path).map_err(|e| e.to_string())?;

    let (input, expected) = content
        .split_once(EXPECT)
        .ok_or_else(|| format!("missing '{}' line", EXPECT))?;

    let target = target_for(&content)?;
    let lowerer = Lowerer::new(target).map_err(|e| format!("Target Error: {}", e))?;
    let block = parse_block(input).map_err(|e| format!("Parse Error: {}", e))?;
    let result = lowerer.lower_block(&block);

    let expected = expected.trim();
    if let Some(kind) = expected.strip_prefix('!') {
        return match result {
            Err(e) if e.kind() == kind.trim() => Ok(()),
            Err(e) => Err(format!("expected {} error, got {}", kind.trim(), e)),
            Ok(out) => Err(format!("expected {} error, got:\n{}", kind.trim(), out)),
        };
    }

    let out = result.map_err(|e| format!("Lowering Error: {}", e))?;
    let want = parse_block(expected).map_err(|e| format!("Expected block: {}", e))?;
    let got = out.into_instructions();
    if got != want {
        let show = |v: &[lowerforge::Instruction]| {
            v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("\n")
        };
        return Err(format!("expected:\n{}\ngot:\n{}", show(&want), show(&got)));
    }

    // lowered text must read back as the same instructions
    for ins in &got {
        let again = parse_instruction(&ins.to_string())?;
        if &again != ins {
            return Err(format!("{} does not round-trip", ins));
        }
    }
    Ok(())
}

#[test]
fn run_all_programs() {
    let test_dir = Path::new("tests/programs");
    if !test_dir.exists() {
        panic!("tests/programs directory not found at {:?}", std::env::current_dir());
    }

    let mut failures = Vec::new();
    let mut count = 0;

    for entry in fs::read_dir(test_dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("blk") {
            count += 1;
            if let Err(e) = run_test_file(&path) {
                failures.push((path, e));
            }
        }
    }

    assert!(count > 0, "no .blk listings found");
    if !failures.is_empty() {
        for (path, err) in &failures {
            println!("FAILED: {:?}\n{}", path, err);
        }
        panic!("{} of {} listings failed", failures.len(), count);
    }
}
