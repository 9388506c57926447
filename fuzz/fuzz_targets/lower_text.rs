#![no_main]

use libfuzzer_sys::fuzz_target;
use lowerforge::parser::{parse_block, parse_instruction};
use lowerforge::{Lowerer, TargetDescriptor};

fuzz_target!(|data: &[u8]| {
    let text = match std::str::from_utf8(data) {
        Ok(t) => t,
        Err(_) => return,
    };
    let block = match parse_block(text) {
        Ok(b) => b,
        Err(_) => return,
    };
    let lowerer = match Lowerer::new(TargetDescriptor::amd64()) {
        Ok(l) => l,
        Err(_) => return,
    };
    if let Ok(out) = lowerer.lower_block(&block) {
        for lowered in out.iter() {
            assert!(lowered.instruction.tier() <= 2);
            assert!(lowered.origin < block.len());
            let text = lowered.instruction.to_string();
            assert_eq!(parse_instruction(&text).as_ref(), Ok(&lowered.instruction));
        }
    }
});
