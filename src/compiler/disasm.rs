//! Disassembly of generated kernels, for debugging dumps and tests.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, Mnemonic, NasmFormatter, OpKind};

/// Instruction counts of a generated kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeStats {
    pub instructions: usize,
    pub fma: usize,
    /// Scalar broadcasts from memory.
    pub broadcasts: usize,
    pub vector_loads: usize,
    pub vector_stores: usize,
    /// Conditional branches to a lower address (loop back-edges).
    pub backward_branches: usize,
}

fn decode(code: &[u8]) -> impl Iterator<Item = Instruction> + '_ {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    std::iter::from_fn(move || decoder.can_decode().then(|| decoder.decode()))
}

/// NASM-syntax listing, one `offset  instruction` line per instruction.
pub fn listing(code: &[u8]) -> String {
    let mut formatter = NasmFormatter::new();
    let mut out = String::new();
    let mut text = String::new();
    for instr in decode(code) {
        text.clear();
        formatter.format(&instr, &mut text);
        out.push_str(&format!("{:06x}  {}\n", instr.ip(), text));
    }
    out
}

pub fn stats(code: &[u8]) -> CodeStats {
    let mut s = CodeStats::default();
    for instr in decode(code) {
        s.instructions += 1;
        match instr.mnemonic() {
            Mnemonic::Vfmadd231ps => s.fma += 1,
            Mnemonic::Vbroadcastss if instr.op_kind(1) == OpKind::Memory => s.broadcasts += 1,
            Mnemonic::Vmovups if instr.op_kind(1) == OpKind::Memory => s.vector_loads += 1,
            Mnemonic::Vmovups if instr.op_kind(0) == OpKind::Memory => s.vector_stores += 1,
            _ => {}
        }
        if instr.is_jcc_short_or_near() && instr.near_branch_target() < instr.ip() {
            s.backward_branches += 1;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    // vfmadd231ps ymm0, ymm1, ymm2 ; vmovups [rax], ymm0 ; ret
    const SNIPPET: [u8; 10] = [0xC4, 0xE2, 0x75, 0xB8, 0xC2, 0xC5, 0xFC, 0x11, 0x00, 0xC3];

    #[test]
    fn test_stats_counts_snippet() {
        let s = stats(&SNIPPET);
        assert_eq!(s.instructions, 3);
        assert_eq!(s.fma, 1);
        assert_eq!(s.vector_stores, 1);
        assert_eq!(s.vector_loads, 0);
    }

    #[test]
    fn test_listing_format() {
        let text = listing(&SNIPPET);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("000000  vfmadd231ps"));
        assert!(lines[2].ends_with("ret"));
    }

    #[test]
    fn test_backward_branch_detected() {
        // top: dec r12 ; jne top
        let code = [0x49, 0xFF, 0xCC, 0x75, 0xFB];
        assert_eq!(stats(&code).backward_branches, 1);
    }
}
