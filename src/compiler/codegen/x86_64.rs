//! x86_64 JIT code generation via iced-x86 CodeAssembler (AVX2 + FMA).
//!
//! Register convention (System V AMD64 ABI, leaf function):
//! - rdi = `*const CallDescriptor`
//! - r8 = src, r9 = dst, r10 = filter, r11 = bias
//! - rax = per-row src, rcx = per-row filter, edx = constant staging
//! - r12, r13, r14 = loop counters (callee-saved, pushed in the prologue)
//! - ymm0..ymm15 = `VReg(0..16)`

use iced_x86::code_asm::*;
use iced_x86::IcedError;

use super::simd_ops::{BaseReg, Label, MemOperand, SimdOps, VReg};
use super::CodegenOutput;

/// Callee-saved registers used as loop counters, in push order.
const SAVED_GPRS: [AsmRegister64; 3] = [r12, r13, r14];

/// Map ymm index 0..15 to iced-x86 AsmRegisterYmm.
pub fn ymm_reg(idx: u8) -> Result<AsmRegisterYmm, String> {
    match idx {
        0 => Ok(ymm0),
        1 => Ok(ymm1),
        2 => Ok(ymm2),
        3 => Ok(ymm3),
        4 => Ok(ymm4),
        5 => Ok(ymm5),
        6 => Ok(ymm6),
        7 => Ok(ymm7),
        8 => Ok(ymm8),
        9 => Ok(ymm9),
        10 => Ok(ymm10),
        11 => Ok(ymm11),
        12 => Ok(ymm12),
        13 => Ok(ymm13),
        14 => Ok(ymm14),
        15 => Ok(ymm15),
        _ => Err(format!("ymm index {idx} out of range (0..15)")),
    }
}

fn xmm_reg(idx: u8) -> Result<AsmRegisterXmm, String> {
    match idx {
        0 => Ok(xmm0),
        1 => Ok(xmm1),
        2 => Ok(xmm2),
        3 => Ok(xmm3),
        4 => Ok(xmm4),
        5 => Ok(xmm5),
        6 => Ok(xmm6),
        7 => Ok(xmm7),
        8 => Ok(xmm8),
        9 => Ok(xmm9),
        10 => Ok(xmm10),
        11 => Ok(xmm11),
        12 => Ok(xmm12),
        13 => Ok(xmm13),
        14 => Ok(xmm14),
        15 => Ok(xmm15),
        _ => Err(format!("xmm index {idx} out of range (0..15)")),
    }
}

/// Map a role to its general-purpose register.
pub fn gpr(base: BaseReg) -> Result<AsmRegister64, String> {
    match base {
        BaseReg::Param => Ok(rdi),
        BaseReg::Src => Ok(r8),
        BaseReg::Dst => Ok(r9),
        BaseReg::Filt => Ok(r10),
        BaseReg::Bias => Ok(r11),
        BaseReg::AuxSrc => Ok(rax),
        BaseReg::AuxFilt => Ok(rcx),
        BaseReg::LoopVar(n) => SAVED_GPRS
            .get(n as usize)
            .copied()
            .ok_or_else(|| format!("loop variable {n} has no register")),
    }
}

fn err(e: IcedError) -> String {
    e.to_string()
}

/// AVX2/FMA code generator backed by iced-x86.
pub struct X86CodeGen {
    asm: CodeAssembler,
    labels: Vec<CodeLabel>,
    /// A label was defined and no instruction has followed it yet.
    label_pending: bool,
}

impl X86CodeGen {
    pub fn new() -> Result<Self, String> {
        Ok(X86CodeGen {
            asm: CodeAssembler::new(64).map_err(err)?,
            labels: Vec::new(),
            label_pending: false,
        })
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.asm.instructions().len()
    }

    fn emit<F>(&mut self, f: F) -> Result<(), String>
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    {
        f(&mut self.asm).map_err(err)?;
        self.label_pending = false;
        Ok(())
    }

    fn mem(mem: MemOperand) -> Result<AsmMemoryOperand, String> {
        Ok(gpr(mem.base)? + mem.offset)
    }

    fn label(&self, label: Label) -> Result<CodeLabel, String> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .ok_or_else(|| format!("label {} was never allocated", label.0))
    }
}

impl SimdOps for X86CodeGen {
    // ── Vector arithmetic ───────────────────────────────────────

    fn vmax(&mut self, dst: VReg, a: VReg, b: VReg) -> Result<(), String> {
        let (d, a, b) = (ymm_reg(dst.0)?, ymm_reg(a.0)?, ymm_reg(b.0)?);
        self.emit(|asm| asm.vmaxps(d, a, b))
    }

    fn vmin(&mut self, dst: VReg, a: VReg, b: VReg) -> Result<(), String> {
        let (d, a, b) = (ymm_reg(dst.0)?, ymm_reg(a.0)?, ymm_reg(b.0)?);
        self.emit(|asm| asm.vminps(d, a, b))
    }

    fn vfmadd231(&mut self, dst: VReg, a: VReg, b: VReg) -> Result<(), String> {
        let (d, a, b) = (ymm_reg(dst.0)?, ymm_reg(a.0)?, ymm_reg(b.0)?);
        self.emit(|asm| asm.vfmadd231ps(d, a, b))
    }

    // ── Memory operations ───────────────────────────────────────

    fn vload(&mut self, dst: VReg, mem: MemOperand) -> Result<(), String> {
        let (d, m) = (ymm_reg(dst.0)?, Self::mem(mem)?);
        self.emit(|asm| asm.vmovups(d, ymmword_ptr(m)))
    }

    fn vstore(&mut self, mem: MemOperand, src: VReg) -> Result<(), String> {
        let (s, m) = (ymm_reg(src.0)?, Self::mem(mem)?);
        self.emit(|asm| asm.vmovups(ymmword_ptr(m), s))
    }

    fn vbroadcast(&mut self, dst: VReg, mem: MemOperand) -> Result<(), String> {
        let (d, m) = (ymm_reg(dst.0)?, Self::mem(mem)?);
        self.emit(|asm| asm.vbroadcastss(d, dword_ptr(m)))
    }

    fn vbroadcast_const(&mut self, dst: VReg, val: f32) -> Result<(), String> {
        let (d, x) = (ymm_reg(dst.0)?, xmm_reg(dst.0)?);
        let bits = val.to_bits() as i32;
        self.emit(|asm| {
            asm.mov(edx, bits)?;
            asm.vmovd(x, edx)?;
            asm.vbroadcastss(d, x)
        })
    }

    fn vzero(&mut self, dst: VReg) -> Result<(), String> {
        let d = ymm_reg(dst.0)?;
        self.emit(|asm| asm.vxorps(d, d, d))
    }

    // ── Control flow ────────────────────────────────────────────

    fn alloc_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        let label = self.asm.create_label();
        self.labels.push(label);
        Label(id)
    }

    fn define_label(&mut self, label: Label) -> Result<(), String> {
        // iced-x86 binds one label per instruction.
        if self.label_pending {
            self.emit(|asm| asm.nop())?;
        }
        let mut code_label = self.label(label)?;
        self.asm.set_label(&mut code_label).map_err(err)?;
        self.labels[label.0 as usize] = code_label;
        self.label_pending = true;
        Ok(())
    }

    fn jump(&mut self, label: Label) -> Result<(), String> {
        let l = self.label(label)?;
        self.emit(|asm| asm.jmp(l))
    }

    fn branch_if_flag_set(&mut self, mem: MemOperand, label: Label) -> Result<(), String> {
        let (m, l) = (Self::mem(mem)?, self.label(label)?);
        self.emit(|asm| {
            asm.cmp(byte_ptr(m), 0)?;
            asm.jne(l)
        })
    }

    fn branch_if_flag_clear(&mut self, mem: MemOperand, label: Label) -> Result<(), String> {
        let (m, l) = (Self::mem(mem)?, self.label(label)?);
        self.emit(|asm| {
            asm.cmp(byte_ptr(m), 0)?;
            asm.je(l)
        })
    }

    fn branch_if_zero(&mut self, reg: BaseReg, label: Label) -> Result<(), String> {
        let (r, l) = (gpr(reg)?, self.label(label)?);
        self.emit(|asm| {
            asm.test(r, r)?;
            asm.je(l)
        })
    }

    fn dec_and_branch_nz(&mut self, counter: BaseReg, label: Label) -> Result<(), String> {
        let (r, l) = (gpr(counter)?, self.label(label)?);
        self.emit(|asm| {
            asm.dec(r)?;
            asm.jne(l)
        })
    }

    // ── GPR operations ──────────────────────────────────────────

    fn gpr_load(&mut self, dst: BaseReg, mem: MemOperand) -> Result<(), String> {
        let (d, m) = (gpr(dst)?, Self::mem(mem)?);
        self.emit(|asm| asm.mov(d, qword_ptr(m)))
    }

    fn gpr_load_imm(&mut self, dst: BaseReg, imm: u64) -> Result<(), String> {
        let d = gpr(dst)?;
        self.emit(|asm| asm.mov(d, imm))
    }

    fn gpr_add_imm(&mut self, dst: BaseReg, imm: i32) -> Result<(), String> {
        if imm == 0 {
            return Ok(());
        }
        let d = gpr(dst)?;
        self.emit(|asm| asm.add(d, imm))
    }

    fn gpr_mov(&mut self, dst: BaseReg, src: BaseReg) -> Result<(), String> {
        let (d, s) = (gpr(dst)?, gpr(src)?);
        self.emit(|asm| asm.mov(d, s))
    }

    // ── Function frame ──────────────────────────────────────────

    fn emit_prologue(&mut self) -> Result<(), String> {
        self.emit(|asm| {
            for r in SAVED_GPRS {
                asm.push(r)?;
            }
            Ok(())
        })
    }

    fn emit_epilogue(&mut self) -> Result<(), String> {
        self.emit(|asm| {
            asm.vzeroupper()?;
            for r in SAVED_GPRS.iter().rev() {
                asm.pop(*r)?;
            }
            asm.ret()
        })
    }

    fn finalize(&mut self) -> Result<CodegenOutput, String> {
        // Only relative branches are emitted, so the code is position independent.
        let code = self.asm.assemble(0).map_err(err)?;
        Ok(CodegenOutput { code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ymm_reg_mapping() {
        for i in 0..16u8 {
            assert!(ymm_reg(i).is_ok());
        }
        assert!(ymm_reg(16).is_err());
    }

    #[test]
    fn test_gpr_roles_are_distinct() {
        let roles = [
            BaseReg::Param,
            BaseReg::Src,
            BaseReg::Dst,
            BaseReg::Filt,
            BaseReg::Bias,
            BaseReg::AuxSrc,
            BaseReg::AuxFilt,
            BaseReg::LoopVar(0),
            BaseReg::LoopVar(1),
            BaseReg::LoopVar(2),
        ];
        let regs: Vec<_> = roles.iter().map(|r| gpr(*r).unwrap()).collect();
        for (i, a) in regs.iter().enumerate() {
            for b in &regs[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(gpr(BaseReg::LoopVar(3)).is_err());
    }

    #[test]
    fn test_frame_assembles() {
        let mut cg = X86CodeGen::new().unwrap();
        cg.emit_prologue().unwrap();
        cg.vzero(VReg(0)).unwrap();
        cg.emit_epilogue().unwrap();
        let out = cg.finalize().unwrap();
        assert_eq!(*out.code.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_back_to_back_labels_assemble() {
        let mut cg = X86CodeGen::new().unwrap();
        let a = cg.alloc_label();
        let b = cg.alloc_label();
        cg.emit_prologue().unwrap();
        cg.branch_if_zero(BaseReg::Src, b).unwrap();
        cg.define_label(a).unwrap();
        cg.define_label(b).unwrap();
        cg.emit_epilogue().unwrap();
        assert!(cg.finalize().is_ok());
    }

    #[test]
    fn test_unallocated_label_is_error() {
        let mut cg = X86CodeGen::new().unwrap();
        assert!(cg.jump(Label(7)).is_err());
    }

    #[test]
    fn test_zero_add_is_elided() {
        let mut cg = X86CodeGen::new().unwrap();
        cg.gpr_add_imm(BaseReg::Src, 0).unwrap();
        assert_eq!(cg.instruction_count(), 0);
        cg.gpr_add_imm(BaseReg::Src, 32).unwrap();
        assert_eq!(cg.instruction_count(), 1);
    }
}
