//! SimdOps trait: virtual instruction set the convolution algorithm emits through.
//!
//! The algorithm layer (`conv_fwd.rs`) generates code by calling methods on
//! `SimdOps`. The x86_64 backend maps every call to real AVX2/FMA
//! instructions. `VReg` indices map to ymm registers, `BaseReg` names
//! general-purpose registers by role.

use super::CodegenOutput;

// ── Virtual register model ──────────────────────────────────────────────────

/// Virtual SIMD register, an index mapped to a physical register by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(pub u8);

/// General-purpose registers by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseReg {
    /// Pointer to the `CallDescriptor`.
    Param,
    /// Input pointer of the current tile.
    Src,
    /// Output pointer of the current tile.
    Dst,
    /// Filter pointer of the first output-channel block.
    Filt,
    /// Bias pointer of the first output-channel block.
    Bias,
    /// Input pointer of the current kernel row/tap.
    AuxSrc,
    /// Filter pointer of the current kernel row/tap.
    AuxFilt,
    /// Loop counter (backend allocates a callee-saved GPR).
    /// 0=kernel rows, 1=middle tiles, 2=kernel taps
    LoopVar(u8),
}

/// Memory operand for load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: BaseReg,
    pub offset: i32,
}

impl MemOperand {
    pub fn new(base: BaseReg, offset: i32) -> Self {
        MemOperand { base, offset }
    }
}

/// Label for branch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

// ── SimdOps trait ───────────────────────────────────────────────────────────

/// Platform-agnostic SIMD instruction interface.
pub trait SimdOps {
    // ── Vector arithmetic ───────────────────────────────────────────────

    /// dst = max(a, b)
    fn vmax(&mut self, dst: VReg, a: VReg, b: VReg) -> Result<(), String>;
    /// dst = min(a, b)
    fn vmin(&mut self, dst: VReg, a: VReg, b: VReg) -> Result<(), String>;
    /// dst = a * b + dst  (accumulating FMA)
    fn vfmadd231(&mut self, dst: VReg, a: VReg, b: VReg) -> Result<(), String>;

    // ── Memory operations ───────────────────────────────────────────────

    /// dst = load SIMD vector from memory
    fn vload(&mut self, dst: VReg, mem: MemOperand) -> Result<(), String>;
    /// store SIMD vector to memory
    fn vstore(&mut self, mem: MemOperand, src: VReg) -> Result<(), String>;
    /// dst = broadcast scalar f32 from memory to all lanes
    fn vbroadcast(&mut self, dst: VReg, mem: MemOperand) -> Result<(), String>;
    /// dst = broadcast compile-time f32 constant to all lanes
    fn vbroadcast_const(&mut self, dst: VReg, val: f32) -> Result<(), String>;
    /// dst = all zeros
    fn vzero(&mut self, dst: VReg) -> Result<(), String>;

    // ── Control flow ────────────────────────────────────────────────────

    /// Allocate a new label (returns unique label ID).
    fn alloc_label(&mut self) -> Label;
    /// Define a label at the current code position.
    fn define_label(&mut self, label: Label) -> Result<(), String>;
    /// Unconditional jump to label.
    fn jump(&mut self, label: Label) -> Result<(), String>;
    /// Branch to label if the byte at `mem` is non-zero.
    fn branch_if_flag_set(&mut self, mem: MemOperand, label: Label) -> Result<(), String>;
    /// Branch to label if the byte at `mem` is zero.
    fn branch_if_flag_clear(&mut self, mem: MemOperand, label: Label) -> Result<(), String>;
    /// Branch to label if GPR is zero.
    fn branch_if_zero(&mut self, reg: BaseReg, label: Label) -> Result<(), String>;
    /// Decrement GPR and branch to label if non-zero.
    fn dec_and_branch_nz(&mut self, counter: BaseReg, label: Label) -> Result<(), String>;

    // ── GPR operations ──────────────────────────────────────────────────

    /// Load a 64-bit value from memory into GPR.
    fn gpr_load(&mut self, dst: BaseReg, mem: MemOperand) -> Result<(), String>;
    /// Load immediate value into GPR.
    fn gpr_load_imm(&mut self, dst: BaseReg, imm: u64) -> Result<(), String>;
    /// dst = dst + imm
    fn gpr_add_imm(&mut self, dst: BaseReg, imm: i32) -> Result<(), String>;
    /// dst = src
    fn gpr_mov(&mut self, dst: BaseReg, src: BaseReg) -> Result<(), String>;

    // ── Function frame ──────────────────────────────────────────────────

    /// Emit function prologue (save callee-saved registers).
    fn emit_prologue(&mut self) -> Result<(), String>;
    /// Emit function epilogue (restore registers, return).
    fn emit_epilogue(&mut self) -> Result<(), String>;
    /// Finalize code generation and return assembled machine code.
    fn finalize(&mut self) -> Result<CodegenOutput, String>;
}
