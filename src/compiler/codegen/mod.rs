//! Code generation for planned convolutions.
//!
//! `conv_fwd` drives the kernel algorithm through the `SimdOps` trait;
//! `x86_64` lowers it to AVX2/FMA machine code with iced-x86.

pub mod conv_fwd;
pub mod registers;
pub mod simd_ops;
pub mod x86_64;

use crate::compiler::planner::BlockingPlan;
use simd_ops::SimdOps;

/// Output of code generation: raw machine code bytes.
pub struct CodegenOutput {
    /// Raw, position-independent machine code.
    pub code: Vec<u8>,
}

/// Generate the kernel for `plan`.
pub fn generate(plan: &BlockingPlan) -> Result<CodegenOutput, String> {
    let mut cg = x86_64::X86CodeGen::new()?;
    conv_fwd::emit_conv_fwd(&mut cg, plan)?;
    log::trace!("conv kernel: {} instructions emitted", cg.instruction_count());
    cg.finalize()
}
