//! conv-jit-kernels: JIT-generated AVX2/FMA forward convolution kernels.
//!
//! Given the shape of a single 2-D forward convolution, the crate derives a
//! register-fitting blocking plan and emits a specialized x86_64 instruction
//! stream that computes exactly that convolution:
//!
//! - **Planner**: validates shapes/layouts and derives the tiling
//!   (`compiler::planner`). Unsupported shapes are rejected with a diagnostic.
//! - **Emitter**: compiles a plan once into an executable code object
//!   (`compiler::codegen`), invoked many times with per-call descriptors.
//! - **Driver**: a minimal forward pass over caller-owned buffers
//!   (`driver`), sequential or `rayon`-parallel.
//!
//! # Quick Start
//!
//! ```ignore
//! use conv_jit_kernels::{ConvolutionForward, ShapeParameters};
//!
//! let shape = ShapeParameters::blocked(1, 16, 32, 32, 32, 3, 3).with_padding(1, 1);
//! let conv = ConvolutionForward::new(&shape)?;
//! conv.execute(&src, &weights, None, &mut dst)?;
//! ```

#[cfg(not(unix))]
compile_error!("conv-jit-kernels maps executable memory with mmap and only builds on unix targets");

pub mod compiler;
pub mod dispatch;
pub mod driver;
pub mod types;

pub use compiler::{
    compile, BlockingPlan, CallDescriptor, CompileOptions, ConvCompiler, ConvKernel, TileLayout,
    TileSpec, WidthStrategy,
};
pub use compiler::shape::{Activation, MemoryFormat, ShapeParameters};
pub use driver::ConvolutionForward;
pub use types::{ConvError, ConvResult, UnimplementedReason};
