//! Convolution compiler: JIT compilation of one forward convolution.
//!
//! # Pipeline
//!
//! ```text
//! ShapeParameters → BlockingPlan → Codegen → ConvKernel
//!                       ↑              ↑
//!                   planner.rs     codegen/
//!                                  conv_fwd.rs
//!                                  x86_64.rs
//! ```
//!
//! Planning and emission are synchronous. The resulting `ConvKernel` is
//! immutable and can be invoked concurrently for disjoint outputs.

pub mod call;
pub mod codegen;
pub mod disasm;
pub mod executable;
pub mod hw_constraints;
pub mod planner;
pub mod shape;

pub use call::CallDescriptor;
pub use codegen::CodegenOutput;
pub use executable::{ConvKernel, ConvKernelFn};
pub use planner::{BlockingPlan, InputAddressing, TileLayout, TileSpec, WidthStrategy};

use std::env;

use crate::types::{ConvError, ConvResult};
use shape::ShapeParameters;

/// Environment variable enabling disassembly dumps of compiled kernels.
pub const DUMP_ENV: &str = "CONV_JIT_DUMP";

/// Compilation options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Keep a NASM listing on the kernel and log it at trace level.
    pub dump_listing: bool,
}

impl CompileOptions {
    pub fn from_env() -> Self {
        let dump_listing = env::var(DUMP_ENV).map(|v| parse_flag(&v)).unwrap_or(false);
        CompileOptions { dump_listing }
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// The convolution compiler: plans shapes and emits kernels.
#[derive(Debug, Clone, Default)]
pub struct ConvCompiler {
    options: CompileOptions,
}

impl ConvCompiler {
    /// Create a compiler configured from the environment.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: CompileOptions) -> Self {
        ConvCompiler { options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Validate `shape` and derive its blocking plan.
    pub fn plan(&self, shape: &ShapeParameters) -> ConvResult<BlockingPlan> {
        Ok(planner::plan(shape)?)
    }

    /// Plan and compile `shape`.
    pub fn compile(&self, shape: &ShapeParameters) -> ConvResult<ConvKernel> {
        let plan = self.plan(shape)?;
        self.compile_plan(plan)
    }

    /// Emit the kernel for an already derived plan.
    pub fn compile_plan(&self, plan: BlockingPlan) -> ConvResult<ConvKernel> {
        let output = codegen::generate(&plan).map_err(ConvError::Codegen)?;
        log::debug!(
            "conv kernel compiled: {} bytes, {} middle tiles, nb_oc_blocking={}",
            output.code.len(),
            plan.tiles.n_middle,
            plan.nb_oc_blocking
        );

        let kernel = ConvKernel::from_code(&output.code, plan)?;
        if !self.options.dump_listing {
            return Ok(kernel);
        }
        let listing = disasm::listing(&output.code);
        log::trace!("conv kernel listing:\n{listing}");
        Ok(kernel.with_listing(listing))
    }
}

/// Compile `shape` with options taken from the environment.
pub fn compile(shape: &ShapeParameters) -> ConvResult<ConvKernel> {
    ConvCompiler::new().compile(shape)
}
