//! Vector register budget for the AVX2 convolution kernel.
//!
//! The kernel keeps an `nb_oc_blocking × ur_w` grid of accumulators resident
//! in ymm registers. During accumulation it additionally needs one broadcast
//! register per output column and one register for the current weight
//! vector; the activation epilogue needs a zero constant, the negative-slope
//! constant and one temporary.

/// f32 lanes per ymm register.
pub const SIMD_W_F32: usize = 8;

/// Architectural ymm registers available without AVX-512.
pub const NUM_VECTOR_REGS: usize = 16;

/// Registers holding the current weight vector during accumulation.
pub const WEIGHT_REGS: usize = 1;

/// Scratch registers used by the activation epilogue.
pub const ACTIVATION_SCRATCH_REGS: usize = 3;

/// A specific hardware constraint that was violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintViolation {
    /// Register pressure exceeds available SIMD registers.
    RegisterPressure { needed: usize, available: usize },
}

/// Register usage of one output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBudget {
    pub accumulators: usize,
    pub broadcast: usize,
    pub weight: usize,
    pub activation_scratch: usize,
}

impl RegisterBudget {
    pub fn for_tile(nb_oc_blocking: usize, ur_w: usize, with_activation: bool) -> Self {
        RegisterBudget {
            accumulators: nb_oc_blocking * ur_w,
            broadcast: ur_w,
            weight: WEIGHT_REGS,
            activation_scratch: if with_activation { ACTIVATION_SCRATCH_REGS } else { 0 },
        }
    }

    /// Registers that never hold accumulators while the tap loop runs.
    pub fn reserved(&self) -> usize {
        self.broadcast + self.weight
    }

    /// Live registers inside the accumulation loop.
    pub fn accumulate_pressure(&self) -> usize {
        self.accumulators + self.reserved()
    }

    /// Live registers inside the activation epilogue.
    pub fn epilogue_pressure(&self) -> usize {
        self.accumulators + self.activation_scratch
    }

    pub fn peak(&self) -> usize {
        self.accumulate_pressure().max(self.epilogue_pressure())
    }

    pub fn validate(&self) -> Result<(), ConstraintViolation> {
        let needed = self.peak();
        if needed > NUM_VECTOR_REGS {
            return Err(ConstraintViolation::RegisterPressure {
                needed,
                available: NUM_VECTOR_REGS,
            });
        }
        Ok(())
    }
}
