//! Vector register assignment for one output tile.
//!
//! Accumulators occupy the low registers row-major by output-channel block,
//! the per-column broadcasts follow them, and ymm15 holds the current weight
//! vector. The activation epilogue reuses the top three registers once the
//! broadcasts and the weight are dead.

use super::simd_ops::VReg;
use crate::compiler::hw_constraints::{RegisterBudget, NUM_VECTOR_REGS};

/// Current weight vector during accumulation.
pub const WEIGHT: VReg = VReg(NUM_VECTOR_REGS as u8 - 1);

/// Zero constant of the activation epilogue.
pub const ACT_ZERO: VReg = VReg(NUM_VECTOR_REGS as u8 - 1);
/// Negative-slope constant of the activation epilogue.
pub const ACT_SLOPE: VReg = VReg(NUM_VECTOR_REGS as u8 - 2);
/// Scratch register of the activation epilogue.
pub const ACT_TMP: VReg = VReg(NUM_VECTOR_REGS as u8 - 3);

/// `rows × cols` accumulator grid: one row per output-channel block, one
/// column per unrolled output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorGrid {
    rows: usize,
    cols: usize,
}

impl AccumulatorGrid {
    /// Panics if the grid does not fit the register file; the planner never
    /// produces such a tile.
    pub fn new(rows: usize, cols: usize, with_activation: bool) -> Self {
        let budget = RegisterBudget::for_tile(rows, cols, with_activation);
        assert!(
            budget.validate().is_ok(),
            "{rows}x{cols} accumulator grid exceeds the register file ({budget:?})"
        );
        AccumulatorGrid { rows, cols }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn acc(&self, ii: usize, jj: usize) -> VReg {
        debug_assert!(ii < self.rows && jj < self.cols);
        VReg((self.cols * ii + jj) as u8)
    }

    /// Broadcast input scalar for output column `jj`.
    pub fn broadcast(&self, jj: usize) -> VReg {
        debug_assert!(jj < self.cols);
        VReg((self.rows * self.cols + jj) as u8)
    }

    /// Every `(ii, jj)` slot in row-major order.
    pub fn slots(&self) -> impl Iterator<Item = (usize, usize)> {
        let cols = self.cols;
        (0..self.rows).flat_map(move |ii| (0..cols).map(move |jj| (ii, jj)))
    }
}
