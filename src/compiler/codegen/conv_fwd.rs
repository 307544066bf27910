//! Forward convolution kernel emission.
//!
//! One generated function computes one output row for `nb_oc_blocking`
//! output-channel blocks, accumulating one input-channel block over the
//! `kh_padding` kernel rows given in the call descriptor. The row is walked
//! tile by tile as laid out by the planner:
//!
//! ```text
//!   [left] [middle x n_middle (runtime loop)] [right] [tail]
//! ```
//!
//! Inside a tile the accumulators stay in registers; padded input columns
//! are skipped at emission time, so the generated code never reads outside
//! the input row.

use super::registers::{AccumulatorGrid, ACT_SLOPE, ACT_TMP, ACT_ZERO, WEIGHT};
use super::simd_ops::{BaseReg, MemOperand, SimdOps};
use crate::compiler::call::offsets;
use crate::compiler::planner::{overhang_cols, BlockingPlan, TileSpec, WidthStrategy};
use crate::compiler::shape::Activation;

const F32_BYTES: isize = std::mem::size_of::<f32>() as isize;

/// Element count to an immediate byte displacement.
fn bytes(elems: isize) -> Result<i32, String> {
    elems
        .checked_mul(F32_BYTES)
        .and_then(|b| i32::try_from(b).ok())
        .ok_or_else(|| format!("displacement of {elems} elements does not fit in 32 bits"))
}

fn mem(base: BaseReg, elems: isize) -> Result<MemOperand, String> {
    Ok(MemOperand::new(base, bytes(elems)?))
}

fn param(offset: i32) -> MemOperand {
    MemOperand::new(BaseReg::Param, offset)
}

/// Emit the complete kernel function for `plan`.
pub fn emit_conv_fwd<E: SimdOps>(e: &mut E, plan: &BlockingPlan) -> Result<(), String> {
    assert_eq!(
        plan.tiles.covered_width(plan.ur_w),
        plan.ow,
        "tile layout {:?} does not cover the output row",
        plan.tiles
    );
    let col_stride = plan.src_addressing.col_stride() as isize;
    let ur_w = plan.ur_w as isize;
    let sw = plan.stride_w as isize;
    let src_step = ur_w * sw * col_stride;
    let dst_step = ur_w * plan.oc_block as isize;

    e.emit_prologue()?;
    e.gpr_load(BaseReg::Src, param(offsets::SRC))?;
    e.gpr_load(BaseReg::Dst, param(offsets::DST))?;
    e.gpr_load(BaseReg::Filt, param(offsets::FILT))?;
    if plan.with_bias {
        e.gpr_load(BaseReg::Bias, param(offsets::BIAS))?;
    }

    if let Some(left) = plan.tiles.left {
        width_blk_step(e, plan, &left)?;
        let first_step = (ur_w * sw - plan.l_pad as isize) * col_stride;
        e.gpr_add_imm(BaseReg::Src, bytes(first_step)?)?;
        e.gpr_add_imm(BaseReg::Dst, bytes(dst_step)?)?;
    }

    if plan.tiles.n_middle > 0 {
        let counter = BaseReg::LoopVar(1);
        let body = e.alloc_label();
        e.gpr_load_imm(counter, plan.tiles.n_middle as u64)?;
        e.define_label(body)?;
        width_blk_step(e, plan, &plan.middle_tile())?;
        e.gpr_add_imm(BaseReg::Src, bytes(src_step)?)?;
        e.gpr_add_imm(BaseReg::Dst, bytes(dst_step)?)?;
        e.dec_and_branch_nz(counter, body)?;
    }

    if let Some(right) = plan.tiles.right {
        width_blk_step(e, plan, &right)?;
        e.gpr_add_imm(BaseReg::Src, bytes(src_step)?)?;
        e.gpr_add_imm(BaseReg::Dst, bytes(dst_step)?)?;
    }

    if let Some(tail) = plan.tiles.tail {
        width_blk_step(e, plan, &tail)?;
    }

    e.emit_epilogue()
}

/// One output tile: initialise, accumulate over the kernel rows, store.
fn width_blk_step<E: SimdOps>(e: &mut E, plan: &BlockingPlan, tile: &TileSpec) -> Result<(), String> {
    let grid = AccumulatorGrid::new(plan.nb_oc_blocking, tile.width, plan.activation.is_some());
    let oc_blk = plan.oc_block as isize;
    let dst_oc_stride = plan.dst_oc_block_stride() as isize;

    // Accumulator initialisation.
    let init_fresh = e.alloc_label();
    let accumulate = e.alloc_label();
    e.branch_if_flag_set(param(offsets::IS_FIRST), init_fresh)?;
    for (ii, jj) in grid.slots() {
        let off = ii as isize * dst_oc_stride + jj as isize * oc_blk;
        e.vload(grid.acc(ii, jj), mem(BaseReg::Dst, off)?)?;
    }
    e.jump(accumulate)?;
    e.define_label(init_fresh)?;
    for (ii, jj) in grid.slots() {
        if plan.with_bias {
            e.vload(grid.acc(ii, jj), mem(BaseReg::Bias, ii as isize * oc_blk)?)?;
        } else {
            e.vzero(grid.acc(ii, jj))?;
        }
    }
    e.define_label(accumulate)?;

    // Kernel-row loop; a zero row count skips straight to the store.
    let rows = BaseReg::LoopVar(0);
    let row_body = e.alloc_label();
    let rows_done = e.alloc_label();
    e.gpr_mov(BaseReg::AuxSrc, BaseReg::Src)?;
    e.gpr_mov(BaseReg::AuxFilt, BaseReg::Filt)?;
    e.gpr_load(rows, param(offsets::KH_PADDING))?;
    e.branch_if_zero(rows, rows_done)?;
    e.define_label(row_body)?;
    match plan.strategy_for(tile) {
        WidthStrategy::Unrolled => {
            for ki in 0..plan.kw {
                oh_step_unroll_kw(e, plan, tile, &grid, ki)?;
            }
            e.gpr_add_imm(BaseReg::AuxFilt, bytes(plan.filter_row_stride() as isize)?)?;
            e.gpr_add_imm(BaseReg::AuxSrc, bytes(plan.src_addressing.row_stride() as isize)?)?;
        }
        WidthStrategy::RuntimeLoop => oh_step_nopad(e, plan, &grid)?,
    }
    e.dec_and_branch_nz(rows, row_body)?;
    e.define_label(rows_done)?;

    store_tile(e, plan, &grid)
}

/// One unrolled kernel tap `ki` of one kernel row, skipping padded columns.
fn oh_step_unroll_kw<E: SimdOps>(
    e: &mut E,
    plan: &BlockingPlan,
    tile: &TileSpec,
    grid: &AccumulatorGrid,
    ki: usize,
) -> Result<(), String> {
    let sw = plan.stride_w;
    let (ki_s, kw_s) = (ki as isize, plan.kw as isize);
    let jj_start = overhang_cols(tile.pad_l as isize - ki_s, sw);
    let jj_end = tile
        .width
        .saturating_sub(overhang_cols(ki_s + tile.pad_r as isize - (kw_s - 1), sw));
    if jj_start >= jj_end {
        return Ok(());
    }

    let ic_blk = plan.ic_block;
    let oc_blk = plan.oc_block as isize;
    let foc = plan.filter_oc_block_stride() as isize;
    let tap = ki_s * (ic_blk as isize) * oc_blk;

    for ifm2 in 0..ic_blk {
        for jj in jj_start..jj_end {
            let col = ki_s + (jj * sw) as isize - tile.pad_l as isize;
            let off = plan.src_addressing.offset(ifm2, 0, col);
            e.vbroadcast(grid.broadcast(jj), mem(BaseReg::AuxSrc, off)?)?;
        }
        for ii in 0..grid.rows() {
            let off = ii as isize * foc + tap + ifm2 as isize * oc_blk;
            e.vload(WEIGHT, mem(BaseReg::AuxFilt, off)?)?;
            for jj in jj_start..jj_end {
                e.vfmadd231(grid.acc(ii, jj), grid.broadcast(jj), WEIGHT)?;
            }
        }
    }
    Ok(())
}

/// One kernel row as a counted loop over the `kw` taps (unpadded tiles only).
///
/// Leaves `AuxFilt` at the next kernel row and `AuxSrc` at the next input row.
fn oh_step_nopad<E: SimdOps>(e: &mut E, plan: &BlockingPlan, grid: &AccumulatorGrid) -> Result<(), String> {
    let taps = BaseReg::LoopVar(2);
    let tap_body = e.alloc_label();
    let ic_blk = plan.ic_block;
    let oc_blk = plan.oc_block as isize;
    let foc = plan.filter_oc_block_stride() as isize;
    let sw = plan.stride_w as isize;
    let col_stride = plan.src_addressing.col_stride() as isize;

    e.gpr_load_imm(taps, plan.kw as u64)?;
    e.define_label(tap_body)?;
    for ifm2 in 0..ic_blk {
        for jj in 0..grid.cols() {
            let off = plan.src_addressing.offset(ifm2, 0, jj as isize * sw);
            e.vbroadcast(grid.broadcast(jj), mem(BaseReg::AuxSrc, off)?)?;
        }
        for ii in 0..grid.rows() {
            let off = ii as isize * foc + ifm2 as isize * oc_blk;
            e.vload(WEIGHT, mem(BaseReg::AuxFilt, off)?)?;
            for jj in 0..grid.cols() {
                e.vfmadd231(grid.acc(ii, jj), grid.broadcast(jj), WEIGHT)?;
            }
        }
    }
    e.gpr_add_imm(BaseReg::AuxFilt, bytes(ic_blk as isize * oc_blk)?)?;
    e.gpr_add_imm(BaseReg::AuxSrc, bytes(col_stride)?)?;
    e.dec_and_branch_nz(taps, tap_body)?;

    let row_rewind = plan.src_addressing.row_stride() as isize - plan.kw as isize * col_stride;
    e.gpr_add_imm(BaseReg::AuxSrc, bytes(row_rewind)?)
}

/// Store the tile, applying the activation only on the last input-channel block.
fn store_tile<E: SimdOps>(e: &mut E, plan: &BlockingPlan, grid: &AccumulatorGrid) -> Result<(), String> {
    let Some(activation) = plan.activation else {
        return store_accumulators(e, plan, grid);
    };

    let plain = e.alloc_label();
    let done = e.alloc_label();
    e.branch_if_flag_clear(param(offsets::IS_LAST), plain)?;
    emit_activation(e, grid, activation)?;
    store_accumulators(e, plan, grid)?;
    e.jump(done)?;
    e.define_label(plain)?;
    store_accumulators(e, plan, grid)?;
    e.define_label(done)
}

/// `acc = max(acc, 0) + min(acc, 0) * slope`; plain max when the slope is zero.
fn emit_activation<E: SimdOps>(e: &mut E, grid: &AccumulatorGrid, activation: Activation) -> Result<(), String> {
    let slope = activation.negative_slope();
    e.vzero(ACT_ZERO)?;
    if slope == 0.0 {
        for (ii, jj) in grid.slots() {
            let acc = grid.acc(ii, jj);
            e.vmax(acc, acc, ACT_ZERO)?;
        }
        return Ok(());
    }
    e.vbroadcast_const(ACT_SLOPE, slope)?;
    for (ii, jj) in grid.slots() {
        let acc = grid.acc(ii, jj);
        e.vmin(ACT_TMP, acc, ACT_ZERO)?;
        e.vmax(acc, acc, ACT_ZERO)?;
        e.vfmadd231(acc, ACT_TMP, ACT_SLOPE)?;
    }
    Ok(())
}

fn store_accumulators<E: SimdOps>(e: &mut E, plan: &BlockingPlan, grid: &AccumulatorGrid) -> Result<(), String> {
    let oc_blk = plan.oc_block as isize;
    let dst_oc_stride = plan.dst_oc_block_stride() as isize;
    for (ii, jj) in grid.slots() {
        let off = ii as isize * dst_oc_stride + jj as isize * oc_blk;
        e.vstore(mem(BaseReg::Dst, off)?, grid.acc(ii, jj))?;
    }
    Ok(())
}
