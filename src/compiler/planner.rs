//! Shape planner: validates convolution shapes and derives the blocking plan.
//!
//! The planner decides every code-shape parameter at compile time: channel
//! blocking, the register blocking factor, the output-width unroll and the
//! layout of padded/unpadded tiles along the output row. The emitter bakes
//! all of it into immediates; nothing is decided at run time.

use crate::compiler::hw_constraints::{RegisterBudget, SIMD_W_F32};
use crate::compiler::shape::{Activation, MemoryFormat, ShapeParameters};
use crate::types::UnimplementedReason;

/// Output columns unrolled per tile.
pub const DEFAULT_UR_W: usize = 3;

/// Kernel widths at or above this use the runtime tap loop on unpadded tiles.
pub const RUNTIME_LOOP_MIN_KW: usize = 5;

/// Widest kernel for which padding is allowed with non-unit strides.
const MAX_PADDED_KW: usize = 7;

/// Register blocking factors tried in order of preference.
const OC_BLOCKING_CANDIDATES: [usize; 3] = [4, 3, 2];

/// One output tile: `width` output columns, with the input overrun on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub width: usize,
    pub pad_l: usize,
    pub pad_r: usize,
}

impl TileSpec {
    pub fn unpadded(width: usize) -> Self {
        TileSpec { width, pad_l: 0, pad_r: 0 }
    }

    pub fn is_padded(&self) -> bool {
        self.pad_l > 0 || self.pad_r > 0
    }
}

/// Partition of one output row into tiles, in emission order.
///
/// `left` and `right` are full-width tiles touching the padding, the middle
/// tiles run in a counted loop, `tail` holds the `ow % ur_w` leftover columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    pub left: Option<TileSpec>,
    pub n_middle: usize,
    pub right: Option<TileSpec>,
    pub tail: Option<TileSpec>,
}

impl TileLayout {
    /// Total output columns covered by all tiles.
    pub fn covered_width(&self, ur_w: usize) -> usize {
        let edge = |t: Option<TileSpec>| t.map_or(0, |t| t.width);
        edge(self.left) + self.n_middle * ur_w + edge(self.right) + edge(self.tail)
    }
}

/// How the kernel-width taps of one tile are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidthStrategy {
    /// Every tap unrolled, padded columns skipped at compile time.
    Unrolled,
    /// Counted loop over taps; only for unpadded tiles.
    RuntimeLoop,
}

/// Element addressing of one input-channel block, fixed at planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAddressing {
    /// One `ih × iw` plane per channel (`nchw`).
    Planar { ih: usize, iw: usize },
    /// `lanes` channels interleaved per pixel (`nhwc` with 3 channels, `nChw8c`).
    Interleaved { lanes: usize, iw: usize },
}

impl InputAddressing {
    /// Element offset of `channel` at (`row`, `col`) relative to the block origin.
    pub fn offset(&self, channel: usize, row: isize, col: isize) -> isize {
        match *self {
            InputAddressing::Planar { ih, iw } => {
                (channel * ih * iw) as isize + row * iw as isize + col
            }
            InputAddressing::Interleaved { lanes, iw } => {
                (row * iw as isize + col) * lanes as isize + channel as isize
            }
        }
    }

    /// Elements between horizontally adjacent pixels.
    pub fn col_stride(&self) -> usize {
        match *self {
            InputAddressing::Planar { .. } => 1,
            InputAddressing::Interleaved { lanes, .. } => lanes,
        }
    }

    /// Elements between vertically adjacent pixels.
    pub fn row_stride(&self) -> usize {
        match *self {
            InputAddressing::Planar { iw, .. } => iw,
            InputAddressing::Interleaved { lanes, iw } => lanes * iw,
        }
    }
}

/// Complete blocking plan for one convolution. Channel counts are per group.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockingPlan {
    pub groups: usize,
    pub mb: usize,
    pub ic: usize,
    pub oc: usize,
    pub ih: usize,
    pub iw: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub t_pad: usize,
    pub l_pad: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub src_format: MemoryFormat,
    pub with_bias: bool,
    pub activation: Option<Activation>,

    pub simd_w: usize,
    pub ic_block: usize,
    pub nb_ic: usize,
    pub oc_block: usize,
    pub nb_oc: usize,
    /// Output-channel blocks computed per pass.
    pub nb_oc_blocking: usize,
    pub ur_w: usize,
    pub ur_w_tail: usize,
    /// Right overrun of the last output column.
    pub r_pad: usize,
    pub tiles: TileLayout,
    pub src_addressing: InputAddressing,
}

/// Validate `shape` and derive its blocking plan.
pub fn plan(shape: &ShapeParameters) -> Result<BlockingPlan, UnimplementedReason> {
    BlockingPlan::build(shape)
}

fn positive(value: usize, name: &str) -> Result<usize, UnimplementedReason> {
    if value == 0 {
        return Err(UnimplementedReason::InvalidShape(format!("{name} must be positive")));
    }
    Ok(value)
}

/// `max(0, ceil(overrun / stride))`: output columns lost to an input overrun.
pub(crate) fn overhang_cols(overrun: isize, stride: usize) -> usize {
    if overrun <= 0 {
        return 0;
    }
    let stride = stride as isize;
    ((overrun + stride - 1) / stride) as usize
}

fn check_layouts(shape: &ShapeParameters, ic: usize) -> Result<(), UnimplementedReason> {
    use MemoryFormat::*;

    let flat = ic == 3;
    let grouped = shape.groups > 1;
    let mismatch = |msg: String| Err(UnimplementedReason::LayoutMismatch(msg));

    let src_ok = if flat {
        matches!(shape.src_format, Nchw | Nhwc)
    } else {
        shape.src_format == NChw8c
    };
    if !src_ok {
        return mismatch(format!(
            "source format {:?} unsupported for {} input channels per group",
            shape.src_format, ic
        ));
    }
    if grouped && shape.src_format == Nhwc {
        return mismatch("channels-last source with groups".into());
    }

    let expected_weights = match (grouped, flat) {
        (true, _) => GOIhw8i8o,
        (false, true) => Ohwi8o,
        (false, false) => OIhw8i8o,
    };
    if shape.weights_format != expected_weights {
        return mismatch(format!(
            "weights format {:?}, expected {:?}",
            shape.weights_format, expected_weights
        ));
    }

    if let Some(bias) = shape.bias_format {
        if !matches!(bias, Any | X) {
            return mismatch(format!("bias format {bias:?}"));
        }
    }

    if shape.dst_format != NChw8c {
        return mismatch(format!("destination format {:?}, expected NChw8c", shape.dst_format));
    }
    Ok(())
}

impl BlockingPlan {
    /// Build a plan, or report why the shape cannot be tiled.
    pub fn build(shape: &ShapeParameters) -> Result<Self, UnimplementedReason> {
        let result = Self::derive(shape);
        match &result {
            Ok(plan) => log::debug!(
                "conv plan: ic={} oc={} {}x{} k{}x{} -> nb_oc_blocking={} ur_w={} tail={} tiles={:?}",
                plan.ic, plan.oc, plan.oh, plan.ow, plan.kh, plan.kw,
                plan.nb_oc_blocking, plan.ur_w, plan.ur_w_tail, plan.tiles
            ),
            Err(reason) => log::debug!("conv plan rejected: {reason}"),
        }
        result
    }

    fn derive(shape: &ShapeParameters) -> Result<Self, UnimplementedReason> {
        let groups = positive(shape.groups, "groups")?;
        positive(shape.mb, "minibatch")?;
        for (value, name) in [
            (shape.ic, "input channels"),
            (shape.oc, "output channels"),
            (shape.ih, "input height"),
            (shape.iw, "input width"),
            (shape.oh, "output height"),
            (shape.ow, "output width"),
            (shape.kh, "kernel height"),
            (shape.kw, "kernel width"),
            (shape.stride_h, "stride height"),
            (shape.stride_w, "stride width"),
        ] {
            positive(value, name)?;
        }
        if shape.ic % groups != 0 || shape.oc % groups != 0 {
            return Err(UnimplementedReason::InvalidShape(format!(
                "{groups} groups do not divide ic={} oc={}",
                shape.ic, shape.oc
            )));
        }

        let ic = shape.ic / groups;
        let oc = shape.oc / groups;
        let flat = ic == 3;
        check_layouts(shape, ic)?;

        let simd_w = SIMD_W_F32;
        let ow = shape.ow;
        let ur_w = DEFAULT_UR_W.min(ow);
        let ur_w_tail = ow % ur_w;

        if oc % simd_w != 0 {
            return Err(UnimplementedReason::ChannelDivisibility {
                what: "output",
                channels: oc,
                simd_w,
            });
        }
        if !flat && ic % simd_w != 0 {
            return Err(UnimplementedReason::ChannelDivisibility {
                what: "input",
                channels: ic,
                simd_w,
            });
        }
        if shape.l_pad > ur_w {
            return Err(UnimplementedReason::PaddingTilingFit(format!(
                "left padding {} exceeds tile width {ur_w}",
                shape.l_pad
            )));
        }
        let unit_stride = shape.stride_h == 1 && shape.stride_w == 1;
        let unpadded = shape.t_pad == 0 && shape.l_pad == 0;
        if shape.kw > MAX_PADDED_KW && !(unpadded || unit_stride) {
            return Err(UnimplementedReason::PaddingTilingFit(format!(
                "kernel width {} > {MAX_PADDED_KW} needs zero padding or unit strides",
                shape.kw
            )));
        }

        let (iw, kw, l_pad, stride_w) =
            (shape.iw as isize, shape.kw as isize, shape.l_pad as isize, shape.stride_w as isize);
        // Input column one past the last real one, in padded coordinates.
        let right_edge = iw + l_pad - 1;
        let overrun_at = |col: isize| col * stride_w + kw - 1 - right_edge;

        let r_pad_no_tail = overrun_at((ow - ur_w_tail) as isize - 1).max(0) as usize;
        if r_pad_no_tail > ur_w {
            return Err(UnimplementedReason::TailPaddingFit { r_pad: r_pad_no_tail, ur_w });
        }

        let ic_block = if ic % simd_w != 0 { ic } else { simd_w };
        let nb_ic = ic / ic_block;
        let oc_block = simd_w;
        let nb_oc = oc / oc_block;
        let nb_oc_blocking = OC_BLOCKING_CANDIDATES
            .iter()
            .copied()
            .find(|b| nb_oc % b == 0)
            .unwrap_or(1);

        let r_pad = overrun_at(ow as isize - 1).max(0) as usize;
        let tiles = Self::layout_tiles(ow, ur_w, ur_w_tail, shape.l_pad, r_pad, |col| overrun_at(col));

        let src_addressing = match shape.src_format {
            MemoryFormat::Nchw => InputAddressing::Planar { ih: shape.ih, iw: shape.iw },
            _ => InputAddressing::Interleaved { lanes: ic_block, iw: shape.iw },
        };

        let plan = BlockingPlan {
            groups,
            mb: shape.mb,
            ic,
            oc,
            ih: shape.ih,
            iw: shape.iw,
            oh: shape.oh,
            ow,
            kh: shape.kh,
            kw: shape.kw,
            t_pad: shape.t_pad,
            l_pad: shape.l_pad,
            stride_h: shape.stride_h,
            stride_w: shape.stride_w,
            src_format: shape.src_format,
            with_bias: shape.has_bias(),
            activation: shape.activation,
            simd_w,
            ic_block,
            nb_ic,
            oc_block,
            nb_oc,
            nb_oc_blocking,
            ur_w,
            ur_w_tail,
            r_pad,
            tiles,
            src_addressing,
        };
        debug_assert_eq!(plan.tiles.covered_width(ur_w), ow);
        debug_assert!(plan.register_budget().validate().is_ok());
        Ok(plan)
    }

    /// Split the output row into left/middle/right/tail tiles.
    ///
    /// `overrun_at(col)` is the right input overrun of output column `col`.
    fn layout_tiles(
        ow: usize,
        ur_w: usize,
        ur_w_tail: usize,
        l_pad: usize,
        r_pad: usize,
        overrun_at: impl Fn(isize) -> isize,
    ) -> TileLayout {
        let mut n_oi = (ow / ur_w) as isize;
        let r_pad1 = overrun_at(ur_w as isize * n_oi - 1);
        if r_pad1 > 0 {
            n_oi -= 1;
        }

        let mut left = None;
        if l_pad > 0 {
            n_oi -= 1;
            // A single full tile that overruns on both sides.
            let pad_r = if n_oi < 0 && r_pad1 > 0 { r_pad1 as usize } else { 0 };
            left = Some(TileSpec { width: ur_w, pad_l: l_pad, pad_r });
        }

        let right = (r_pad1 > 0 && n_oi >= 0).then(|| TileSpec {
            width: ur_w,
            pad_l: 0,
            pad_r: r_pad1 as usize,
        });
        let tail = (ur_w_tail != 0).then(|| TileSpec { width: ur_w_tail, pad_l: 0, pad_r: r_pad });

        TileLayout {
            left,
            n_middle: n_oi.max(0) as usize,
            right,
            tail,
        }
    }

    /// Tap emission strategy for a tile of this plan.
    pub fn strategy_for(&self, tile: &TileSpec) -> WidthStrategy {
        if self.kw >= RUNTIME_LOOP_MIN_KW && !tile.is_padded() {
            WidthStrategy::RuntimeLoop
        } else {
            WidthStrategy::Unrolled
        }
    }

    /// Register usage of the widest tile.
    pub fn register_budget(&self) -> RegisterBudget {
        RegisterBudget::for_tile(self.nb_oc_blocking, self.ur_w, self.activation.is_some())
    }

    /// The unpadded tile used by the middle loop.
    pub fn middle_tile(&self) -> TileSpec {
        TileSpec::unpadded(self.ur_w)
    }

    /// Elements between consecutive output-channel blocks of the filter.
    pub fn filter_oc_block_stride(&self) -> usize {
        self.nb_ic * self.kh * self.kw * self.ic_block * self.oc_block
    }

    /// Elements of one kernel row of one (oc block, ic block) filter slice.
    pub fn filter_row_stride(&self) -> usize {
        self.kw * self.ic_block * self.oc_block
    }

    /// Elements between consecutive output-channel blocks of the destination.
    pub fn dst_oc_block_stride(&self) -> usize {
        self.oh * self.ow * self.oc_block
    }
}
