//! Property-based tests for the planner and the emitter.
//!
//! Uses proptest to verify invariants that must hold for every accepted shape:
//! - Tile coverage: left + middle + right + tail == output width
//! - Register budget fits the 16 ymm registers
//! - Register blocking factor follows the divisor rule
//! - Emission succeeds and is deterministic

use proptest::prelude::*;

use conv_jit_kernels::compiler::codegen::generate;
use conv_jit_kernels::compiler::disasm;
use conv_jit_kernels::compiler::hw_constraints::NUM_VECTOR_REGS;
use conv_jit_kernels::compiler::planner::plan;
use conv_jit_kernels::{Activation, ShapeParameters, WidthStrategy};

fn arb_shape() -> impl Strategy<Value = ShapeParameters> {
    (
        prop_oneof![Just(3usize), Just(8), Just(16), Just(24)],
        1usize..=12,  // output-channel blocks
        1usize..=20,  // ih
        1usize..=24,  // iw
        1usize..=7,   // kh
        1usize..=11,  // kw
        0usize..=4,   // padding
        1usize..=3,   // stride
        any::<bool>(),
        prop_oneof![Just(None), Just(Some(0.0f32)), Just(Some(0.25f32))],
    )
        .prop_map(|(ic, ocb, ih, iw, kh, kw, pad, stride, bias, slope)| {
            let mut s = if ic == 3 {
                ShapeParameters::flat(1, ih, iw, ocb * 8, kh, kw)
            } else {
                ShapeParameters::blocked(1, ic, ih, iw, ocb * 8, kh, kw)
            };
            s = s.with_padding(pad.min(kh - 1), pad.min(kw - 1)).with_stride(stride, stride);
            if bias {
                s = s.with_bias();
            }
            if let Some(slope) = slope {
                s = s.with_activation(Activation::leaky_relu(slope));
            }
            s
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Accepted plans partition the output row exactly.
    #[test]
    fn prop_tiles_cover_output_width(shape in arb_shape()) {
        if let Ok(p) = plan(&shape) {
            prop_assert_eq!(p.tiles.covered_width(p.ur_w), p.ow);
            prop_assert!(p.ur_w_tail < p.ur_w);
            if let Some(tail) = p.tiles.tail {
                prop_assert_eq!(tail.width, p.ur_w_tail);
                prop_assert_eq!(tail.pad_l, 0);
            }
            prop_assert_eq!(p.tiles.left.is_some(), p.l_pad > 0);
        }
    }

    /// Accepted plans fit the register file.
    #[test]
    fn prop_register_budget(shape in arb_shape()) {
        if let Ok(p) = plan(&shape) {
            let b = p.register_budget();
            prop_assert!(p.nb_oc_blocking * p.ur_w + b.reserved() <= NUM_VECTOR_REGS);
            prop_assert!(b.validate().is_ok());
        }
    }

    /// nb_oc_blocking is the first of {4, 3, 2} dividing nb_oc, else 1.
    #[test]
    fn prop_blocking_factor(shape in arb_shape()) {
        if let Ok(p) = plan(&shape) {
            let expected = [4, 3, 2].into_iter().find(|b| p.nb_oc % b == 0).unwrap_or(1);
            prop_assert_eq!(p.nb_oc_blocking, expected);
            prop_assert_eq!(p.nb_oc % p.nb_oc_blocking, 0);
        }
    }

    /// Padded tiles are always unrolled.
    #[test]
    fn prop_padded_tiles_unrolled(shape in arb_shape()) {
        if let Ok(p) = plan(&shape) {
            for tile in [p.tiles.left, p.tiles.right, p.tiles.tail].into_iter().flatten() {
                if tile.is_padded() {
                    prop_assert_eq!(p.strategy_for(&tile), WidthStrategy::Unrolled);
                }
            }
        }
    }

    /// Every accepted plan emits, deterministically, and ends in `ret`.
    #[test]
    fn prop_codegen_deterministic(shape in arb_shape()) {
        if let Ok(p) = plan(&shape) {
            let a = generate(&p).unwrap().code;
            let b = generate(&p).unwrap().code;
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.last().copied(), Some(0xC3u8));
            let stats = disasm::stats(&a);
            prop_assert!(stats.vector_stores >= p.nb_oc_blocking);
        }
    }
}
