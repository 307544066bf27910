//! Shared helpers for the integration tests: a naive reference convolution
//! and converters between logical and kernel tensor layouts.

#![allow(dead_code)]

use conv_jit_kernels::{MemoryFormat, ShapeParameters};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SIMD_W: usize = 8;

/// True when generated kernels can run here; prints a skip notice otherwise.
pub fn jit_available(test: &str) -> bool {
    let ok = conv_jit_kernels::dispatch::host_supports_jit();
    if !ok {
        eprintln!("skipping {test}: host lacks AVX2/FMA");
    }
    ok
}

pub fn random_vec(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Logical tensors of one convolution.
///
/// - src: `[mb][groups * ic][ih][iw]`
/// - weights: `[groups][oc][ic][kh][kw]` (per-group channel counts)
/// - bias: `[groups * oc]`
pub struct Problem {
    pub shape: ShapeParameters,
    pub src: Vec<f32>,
    pub weights: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

impl Problem {
    pub fn random(shape: ShapeParameters, seed: u64) -> Self {
        let s = &shape;
        let src = random_vec(s.mb * s.ic * s.ih * s.iw, seed);
        let weights = random_vec(s.oc * (s.ic / s.groups) * s.kh * s.kw, seed.wrapping_add(1));
        let bias = s.has_bias().then(|| random_vec(s.oc, seed.wrapping_add(2)));
        Problem { shape, src, weights, bias }
    }

    /// Direct convolution in logical `nchw` output order.
    pub fn reference(&self) -> Vec<f32> {
        let s = &self.shape;
        let (g_ic, g_oc) = (s.ic / s.groups, s.oc / s.groups);
        let mut out = vec![0.0f32; s.mb * s.oc * s.oh * s.ow];
        for n in 0..s.mb {
            for g in 0..s.groups {
                for o in 0..g_oc {
                    let oc = g * g_oc + o;
                    for y in 0..s.oh {
                        for x in 0..s.ow {
                            let mut acc = self.bias.as_ref().map_or(0.0, |b| b[oc]);
                            for ky in 0..s.kh {
                                let iy = (y * s.stride_h + ky) as isize - s.t_pad as isize;
                                if iy < 0 || iy >= s.ih as isize {
                                    continue;
                                }
                                for kx in 0..s.kw {
                                    let ix = (x * s.stride_w + kx) as isize - s.l_pad as isize;
                                    if ix < 0 || ix >= s.iw as isize {
                                        continue;
                                    }
                                    for c in 0..g_ic {
                                        let ic = g * g_ic + c;
                                        let sv = self.src
                                            [((n * s.ic + ic) * s.ih + iy as usize) * s.iw + ix as usize];
                                        let wv = self.weights
                                            [(((oc * g_ic) + c) * s.kh + ky) * s.kw + kx];
                                        acc += sv * wv;
                                    }
                                }
                            }
                            if let Some(act) = s.activation {
                                acc = act.apply(acc);
                            }
                            out[((n * s.oc + oc) * s.oh + y) * s.ow + x] = acc;
                        }
                    }
                }
            }
        }
        out
    }

    /// Source in the shape's input format.
    pub fn kernel_src(&self) -> Vec<f32> {
        let s = &self.shape;
        let (c_total, hw) = (s.ic, s.ih * s.iw);
        match s.src_format {
            MemoryFormat::Nchw => self.src.clone(),
            MemoryFormat::Nhwc => {
                let mut out = vec![0.0; self.src.len()];
                for n in 0..s.mb {
                    for c in 0..c_total {
                        for p in 0..hw {
                            out[(n * hw + p) * c_total + c] = self.src[(n * c_total + c) * hw + p];
                        }
                    }
                }
                out
            }
            _ => to_blocked8(&self.src, s.mb, c_total, hw),
        }
    }

    /// Weights as `[g][oc/8][ic/icb][kh][kw][icb][8]`.
    pub fn kernel_weights(&self) -> Vec<f32> {
        let s = &self.shape;
        let (g_ic, g_oc) = (s.ic / s.groups, s.oc / s.groups);
        let icb = if g_ic % SIMD_W == 0 { SIMD_W } else { g_ic };
        let (nb_ic, nb_oc, khw) = (g_ic / icb, g_oc / SIMD_W, s.kh * s.kw);
        let mut out = vec![0.0; self.weights.len()];
        for g in 0..s.groups {
            for o in 0..g_oc {
                for c in 0..g_ic {
                    for k in 0..khw {
                        let logical = (((g * g_oc + o) * g_ic) + c) * khw + k;
                        let (ob, ol) = (o / SIMD_W, o % SIMD_W);
                        let (cb, cl) = (c / icb, c % icb);
                        let blocked = ((((g * nb_oc + ob) * nb_ic + cb) * khw + k) * icb + cl) * SIMD_W + ol;
                        out[blocked] = self.weights[logical];
                    }
                }
            }
        }
        out
    }

    pub fn dst_len(&self) -> usize {
        let s = &self.shape;
        s.mb * s.oc * s.oh * s.ow
    }

    /// Convert a kernel `nChw8c` destination back to logical order.
    pub fn logical_dst(&self, dst: &[f32]) -> Vec<f32> {
        let s = &self.shape;
        from_blocked8(dst, s.mb, s.oc, s.oh * s.ow)
    }
}

pub fn to_blocked8(plain: &[f32], mb: usize, c: usize, hw: usize) -> Vec<f32> {
    let mut out = vec![0.0; plain.len()];
    for n in 0..mb {
        for ch in 0..c {
            for p in 0..hw {
                let (cb, cl) = (ch / SIMD_W, ch % SIMD_W);
                out[((n * (c / SIMD_W) + cb) * hw + p) * SIMD_W + cl] = plain[(n * c + ch) * hw + p];
            }
        }
    }
    out
}

pub fn from_blocked8(blocked: &[f32], mb: usize, c: usize, hw: usize) -> Vec<f32> {
    let mut out = vec![0.0; blocked.len()];
    for n in 0..mb {
        for ch in 0..c {
            for p in 0..hw {
                let (cb, cl) = (ch / SIMD_W, ch % SIMD_W);
                out[(n * c + ch) * hw + p] = blocked[((n * (c / SIMD_W) + cb) * hw + p) * SIMD_W + cl];
            }
        }
    }
    out
}

pub fn assert_close(got: &[f32], want: &[f32], what: &str) {
    assert_eq!(got.len(), want.len(), "{what}: length");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        let tol = 1e-4 * (1.0 + w.abs()) * 8.0;
        assert!(
            (g - w).abs() <= tol,
            "{what}: element {i} got {g}, want {w}"
        );
    }
}
