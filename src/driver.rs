//! Minimal forward-convolution driver over caller-owned buffers.
//!
//! Tensor layouts (element order, outermost first):
//! - src: `nchw` / `nhwc` for 3-channel input, `nChw8c` otherwise
//! - weights: `[g][oc/8][ic/ic_block][kh][kw][ic_block][8]`
//! - bias: `[g * oc]`
//! - dst: `nChw8c`
//!
//! One kernel call covers one output row of `nb_oc_blocking` output-channel
//! blocks for one input-channel block. Kernel rows that fall into the top or
//! bottom padding are clipped here before the call.

use rayon::prelude::*;

use crate::compiler::shape::{MemoryFormat, ShapeParameters};
use crate::compiler::{BlockingPlan, CallDescriptor, ConvCompiler, ConvKernel};
use crate::dispatch::{get_isa_level, host_supports_jit};
use crate::types::{ConvError, ConvResult};

/// Base pointers of one forward pass.
#[derive(Clone, Copy)]
struct TensorPtrs {
    src: *const f32,
    weights: *const f32,
    bias: *const f32,
    dst: *mut f32,
}

// SAFETY: work items write disjoint regions of dst; src, weights and bias are
// only read.
unsafe impl Send for TensorPtrs {}
unsafe impl Sync for TensorPtrs {}

/// One (group, image, output-channel-block group) unit of work.
#[derive(Debug, Clone, Copy)]
struct WorkItem {
    g: usize,
    n: usize,
    ocbb: usize,
}

/// A compiled forward convolution.
#[derive(Debug)]
pub struct ConvolutionForward {
    kernel: ConvKernel,
}

impl ConvolutionForward {
    /// Plan and compile `shape` with options from the environment.
    pub fn new(shape: &ShapeParameters) -> ConvResult<Self> {
        Self::with_compiler(&ConvCompiler::new(), shape)
    }

    pub fn with_compiler(compiler: &ConvCompiler, shape: &ShapeParameters) -> ConvResult<Self> {
        Ok(Self::from_kernel(compiler.compile(shape)?))
    }

    pub fn from_kernel(kernel: ConvKernel) -> Self {
        ConvolutionForward { kernel }
    }

    pub fn kernel(&self) -> &ConvKernel {
        &self.kernel
    }

    pub fn plan(&self) -> &BlockingPlan {
        self.kernel.plan()
    }

    pub fn src_len(&self) -> usize {
        let p = self.plan();
        p.mb * p.groups * p.ic * p.ih * p.iw
    }

    pub fn weights_len(&self) -> usize {
        let p = self.plan();
        p.groups * p.oc * p.ic * p.kh * p.kw
    }

    /// Zero when the convolution has no bias.
    pub fn bias_len(&self) -> usize {
        let p = self.plan();
        if p.with_bias {
            p.groups * p.oc
        } else {
            0
        }
    }

    pub fn dst_len(&self) -> usize {
        let p = self.plan();
        p.mb * p.groups * p.oc * p.oh * p.ow
    }

    /// Run the whole convolution on the calling thread.
    pub fn execute(
        &self,
        src: &[f32],
        weights: &[f32],
        bias: Option<&[f32]>,
        dst: &mut [f32],
    ) -> ConvResult<()> {
        let ptrs = self.prepare(src, weights, bias, dst)?;
        for item in self.work_items() {
            // SAFETY: buffers were validated against the plan in `prepare`.
            unsafe { self.run_item(ptrs, item) };
        }
        Ok(())
    }

    /// Run the convolution with one rayon task per work item.
    pub fn execute_parallel(
        &self,
        src: &[f32],
        weights: &[f32],
        bias: Option<&[f32]>,
        dst: &mut [f32],
    ) -> ConvResult<()> {
        let ptrs = self.prepare(src, weights, bias, dst)?;
        let items: Vec<WorkItem> = self.work_items().collect();
        items.into_par_iter().for_each(|item| {
            // SAFETY: as in `execute`; items address disjoint dst regions.
            unsafe { self.run_item(ptrs, item) };
        });
        Ok(())
    }

    fn prepare(
        &self,
        src: &[f32],
        weights: &[f32],
        bias: Option<&[f32]>,
        dst: &mut [f32],
    ) -> ConvResult<TensorPtrs> {
        if !host_supports_jit() {
            log::warn!("refusing to run conv kernel: host ISA level {:?}", get_isa_level());
            return Err(ConvError::UnsupportedIsa(
                "generated kernels require AVX2 and FMA".into(),
            ));
        }
        check_len("src", self.src_len(), src.len())?;
        check_len("weights", self.weights_len(), weights.len())?;
        check_len("dst", self.dst_len(), dst.len())?;
        check_len("bias", self.bias_len(), bias.map_or(0, |b| b.len()))?;

        Ok(TensorPtrs {
            src: src.as_ptr(),
            weights: weights.as_ptr(),
            bias: bias.map_or(std::ptr::null(), |b| b.as_ptr()),
            dst: dst.as_mut_ptr(),
        })
    }

    fn work_items(&self) -> impl Iterator<Item = WorkItem> {
        let p = self.plan();
        let (groups, mb, n_ocbb) = (p.groups, p.mb, p.nb_oc / p.nb_oc_blocking);
        (0..groups).flat_map(move |g| {
            (0..mb).flat_map(move |n| (0..n_ocbb).map(move |ocbb| WorkItem { g, n, ocbb }))
        })
    }

    /// Every output row of one work item, input-channel blocks in order.
    ///
    /// # Safety
    /// `ptrs` must point at buffers of the lengths reported by this driver.
    unsafe fn run_item(&self, ptrs: TensorPtrs, item: WorkItem) {
        let p = self.plan();
        let WorkItem { g, n, ocbb } = item;
        let ocb0 = ocbb * p.nb_oc_blocking;

        for oh_idx in 0..p.oh {
            let ij = oh_idx * p.stride_h;
            let t_over = p.t_pad.saturating_sub(ij);
            let b_over = (ij + p.kh).saturating_sub(p.t_pad + p.ih);
            let ih_start = ij.saturating_sub(p.t_pad);
            let kh_padding = p.kh.saturating_sub(t_over + b_over);

            let dst_off = ((n * p.groups * p.nb_oc + g * p.nb_oc + ocb0) * p.oh + oh_idx) * p.ow * p.oc_block;
            let bias_off = (g * p.nb_oc + ocb0) * p.oc_block;

            for icb in 0..p.nb_ic {
                let filt_off = (((g * p.nb_oc + ocb0) * p.nb_ic + icb) * p.kh + t_over)
                    * p.kw
                    * p.ic_block
                    * p.oc_block;
                let desc = CallDescriptor {
                    src: ptrs.src.wrapping_add(src_offset(p, g, n, icb, ih_start)),
                    dst: ptrs.dst.wrapping_add(dst_off),
                    filt: ptrs.weights.wrapping_add(filt_off),
                    bias: if ptrs.bias.is_null() {
                        ptrs.bias
                    } else {
                        ptrs.bias.wrapping_add(bias_off)
                    },
                    kh_padding,
                    is_first: icb == 0,
                    is_last: icb + 1 == p.nb_ic,
                };
                self.call(&desc);
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn call(&self, desc: &CallDescriptor) {
        self.kernel.invoke(desc);
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn call(&self, _desc: &CallDescriptor) {
        unreachable!("host_supports_jit() is false off x86_64");
    }
}

/// Element offset of row `ih_start` of input-channel block `icb`.
fn src_offset(p: &BlockingPlan, g: usize, n: usize, icb: usize, ih_start: usize) -> usize {
    match p.src_format {
        MemoryFormat::Nchw => {
            ((n * p.groups * p.ic + g * p.ic + icb * p.ic_block) * p.ih + ih_start) * p.iw
        }
        MemoryFormat::Nhwc => (n * p.ih + ih_start) * p.iw * p.ic,
        _ => (((n * p.groups + g) * p.nb_ic + icb) * p.ih + ih_start) * p.iw * p.ic_block,
    }
}

fn check_len(tensor: &'static str, expected: usize, got: usize) -> ConvResult<()> {
    if expected != got {
        return Err(ConvError::ShapeMismatch { tensor, expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileOptions;

    fn compiler() -> ConvCompiler {
        ConvCompiler::with_options(CompileOptions { dump_listing: false })
    }

    #[test]
    fn test_tensor_lengths() {
        let shape = ShapeParameters::blocked(2, 16, 6, 5, 24, 3, 3).with_bias();
        let conv = ConvolutionForward::with_compiler(&compiler(), &shape).unwrap();
        assert_eq!(conv.src_len(), 2 * 16 * 6 * 5);
        assert_eq!(conv.weights_len(), 24 * 16 * 9);
        assert_eq!(conv.bias_len(), 24);
        assert_eq!(conv.dst_len(), 2 * 24 * 4 * 3);
    }

    #[test]
    fn test_grouped_lengths() {
        let shape = ShapeParameters::blocked(1, 32, 4, 4, 16, 1, 1).with_groups(2);
        let conv = ConvolutionForward::with_compiler(&compiler(), &shape).unwrap();
        assert_eq!(conv.weights_len(), 2 * 8 * 16);
        assert_eq!(conv.bias_len(), 0);
        assert_eq!(conv.work_items().count(), 2);
    }

    #[test]
    fn test_wrong_lengths_rejected() {
        if !host_supports_jit() {
            eprintln!("skipping: host lacks AVX2/FMA");
            return;
        }
        let shape = ShapeParameters::flat(1, 6, 6, 8, 3, 3).with_bias();
        let conv = ConvolutionForward::with_compiler(&compiler(), &shape).unwrap();
        let src = vec![0.0; conv.src_len()];
        let w = vec![0.0; conv.weights_len()];
        let mut dst = vec![0.0; conv.dst_len()];

        let err = conv.execute(&src[1..], &w, None, &mut dst).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch { tensor: "src", .. }));

        let err = conv.execute(&src, &w, None, &mut dst).unwrap_err();
        assert!(matches!(
            err,
            ConvError::ShapeMismatch { tensor: "bias", expected: 8, got: 0 }
        ));
    }

    #[test]
    fn test_unsupported_host_refused() {
        if host_supports_jit() {
            return;
        }
        let shape = ShapeParameters::flat(1, 6, 6, 8, 3, 3);
        let conv = ConvolutionForward::with_compiler(&compiler(), &shape).unwrap();
        let mut dst = vec![0.0; conv.dst_len()];
        let err = conv
            .execute(&vec![0.0; conv.src_len()], &vec![0.0; conv.weights_len()], None, &mut dst)
            .unwrap_err();
        assert!(matches!(err, ConvError::UnsupportedIsa(_)));
    }

    #[test]
    fn test_src_offsets() {
        let shape = ShapeParameters::blocked(2, 16, 5, 4, 8, 3, 3);
        let conv = ConvolutionForward::with_compiler(&compiler(), &shape).unwrap();
        let p = conv.plan();
        // Image 1, second channel block, row 2.
        assert_eq!(src_offset(p, 0, 1, 1, 2), ((2 + 1) * 5 + 2) * 4 * 8);

        let flat = ShapeParameters::flat(1, 5, 4, 8, 3, 3).channels_last();
        let conv = ConvolutionForward::with_compiler(&compiler(), &flat).unwrap();
        assert_eq!(src_offset(conv.plan(), 0, 0, 0, 3), 3 * 4 * 3);
    }
}
