//! Convolution shape parameters as supplied by the caller.
//!
//! Channel counts are totals across groups, matching the tensor dimensions
//! the caller allocates. The planner divides them by `groups`.

/// Memory format tags for the tensors involved in a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    /// Let the implementation choose (only meaningful for bias).
    Any,
    /// Plain 1-D vector (bias).
    X,
    /// Planar activations: `[n][c][h][w]`.
    Nchw,
    /// Channels-last activations: `[n][h][w][c]`.
    Nhwc,
    /// Channel-blocked activations: `[n][c/8][h][w][8c]`.
    NChw8c,
    /// Plain weights: `[o][i][h][w]`.
    Oihw,
    /// Weights for 3-channel input: `[o/8][h][w][i][8o]`.
    Ohwi8o,
    /// Blocked weights: `[o/8][i/8][h][w][8i][8o]`.
    OIhw8i8o,
    /// Grouped blocked weights: `[g][o/8][i/8][h][w][8i][8o]`.
    GOIhw8i8o,
}

/// Post-accumulation activation applied on the last input-channel block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// `x` if `x > 0`, else `x * negative_slope`. Plain ReLU has slope 0.
    Relu { negative_slope: f32 },
}

impl Activation {
    pub fn relu() -> Self {
        Activation::Relu { negative_slope: 0.0 }
    }

    pub fn leaky_relu(negative_slope: f32) -> Self {
        Activation::Relu { negative_slope }
    }

    pub fn negative_slope(&self) -> f32 {
        match self {
            Activation::Relu { negative_slope } => *negative_slope,
        }
    }

    /// Scalar reference of the activation.
    pub fn apply(&self, x: f32) -> f32 {
        let slope = self.negative_slope();
        if x > 0.0 {
            x
        } else {
            x * slope
        }
    }
}

/// Shape parameters of one 2-D forward convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeParameters {
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
    pub weights_format: MemoryFormat,
    pub dst_format: MemoryFormat,
    /// `None` when the convolution has no bias.
    pub bias_format: Option<MemoryFormat>,
    pub activation: Option<Activation>,
}

/// Output extent for a symmetric padding of `pad` on both sides.
pub fn output_dim(input: usize, kernel: usize, pad: usize, stride: usize) -> usize {
    let padded = input + 2 * pad;
    if padded < kernel || stride == 0 {
        return 0;
    }
    (padded - kernel) / stride + 1
}

impl ShapeParameters {
    /// Channel-blocked convolution (`nChw8c` in, `nChw8c` out), unit stride,
    /// no padding, no bias.
    pub fn blocked(
        mb: usize,
        ic: usize,
        ih: usize,
        iw: usize,
        oc: usize,
        kh: usize,
        kw: usize,
    ) -> Self {
        Self::with_src_format(MemoryFormat::NChw8c, MemoryFormat::OIhw8i8o, mb, ic, ih, iw, oc, kh, kw)
    }

    /// 3-channel planar input (`nchw` in, `nChw8c` out), unit stride, no
    /// padding, no bias.
    pub fn flat(mb: usize, ih: usize, iw: usize, oc: usize, kh: usize, kw: usize) -> Self {
        Self::with_src_format(MemoryFormat::Nchw, MemoryFormat::Ohwi8o, mb, 3, ih, iw, oc, kh, kw)
    }

    #[allow(clippy::too_many_arguments)]
    fn with_src_format(
        src_format: MemoryFormat,
        weights_format: MemoryFormat,
        mb: usize,
        ic: usize,
        ih: usize,
        iw: usize,
        oc: usize,
        kh: usize,
        kw: usize,
    ) -> Self {
        ShapeParameters {
            groups: 1,
            mb,
            ic,
            oc,
            ih,
            iw,
            oh: output_dim(ih, kh, 0, 1),
            ow: output_dim(iw, kw, 0, 1),
            kh,
            kw,
            t_pad: 0,
            l_pad: 0,
            stride_h: 1,
            stride_w: 1,
            src_format,
            weights_format,
            dst_format: MemoryFormat::NChw8c,
            bias_format: None,
            activation: None,
        }
    }

    /// Set symmetric padding and recompute the output extent.
    pub fn with_padding(mut self, t_pad: usize, l_pad: usize) -> Self {
        self.t_pad = t_pad;
        self.l_pad = l_pad;
        self.recompute_output();
        self
    }

    /// Set strides and recompute the output extent.
    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self.recompute_output();
        self
    }

    /// Override the output extent (asymmetric padding).
    pub fn with_output(mut self, oh: usize, ow: usize) -> Self {
        self.oh = oh;
        self.ow = ow;
        self
    }

    /// Split channels into `groups` groups; switches weights to the grouped format.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        if groups > 1 {
            self.weights_format = MemoryFormat::GOIhw8i8o;
        }
        self
    }

    pub fn with_bias(mut self) -> Self {
        self.bias_format = Some(MemoryFormat::X);
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    /// Switch a 3-channel convolution to channels-last input.
    pub fn channels_last(mut self) -> Self {
        self.src_format = MemoryFormat::Nhwc;
        self
    }

    pub fn has_bias(&self) -> bool {
        self.bias_format.is_some()
    }

    fn recompute_output(&mut self) {
        self.oh = output_dim(self.ih, self.kh, self.t_pad, self.stride_h);
        self.ow = output_dim(self.iw, self.kw, self.l_pad, self.stride_w);
    }
}
