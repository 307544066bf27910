//! Runtime call descriptor read by the generated kernel.

use std::mem::offset_of;

/// Arguments of one kernel invocation.
///
/// The generated code reads this record through the first argument register
/// and never writes it. Addresses are not validated: every pointer must
/// cover the region the plan implies, and `kh_padding` must already be
/// clipped to the kernel rows that fall inside the input.
///
/// Calls contributing to the same output tile must run in input-channel
/// block order: the call with `is_first` set before any other, the one with
/// `is_last` set after all others. Both may be set on a single call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallDescriptor {
    /// First input element of the top kernel row for this output row.
    pub src: *const f32,
    /// First element of the output row for the first output-channel block.
    pub dst: *mut f32,
    /// Filter of the first output-channel block, advanced past clipped top rows.
    pub filt: *const f32,
    /// Bias of the first output-channel block; ignored without bias.
    pub bias: *const f32,
    /// Kernel rows to accumulate in this call.
    pub kh_padding: usize,
    /// Initialise accumulators from bias/zero instead of `dst`.
    pub is_first: bool,
    /// Apply the activation before the final store.
    pub is_last: bool,
}

impl CallDescriptor {
    /// A descriptor for a single-block call (`is_first` and `is_last` set).
    pub fn single(
        src: *const f32,
        dst: *mut f32,
        filt: *const f32,
        bias: *const f32,
        kh_padding: usize,
    ) -> Self {
        CallDescriptor {
            src,
            dst,
            filt,
            bias,
            kh_padding,
            is_first: true,
            is_last: true,
        }
    }
}

/// Byte offsets of the descriptor fields, as baked into the generated code.
pub(crate) mod offsets {
    use super::*;

    pub const SRC: i32 = offset_of!(CallDescriptor, src) as i32;
    pub const DST: i32 = offset_of!(CallDescriptor, dst) as i32;
    pub const FILT: i32 = offset_of!(CallDescriptor, filt) as i32;
    pub const BIAS: i32 = offset_of!(CallDescriptor, bias) as i32;
    pub const KH_PADDING: i32 = offset_of!(CallDescriptor, kh_padding) as i32;
    pub const IS_FIRST: i32 = offset_of!(CallDescriptor, is_first) as i32;
    pub const IS_LAST: i32 = offset_of!(CallDescriptor, is_last) as i32;
}
