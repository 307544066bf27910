//! Host ISA detection for running generated kernels.
//!
//! Kernels can be generated on any host; running them needs AVX2 and FMA.
//! Detection runs once and is cached for the process lifetime.

use std::sync::OnceLock;

/// The instruction set generated kernels target. AVX-512 hosts report
/// `Avx2`: no kernel uses wider registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsaLevel {
    Scalar,
    /// AVX2 together with FMA3.
    Avx2,
}

static ISA_LEVEL: OnceLock<IsaLevel> = OnceLock::new();

pub fn get_isa_level() -> IsaLevel {
    *ISA_LEVEL.get_or_init(detect_isa_features)
}

/// True when generated kernels can run on this host.
pub fn host_supports_jit() -> bool {
    get_isa_level() >= IsaLevel::Avx2
}

#[cfg(target_arch = "x86_64")]
fn detect_isa_features() -> IsaLevel {
    let level = if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        IsaLevel::Avx2
    } else {
        IsaLevel::Scalar
    };
    log::debug!("detected ISA level {level:?}");
    level
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_isa_features() -> IsaLevel {
    IsaLevel::Scalar
}
