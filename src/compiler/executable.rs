//! ConvKernel: mmap'd executable code + the plan it was generated from.
//!
//! The generated code is copied into an anonymous mapping that is made
//! read+execute before the kernel is handed out, so a `ConvKernel` is
//! immutable and may be invoked from any number of threads at once.

use crate::compiler::call::CallDescriptor;
use crate::compiler::planner::BlockingPlan;
use crate::types::{ConvError, ConvResult};

/// Signature of a generated convolution kernel.
pub type ConvKernelFn = unsafe extern "sysv64" fn(*const CallDescriptor);

/// A JIT-compiled convolution kernel.
pub struct ConvKernel {
    code: ExecutableBuffer,
    plan: BlockingPlan,
    listing: Option<String>,
}

impl ConvKernel {
    /// Create a kernel from raw machine code bytes.
    pub fn from_code(code_bytes: &[u8], plan: BlockingPlan) -> ConvResult<Self> {
        let code = ExecutableBuffer::new(code_bytes)?;
        Ok(ConvKernel {
            code,
            plan,
            listing: None,
        })
    }

    pub(crate) fn with_listing(mut self, listing: String) -> Self {
        self.listing = Some(listing);
        self
    }

    /// Size of the generated code in bytes.
    pub fn code_size(&self) -> usize {
        self.code.code_len
    }

    /// The generated machine code.
    pub fn code(&self) -> &[u8] {
        if self.code.ptr.is_null() {
            return &[];
        }
        // SAFETY: the mapping is readable and holds `code_len` initialised bytes
        // for as long as `self` lives.
        unsafe { std::slice::from_raw_parts(self.code.ptr, self.code.code_len) }
    }

    pub fn plan(&self) -> &BlockingPlan {
        &self.plan
    }

    /// Disassembly captured at compile time, if requested.
    pub fn listing(&self) -> Option<&str> {
        self.listing.as_deref()
    }

    /// Get the entry point function pointer.
    ///
    /// # Safety
    /// The caller must ensure the code was generated for the current CPU.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn entry_point(&self) -> ConvKernelFn {
        std::mem::transmute(self.code.ptr)
    }

    /// Run the kernel once.
    ///
    /// # Safety
    /// The host must support AVX2 and FMA. Every pointer in `desc` must
    /// cover the region the plan implies for one output row of
    /// `nb_oc_blocking` output-channel blocks, and `dst` must not be
    /// written concurrently by another call.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn invoke(&self, desc: &CallDescriptor) {
        let f = self.entry_point();
        f(desc as *const CallDescriptor);
    }
}

impl std::fmt::Debug for ConvKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvKernel")
            .field("code_size", &self.code_size())
            .field("plan", &self.plan)
            .finish()
    }
}

/// An executable memory buffer backed by mmap.
struct ExecutableBuffer {
    ptr: *mut u8,
    /// Mapped length, page aligned.
    len: usize,
    code_len: usize,
}

// SAFETY: ExecutableBuffer owns its mmap'd memory exclusively. The pointer is
// never aliased and the buffer is immutable (PROT_READ|PROT_EXEC) after construction.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Allocate an executable memory region and copy code into it.
    fn new(code: &[u8]) -> ConvResult<Self> {
        if code.is_empty() {
            return Ok(ExecutableBuffer {
                ptr: std::ptr::null_mut(),
                len: 0,
                code_len: 0,
            });
        }

        // Round up to page size
        let page_size = page_size();
        let len = (code.len() + page_size - 1) & !(page_size - 1);

        // SAFETY: mmap with MAP_PRIVATE|MAP_ANONYMOUS creates a new anonymous mapping.
        // No file descriptor is used (-1). Return value is checked for MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(ConvError::Executable(format!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        // Make executable (and read-only)
        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            let os_err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(ConvError::Executable(format!("mprotect failed: {os_err}")));
        }

        Ok(ExecutableBuffer {
            ptr,
            len,
            code_len: code.len(),
        })
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
