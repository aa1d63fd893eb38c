//! Executable memory for embedders without a moving collector.
//!
//! On unix this is a plain anonymous mapping that starts out read-write
//! and is flipped to read-execute when the block is published. Elsewhere a
//! heap buffer is used; it can hold emitted bytes for inspection but can
//! not be executed.

use crate::gc::{CodeAllocator, CodeBlock, CodeMemory};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::io;
        use std::ptr;

        /// An anonymous read-write mapping, executable after `publish`.
        pub struct Mmap {
            ptr: *mut u8,
            len: usize,
        }

        impl Mmap {
            pub fn with_at_least(size: usize) -> io::Result<Mmap> {
                let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
                let len = (size + (page - 1)) & !(page - 1);

                let ptr = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        len,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANON,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                Ok(Mmap {
                    ptr: ptr as *mut u8,
                    len,
                })
            }
        }

        impl CodeMemory for Mmap {
            fn as_ptr(&self) -> *const u8 {
                self.ptr
            }

            fn as_mut_ptr(&mut self) -> *mut u8 {
                self.ptr
            }

            fn len(&self) -> usize {
                self.len
            }

            fn publish(&mut self) {
                let result = unsafe {
                    libc::mprotect(
                        self.ptr as *mut libc::c_void,
                        self.len,
                        libc::PROT_READ | libc::PROT_EXEC,
                    )
                };
                assert_eq!(result, 0, "mprotect failed");
            }
        }

        impl Drop for Mmap {
            fn drop(&mut self) {
                unsafe {
                    libc::munmap(self.ptr as *mut libc::c_void, self.len);
                }
            }
        }
    }
}

/// Heap-backed storage; holds bytes but can not execute them.
pub struct HeapMem {
    bytes: Vec<u8>,
}

impl CodeMemory for HeapMem {
    fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn publish(&mut self) {}
}

/// The default allocator: mmap on unix, heap elsewhere.
#[derive(Default)]
pub struct MmapCodeAllocator;

impl CodeAllocator for MmapCodeAllocator {
    fn alloc_code(&self, size: usize, reloc_slots: usize) -> CodeBlock {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                let mem = Mmap::with_at_least(size).expect("code mapping");
                CodeBlock::new(Box::new(mem), reloc_slots)
            } else {
                let mem = HeapMem { bytes: vec![0; size] };
                CodeBlock::new(Box::new(mem), reloc_slots)
            }
        }
    }
}

/// An allocator that always returns heap memory; used by tests that only
/// inspect emitted bytes.
#[derive(Default)]
pub struct HeapCodeAllocator;

impl CodeAllocator for HeapCodeAllocator {
    fn alloc_code(&self, size: usize, reloc_slots: usize) -> CodeBlock {
        let mem = HeapMem {
            bytes: vec![0; size],
        };
        CodeBlock::new(Box::new(mem), reloc_slots)
    }
}
