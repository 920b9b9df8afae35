//! Anonymous executable mappings.

use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};

pub struct Mapping {
    ptr: *mut core::ffi::c_void,
    len: usize,
}

// The mapping is plain memory; sending it between threads is fine.
unsafe impl Send for Mapping {}

impl Mapping {
    pub fn new_writable(len: usize) -> rustix::io::Result<Mapping> {
        let len = round_to_page(len);
        let ptr = unsafe {
            mmap_anonymous(
                core::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };
        Ok(Mapping { ptr, len })
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.cast(), self.len) }
    }

    /// Flip the whole mapping to read-execute.
    pub fn make_executable(&mut self) -> rustix::io::Result<()> {
        unsafe { mprotect(self.ptr, self.len, MprotectFlags::READ | MprotectFlags::EXEC) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

fn round_to_page(len: usize) -> usize {
    let page = rustix::param::page_size();
    (len + page - 1) & !(page - 1)
}
