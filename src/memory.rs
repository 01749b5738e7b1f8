//! Scoped device memory.
//!
//! # Device Buffers
//!
//! Kernels never see tensors here, only raw regions of device-addressable
//! memory handed out by a [`DeviceAllocator`]. The harness wraps every region
//! in a [`DeviceMem`], which owns it for exactly one scope:
//!
//! - allocation happens in [`DeviceMem::new`] and fails with
//!   [`TuneError::Allocation`] (no retry);
//! - release happens in `Drop`, once, on every exit path including `?`;
//! - the harness itself never writes into a buffer, only candidates do.
//!
//! [`HostAllocator`] is the stock allocator. It hands out 64-byte aligned,
//! zero-initialised host memory, so CPU candidates can address the regions
//! directly and GPU candidates stage through them. An optional capacity turns it into a
//! bounded pool for exhaustion tests, and [`HostAllocator::live_bytes`]
//! makes leaks observable.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use briny_tune::memory::{DeviceMem, HostAllocator};
//!
//! let alloc = Arc::new(HostAllocator::new());
//! {
//!     let mut variance = DeviceMem::with_elements::<f32>(alloc.clone(), 256).unwrap();
//!     variance.set_zero().unwrap();
//!     assert_eq!(alloc.live_bytes(), 1024);
//! }
//! assert_eq!(alloc.live_bytes(), 0);
//! ```

use core::ptr::NonNull;
use std::alloc::Layout;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::element::Element;
use crate::error::TuneError;

/// Alignment of every region handed out by [`HostAllocator`].
pub const HOST_ALIGN: usize = 64;

/// Opaque address of a device region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(NonNull<u8>);

// A device address is plain data; access rules are carried by `DeviceMem`.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

impl DevicePtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// The external device-memory collaborator.
///
/// # Safety
/// A region returned by [`DeviceAllocator::allocate`] must be valid for
/// `size_bytes` bytes and aligned to at least [`HOST_ALIGN`] until it is
/// freed. If [`DeviceAllocator::host_accessible`] returns `true`, the host
/// must be able to read and write it through [`DevicePtr::as_ptr`].
/// [`DeviceMem`] relies on both.
pub unsafe trait DeviceAllocator: Send + Sync {
    /// Human-readable allocator name, used in log lines.
    fn name(&self) -> &str;

    /// Whether regions from this allocator can be dereferenced by the host.
    fn host_accessible(&self) -> bool;

    fn allocate(&self, size_bytes: usize) -> Result<DevicePtr, TuneError>;

    /// Fills a region with zero bytes.
    ///
    /// # Safety
    /// `ptr` must be a live region from [`DeviceAllocator::allocate`] on this
    /// allocator, at least `size_bytes` long, with no outstanding views.
    ///
    /// ```compile_fail
    /// use core::ptr::NonNull;
    /// use briny_tune::memory::{DeviceAllocator, DevicePtr, HostAllocator};
    ///
    /// let alloc = HostAllocator::new();
    /// alloc.zero(DevicePtr::new(NonNull::dangling()), 4096).unwrap();
    /// ```
    unsafe fn zero(&self, ptr: DevicePtr, size_bytes: usize) -> Result<(), TuneError>;

    /// Returns a region to the allocator.
    ///
    /// # Safety
    /// `ptr` must have come from [`DeviceAllocator::allocate`] on this
    /// allocator with the same `size_bytes`, and must not be freed twice.
    unsafe fn free(&self, ptr: DevicePtr, size_bytes: usize);
}

/// Aligned host memory posing as device memory.
#[derive(Debug, Default)]
pub struct HostAllocator {
    capacity: Option<usize>,
    live: AtomicUsize,
}

impl HostAllocator {
    /// An allocator limited only by the system allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// An allocator that refuses to hold more than `capacity` live bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            live: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated and not yet freed.
    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn layout(size_bytes: usize) -> Result<Layout, TuneError> {
        Layout::from_size_align(size_bytes, HOST_ALIGN)
            .map_err(|e| TuneError::allocation(size_bytes, e.to_string()))
    }
}

unsafe impl DeviceAllocator for HostAllocator {
    fn name(&self) -> &str {
        "host"
    }

    fn host_accessible(&self) -> bool {
        true
    }

    fn allocate(&self, size_bytes: usize) -> Result<DevicePtr, TuneError> {
        if size_bytes == 0 {
            return Err(TuneError::allocation(0, "zero-sized region"));
        }
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                let next = live.checked_add(size_bytes)?;
                match self.capacity {
                    Some(cap) if next > cap => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            return Err(TuneError::allocation(size_bytes, "host pool exhausted"));
        }

        let layout = match Self::layout(size_bytes) {
            Ok(layout) => layout,
            Err(e) => {
                self.live.fetch_sub(size_bytes, Ordering::AcqRel);
                return Err(e);
            }
        };
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        match NonNull::new(raw) {
            Some(ptr) => Ok(DevicePtr::new(ptr)),
            None => {
                self.live.fetch_sub(size_bytes, Ordering::AcqRel);
                Err(TuneError::allocation(size_bytes, "system allocator returned null"))
            }
        }
    }

    unsafe fn zero(&self, ptr: DevicePtr, size_bytes: usize) -> Result<(), TuneError> {
        unsafe { ptr.as_ptr().write_bytes(0, size_bytes) };
        Ok(())
    }

    unsafe fn free(&self, ptr: DevicePtr, size_bytes: usize) {
        // layout was valid at allocation time, so it is valid now
        if let Ok(layout) = Self::layout(size_bytes) {
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            self.live.fetch_sub(size_bytes, Ordering::AcqRel);
        }
    }
}

/// An owned device region, released when dropped.
pub struct DeviceMem {
    ptr: DevicePtr,
    size_bytes: usize,
    allocator: Arc<dyn DeviceAllocator>,
}

impl DeviceMem {
    /// Allocates `size_bytes` from `allocator`.
    ///
    /// # Errors
    /// [`TuneError::Allocation`] if the allocator refuses the request.
    pub fn new(allocator: Arc<dyn DeviceAllocator>, size_bytes: usize) -> Result<Self, TuneError> {
        let ptr = allocator.allocate(size_bytes)?;
        log::trace!(
            "allocated {size_bytes} bytes at {:#x} from {}",
            ptr.addr(),
            allocator.name()
        );
        Ok(Self {
            ptr,
            size_bytes,
            allocator,
        })
    }

    /// Allocates room for `count` elements of `T`.
    pub fn with_elements<T: Element>(
        allocator: Arc<dyn DeviceAllocator>,
        count: usize,
    ) -> Result<Self, TuneError> {
        let size_bytes = count
            .checked_mul(size_of::<T>())
            .ok_or_else(|| TuneError::allocation(usize::MAX, "element count overflows usize"))?;
        Self::new(allocator, size_bytes)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn device_buffer(&self) -> DevicePtr {
        self.ptr
    }

    pub fn is_host_accessible(&self) -> bool {
        self.allocator.host_accessible()
    }

    /// Fills the region with zero bytes.
    pub fn set_zero(&mut self) -> Result<(), TuneError> {
        // `&mut self` rules out any bound argument over this region
        unsafe { self.allocator.zero(self.ptr, self.size_bytes) }
    }

    /// Copies `data` to the front of the region.
    pub fn copy_from_host<T: Element>(&mut self, data: &[T]) -> Result<(), TuneError> {
        let bytes = size_of_val(data);
        self.check_host_access::<T>(bytes)?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr() as *mut T, data.len());
        }
        Ok(())
    }

    /// Reads the whole region back as elements of `T`.
    pub fn to_host_vec<T: Element>(&self) -> Result<Vec<T>, TuneError> {
        self.check_host_access::<T>(0)?;
        let len = self.size_bytes / size_of::<T>();
        let view = unsafe { core::slice::from_raw_parts(self.ptr.as_ptr() as *const T, len) };
        Ok(view.to_vec())
    }

    fn check_host_access<T: Element>(&self, bytes: usize) -> Result<(), TuneError> {
        if !self.is_host_accessible() {
            return Err(TuneError::Unsupported(format!(
                "{} memory is not host accessible",
                self.allocator.name()
            )));
        }
        if bytes > self.size_bytes {
            return Err(TuneError::Unsupported(format!(
                "host copy of {bytes} bytes exceeds {}-byte region",
                self.size_bytes
            )));
        }
        if self.ptr.addr() % align_of::<T>() != 0 {
            return Err(TuneError::Unsupported(format!(
                "region is not aligned for {}",
                T::NAME
            )));
        }
        Ok(())
    }
}

impl core::fmt::Debug for DeviceMem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceMem")
            .field("ptr", &format_args!("{:#x}", self.ptr.addr()))
            .field("size_bytes", &self.size_bytes)
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

impl Drop for DeviceMem {
    fn drop(&mut self) {
        unsafe { self.allocator.free(self.ptr, self.size_bytes) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_exactly_once() {
        let alloc = Arc::new(HostAllocator::new());
        let a = DeviceMem::new(alloc.clone(), 100).unwrap();
        let b = DeviceMem::new(alloc.clone(), 28).unwrap();
        assert_eq!(alloc.live_bytes(), 128);
        drop(a);
        assert_eq!(alloc.live_bytes(), 28);
        drop(b);
        assert_eq!(alloc.live_bytes(), 0);
    }

    #[test]
    fn regions_are_aligned() {
        let alloc = Arc::new(HostAllocator::new());
        let mem = DeviceMem::new(alloc, 3).unwrap();
        assert_eq!(mem.device_buffer().addr() % HOST_ALIGN, 0);
    }

    #[test]
    fn exhausted_pool_reports_allocation_error() {
        let alloc = Arc::new(HostAllocator::with_capacity(64));
        let _held = DeviceMem::new(alloc.clone(), 48).unwrap();
        let err = DeviceMem::new(alloc.clone(), 32).unwrap_err();
        assert!(matches!(err, TuneError::Allocation { requested: 32, .. }));
        assert_eq!(alloc.live_bytes(), 48);
    }

    #[test]
    fn zero_sized_request_is_refused() {
        let alloc = Arc::new(HostAllocator::new());
        assert!(matches!(
            DeviceMem::new(alloc, 0),
            Err(TuneError::Allocation { requested: 0, .. })
        ));
    }

    #[test]
    fn early_return_still_frees() {
        fn build(alloc: &Arc<HostAllocator>) -> Result<(), TuneError> {
            let _x = DeviceMem::new(alloc.clone(), 40)?;
            let _y = DeviceMem::new(alloc.clone(), 40)?;
            Ok(())
        }
        let alloc = Arc::new(HostAllocator::with_capacity(60));
        assert!(build(&alloc).is_err());
        assert_eq!(alloc.live_bytes(), 0);
    }

    #[test]
    fn host_round_trip_and_zero_fill() {
        let alloc = Arc::new(HostAllocator::new());
        let mut mem = DeviceMem::with_elements::<f32>(alloc, 4).unwrap();
        mem.copy_from_host(&[1.0f32, -2.0, 3.5, 4.0]).unwrap();
        assert_eq!(mem.to_host_vec::<f32>().unwrap(), vec![1.0, -2.0, 3.5, 4.0]);
        mem.set_zero().unwrap();
        assert_eq!(mem.to_host_vec::<f32>().unwrap(), vec![0.0; 4]);
        assert!(mem.copy_from_host(&[0.0f32; 5]).is_err());
    }

    #[test]
    fn zero_fill_stays_inside_the_region() {
        let alloc = Arc::new(HostAllocator::new());
        let mut pair = DeviceMem::with_elements::<f32>(alloc.clone(), 8).unwrap();
        pair.copy_from_host(&[7.0f32; 8]).unwrap();
        let mut front = DeviceMem::with_elements::<f32>(alloc, 4).unwrap();
        front.copy_from_host(&[1.0f32; 4]).unwrap();
        front.set_zero().unwrap();
        assert_eq!(front.to_host_vec::<f32>().unwrap(), vec![0.0; 4]);
        assert_eq!(pair.to_host_vec::<f32>().unwrap(), vec![7.0; 8]);
    }
}
