//! Device Context
//!
//! Fixed-layout structures shared between host and device code. A
//! [`DeviceContext`] is handed to every launch that samples demand-loaded
//! textures; its field order is part of the device ABI.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use texpage_platform::DevicePtr;

/// Device pointer with an element capacity
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceView {
    pub ptr: u64,
    pub capacity: u32,
    pub _pad: u32,
}

impl DeviceView {
    pub fn new(ptr: DevicePtr, capacity: u32) -> Self {
        Self {
            ptr: ptr.0,
            capacity,
            _pad: 0,
        }
    }

    pub fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.ptr)
    }

    /// Pointer to element `index` of `elem_size` bytes
    pub fn element(&self, index: u32, elem_size: usize) -> DevicePtr {
        DevicePtr(self.ptr).offset(index as u64 * elem_size as u64)
    }
}

bitflags! {
    /// Per-launch behavior flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u32 {
        /// Report requests for pages that are already resident, refreshing their LRU value
        const REQUEST_IF_RESIDENT = 1 << 0;
        /// Keep LRU values on the device and report stale pages
        const USE_LRU_TABLE = 1 << 1;
    }
}

/// Slots of [`DeviceContext::array_lengths`]
pub mod array_length {
    pub const REQUESTED: usize = 0;
    pub const STALE: usize = 1;
    pub const FILLED: usize = 2;
    pub const INVALIDATED: usize = 3;
    pub const COUNT: usize = 4;
}

/// Per-launch view of the paging state.
///
/// `page_table`, `residence_bits` and `lru_table` are shared by every context
/// of a device; the remaining buffers belong to this context.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceContext {
    /// `u64` entries for pages below the page table entry count
    pub page_table: DeviceView,
    /// One bit per page
    pub residence_bits: DeviceView,
    /// One `u8` LRU value per page
    pub lru_table: DeviceView,
    /// One bit per page, set by sampling code on a miss
    pub request_bits: DeviceView,
    /// `u32` page ids written by the pull kernel
    pub requested_pages: DeviceView,
    /// [`StalePage`] entries written by the pull kernel
    pub stale_pages: DeviceView,
    /// [`DevicePageMapping`] entries read by the push kernel
    pub filled_pages: DeviceView,
    /// `u32` page ids read by the push kernel
    pub invalidated_pages: DeviceView,
    /// `u32` lengths, indexed by [`array_length`]
    pub array_lengths: DeviceView,
    /// [`ContextFlags`] bits
    pub flags: u32,
    /// Slot in the owning pool
    pub pool_index: u32,
}

impl DeviceContext {
    pub fn flags(&self) -> ContextFlags {
        ContextFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: ContextFlags) {
        self.flags = flags.bits();
    }

    pub fn request_if_resident(&self) -> bool {
        self.flags().contains(ContextFlags::REQUEST_IF_RESIDENT)
    }

    pub fn use_lru_table(&self) -> bool {
        self.flags().contains(ContextFlags::USE_LRU_TABLE)
    }
}

/// Mapping applied by the push kernel
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DevicePageMapping {
    pub page_id: u32,
    pub lru_val: u32,
    pub entry: u64,
}

/// Resident page that was not referenced by the last launch
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StalePage {
    pub page_id: u32,
    pub lru_val: u32,
}

/// Words needed for a bitmap over `num_pages` pages
pub fn bitmap_words(num_pages: u32) -> u32 {
    num_pages.div_ceil(32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_context_layout() {
        assert_eq!(size_of::<DeviceView>(), 16);
        assert_eq!(offset_of!(DeviceContext, page_table), 0);
        assert_eq!(offset_of!(DeviceContext, request_bits), 48);
        assert_eq!(offset_of!(DeviceContext, array_lengths), 128);
        assert_eq!(offset_of!(DeviceContext, flags), 144);
        assert_eq!(offset_of!(DeviceContext, pool_index), 148);
        assert_eq!(size_of::<DeviceContext>(), 152);
    }

    #[test]
    fn test_mapping_layout() {
        assert_eq!(size_of::<DevicePageMapping>(), 16);
        assert_eq!(size_of::<StalePage>(), 8);
    }

    #[test]
    fn test_flags() {
        let mut context = DeviceContext::default();
        assert!(!context.request_if_resident());

        context.set_flags(ContextFlags::REQUEST_IF_RESIDENT | ContextFlags::USE_LRU_TABLE);
        assert!(context.request_if_resident());
        assert!(context.use_lru_table());
        assert_eq!(context.flags, 3);
    }

    #[test]
    fn test_view_elements() {
        let view = DeviceView::new(DevicePtr(0x1000), 4);
        assert_eq!(view.element(3, 8), DevicePtr(0x1018));
        assert_eq!(view.device_ptr(), DevicePtr(0x1000));
        assert_eq!(bitmap_words(33), 2);
    }
}
