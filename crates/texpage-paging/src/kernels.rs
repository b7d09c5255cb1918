//! Device-side kernels and sampling helpers.
//!
//! The push kernel applies host mapping updates to the shared page table,
//! residence bits and LRU table. The pull kernel scans the request bits of a
//! context, ages LRU values and writes the requested and stale page lists.
//! The `paging_*` helpers are what sampling code runs per texture fetch.

use rayon::prelude::*;
use texpage_platform::{Device, DevicePtr, DeviceResult, Stream};

use crate::device_context::{DeviceContext, DevicePageMapping, StalePage, array_length};
use crate::paging_system::{MAX_LRU_VAL, NON_EVICTABLE_LRU_VAL};
use crate::sampler::{BASE_COLOR_OFFSET, TextureSampler};

const WORD_BITS: u32 = 32;

fn read_array_lengths(device: &Device, context: &DeviceContext) -> DeviceResult<[u32; array_length::COUNT]> {
    device.read_value(context.array_lengths.device_ptr())
}

/// Apply the filled and invalidated lists of `context`
pub fn push_mappings_kernel(device: &Device, context: &DeviceContext) -> DeviceResult<()> {
    let lengths = read_array_lengths(device, context)?;
    let num_filled = lengths[array_length::FILLED].min(context.filled_pages.capacity) as usize;
    let num_invalidated =
        lengths[array_length::INVALIDATED].min(context.invalidated_pages.capacity) as usize;
    if num_filled == 0 && num_invalidated == 0 {
        return Ok(());
    }

    let filled: Vec<DevicePageMapping> =
        device.read_vec(context.filled_pages.device_ptr(), num_filled)?;
    let invalidated: Vec<u32> =
        device.read_vec(context.invalidated_pages.device_ptr(), num_invalidated)?;

    let residence_ptr = context.residence_bits.device_ptr();
    let mut residence: Vec<u32> =
        device.read_vec(residence_ptr, context.residence_bits.capacity as usize)?;
    let use_lru = context.use_lru_table();
    let mut lru: Vec<u8> = if use_lru {
        device.read_vec(context.lru_table.device_ptr(), context.lru_table.capacity as usize)?
    } else {
        Vec::new()
    };

    for &page_id in &invalidated {
        residence[(page_id / WORD_BITS) as usize] &= !(1 << (page_id % WORD_BITS));
        if page_id < context.page_table.capacity {
            device.write_value(context.page_table.element(page_id, 8), &0u64)?;
        }
        if let Some(value) = lru.get_mut(page_id as usize) {
            *value = 0;
        }
    }

    for mapping in &filled {
        let page_id = mapping.page_id;
        residence[(page_id / WORD_BITS) as usize] |= 1 << (page_id % WORD_BITS);
        if page_id < context.page_table.capacity {
            device.write_value(context.page_table.element(page_id, 8), &mapping.entry)?;
        }
        if let Some(value) = lru.get_mut(page_id as usize) {
            *value = mapping.lru_val as u8;
        }
    }

    device.write_slice(residence_ptr, &residence)?;
    if use_lru {
        device.write_slice(context.lru_table.device_ptr(), &lru)?;
    }
    Ok(())
}

/// Scan the request bits of `[start_page, end_page)`.
///
/// Writes requested pages (non-resident ones, or all of them when the context
/// asks for hits) and, with an LRU table, ages resident pages and writes the
/// stale ones. Both lists are truncated to their capacity.
pub fn pull_requests_kernel(
    device: &Device,
    context: &DeviceContext,
    start_page: u32,
    end_page: u32,
) -> DeviceResult<()> {
    let request_bits: Vec<u32> =
        device.read_vec(context.request_bits.device_ptr(), context.request_bits.capacity as usize)?;
    let residence: Vec<u32> =
        device.read_vec(context.residence_bits.device_ptr(), context.residence_bits.capacity as usize)?;
    let use_lru = context.use_lru_table();
    let request_if_resident = context.request_if_resident();

    let mut lru: Vec<u8> = if use_lru {
        device.read_vec(context.lru_table.device_ptr(), context.lru_table.capacity as usize)?
    } else {
        vec![0; request_bits.len() * WORD_BITS as usize]
    };

    let per_word: Vec<(Vec<u32>, Vec<StalePage>)> = lru
        .par_chunks_mut(WORD_BITS as usize)
        .enumerate()
        .map(|(word, lru_values)| {
            let mut requested = Vec::new();
            let mut stale = Vec::new();
            let base = word as u32 * WORD_BITS;
            let (Some(&requests), Some(&resident)) = (request_bits.get(word), residence.get(word)) else {
                return (requested, stale);
            };

            for (bit, lru_val) in lru_values.iter_mut().enumerate() {
                let page_id = base + bit as u32;
                if page_id < start_page || page_id >= end_page {
                    continue;
                }
                let is_requested = requests & (1 << bit) != 0;
                let is_resident = resident & (1 << bit) != 0;

                if is_requested && (!is_resident || request_if_resident) {
                    requested.push(page_id);
                }
                if !use_lru || !is_resident || *lru_val == NON_EVICTABLE_LRU_VAL as u8 {
                    continue;
                }
                if is_requested {
                    *lru_val = 0;
                } else {
                    if *lru_val >= 1 {
                        stale.push(StalePage {
                            page_id,
                            lru_val: (*lru_val as u32 + 1).min(MAX_LRU_VAL),
                        });
                    }
                    *lru_val = (*lru_val + 1).min(MAX_LRU_VAL as u8);
                }
            }
            (requested, stale)
        })
        .collect();

    let mut requested: Vec<u32> = Vec::new();
    let mut stale: Vec<StalePage> = Vec::new();
    for (word_requested, word_stale) in per_word {
        requested.extend(word_requested);
        stale.extend(word_stale);
    }
    requested.truncate(context.requested_pages.capacity as usize);
    stale.truncate(context.stale_pages.capacity as usize);

    device.write_slice(context.requested_pages.device_ptr(), &requested)?;
    device.write_slice(context.stale_pages.device_ptr(), &stale)?;
    device.write_value(
        context.array_lengths.element(array_length::REQUESTED as u32, 4),
        &(requested.len() as u32),
    )?;
    device.write_value(
        context.array_lengths.element(array_length::STALE as u32, 4),
        &(stale.len() as u32),
    )?;
    if use_lru {
        device.write_slice(context.lru_table.device_ptr(), &lru)?;
    }
    Ok(())
}

/// Enqueue the push kernel on `stream`
pub fn launch_push_mappings(stream: &Stream, context: DeviceContext) -> DeviceResult<()> {
    stream.launch("push_mappings", move |device| push_mappings_kernel(device, &context))
}

/// Enqueue the pull kernel on `stream`
pub fn launch_pull_requests(
    stream: &Stream,
    context: DeviceContext,
    start_page: u32,
    end_page: u32,
) -> DeviceResult<()> {
    stream.launch("pull_requests", move |device| {
        pull_requests_kernel(device, &context, start_page, end_page)
    })
}

// ---- Sampling side ----

/// Record a request for `page_id`
#[inline]
pub fn paging_request(device: &Device, context: &DeviceContext, page_id: u32) -> DeviceResult<()> {
    let word = context.request_bits.element(page_id / WORD_BITS, 4);
    device.fetch_or_u32(word, 1 << (page_id % WORD_BITS))?;
    Ok(())
}

#[inline]
pub fn paging_is_resident(device: &Device, context: &DeviceContext, page_id: u32) -> DeviceResult<bool> {
    let word: u32 = device.read_value(context.residence_bits.element(page_id / WORD_BITS, 4))?;
    Ok(word & (1 << (page_id % WORD_BITS)) != 0)
}

/// Page table entry of a resident page, or `None` after recording a request.
///
/// Tile pages have no page table entry and map to 0. With
/// `REQUEST_IF_RESIDENT` set, hits are recorded too.
pub fn paging_map_or_request(
    device: &Device,
    context: &DeviceContext,
    page_id: u32,
) -> DeviceResult<Option<u64>> {
    let resident = paging_is_resident(device, context, page_id)?;
    if !resident || context.request_if_resident() {
        paging_request(device, context, page_id)?;
    }
    if !resident {
        return Ok(None);
    }
    if page_id < context.page_table.capacity {
        Ok(Some(device.read_value(context.page_table.element(page_id, 8))?))
    } else {
        Ok(Some(0))
    }
}

/// Sampler of a texture, or `None` after requesting its page
pub fn paging_texture_sampler(
    device: &Device,
    context: &DeviceContext,
    texture_id: u32,
) -> DeviceResult<Option<TextureSampler>> {
    match paging_map_or_request(device, context, texture_id)? {
        Some(address) if address != 0 => Ok(Some(device.read_value(DevicePtr(address))?)),
        _ => Ok(None),
    }
}

/// Emulates one texture fetch touching tile `(tile_x, tile_y)` of `mip_level`.
///
/// Returns the page table entry of the tile page (0 for tile pages, the dense
/// storage address for dense textures), or `None` if the sampler or the tile
/// was not resident and has been requested. Levels in the mip tail resolve to
/// the tail page.
pub fn paging_request_texture_tile(
    device: &Device,
    context: &DeviceContext,
    texture_id: u32,
    mip_level: u32,
    tile_x: u32,
    tile_y: u32,
) -> DeviceResult<Option<u64>> {
    let Some(sampler) = paging_texture_sampler(device, context, texture_id)? else {
        return Ok(None);
    };
    if sampler.num_pages == 0 {
        return Ok(Some(sampler.texture));
    }

    let page_id = if mip_level >= sampler.mip_tail_first_level {
        sampler.start_page
    } else {
        sampler.tile_page_id(mip_level, tile_x, tile_y)
    };
    paging_map_or_request(device, context, page_id)
}

/// Base color of a texture as packed RGBA unorm16, or `None` after requesting it
pub fn paging_texture_base_color(
    device: &Device,
    context: &DeviceContext,
    texture_id: u32,
) -> DeviceResult<Option<u64>> {
    paging_map_or_request(device, context, texture_id + BASE_COLOR_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_context::{ContextFlags, DeviceView, bitmap_words};
    use texpage_platform::DeviceCapabilities;

    const NUM_PAGES: u32 = 256;
    const NUM_PTE: u32 = 64;

    fn view(device: &Device, count: u32, elem_size: usize) -> DeviceView {
        DeviceView::new(device.alloc(count as usize * elem_size).unwrap(), count)
    }

    fn context(device: &Device, flags: ContextFlags) -> DeviceContext {
        let mut context = DeviceContext {
            page_table: view(device, NUM_PTE, 8),
            residence_bits: view(device, bitmap_words(NUM_PAGES), 4),
            lru_table: view(device, NUM_PAGES, 1),
            request_bits: view(device, bitmap_words(NUM_PAGES), 4),
            requested_pages: view(device, 16, 4),
            stale_pages: view(device, 16, 8),
            filled_pages: view(device, 16, 16),
            invalidated_pages: view(device, 16, 4),
            array_lengths: view(device, 4, 4),
            flags: 0,
            pool_index: 0,
        };
        context.set_flags(flags);
        context
    }

    fn push(device: &Device, context: &DeviceContext, filled: &[DevicePageMapping], invalidated: &[u32]) {
        device.write_slice(context.filled_pages.device_ptr(), filled).unwrap();
        device.write_slice(context.invalidated_pages.device_ptr(), invalidated).unwrap();
        device
            .write_value(
                context.array_lengths.device_ptr(),
                &[0u32, 0, filled.len() as u32, invalidated.len() as u32],
            )
            .unwrap();
        push_mappings_kernel(device, context).unwrap();
    }

    fn pull(device: &Device, context: &DeviceContext) -> (Vec<u32>, Vec<StalePage>) {
        pull_requests_kernel(device, context, 0, NUM_PAGES).unwrap();
        let lengths = read_array_lengths(device, context).unwrap();
        let requested = device
            .read_vec(context.requested_pages.device_ptr(), lengths[array_length::REQUESTED] as usize)
            .unwrap();
        let stale = device
            .read_vec(context.stale_pages.device_ptr(), lengths[array_length::STALE] as usize)
            .unwrap();
        (requested, stale)
    }

    fn mapping(page_id: u32, lru_val: u32, entry: u64) -> DevicePageMapping {
        DevicePageMapping { page_id, lru_val, entry }
    }

    #[test]
    fn test_push_sets_entries_and_residence() {
        let device = Device::new(DeviceCapabilities::default());
        let context = context(&device, ContextFlags::USE_LRU_TABLE);
        push(&device, &context, &[mapping(3, 15, 0xabc0), mapping(100, 0, 0)], &[]);

        assert!(paging_is_resident(&device, &context, 3).unwrap());
        assert!(paging_is_resident(&device, &context, 100).unwrap());
        assert!(!paging_is_resident(&device, &context, 4).unwrap());
        let entry: u64 = device.read_value(context.page_table.element(3, 8)).unwrap();
        assert_eq!(entry, 0xabc0);
        let lru: u8 = device.read_value(context.lru_table.element(3, 1)).unwrap();
        assert_eq!(lru, 15);

        push(&device, &context, &[], &[3]);
        assert!(!paging_is_resident(&device, &context, 3).unwrap());
        let entry: u64 = device.read_value(context.page_table.element(3, 8)).unwrap();
        assert_eq!(entry, 0);
    }

    #[test]
    fn test_map_or_request() {
        let device = Device::new(DeviceCapabilities::default());
        let context = context(&device, ContextFlags::empty());
        push(&device, &context, &[mapping(5, 0, 0x1000), mapping(70, 0, 0)], &[]);

        assert_eq!(paging_map_or_request(&device, &context, 5).unwrap(), Some(0x1000));
        assert_eq!(paging_map_or_request(&device, &context, 70).unwrap(), Some(0));
        assert_eq!(paging_map_or_request(&device, &context, 71).unwrap(), None);
        assert_eq!(paging_map_or_request(&device, &context, 200).unwrap(), None);

        let (requested, stale) = pull(&device, &context);
        assert_eq!(requested, vec![71, 200]);
        assert!(stale.is_empty());
    }

    #[test]
    fn test_request_if_resident_reports_hits() {
        let device = Device::new(DeviceCapabilities::default());
        let context = context(&device, ContextFlags::REQUEST_IF_RESIDENT);
        push(&device, &context, &[mapping(70, 0, 0)], &[]);

        assert_eq!(paging_map_or_request(&device, &context, 70).unwrap(), Some(0));
        paging_request(&device, &context, 90).unwrap();
        let (requested, _) = pull(&device, &context);
        assert_eq!(requested, vec![70, 90]);
    }

    #[test]
    fn test_pull_ages_lru_values() {
        let device = Device::new(DeviceCapabilities::default());
        let context = context(&device, ContextFlags::USE_LRU_TABLE);
        push(
            &device,
            &context,
            &[mapping(64, 0, 0), mapping(65, 13, 0), mapping(66, 15, 0), mapping(67, 5, 0)],
            &[],
        );
        paging_request(&device, &context, 67).unwrap();

        let (requested, stale) = pull(&device, &context);
        assert!(requested.is_empty());
        assert_eq!(stale, vec![StalePage { page_id: 65, lru_val: 14 }]);

        let lru: Vec<u8> = device.read_vec(context.lru_table.element(64, 1), 4).unwrap();
        assert_eq!(lru, vec![1, 14, 15, 0]);

        // Saturates at the maximum and never touches pinned pages
        device.fill(context.request_bits.device_ptr(), 4 * bitmap_words(NUM_PAGES) as usize, 0).unwrap();
        let (_, stale) = pull(&device, &context);
        let stale_pages: Vec<u32> = stale.iter().map(|page| page.page_id).collect();
        assert_eq!(stale_pages, vec![64, 65]);
        let lru: Vec<u8> = device.read_vec(context.lru_table.element(64, 1), 4).unwrap();
        assert_eq!(lru, vec![2, 14, 15, 1]);
    }

    #[test]
    fn test_pull_respects_range_and_capacity() {
        let device = Device::new(DeviceCapabilities::default());
        let context = context(&device, ContextFlags::empty());
        for page_id in 100..140 {
            paging_request(&device, &context, page_id).unwrap();
        }
        paging_request(&device, &context, 2).unwrap();

        pull_requests_kernel(&device, &context, 64, NUM_PAGES).unwrap();
        let lengths = read_array_lengths(&device, &context).unwrap();
        assert_eq!(lengths[array_length::REQUESTED], 16);
        let requested: Vec<u32> = device.read_vec(context.requested_pages.device_ptr(), 16).unwrap();
        assert_eq!(requested, (100..116).collect::<Vec<_>>());
    }

    #[test]
    fn test_texture_tile_request_goes_through_sampler() {
        let device = Device::new(DeviceCapabilities::default());
        let context = context(&device, ContextFlags::empty());

        assert_eq!(paging_request_texture_tile(&device, &context, 8, 0, 0, 0).unwrap(), None);

        let mut sampler = TextureSampler {
            start_page: 128,
            num_pages: 10,
            mip_tail_first_level: 1,
            ..Default::default()
        };
        sampler.desc.set_num_mip_levels(3);
        sampler.mip_level_sizes[0].mip_level_start = 1;
        sampler.mip_level_sizes[0].level_width_in_tiles = 2;
        let address = device.alloc(std::mem::size_of::<TextureSampler>()).unwrap();
        device.write_value(address, &sampler).unwrap();
        push(&device, &context, &[mapping(8, 15, address.0)], &[]);

        assert_eq!(paging_request_texture_tile(&device, &context, 8, 0, 1, 0).unwrap(), None);
        assert_eq!(paging_request_texture_tile(&device, &context, 8, 2, 0, 0).unwrap(), None);
        let (requested, _) = pull(&device, &context);
        // The sampler page is resident now, so only the tiles are reported
        assert_eq!(requested, vec![128, 130]);

        assert_eq!(paging_texture_sampler(&device, &context, 8).unwrap(), Some(sampler));
        assert!(paging_texture_base_color(&device, &context, 8).unwrap().is_none());
    }
}
