//! Page Table Manager
//!
//! Owns the flat page-id space. Pages `[0, num_page_table_entries)` are
//! "backed": each has a device page table entry (samplers, resources).
//! Pages above are "unbacked" tile pages whose residency is tracked by the
//! paging system alone. Both regions hand out contiguous ranges from a cursor
//! and never reclaim them.

use std::fmt;
use std::sync::Arc;

use crate::request_processor::RequestHandler;
use crate::{PagingError, PagingResult};

struct PageRange {
    start: u32,
    end: u32,
    handler: Option<Arc<dyn RequestHandler>>,
}

#[derive(Default)]
struct Region {
    ranges: Vec<PageRange>,
}

impl Region {
    fn find(&self, page_id: u32) -> Option<&PageRange> {
        // Ranges are appended in increasing page order
        let index = self.ranges.partition_point(|range| range.end <= page_id);
        self.ranges
            .get(index)
            .filter(|range| range.start <= page_id)
    }
}

/// Allocator of page-id ranges. Callers serialize access.
pub struct PageTableManager {
    num_pages: u32,
    num_page_table_entries: u32,
    next_backed_page: u32,
    next_unbacked_page: u32,
    backed: Region,
    unbacked: Region,
}

impl fmt::Debug for PageTableManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableManager")
            .field("num_pages", &self.num_pages)
            .field("num_page_table_entries", &self.num_page_table_entries)
            .field("next_backed_page", &self.next_backed_page)
            .field("next_unbacked_page", &self.next_unbacked_page)
            .finish()
    }
}

impl PageTableManager {
    pub fn new(num_pages: u32, num_page_table_entries: u32) -> Self {
        assert!(
            num_page_table_entries <= num_pages,
            "page table entries ({num_page_table_entries}) exceed the page space ({num_pages})"
        );
        Self {
            num_pages,
            num_page_table_entries,
            next_backed_page: 0,
            next_unbacked_page: num_page_table_entries,
            backed: Region::default(),
            unbacked: Region::default(),
        }
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn num_page_table_entries(&self) -> u32 {
        self.num_page_table_entries
    }

    /// Reserve `num_pages` contiguous pages with page table entries
    pub fn reserve_backed_pages(
        &mut self,
        num_pages: u32,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> PagingResult<u32> {
        let start = reserve(
            &mut self.next_backed_page,
            self.num_page_table_entries,
            num_pages,
            handler,
            &mut self.backed,
        )?;
        log::debug!("reserved backed pages [{}, {})", start, start + num_pages);
        Ok(start)
    }

    /// Reserve `num_pages` contiguous tile pages
    pub fn reserve_unbacked_pages(
        &mut self,
        num_pages: u32,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> PagingResult<u32> {
        let start = reserve(
            &mut self.next_unbacked_page,
            self.num_pages,
            num_pages,
            handler,
            &mut self.unbacked,
        )?;
        log::debug!("reserved tile pages [{}, {})", start, start + num_pages);
        Ok(start)
    }

    /// One past the highest page handed out
    pub fn end_page(&self) -> u32 {
        self.next_unbacked_page
    }

    /// Pages still available in the backed region
    pub fn available_backed_pages(&self) -> u32 {
        self.num_page_table_entries - self.next_backed_page
    }

    /// Pages still available in the tile region
    pub fn available_unbacked_pages(&self) -> u32 {
        self.num_pages - self.next_unbacked_page
    }

    /// Handler of the range containing `page_id`
    pub fn request_handler(&self, page_id: u32) -> Option<Arc<dyn RequestHandler>> {
        let region = if page_id < self.num_page_table_entries {
            &self.backed
        } else {
            &self.unbacked
        };
        region.find(page_id).and_then(|range| range.handler.clone())
    }
}

fn reserve(
    cursor: &mut u32,
    limit: u32,
    num_pages: u32,
    handler: Option<Arc<dyn RequestHandler>>,
    region: &mut Region,
) -> PagingResult<u32> {
    let available = limit - *cursor;
    if num_pages > available {
        return Err(PagingError::PageSpaceExhausted {
            requested: num_pages,
            available,
        });
    }

    let start = *cursor;
    *cursor += num_pages;
    if num_pages > 0 {
        region.ranges.push(PageRange {
            start,
            end: start + num_pages,
            handler,
        });
    }
    Ok(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_processor::FillOutcome;
    use texpage_platform::Stream;

    struct Named(&'static str);

    impl RequestHandler for Named {
        fn fill_request(&self, _stream: &Stream, _page_id: u32) -> PagingResult<FillOutcome> {
            Ok(FillOutcome::Filled)
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    fn handler_name(manager: &PageTableManager, page_id: u32) -> Option<String> {
        manager
            .request_handler(page_id)
            .map(|handler| handler.name().to_string())
    }

    #[test]
    fn test_regions_are_separate() {
        let mut manager = PageTableManager::new(1000, 100);
        assert_eq!(manager.end_page(), 100);

        assert_eq!(manager.reserve_backed_pages(10, None).unwrap(), 0);
        assert_eq!(manager.reserve_backed_pages(5, None).unwrap(), 10);
        assert_eq!(manager.reserve_unbacked_pages(50, None).unwrap(), 100);
        assert_eq!(manager.reserve_unbacked_pages(25, None).unwrap(), 150);

        assert_eq!(manager.end_page(), 175);
        assert_eq!(manager.available_backed_pages(), 85);
        assert_eq!(manager.available_unbacked_pages(), 825);
    }

    #[test]
    fn test_exhaustion() {
        let mut manager = PageTableManager::new(200, 100);
        manager.reserve_backed_pages(90, None).unwrap();
        assert!(matches!(
            manager.reserve_backed_pages(11, None),
            Err(PagingError::PageSpaceExhausted { requested: 11, available: 10 })
        ));
        assert_eq!(manager.reserve_backed_pages(10, None).unwrap(), 90);

        assert!(manager.reserve_unbacked_pages(101, None).is_err());
        assert_eq!(manager.reserve_unbacked_pages(100, None).unwrap(), 100);
        assert_eq!(manager.end_page(), 200);
    }

    #[test]
    fn test_handler_lookup() {
        let mut manager = PageTableManager::new(1000, 100);
        manager.reserve_backed_pages(4, Some(Arc::new(Named("handler-1")))).unwrap();
        manager.reserve_backed_pages(0, Some(Arc::new(Named("handler-9")))).unwrap();
        manager.reserve_backed_pages(3, None).unwrap();
        manager.reserve_backed_pages(2, Some(Arc::new(Named("handler-2")))).unwrap();
        manager.reserve_unbacked_pages(64, Some(Arc::new(Named("handler-3")))).unwrap();

        assert_eq!(handler_name(&manager, 0).as_deref(), Some("handler-1"));
        assert_eq!(handler_name(&manager, 3).as_deref(), Some("handler-1"));
        assert_eq!(handler_name(&manager, 4), None);
        assert_eq!(handler_name(&manager, 8).as_deref(), Some("handler-2"));
        assert_eq!(handler_name(&manager, 9), None);
        assert_eq!(handler_name(&manager, 99), None);
        assert_eq!(handler_name(&manager, 100).as_deref(), Some("handler-3"));
        assert_eq!(handler_name(&manager, 163).as_deref(), Some("handler-3"));
        assert_eq!(handler_name(&manager, 164), None);
    }
}
