use std::sync::Weak;

use texpage_platform::Stream;

use super::upgrade;
use crate::demand_loader::LoaderCore;
use crate::paging_system::NON_EVICTABLE_LRU_VAL;
use crate::request_processor::{FillOutcome, RequestHandler};
use crate::{PagingError, PagingResult};

/// Fill callback of a resource.
///
/// Called on a worker thread with the stream of the launch that requested
/// the page and the page id. Returns the page table entry to map, or `None`
/// when the page cannot be provided yet and should be requested again.
pub type ResourceCallback = Box<dyn Fn(&Stream, u32) -> anyhow::Result<Option<u64>> + Send + Sync>;

/// Forwards the pages of a resource to its callback
pub(crate) struct ResourceRequestHandler {
    core: Weak<LoaderCore>,
    callback: ResourceCallback,
}

impl ResourceRequestHandler {
    pub fn new(core: Weak<LoaderCore>, callback: ResourceCallback) -> Self {
        Self { core, callback }
    }
}

impl RequestHandler for ResourceRequestHandler {
    fn fill_request(&self, stream: &Stream, page_id: u32) -> PagingResult<FillOutcome> {
        let Some(core) = upgrade(&self.core) else {
            return Ok(FillOutcome::Deferred);
        };
        let paging = core.page_loader.paging_system();
        if paging.has_mapping(page_id) {
            return Ok(FillOutcome::Filled);
        }

        match (self.callback)(stream, page_id).map_err(PagingError::Callback)? {
            Some(entry) => {
                paging.add_mapping(page_id, NON_EVICTABLE_LRU_VAL, entry);
                Ok(FillOutcome::Filled)
            }
            None => Ok(FillOutcome::Deferred),
        }
    }

    fn name(&self) -> &str {
        "resource"
    }
}
