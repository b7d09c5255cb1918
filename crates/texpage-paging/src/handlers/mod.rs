//! Request handlers of the demand loader.
//!
//! Each handler owns a page range: the sampler handler the texture id pages,
//! one texture handler per texture the tile pages of that texture, and one
//! resource handler per resource its page range. Handlers keep a weak
//! reference to the loader so the page table does not keep it alive.

mod resource;
mod sampler;
mod texture;

pub use resource::ResourceCallback;
pub(crate) use resource::ResourceRequestHandler;
pub(crate) use sampler::SamplerRequestHandler;
pub(crate) use texture::TextureRequestHandler;

use std::sync::{Arc, Weak};

use crate::demand_loader::LoaderCore;

/// Loader of a handler, or `None` once the loader is gone
fn upgrade(core: &Weak<LoaderCore>) -> Option<Arc<LoaderCore>> {
    let core = core.upgrade();
    if core.is_none() {
        log::debug!("demand loader dropped; ignoring request");
    }
    core
}
