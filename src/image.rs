//! Public image handles and draw options.
//!
//! `Image` is deliberately not `Clone`: every live handle is the unique owner
//! of its slot, so the aliased-handle class of bug cannot be written down.
//! Dropping a handle without disposing it enqueues the underlying id on the
//! pipeline's deferred-dispose queue, drained at the next frame boundary.

use std::sync::{Arc, Mutex};

use crate::driver::{Address, Filter};
use crate::foundation::blend::Blend;
use crate::foundation::color::{ColorMatrix, ColorScale};
use crate::foundation::geom::{GeoM, Region};
use crate::mipmap::MipKey;

pub(crate) type DisposeQueue = Arc<Mutex<Vec<MipKey>>>;

pub struct Image {
    pub(crate) key: MipKey,
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Source-rect restriction for sub-image views, in backing-image
    /// coordinates.
    pub(crate) bounds: Region,
    /// Sub-image views borrow the backing image and never dispose it.
    pub(crate) is_sub: bool,
    pub(crate) disposed: bool,
    pub(crate) dispose_queue: DisposeQueue,
}

impl Image {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bounds(&self) -> Region {
        self.bounds
    }

    /// A view onto a sub-rectangle of this image, usable as a draw source.
    /// `rect` is clipped to this image's bounds.
    pub fn sub_image(&self, rect: Region) -> Image {
        let clipped = match rect.translated(self.bounds.x, self.bounds.y).intersection(self.bounds) {
            Some(r) => r,
            None => Region::new(self.bounds.x, self.bounds.y, 0, 0),
        };
        Image {
            key: self.key,
            width: self.width,
            height: self.height,
            bounds: clipped,
            is_sub: true,
            disposed: self.disposed,
            dispose_queue: Arc::clone(&self.dispose_queue),
        }
    }

    pub(crate) fn is_view(&self) -> bool {
        self.is_sub
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.is_sub || self.disposed {
            return;
        }
        if let Ok(mut queue) = self.dispose_queue.lock() {
            queue.push(self.key);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("key", &self.key)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bounds", &self.bounds)
            .field("is_sub", &self.is_sub)
            .finish()
    }
}

/// Options for [`crate::Pipeline::draw_image`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawImageOptions {
    pub geom: GeoM,
    pub color_matrix: Option<ColorMatrix>,
    pub color_scale: ColorScale,
    pub blend: Blend,
    pub filter: Filter,
    pub address: Address,
    /// Overrides the source rectangle, in source-image coordinates. Composes
    /// with a sub-image view's bounds.
    pub source_rect: Option<Region>,
}
