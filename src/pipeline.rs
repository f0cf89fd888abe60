//! The pipeline: single owning value for every rendering layer.
//!
//! Layer order for a user draw: `Image` -> mipmap -> atlas -> restorable ->
//! command queue -> driver. The pipeline validates the user-facing contract,
//! then each layer rewrites the draw in its own terms.

use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::atlas::{Atlas, AtlasOpts};
use crate::command::Graphics;
use crate::driver::Driver;
use crate::foundation::color::Color;
use crate::foundation::error::{SpryteError, SpryteResult};
use crate::foundation::geom::Region;
use crate::image::{DisposeQueue, DrawImageOptions, Image};
use crate::mesh::Vertex;
use crate::mipmap::{MipKey, Mipmaps};
use crate::restore::RestoreRegistry;

/// Pipeline construction knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOpts {
    pub atlas: AtlasOpts,
}

pub struct Pipeline {
    gfx: Graphics,
    restore: RestoreRegistry,
    atlas: Atlas,
    mipmaps: Mipmaps,
    deferred: DisposeQueue,
}

impl Pipeline {
    pub fn new(driver: Box<dyn Driver>, opts: PipelineOpts) -> Self {
        let gfx = Graphics::new(driver);
        let atlas = Atlas::new(&gfx, opts.atlas);
        Self {
            gfx,
            restore: RestoreRegistry::new(),
            atlas,
            mipmaps: Mipmaps::new(),
            deferred: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn max_image_size(&self) -> u32 {
        self.gfx.max_image_size()
    }

    fn wrap(&self, key: MipKey, width: u32, height: u32) -> Image {
        Image {
            key,
            width,
            height,
            bounds: Region::sized(width as i32, height as i32),
            is_sub: false,
            disposed: false,
            dispose_queue: Arc::clone(&self.deferred),
        }
    }

    fn validate_size(&self, width: u32, height: u32) -> SpryteResult<()> {
        let max = self.gfx.max_image_size();
        if width == 0 || height == 0 || width > max || height > max {
            return Err(SpryteError::validation(format!(
                "image size {width}x{height} out of range 1..={max}"
            )));
        }
        Ok(())
    }

    pub fn new_image(&mut self, width: u32, height: u32) -> SpryteResult<Image> {
        self.validate_size(width, height)?;
        let key = self.mipmaps.new_image(
            &mut self.atlas,
            &mut self.restore,
            &mut self.gfx,
            width,
            height,
            false,
        )?;
        Ok(self.wrap(key, width, height))
    }

    /// Volatile images are cleared at every frame start and excluded from
    /// restoration; cheap for fully repainted scratch surfaces.
    pub fn new_volatile_image(&mut self, width: u32, height: u32) -> SpryteResult<Image> {
        self.validate_size(width, height)?;
        let key = self.mipmaps.new_image(
            &mut self.atlas,
            &mut self.restore,
            &mut self.gfx,
            width,
            height,
            true,
        )?;
        Ok(self.wrap(key, width, height))
    }

    pub fn new_screen_image(&mut self, width: u32, height: u32) -> SpryteResult<Image> {
        self.validate_size(width, height)?;
        let key = self.mipmaps.new_screen_image(
            &mut self.atlas,
            &mut self.restore,
            &mut self.gfx,
            width,
            height,
        )?;
        Ok(self.wrap(key, width, height))
    }

    fn live_key(&self, image: &Image) -> SpryteResult<MipKey> {
        if image.disposed || !self.mipmaps.contains(image.key) {
            return Err(SpryteError::disposed(format!("image {:?}", image.key)));
        }
        Ok(image.key)
    }

    fn reject_view(&self, image: &Image, op: &str) -> SpryteResult<()> {
        if image.is_view() {
            return Err(SpryteError::validation(format!(
                "{op} on a sub-image view is not allowed"
            )));
        }
        Ok(())
    }

    /// Fills are ignored on disposed images.
    pub fn fill(&mut self, image: &mut Image, color: Color) -> SpryteResult<()> {
        self.reject_view(image, "fill")?;
        let Ok(key) = self.live_key(image) else {
            return Ok(());
        };
        self.mipmaps
            .fill(&mut self.atlas, &mut self.restore, &mut self.gfx, key, color)
    }

    /// `pixels` must hold exactly `4 * w * h` premultiplied RGBA bytes.
    /// Ignored on disposed images.
    pub fn replace_pixels(&mut self, image: &mut Image, pixels: &[u8]) -> SpryteResult<()> {
        self.reject_view(image, "replace_pixels")?;
        let Ok(key) = self.live_key(image) else {
            return Ok(());
        };
        let want = (image.width * image.height * 4) as usize;
        if pixels.len() != want {
            return Err(SpryteError::PixelLength {
                got: pixels.len(),
                want,
            });
        }
        self.mipmaps.replace_pixels(
            &mut self.atlas,
            &mut self.restore,
            &mut self.gfx,
            key,
            pixels,
        )
    }

    pub fn draw_image(
        &mut self,
        dst: &mut Image,
        src: &Image,
        opts: &DrawImageOptions,
    ) -> SpryteResult<()> {
        self.reject_view(dst, "draw_image")?;
        let dst_key = self.live_key(dst)?;
        let src_key = self.live_key(src)?;
        if dst_key == src_key {
            return Err(SpryteError::SameSourceAndDestination);
        }

        let bounds = match opts.source_rect {
            Some(rect) => match rect
                .translated(src.bounds.x, src.bounds.y)
                .intersection(src.bounds)
            {
                Some(r) => r,
                None => return Ok(()),
            },
            None => src.bounds,
        };

        self.mipmaps.draw_image(
            &mut self.atlas,
            &mut self.restore,
            &mut self.gfx,
            dst_key,
            src_key,
            bounds,
            opts.geom,
            opts.color_matrix,
            opts.color_scale,
            opts.blend,
            opts.filter,
            opts.address,
        )
    }

    /// Raw triangle path. Vertices address the source in its own pixel
    /// coordinates; indices come in triples.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_triangles(
        &mut self,
        dst: &mut Image,
        src: &Image,
        vertices: Vec<Vertex>,
        indices: Vec<u16>,
        opts: &DrawImageOptions,
    ) -> SpryteResult<()> {
        self.reject_view(dst, "draw_triangles")?;
        let dst_key = self.live_key(dst)?;
        let src_key = self.live_key(src)?;
        if dst_key == src_key {
            return Err(SpryteError::SameSourceAndDestination);
        }
        if indices.len() % 3 != 0 {
            return Err(SpryteError::validation(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(SpryteError::validation(format!(
                "index {bad} out of range for {} vertices",
                vertices.len()
            )));
        }
        self.mipmaps.draw_triangles(
            &mut self.atlas,
            &mut self.restore,
            &mut self.gfx,
            dst_key,
            src_key,
            vertices,
            SmallVec::from_vec(indices),
            opts.color_matrix,
            opts.blend,
            opts.filter,
            opts.address,
        )
    }

    /// One-pixel readback; flushes pending work first. Out-of-bounds reads
    /// and reads from disposed images return transparent.
    pub fn at(&mut self, image: &Image, x: i32, y: i32) -> SpryteResult<Color> {
        let Ok(key) = self.live_key(image) else {
            return Ok(Color::TRANSPARENT);
        };
        if !image.bounds.contains_point(image.bounds.x + x, image.bounds.y + y) {
            return Ok(Color::TRANSPARENT);
        }
        self.mipmaps.at(
            &mut self.atlas,
            &mut self.restore,
            &mut self.gfx,
            key,
            image.bounds.x + x,
            image.bounds.y + y,
        )
    }

    /// Full readback of the image's bounds, row-major premultiplied RGBA.
    pub fn pixels(&mut self, image: &Image) -> SpryteResult<Vec<u8>> {
        let key = self.live_key(image)?;
        let full =
            self.mipmaps
                .pixels(&mut self.atlas, &mut self.restore, &mut self.gfx, key)?;
        if !image.is_view() {
            return Ok(full);
        }
        let b = image.bounds;
        let stride = image.width as usize * 4;
        let mut out = Vec::with_capacity((b.width * b.height * 4) as usize);
        for row in 0..b.height as usize {
            let off = (b.y as usize + row) * stride + b.x as usize * 4;
            out.extend_from_slice(&full[off..off + b.width as usize * 4]);
        }
        Ok(out)
    }

    /// Immediate disposal. Idempotent; sub-image views only detach.
    pub fn dispose(&mut self, image: &mut Image) -> SpryteResult<()> {
        if image.is_view() || image.disposed {
            image.disposed = true;
            return Ok(());
        }
        image.disposed = true;
        if !self.mipmaps.contains(image.key) {
            return Ok(());
        }
        self.mipmaps
            .dispose(&mut self.atlas, &mut self.restore, &mut self.gfx, image.key)
    }

    /// Frame start: drain handle drops, detect context loss, reset volatile
    /// surfaces.
    #[tracing::instrument(skip_all)]
    pub fn begin_frame(&mut self) -> SpryteResult<()> {
        self.gfx.reset_for_frame();

        let dropped: Vec<MipKey> = match self.deferred.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => Vec::new(),
        };
        if !dropped.is_empty() {
            tracing::trace!(count = dropped.len(), "draining deferred disposals");
        }
        for key in dropped {
            if self.mipmaps.contains(key) {
                self.mipmaps
                    .dispose(&mut self.atlas, &mut self.restore, &mut self.gfx, key)?;
            }
        }

        if self.gfx.needs_restoring() && self.restore.context_lost(&mut self.gfx)? {
            tracing::warn!("context loss detected, restoring images");
            self.restore.restore(&mut self.gfx)?;
        }

        self.restore.clear_volatile_images(&mut self.gfx)
    }

    /// Frame end: flush, collapse stale restorable state, run the atlas
    /// re-share scan.
    #[tracing::instrument(skip_all)]
    pub fn end_frame(&mut self) -> SpryteResult<()> {
        self.gfx.flush()?;
        self.restore.resolve_stale_images(&mut self.gfx)?;
        self.atlas.end_frame(&mut self.restore, &mut self.gfx)
    }

    pub fn is_shared_for_testing(&self, image: &Image) -> bool {
        self.mipmaps
            .orig_key(image.key)
            .map(|orig| self.atlas.is_shared_for_testing(orig))
            .unwrap_or(false)
    }

    pub fn same_backend_for_testing(&self, a: &Image, b: &Image) -> bool {
        match (self.mipmaps.orig_key(a.key), self.mipmaps.orig_key(b.key)) {
            (Ok(a), Ok(b)) => self.atlas.same_backend_for_testing(a, b),
            _ => false,
        }
    }

    pub fn backend_count_for_testing(&self) -> usize {
        self.atlas.backend_count_for_testing()
    }
}
