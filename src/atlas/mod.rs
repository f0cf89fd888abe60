//! Texture atlas: small images share one large backend texture so that draws
//! from different logical images can still batch into one driver call.
//!
//! An image is *shared* while it only ever acts as a draw source. The first
//! draw that targets it evicts it into a dedicated backend (isolation). An
//! isolated image that then goes unwritten for a number of frames is packed
//! back into the shared pool.

mod packer;

pub use packer::{NodeId, Page};

use crate::command::Graphics;
use crate::driver::{Address, Filter};
use crate::foundation::arena::{Arena, Handle};
use crate::foundation::blend::Blend;
use crate::foundation::color::{Color, ColorMatrix, ColorScale};
use crate::foundation::error::{SpryteError, SpryteResult};
use crate::foundation::geom::{GeoM, Region};
use crate::mesh::{Vertex, quad_indices, quad_vertices};
use crate::restore::{RestoreKey, RestoreRegistry};
use smallvec::SmallVec;

/// Tuning for the shared backend pool.
#[derive(Debug, Clone, Copy)]
pub struct AtlasOpts {
    /// Side of a freshly created shared backend. Defaults from driver caps.
    pub min_backend_size: Option<u32>,
    /// Largest side a shared backend may grow to.
    pub max_backend_size: Option<u32>,
    /// Frames an isolated image must go unwritten before it is packed back
    /// into the shared pool.
    pub reshare_after_frames: u32,
}

impl Default for AtlasOpts {
    fn default() -> Self {
        Self {
            min_backend_size: None,
            max_backend_size: None,
            reshare_after_frames: 10,
        }
    }
}

struct Backend {
    restorable: RestoreKey,
    /// None means the backend is dedicated to a single image.
    page: Option<Page>,
}

type BackendKey = Handle<Backend>;

pub struct AtlasImage {
    width: u32,
    height: u32,
    backend: Option<BackendKey>,
    /// Set only while the image lives in a shared backend.
    node: Option<NodeId>,
    /// Frames since this image was last written to.
    non_updated_count: u32,
    never_shared: bool,
}

pub type AtlasKey = Handle<AtlasImage>;

pub struct Atlas {
    backends: Arena<Backend>,
    images: Arena<AtlasImage>,
    min_size: u32,
    max_size: u32,
    reshare_after: u32,
}

impl Atlas {
    pub fn new(gfx: &Graphics, opts: AtlasOpts) -> Self {
        let (def_min, def_max) = if gfx.has_high_precision_float() {
            (1024, 4096)
        } else {
            (512, 512)
        };
        let cap = gfx.max_image_size();
        let min_size = opts.min_backend_size.unwrap_or(def_min).min(cap);
        let max_size = opts.max_backend_size.unwrap_or(def_max).min(cap).max(min_size);
        Self {
            backends: Arena::new(),
            images: Arena::new(),
            min_size,
            max_size,
            reshare_after: opts.reshare_after_frames,
        }
    }

    fn image(&self, key: AtlasKey) -> SpryteResult<&AtlasImage> {
        self.images
            .get(key)
            .ok_or_else(|| SpryteError::disposed(format!("atlas image {key:?}")))
    }

    fn image_mut(&mut self, key: AtlasKey) -> SpryteResult<&mut AtlasImage> {
        self.images
            .get_mut(key)
            .ok_or_else(|| SpryteError::disposed(format!("atlas image {key:?}")))
    }

    /// Creates an image with no backend; storage is allocated on first use.
    pub fn new_image(&mut self, width: u32, height: u32) -> AtlasKey {
        self.images.insert(AtlasImage {
            width,
            height,
            backend: None,
            node: None,
            non_updated_count: 0,
            never_shared: false,
        })
    }

    pub fn new_volatile_image(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        width: u32,
        height: u32,
    ) -> SpryteResult<AtlasKey> {
        let restorable = restore.new_image(gfx, width, height, true)?;
        let backend = self.backends.insert(Backend {
            restorable,
            page: None,
        });
        Ok(self.images.insert(AtlasImage {
            width,
            height,
            backend: Some(backend),
            node: None,
            non_updated_count: 0,
            never_shared: true,
        }))
    }

    pub fn new_screen_image(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        width: u32,
        height: u32,
    ) -> SpryteResult<AtlasKey> {
        let restorable = restore.new_screen_image(gfx, width, height)?;
        let backend = self.backends.insert(Backend {
            restorable,
            page: None,
        });
        Ok(self.images.insert(AtlasImage {
            width,
            height,
            backend: Some(backend),
            node: None,
            non_updated_count: 0,
            never_shared: true,
        }))
    }

    pub fn size(&self, key: AtlasKey) -> SpryteResult<(u32, u32)> {
        let img = self.image(key)?;
        Ok((img.width, img.height))
    }

    pub fn is_volatile(&self, restore: &RestoreRegistry, key: AtlasKey) -> SpryteResult<bool> {
        match self.image(key)?.backend {
            Some(b) => {
                let backend = self.backend(b)?;
                restore.is_volatile(backend.restorable)
            }
            None => Ok(false),
        }
    }

    pub fn is_screen(&self, restore: &RestoreRegistry, key: AtlasKey) -> SpryteResult<bool> {
        match self.image(key)?.backend {
            Some(b) => {
                let backend = self.backend(b)?;
                restore.is_screen(backend.restorable)
            }
            None => Ok(false),
        }
    }

    fn backend(&self, key: BackendKey) -> SpryteResult<&Backend> {
        self.backends
            .get(key)
            .ok_or_else(|| SpryteError::stale_handle(format!("atlas backend {key:?}")))
    }

    fn is_shared(&self, key: AtlasKey) -> SpryteResult<bool> {
        Ok(self.image(key)?.node.is_some())
    }

    fn shareable(&self, key: AtlasKey) -> SpryteResult<bool> {
        let img = self.image(key)?;
        Ok(!img.never_shared && img.width <= self.max_size && img.height <= self.max_size)
    }

    /// Region the image occupies inside its backend texture.
    fn region(&self, key: AtlasKey) -> SpryteResult<Region> {
        let img = self.image(key)?;
        match (img.backend, img.node) {
            (Some(b), Some(node)) => {
                let backend = self.backend(b)?;
                let page = backend
                    .page
                    .as_ref()
                    .ok_or_else(|| SpryteError::driver("shared image without a page"))?;
                Ok(page.region(node))
            }
            _ => Ok(Region::sized(img.width as i32, img.height as i32)),
        }
    }

    /// Tries to place a rectangle into an existing shared backend, growing the
    /// backend (and migrating its pixels) when needed.
    fn try_alloc(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        backend_key: BackendKey,
        width: i32,
        height: i32,
    ) -> SpryteResult<Option<NodeId>> {
        let Some(backend) = self.backends.get_mut(backend_key) else {
            return Ok(None);
        };
        let Some(page) = backend.page.as_mut() else {
            return Ok(None);
        };

        if let Some(node) = page.alloc(width, height) {
            return Ok(Some(node));
        }

        // Simulate candidate sizes on clones before touching the real page.
        let mut target = page.size() * 2;
        loop {
            if target > page.max_size() {
                return Ok(None);
            }
            let mut sim = page.clone();
            if sim.extend_to(target) && sim.alloc(width, height).is_some() {
                break;
            }
            target *= 2;
        }
        if !page.extend_to(target) {
            return Ok(None);
        }
        let new_side = page.size();
        tracing::debug!(new_side, "extending atlas backend");

        let old_restorable = backend.restorable;
        let (old_w, old_h) = restore.size(old_restorable)?;
        let new_restorable = restore.new_image(gfx, new_side, new_side, false)?;
        let vertices = quad_vertices(
            0.0,
            0.0,
            old_w as f32,
            old_h as f32,
            GeoM::IDENTITY,
            ColorScale::ONE,
        );
        restore.draw_triangles(
            gfx,
            new_restorable,
            old_restorable,
            vertices.to_vec(),
            quad_indices(),
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::ClampToZero,
        )?;
        restore.dispose(gfx, old_restorable);

        let backend = self
            .backends
            .get_mut(backend_key)
            .ok_or_else(|| SpryteError::stale_handle("atlas backend vanished mid-extension"))?;
        backend.restorable = new_restorable;
        let page = backend
            .page
            .as_mut()
            .ok_or_else(|| SpryteError::driver("shared backend lost its page"))?;
        let node = page
            .alloc(width, height)
            .ok_or_else(|| SpryteError::driver("extended page rejected a fitting allocation"))?;
        Ok(Some(node))
    }

    /// Gives the image storage: a slot in a shared backend when allowed, a
    /// dedicated backend otherwise.
    fn allocate(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
        shared: bool,
    ) -> SpryteResult<()> {
        if self.image(key)?.backend.is_some() {
            return Ok(());
        }
        let (width, height) = {
            let img = self.image(key)?;
            (img.width, img.height)
        };

        if !shared || !self.shareable(key)? {
            let restorable = restore.new_image(gfx, width, height, false)?;
            let backend = self.backends.insert(Backend {
                restorable,
                page: None,
            });
            let img = self.image_mut(key)?;
            img.backend = Some(backend);
            return Ok(());
        }

        for backend_key in self.backends.handles() {
            if let Some(node) =
                self.try_alloc(restore, gfx, backend_key, width as i32, height as i32)?
            {
                let img = self.image_mut(key)?;
                img.backend = Some(backend_key);
                img.node = Some(node);
                return Ok(());
            }
        }

        let mut side = self.min_size;
        while width > side || height > side {
            if side >= self.max_size {
                return Err(SpryteError::validation(format!(
                    "image {width}x{height} exceeds the atlas cap {}",
                    self.max_size
                )));
            }
            side *= 2;
        }
        let restorable = restore.new_image(gfx, side, side, false)?;
        let mut page = Page::new(side, self.max_size);
        let node = page
            .alloc(width as i32, height as i32)
            .ok_or_else(|| SpryteError::driver("fresh page rejected a fitting allocation"))?;
        let backend = self.backends.insert(Backend {
            restorable,
            page: Some(page),
        });
        let img = self.image_mut(key)?;
        img.backend = Some(backend);
        img.node = Some(node);
        Ok(())
    }

    /// Moves a shared image into its own backend so it can be drawn to
    /// without touching its neighbors.
    fn ensure_isolated(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
    ) -> SpryteResult<()> {
        if self.image(key)?.backend.is_none() {
            return self.allocate(restore, gfx, key, false);
        }
        if !self.is_shared(key)? {
            return Ok(());
        }

        let region = self.region(key)?;
        let backend_key = self.image(key)?.backend.ok_or_else(|| {
            SpryteError::driver("shared image without a backend")
        })?;
        let node = self.image(key)?.node.ok_or_else(|| {
            SpryteError::driver("shared image without a node")
        })?;
        let shared_restorable = self.backend(backend_key)?.restorable;

        let new_restorable =
            restore.new_image(gfx, region.width as u32, region.height as u32, false)?;
        let vertices = quad_vertices(
            region.x as f32,
            region.y as f32,
            (region.x + region.width) as f32,
            (region.y + region.height) as f32,
            GeoM::IDENTITY,
            ColorScale::ONE,
        );
        restore.draw_triangles(
            gfx,
            new_restorable,
            shared_restorable,
            vertices.to_vec(),
            quad_indices(),
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::ClampToZero,
        )?;

        self.vacate(restore, gfx, backend_key, node, region)?;

        let dedicated = self.backends.insert(Backend {
            restorable: new_restorable,
            page: None,
        });
        let img = self.image_mut(key)?;
        img.backend = Some(dedicated);
        img.node = None;
        Ok(())
    }

    /// Frees a node; zero-clears the vacated rectangle when the backend stays
    /// alive, disposes the backend once it has no tenants left.
    fn vacate(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        backend_key: BackendKey,
        node: NodeId,
        region: Region,
    ) -> SpryteResult<()> {
        let restorable = self.backend(backend_key)?.restorable;
        let empty = {
            let backend = self
                .backends
                .get_mut(backend_key)
                .ok_or_else(|| SpryteError::stale_handle("atlas backend"))?;
            let page = backend
                .page
                .as_mut()
                .ok_or_else(|| SpryteError::driver("vacating a dedicated backend"))?;
            page.free(node);
            page.is_empty()
        };
        if empty {
            restore.dispose(gfx, restorable);
            self.backends.remove(backend_key);
        } else {
            restore.clear_pixels(gfx, restorable, region)?;
        }
        Ok(())
    }

    /// Packs an isolated image back into the shared pool via a pixel
    /// read-back.
    fn make_shared(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
    ) -> SpryteResult<()> {
        if self.is_shared(key)? || !self.shareable(key)? {
            return Ok(());
        }
        let Some(old_backend) = self.image(key)?.backend else {
            return self.allocate(restore, gfx, key, true);
        };
        let old_restorable = self.backend(old_backend)?.restorable;
        // A failed read-back abandons the attempt; the image stays isolated
        // and the next frame-end scan retries.
        let pixels = match restore.pixels(gfx, old_restorable) {
            Ok(pixels) => pixels,
            Err(err) => {
                tracing::warn!(?key, %err, "read-back failed, keeping the image isolated");
                return Ok(());
            }
        };

        self.image_mut(key)?.backend = None;
        self.allocate(restore, gfx, key, true)?;
        self.replace_pixels(restore, gfx, key, &pixels)?;

        restore.dispose(gfx, old_restorable);
        self.backends.remove(old_backend);
        self.image_mut(key)?.non_updated_count = 0;
        Ok(())
    }

    /// Draws `src` into `dst`. Vertices address `src` in its own coordinate
    /// space; the shared-backend offset is applied here.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_triangles(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        dst: AtlasKey,
        src: AtlasKey,
        mut vertices: Vec<Vertex>,
        indices: SmallVec<[u16; 6]>,
        color_matrix: Option<ColorMatrix>,
        blend: Blend,
        filter: Filter,
        address: Address,
    ) -> SpryteResult<()> {
        if dst == src {
            return Err(SpryteError::SameSourceAndDestination);
        }
        self.allocate(restore, gfx, src, true)?;
        self.ensure_isolated(restore, gfx, dst)?;

        let src_backend = self.image(src)?.backend.ok_or_else(|| {
            SpryteError::driver("source image lost its backend")
        })?;
        let dst_backend = self.image(dst)?.backend.ok_or_else(|| {
            SpryteError::driver("destination image lost its backend")
        })?;
        let src_restorable = self.backend(src_backend)?.restorable;
        let dst_restorable = self.backend(dst_backend)?.restorable;
        if src_restorable == dst_restorable {
            return Err(SpryteError::SameSourceAndDestination);
        }

        let src_region = self.region(src)?;
        let (ox, oy) = (src_region.x as f32, src_region.y as f32);
        if ox != 0.0 || oy != 0.0 {
            for v in &mut vertices {
                v.src[0] += ox;
                v.src[1] += oy;
                v.region[0] += ox;
                v.region[1] += oy;
                v.region[2] += ox;
                v.region[3] += oy;
            }
        }

        restore.draw_triangles(
            gfx,
            dst_restorable,
            src_restorable,
            vertices,
            indices,
            color_matrix,
            blend,
            filter,
            address,
        )?;
        self.image_mut(dst)?.non_updated_count = 0;
        Ok(())
    }

    pub fn fill(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
        color: Color,
    ) -> SpryteResult<()> {
        self.allocate(restore, gfx, key, true)?;
        if self.is_shared(key)? {
            // A shared backend only ever receives pixel uploads, so a solid
            // sub-rectangle write is safe and keeps the image shared.
            let img = self.image(key)?;
            let n = (img.width * img.height) as usize;
            let mut pixels = Vec::with_capacity(n * 4);
            for _ in 0..n {
                pixels.extend_from_slice(&[color.r, color.g, color.b, color.a]);
            }
            return self.replace_pixels(restore, gfx, key, &pixels);
        }
        let backend = self.image(key)?.backend.ok_or_else(|| {
            SpryteError::driver("filled image lost its backend")
        })?;
        let restorable = self.backend(backend)?.restorable;
        restore.fill(gfx, restorable, color)?;
        self.image_mut(key)?.non_updated_count = 0;
        Ok(())
    }

    pub fn replace_pixels(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
        pixels: &[u8],
    ) -> SpryteResult<()> {
        self.allocate(restore, gfx, key, true)?;
        let (width, height) = {
            let img = self.image(key)?;
            (img.width, img.height)
        };
        let want = (width * height * 4) as usize;
        if pixels.len() != want {
            return Err(SpryteError::PixelLength {
                got: pixels.len(),
                want,
            });
        }
        let region = self.region(key)?;
        let backend = self.image(key)?.backend.ok_or_else(|| {
            SpryteError::driver("image lost its backend")
        })?;
        let restorable = self.backend(backend)?.restorable;
        restore.replace_pixels(gfx, restorable, pixels, region)?;
        self.image_mut(key)?.non_updated_count = 0;
        Ok(())
    }

    pub fn at(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
        x: i32,
        y: i32,
    ) -> SpryteResult<Color> {
        let img = self.image(key)?;
        if img.backend.is_none() {
            return Ok(Color::TRANSPARENT);
        }
        let region = self.region(key)?;
        if x < 0 || y < 0 || x >= region.width || y >= region.height {
            return Ok(Color::TRANSPARENT);
        }
        let backend = self.image(key)?.backend.ok_or_else(|| {
            SpryteError::driver("image lost its backend")
        })?;
        let restorable = self.backend(backend)?.restorable;
        restore.at(gfx, restorable, region.x + x, region.y + y)
    }

    /// Full RGBA read-back of the image's own region.
    pub fn pixels(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
    ) -> SpryteResult<Vec<u8>> {
        let (width, height) = self.size(key)?;
        if self.image(key)?.backend.is_none() {
            return Ok(vec![0; (width * height * 4) as usize]);
        }
        let region = self.region(key)?;
        let backend = self.image(key)?.backend.ok_or_else(|| {
            SpryteError::driver("image lost its backend")
        })?;
        let restorable = self.backend(backend)?.restorable;
        let (bw, _) = restore.size(restorable)?;
        let full = restore.pixels(gfx, restorable)?;
        let mut out = Vec::with_capacity((width * height * 4) as usize);
        for row in 0..height as usize {
            let off = ((region.y as usize + row) * bw as usize + region.x as usize) * 4;
            out.extend_from_slice(&full[off..off + width as usize * 4]);
        }
        Ok(out)
    }

    /// Disposing twice is a no-op.
    pub fn dispose(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: AtlasKey,
    ) -> SpryteResult<()> {
        let Some(img) = self.images.get(key) else {
            return Ok(());
        };
        let backend = img.backend;
        let node = img.node;
        let region = self.region(key)?;
        self.images.remove(key);

        let Some(backend_key) = backend else {
            return Ok(());
        };
        match node {
            Some(node) => self.vacate(restore, gfx, backend_key, node, region)?,
            None => {
                let restorable = self.backend(backend_key)?.restorable;
                restore.dispose(gfx, restorable);
                self.backends.remove(backend_key);
            }
        }
        Ok(())
    }

    pub fn contains(&self, key: AtlasKey) -> bool {
        self.images.contains(key)
    }

    /// Frame-end pass: isolated images that went unwritten long enough move
    /// back into the shared pool.
    #[tracing::instrument(skip_all)]
    pub fn end_frame(
        &mut self,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
    ) -> SpryteResult<()> {
        let mut to_share = Vec::new();
        for key in self.images.handles() {
            if self.is_shared(key)? || !self.shareable(key)? {
                continue;
            }
            if self.image(key)?.backend.is_none() {
                continue;
            }
            let img = self.image_mut(key)?;
            img.non_updated_count += 1;
            if img.non_updated_count >= self.reshare_after {
                to_share.push(key);
            }
        }
        for key in to_share {
            tracing::trace!(?key, "moving image back into the shared pool");
            self.make_shared(restore, gfx, key)?;
        }
        Ok(())
    }

    pub fn is_shared_for_testing(&self, key: AtlasKey) -> bool {
        self.images
            .get(key)
            .map(|img| img.node.is_some())
            .unwrap_or(false)
    }

    pub fn same_backend_for_testing(&self, a: AtlasKey, b: AtlasKey) -> bool {
        match (self.images.get(a), self.images.get(b)) {
            (Some(a), Some(b)) => a.backend.is_some() && a.backend == b.backend,
            _ => false,
        }
    }

    pub fn backend_count_for_testing(&self) -> usize {
        self.backends.len()
    }

    pub fn backend_size_for_testing(&self, key: AtlasKey) -> Option<u32> {
        let backend = self.images.get(key)?.backend?;
        let page = self.backends.get(backend)?.page.as_ref()?;
        Some(page.size())
    }

    pub fn backend_used_area_for_testing(&self, key: AtlasKey) -> Option<u64> {
        let backend = self.images.get(key)?.backend?;
        let page = self.backends.get(backend)?.page.as_ref()?;
        Some(page.used_area())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::software::SoftwareDriver;

    fn setup() -> (Graphics, RestoreRegistry, Atlas) {
        let gfx = Graphics::new(Box::new(SoftwareDriver::new()));
        let restore = RestoreRegistry::new();
        let atlas = Atlas::new(&gfx, AtlasOpts::default());
        (gfx, restore, atlas)
    }

    fn solid(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            out.extend_from_slice(&color);
        }
        out
    }

    fn unit_quad(size: u32) -> (Vec<Vertex>, SmallVec<[u16; 6]>) {
        let vs = quad_vertices(
            0.0,
            0.0,
            size as f32,
            size as f32,
            GeoM::IDENTITY,
            ColorScale::ONE,
        );
        (vs.to_vec(), quad_indices())
    }

    #[test]
    fn small_images_share_one_backend() {
        let (mut gfx, mut restore, mut atlas) = setup();
        let a = atlas.new_image(16, 16);
        let b = atlas.new_image(32, 8);
        atlas
            .replace_pixels(&mut restore, &mut gfx, a, &solid(16, 16, [255, 0, 0, 255]))
            .unwrap();
        atlas
            .replace_pixels(&mut restore, &mut gfx, b, &solid(32, 8, [0, 255, 0, 255]))
            .unwrap();
        assert!(atlas.is_shared_for_testing(a));
        assert!(atlas.is_shared_for_testing(b));
        assert!(atlas.same_backend_for_testing(a, b));
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, a, 0, 0).unwrap(),
            Color::new(255, 0, 0, 255)
        );
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, b, 31, 7).unwrap(),
            Color::new(0, 255, 0, 255)
        );
    }

    #[test]
    fn draw_target_is_isolated() {
        let (mut gfx, mut restore, mut atlas) = setup();
        let src = atlas.new_image(8, 8);
        let dst = atlas.new_image(8, 8);
        atlas
            .replace_pixels(&mut restore, &mut gfx, src, &solid(8, 8, [9, 9, 9, 255]))
            .unwrap();
        atlas
            .replace_pixels(&mut restore, &mut gfx, dst, &solid(8, 8, [1, 1, 1, 255]))
            .unwrap();
        assert!(atlas.same_backend_for_testing(src, dst));

        let (vs, is) = unit_quad(8);
        atlas
            .draw_triangles(
                &mut restore,
                &mut gfx,
                dst,
                src,
                vs,
                is,
                None,
                Blend::COPY,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap();
        assert!(!atlas.is_shared_for_testing(dst));
        assert!(atlas.is_shared_for_testing(src));
        assert!(!atlas.same_backend_for_testing(src, dst));
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, dst, 4, 4).unwrap(),
            Color::new(9, 9, 9, 255)
        );
    }

    #[test]
    fn isolation_preserves_offset_contents() {
        let (mut gfx, mut restore, mut atlas) = setup();
        // First tenant pushes the second away from the origin.
        let first = atlas.new_image(16, 16);
        atlas
            .replace_pixels(&mut restore, &mut gfx, first, &solid(16, 16, [7, 7, 7, 255]))
            .unwrap();
        let second = atlas.new_image(4, 4);
        atlas
            .replace_pixels(&mut restore, &mut gfx, second, &solid(4, 4, [100, 50, 25, 255]))
            .unwrap();

        let src = atlas.new_image(4, 4);
        atlas
            .replace_pixels(&mut restore, &mut gfx, src, &solid(4, 4, [0, 0, 0, 0]))
            .unwrap();
        let (vs, is) = unit_quad(4);
        atlas
            .draw_triangles(
                &mut restore,
                &mut gfx,
                second,
                src,
                vs,
                is,
                None,
                Blend::SOURCE_OVER,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap();
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, second, 3, 3).unwrap(),
            Color::new(100, 50, 25, 255)
        );
    }

    #[test]
    fn backend_extends_for_a_wide_image() {
        let gfx = Graphics::new(Box::new(SoftwareDriver::new()));
        let mut restore = RestoreRegistry::new();
        let mut atlas = Atlas::new(
            &gfx,
            AtlasOpts {
                min_backend_size: Some(64),
                max_backend_size: Some(256),
                ..AtlasOpts::default()
            },
        );
        let mut gfx = gfx;

        let small = atlas.new_image(64, 64);
        atlas
            .replace_pixels(&mut restore, &mut gfx, small, &solid(64, 64, [5, 5, 5, 255]))
            .unwrap();
        assert_eq!(atlas.backend_size_for_testing(small), Some(64));

        // Does not fit at 64 or 128 beside the first tenant.
        let wide = atlas.new_image(129, 10);
        atlas
            .replace_pixels(&mut restore, &mut gfx, wide, &solid(129, 10, [6, 6, 6, 255]))
            .unwrap();
        assert!(atlas.is_shared_for_testing(wide));
        assert!(atlas.same_backend_for_testing(small, wide));
        assert_eq!(atlas.backend_size_for_testing(small), Some(256));

        // The migration preserved the first tenant's pixels.
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, small, 63, 63).unwrap(),
            Color::new(5, 5, 5, 255)
        );
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, wide, 128, 9).unwrap(),
            Color::new(6, 6, 6, 255)
        );
    }

    #[test]
    fn unwritten_isolated_image_is_reshared() {
        let (mut gfx, mut restore, mut atlas) = setup();
        let src = atlas.new_image(8, 8);
        let dst = atlas.new_image(8, 8);
        atlas
            .replace_pixels(&mut restore, &mut gfx, src, &solid(8, 8, [40, 30, 20, 255]))
            .unwrap();
        let (vs, is) = unit_quad(8);
        atlas
            .draw_triangles(
                &mut restore,
                &mut gfx,
                dst,
                src,
                vs,
                is,
                None,
                Blend::COPY,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap();
        assert!(!atlas.is_shared_for_testing(dst));

        for _ in 0..10 {
            atlas.end_frame(&mut restore, &mut gfx).unwrap();
        }
        assert!(atlas.is_shared_for_testing(dst));
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, dst, 7, 0).unwrap(),
            Color::new(40, 30, 20, 255)
        );
    }

    #[test]
    fn draw_to_self_is_rejected() {
        let (mut gfx, mut restore, mut atlas) = setup();
        let img = atlas.new_image(8, 8);
        let (vs, is) = unit_quad(8);
        let err = atlas
            .draw_triangles(
                &mut restore,
                &mut gfx,
                img,
                img,
                vs,
                is,
                None,
                Blend::SOURCE_OVER,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap_err();
        assert!(matches!(err, SpryteError::SameSourceAndDestination));
    }

    #[test]
    fn dispose_clears_the_vacated_region() {
        let (mut gfx, mut restore, mut atlas) = setup();
        let a = atlas.new_image(8, 8);
        let b = atlas.new_image(8, 8);
        atlas
            .replace_pixels(&mut restore, &mut gfx, a, &solid(8, 8, [1, 2, 3, 255]))
            .unwrap();
        atlas
            .replace_pixels(&mut restore, &mut gfx, b, &solid(8, 8, [4, 5, 6, 255]))
            .unwrap();
        let count_before = atlas.backend_count_for_testing();
        atlas.dispose(&mut restore, &mut gfx, a).unwrap();
        // b keeps the backend alive.
        assert_eq!(atlas.backend_count_for_testing(), count_before);
        atlas.dispose(&mut restore, &mut gfx, b).unwrap();
        assert_eq!(atlas.backend_count_for_testing(), count_before - 1);
        // Double dispose is a no-op.
        atlas.dispose(&mut restore, &mut gfx, b).unwrap();
    }

    #[test]
    fn failed_readback_keeps_the_image_isolated() {
        let driver = SoftwareDriver::new();
        let control = driver.control();
        let mut gfx = Graphics::new(Box::new(driver));
        let mut restore = RestoreRegistry::new();
        let mut atlas = Atlas::new(&gfx, AtlasOpts::default());

        let src = atlas.new_image(8, 8);
        let dst = atlas.new_image(8, 8);
        atlas
            .replace_pixels(&mut restore, &mut gfx, src, &solid(8, 8, [50, 60, 70, 255]))
            .unwrap();
        let (vs, is) = unit_quad(8);
        atlas
            .draw_triangles(
                &mut restore,
                &mut gfx,
                dst,
                src,
                vs,
                is,
                None,
                Blend::COPY,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap();
        assert!(!atlas.is_shared_for_testing(dst));
        for _ in 0..9 {
            atlas.end_frame(&mut restore, &mut gfx).unwrap();
        }
        gfx.flush().unwrap();

        // Queue one draw so the read-back's implied flush hits the injected
        // failure. The frame-end scan must survive and leave dst isolated.
        let scratch = atlas
            .new_volatile_image(&mut restore, &mut gfx, 8, 8)
            .unwrap();
        let (vs, is) = unit_quad(8);
        atlas
            .draw_triangles(
                &mut restore,
                &mut gfx,
                scratch,
                src,
                vs,
                is,
                None,
                Blend::SOURCE_OVER,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap();
        control.fail_next_draw();
        atlas.end_frame(&mut restore, &mut gfx).unwrap();
        assert!(!atlas.is_shared_for_testing(dst));

        // The next scan retries and succeeds.
        atlas.end_frame(&mut restore, &mut gfx).unwrap();
        assert!(atlas.is_shared_for_testing(dst));
        assert_eq!(
            atlas.at(&mut restore, &mut gfx, dst, 3, 3).unwrap(),
            Color::new(50, 60, 70, 255)
        );
    }

    #[test]
    fn shared_used_area_matches_live_tenants() {
        let (mut gfx, mut restore, mut atlas) = setup();
        let mut keys = Vec::new();
        for &(w, h) in &[(16u32, 16u32), (32, 8), (8, 24), (20, 20), (4, 4)] {
            let k = atlas.new_image(w, h);
            atlas
                .replace_pixels(&mut restore, &mut gfx, k, &solid(w, h, [7, 7, 7, 255]))
                .unwrap();
            keys.push(k);
        }
        for key in [keys.remove(3), keys.remove(1)] {
            atlas.dispose(&mut restore, &mut gfx, key).unwrap();
        }

        let live: u64 = keys
            .iter()
            .map(|&k| {
                let r = atlas.region(k).unwrap();
                r.width as u64 * r.height as u64
            })
            .sum();
        assert_eq!(atlas.backend_used_area_for_testing(keys[0]), Some(live));
    }

    #[test]
    fn volatile_images_never_share() {
        let (mut gfx, mut restore, mut atlas) = setup();
        let v = atlas
            .new_volatile_image(&mut restore, &mut gfx, 8, 8)
            .unwrap();
        assert!(!atlas.is_shared_for_testing(v));
        for _ in 0..20 {
            atlas.end_frame(&mut restore, &mut gfx).unwrap();
        }
        assert!(!atlas.is_shared_for_testing(v));
    }
}
