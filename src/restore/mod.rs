//! Restorable images: per-image state from which GPU contents can be rebuilt
//! after a context loss.
//!
//! Every non-volatile image carries either authoritative base pixels, an
//! authoritative base color, or a bounded history of draw records on top of an
//! optional base. `resolve_stale_images` runs at every frame boundary and
//! collapses histories back into base pixels so recovery cost stays bounded.

use smallvec::SmallVec;

use crate::command::{Graphics, GpuKey};
use crate::driver::{Address, Filter};
use crate::foundation::arena::{Arena, Handle};
use crate::foundation::blend::Blend;
use crate::foundation::color::{Color, ColorMatrix, ColorScale};
use crate::foundation::error::{SpryteError, SpryteResult};
use crate::foundation::geom::{GeoM, Region};
use crate::mesh::{Vertex, quad_indices, quad_vertices};

/// Draw records kept per image before the image is marked stale and resolved
/// from GPU pixels instead.
const MAX_HISTORY: usize = 1024;

/// Side of the all-white utility image used to lower `fill` onto the driver's
/// triangle vocabulary.
const WHITE_SIZE: u32 = 16;

enum Base {
    Pixels(Vec<u8>),
    Color(Color),
}

struct DrawRecord {
    source: RestoreKey,
    vertices: Vec<Vertex>,
    indices: SmallVec<[u16; 6]>,
    color_matrix: Option<ColorMatrix>,
    blend: Blend,
    filter: Filter,
    address: Address,
}

pub struct RestorableImage {
    gpu: GpuKey,
    width: u32,
    height: u32,
    base: Option<Base>,
    history: Vec<DrawRecord>,
    /// The GPU holds newer contents than `base`/`history` describe; the image
    /// must be re-read before it can serve as restoration state.
    stale: bool,
    volatile: bool,
    screen: bool,
    /// Restored before everything else; the white utility image.
    priority: bool,
}

pub type RestoreKey = Handle<RestorableImage>;

#[cfg(test)]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BaseState {
    Pixels,
    Color,
    None,
}

pub struct RestoreRegistry {
    images: Arena<RestorableImage>,
    white: Option<RestoreKey>,
}

impl Default for RestoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreRegistry {
    pub fn new() -> Self {
        Self {
            images: Arena::new(),
            white: None,
        }
    }

    fn image(&self, key: RestoreKey) -> SpryteResult<&RestorableImage> {
        self.images
            .get(key)
            .ok_or_else(|| SpryteError::stale_handle(format!("restorable image {key:?}")))
    }

    fn image_mut(&mut self, key: RestoreKey) -> SpryteResult<&mut RestorableImage> {
        self.images
            .get_mut(key)
            .ok_or_else(|| SpryteError::stale_handle(format!("restorable image {key:?}")))
    }

    pub fn new_image(
        &mut self,
        gfx: &mut Graphics,
        width: u32,
        height: u32,
        volatile: bool,
    ) -> SpryteResult<RestoreKey> {
        let gpu = gfx.new_image(width, height)?;
        let key = self.images.insert(RestorableImage {
            gpu,
            width,
            height,
            base: None,
            history: Vec::new(),
            stale: false,
            volatile,
            screen: false,
            priority: false,
        });
        // New images start cleared.
        self.fill(gfx, key, Color::TRANSPARENT)?;
        Ok(key)
    }

    pub fn new_screen_image(
        &mut self,
        gfx: &mut Graphics,
        width: u32,
        height: u32,
    ) -> SpryteResult<RestoreKey> {
        let gpu = gfx.new_screen_image(width, height)?;
        let key = self.images.insert(RestorableImage {
            gpu,
            width,
            height,
            base: None,
            history: Vec::new(),
            stale: false,
            volatile: false,
            screen: true,
            priority: false,
        });
        self.fill(gfx, key, Color::TRANSPARENT)?;
        Ok(key)
    }

    /// The 16x16 all-white image every fill samples from, created lazily.
    /// Initialized with `replace_pixels`, never with `fill`, so it restores
    /// from base pixels alone.
    fn white(&mut self, gfx: &mut Graphics) -> SpryteResult<RestoreKey> {
        if let Some(key) = self.white
            && self.images.contains(key)
        {
            return Ok(key);
        }
        let gpu = gfx.new_image(WHITE_SIZE, WHITE_SIZE)?;
        let key = self.images.insert(RestorableImage {
            gpu,
            width: WHITE_SIZE,
            height: WHITE_SIZE,
            base: None,
            history: Vec::new(),
            stale: false,
            volatile: false,
            screen: false,
            priority: true,
        });
        self.white = Some(key);
        let pixels = vec![0xff; (WHITE_SIZE * WHITE_SIZE * 4) as usize];
        self.replace_pixels(gfx, key, &pixels, Region::sized(WHITE_SIZE as i32, WHITE_SIZE as i32))?;
        Ok(key)
    }

    pub fn size(&self, key: RestoreKey) -> SpryteResult<(u32, u32)> {
        let img = self.image(key)?;
        Ok((img.width, img.height))
    }

    pub fn gpu_key(&self, key: RestoreKey) -> SpryteResult<GpuKey> {
        Ok(self.image(key)?.gpu)
    }

    pub fn is_volatile(&self, key: RestoreKey) -> SpryteResult<bool> {
        Ok(self.image(key)?.volatile)
    }

    pub fn is_screen(&self, key: RestoreKey) -> SpryteResult<bool> {
        Ok(self.image(key)?.screen)
    }

    /// Draws the white image over the full destination with copy blend,
    /// scaled so every pixel becomes `color`.
    fn fill_gpu(&mut self, gfx: &mut Graphics, dst: GpuKey, color: Color) -> SpryteResult<()> {
        let white = self.white(gfx)?;
        let white_gpu = self.image(white)?.gpu;
        let (dw, dh) = gfx.size(dst)?;
        let scale = ColorScale::new(
            color.r as f32 / 255.0,
            color.g as f32 / 255.0,
            color.b as f32 / 255.0,
            color.a as f32 / 255.0,
        );
        let geom = GeoM::scale(
            dw as f32 / WHITE_SIZE as f32,
            dh as f32 / WHITE_SIZE as f32,
        );
        let vertices = quad_vertices(0.0, 0.0, WHITE_SIZE as f32, WHITE_SIZE as f32, geom, scale);
        gfx.draw_triangles(
            dst,
            white_gpu,
            vertices.to_vec(),
            quad_indices().to_vec(),
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::ClampToZero,
        )
    }

    /// Clears draw history and installs a solid base color.
    pub fn fill(&mut self, gfx: &mut Graphics, key: RestoreKey, color: Color) -> SpryteResult<()> {
        self.make_stale_if_depending_on(key);
        let gpu = self.image(key)?.gpu;
        self.fill_gpu(gfx, gpu, color)?;
        let img = self.image_mut(key)?;
        img.base = Some(Base::Color(color));
        img.history.clear();
        img.stale = false;
        Ok(())
    }

    /// Overwrites a sub-rectangle of the base pixels. A full-rect write resets
    /// history; a partial write after draws or fills is a contract violation.
    pub fn replace_pixels(
        &mut self,
        gfx: &mut Graphics,
        key: RestoreKey,
        pixels: &[u8],
        region: Region,
    ) -> SpryteResult<()> {
        let (width, height) = {
            let img = self.image(key)?;
            (img.width as i32, img.height as i32)
        };
        let full = Region::sized(width, height);
        if region.is_empty() || !full.contains(region) {
            return Err(SpryteError::validation(format!(
                "replace_pixels region {region:?} out of bounds for {width}x{height}"
            )));
        }
        let want = (region.width as usize) * (region.height as usize) * 4;
        if pixels.len() != want {
            return Err(SpryteError::PixelLength {
                got: pixels.len(),
                want,
            });
        }

        self.make_stale_if_depending_on(key);
        let gpu = self.image(key)?.gpu;
        gfx.replace_pixels(gpu, pixels.to_vec(), region)?;

        let img = self.image_mut(key)?;
        if region == full {
            img.base = Some(Base::Pixels(pixels.to_vec()));
            img.history.clear();
            img.stale = false;
            return Ok(());
        }

        if !img.history.is_empty() {
            return Err(SpryteError::validation(
                "partial replace_pixels after draw_triangles is forbidden",
            ));
        }
        if matches!(img.base, Some(Base::Color(c)) if c.a > 0) {
            return Err(SpryteError::validation(
                "partial replace_pixels after fill is forbidden",
            ));
        }
        if img.stale {
            // The GPU is the only truth; the frame-end resolve picks this up.
            return Ok(());
        }
        let len = (width * height * 4) as usize;
        let base = match &mut img.base {
            Some(Base::Pixels(p)) => p,
            _ => {
                img.base = Some(Base::Pixels(vec![0; len]));
                match &mut img.base {
                    Some(Base::Pixels(p)) => p,
                    _ => unreachable!(),
                }
            }
        };
        let row_bytes = region.width as usize * 4;
        for row in 0..region.height as usize {
            let dst_off = ((region.y as usize + row) * width as usize + region.x as usize) * 4;
            let src_off = row * row_bytes;
            base[dst_off..dst_off + row_bytes]
                .copy_from_slice(&pixels[src_off..src_off + row_bytes]);
        }
        Ok(())
    }

    /// Zero-clears a sub-rectangle; used when an atlas tenant vacates a node.
    pub fn clear_pixels(
        &mut self,
        gfx: &mut Graphics,
        key: RestoreKey,
        region: Region,
    ) -> SpryteResult<()> {
        let zeros = vec![0u8; (region.width.max(0) as usize) * (region.height.max(0) as usize) * 4];
        self.replace_pixels(gfx, key, &zeros, region)
    }

    /// Appends a draw record (or marks the image stale when recording is
    /// pointless) and forwards the draw to the command queue.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_triangles(
        &mut self,
        gfx: &mut Graphics,
        dst: RestoreKey,
        src: RestoreKey,
        vertices: Vec<Vertex>,
        indices: SmallVec<[u16; 6]>,
        color_matrix: Option<ColorMatrix>,
        blend: Blend,
        filter: Filter,
        address: Address,
    ) -> SpryteResult<()> {
        if vertices.is_empty() {
            return Ok(());
        }
        self.make_stale_if_depending_on(dst);

        let (src_stale, src_volatile, src_gpu) = {
            let s = self.image(src)?;
            (s.stale, s.volatile, s.gpu)
        };
        let dst_img = self.image(dst)?;
        let (dst_gpu, dst_screen, dst_volatile) = (dst_img.gpu, dst_img.screen, dst_img.volatile);

        if src_stale || src_volatile || dst_screen || dst_volatile || !gfx.needs_restoring() {
            self.make_stale(dst);
        } else {
            let img = self.image_mut(dst)?;
            if img.history.len() + 1 > MAX_HISTORY {
                self.make_stale(dst);
            } else {
                img.history.push(DrawRecord {
                    source: src,
                    vertices: vertices.clone(),
                    indices: indices.clone(),
                    color_matrix,
                    blend,
                    filter,
                    address,
                });
            }
        }

        gfx.draw_triangles(
            dst_gpu,
            src_gpu,
            vertices,
            indices.to_vec(),
            color_matrix,
            blend,
            filter,
            address,
        )
    }

    fn make_stale(&mut self, key: RestoreKey) {
        if let Some(img) = self.images.get_mut(key) {
            img.base = None;
            img.history.clear();
            img.stale = true;
        }
        // Dependents are not made stale recursively: restoration replays in
        // topological order, so they rebuild from this image's latest state.
    }

    /// Marks every image whose history references `target` stale.
    pub fn make_stale_if_depending_on(&mut self, target: RestoreKey) {
        let dependents: Vec<RestoreKey> = self
            .images
            .iter()
            .filter(|(_, img)| {
                !img.stale && img.history.iter().any(|record| record.source == target)
            })
            .map(|(key, _)| key)
            .collect();
        for key in dependents {
            self.make_stale(key);
        }
    }

    fn read_pixels_from_gpu(&mut self, gfx: &mut Graphics, key: RestoreKey) -> SpryteResult<()> {
        let gpu = self.image(key)?.gpu;
        let pixels = gfx.pixels(gpu)?;
        let img = self.image_mut(key)?;
        img.base = Some(Base::Pixels(pixels));
        img.history.clear();
        img.stale = false;
        Ok(())
    }

    /// Reads one pixel, resolving history through a GPU read-back first when
    /// the base pixels are not current. Slow but pixel-exact.
    pub fn at(&mut self, gfx: &mut Graphics, key: RestoreKey, x: i32, y: i32) -> SpryteResult<Color> {
        let (width, height) = {
            let img = self.image(key)?;
            (img.width as i32, img.height as i32)
        };
        if x < 0 || y < 0 || x >= width || y >= height {
            return Ok(Color::TRANSPARENT);
        }

        let needs_read = {
            let img = self.image(key)?;
            img.stale
                || !img.history.is_empty()
                || !matches!(img.base, Some(Base::Pixels(_) | Base::Color(_)))
        };
        if needs_read {
            self.read_pixels_from_gpu(gfx, key)?;
        }

        let img = self.image(key)?;
        match &img.base {
            Some(Base::Pixels(p)) => {
                let idx = ((y * width + x) * 4) as usize;
                Ok(Color::new(p[idx], p[idx + 1], p[idx + 2], p[idx + 3]))
            }
            Some(Base::Color(c)) => Ok(*c),
            None => Ok(Color::TRANSPARENT),
        }
    }

    /// Full read-back of the GPU contents; flushes pending commands.
    pub fn pixels(&mut self, gfx: &mut Graphics, key: RestoreKey) -> SpryteResult<Vec<u8>> {
        let gpu = self.image(key)?.gpu;
        gfx.pixels(gpu)
    }

    pub fn dispose(&mut self, gfx: &mut Graphics, key: RestoreKey) {
        self.make_stale_if_depending_on(key);
        if let Some(img) = self.images.remove(key) {
            gfx.dispose(img.gpu);
        }
        if self.white == Some(key) {
            self.white = None;
        }
    }

    /// Frame-end resolution: every stale image reads its GPU pixels back into
    /// base pixels, leaving the whole registry restorable.
    #[tracing::instrument(skip_all)]
    pub fn resolve_stale_images(&mut self, gfx: &mut Graphics) -> SpryteResult<()> {
        if !gfx.needs_restoring() {
            return Ok(());
        }
        let keys: Vec<RestoreKey> = self
            .images
            .iter()
            .filter(|(_, img)| img.stale && !img.volatile && !img.screen)
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.read_pixels_from_gpu(gfx, key)?;
        }
        Ok(())
    }

    /// Clears every volatile image; runs at frame start.
    pub fn clear_volatile_images(&mut self, gfx: &mut Graphics) -> SpryteResult<()> {
        let keys: Vec<RestoreKey> = self
            .images
            .iter()
            .filter(|(_, img)| img.volatile)
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.fill(gfx, key, Color::TRANSPARENT)?;
        }
        Ok(())
    }

    /// True when the probe image (the white utility image, or any image) has
    /// been invalidated by a context loss.
    pub fn context_lost(&mut self, gfx: &mut Graphics) -> SpryteResult<bool> {
        let Some(white) = self.white else {
            return Ok(false);
        };
        let gpu = self.image(white)?.gpu;
        gfx.is_invalidated(gpu)
    }

    /// Rebuilds every GPU image after a context loss: fresh driver images,
    /// bases repainted, histories replayed in dependency order.
    #[tracing::instrument(skip_all, fields(images = self.images.len()))]
    pub fn restore(&mut self, gfx: &mut Graphics) -> SpryteResult<()> {
        tracing::debug!("restoring images after context loss");

        // Priority images first (every fill samples the white image), then
        // screens and volatiles; none of these carry history.
        let mut restored: Vec<RestoreKey> = Vec::new();
        let mut pending: Vec<RestoreKey> = Vec::new();
        for (key, img) in self.images.iter() {
            if img.priority {
                restored.insert(0, key);
            } else if img.screen || img.volatile {
                restored.push(key);
            } else {
                pending.push(key);
            }
        }
        let head = restored.clone();
        for key in head {
            self.restore_one(gfx, key)?;
        }

        // Kahn-style: restore an image only once all its history sources are
        // restored. No progress with work remaining means a dependency cycle,
        // which the draw contract (src != dst) makes a corruption signal.
        while !pending.is_empty() {
            let mut progressed = false;
            let mut next_round = Vec::new();
            for key in pending {
                let ready = {
                    let img = self.image(key)?;
                    img.history
                        .iter()
                        .all(|record| restored.contains(&record.source))
                };
                if ready {
                    self.restore_one(gfx, key)?;
                    restored.push(key);
                    progressed = true;
                } else {
                    next_round.push(key);
                }
            }
            if !progressed {
                return Err(SpryteError::validation(
                    "image dependency cycle detected during restoration",
                ));
            }
            pending = next_round;
        }
        Ok(())
    }

    fn restore_one(&mut self, gfx: &mut Graphics, key: RestoreKey) -> SpryteResult<()> {
        let (old_gpu, width, height, screen, volatile, stale) = {
            let img = self.image(key)?;
            (
                img.gpu,
                img.width,
                img.height,
                img.screen,
                img.volatile,
                img.stale,
            )
        };
        gfx.dispose(old_gpu);

        if screen {
            // The OS framebuffer's contents are not ours to reconstruct.
            let gpu = gfx.new_screen_image(width, height)?;
            let img = self.image_mut(key)?;
            img.gpu = gpu;
            img.base = None;
            img.history.clear();
            img.stale = false;
            return Ok(());
        }
        if volatile {
            let gpu = gfx.new_image(width, height)?;
            self.image_mut(key)?.gpu = gpu;
            self.fill(gfx, key, Color::TRANSPARENT)?;
            return Ok(());
        }
        if stale {
            return Err(SpryteError::validation(
                "stale image encountered during restoration; resolve_stale_images must run each frame",
            ));
        }

        let gpu = gfx.new_image(width, height)?;
        self.image_mut(key)?.gpu = gpu;

        enum Paint {
            Pixels(Vec<u8>),
            Color(Color),
            Clear,
        }
        let paint = match &self.image(key)?.base {
            Some(Base::Pixels(p)) => Paint::Pixels(p.clone()),
            Some(Base::Color(c)) => Paint::Color(*c),
            None => Paint::Clear,
        };
        match paint {
            Paint::Pixels(p) => {
                gfx.replace_pixels(gpu, p, Region::sized(width as i32, height as i32))?;
            }
            Paint::Color(c) => {
                self.fill_gpu(gfx, gpu, c)?;
            }
            Paint::Clear => {
                self.fill_gpu(gfx, gpu, Color::TRANSPARENT)?;
            }
        }

        let records: Vec<(GpuKey, Vec<Vertex>, SmallVec<[u16; 6]>, Option<ColorMatrix>, Blend, Filter, Address)> = {
            let img = self.image(key)?;
            img.history
                .iter()
                .map(|record| {
                    let src_gpu = self.image(record.source)?.gpu;
                    Ok((
                        src_gpu,
                        record.vertices.clone(),
                        record.indices.clone(),
                        record.color_matrix,
                        record.blend,
                        record.filter,
                        record.address,
                    ))
                })
                .collect::<SpryteResult<_>>()?
        };
        let had_history = !records.is_empty();
        for (src_gpu, vertices, indices, color_matrix, blend, filter, address) in records {
            gfx.draw_triangles(
                gpu,
                src_gpu,
                vertices,
                indices.to_vec(),
                color_matrix,
                blend,
                filter,
                address,
            )?;
        }
        if had_history {
            // Collapse the replayed history so the base is current again.
            self.read_pixels_from_gpu(gfx, key)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn base_state(&self, key: RestoreKey) -> (BaseState, usize, bool) {
        let img = self.images.get(key).expect("live image");
        let base = match img.base {
            Some(Base::Pixels(_)) => BaseState::Pixels,
            Some(Base::Color(_)) => BaseState::Color,
            None => BaseState::None,
        };
        (base, img.history.len(), img.stale)
    }
}
