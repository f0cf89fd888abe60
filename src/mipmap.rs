//! Mipmap chains: lazily materialised half-scale copies of an image, chosen
//! per draw from the geometry determinant so heavy downscales sample a
//! prefiltered level instead of skipping texels.

use smallvec::SmallVec;

use crate::atlas::{Atlas, AtlasKey};
use crate::command::Graphics;
use crate::driver::{Address, Filter};
use crate::foundation::arena::{Arena, Handle};
use crate::foundation::blend::Blend;
use crate::foundation::color::{Color, ColorMatrix, ColorScale};
use crate::foundation::error::{SpryteError, SpryteResult};
use crate::foundation::geom::{GeoM, Region};
use crate::mesh::{Vertex, quad_indices, quad_vertices};
use crate::restore::RestoreRegistry;

pub const MAX_LEVEL: u32 = 6;

#[derive(Clone, Copy, Default)]
enum LevelSlot {
    #[default]
    Unbuilt,
    /// The image degenerates to zero size at this level.
    Missing,
    Ready(AtlasKey),
}

pub struct Mipmap {
    width: u32,
    height: u32,
    volatile: bool,
    screen: bool,
    orig: AtlasKey,
    levels: [LevelSlot; MAX_LEVEL as usize],
}

pub type MipKey = Handle<Mipmap>;

/// Smallest level whose accumulated magnification brings `det` out of the
/// undersampling range. A draw at determinant 1/64 selects level 3.
pub fn level_for_downscale(det: f32) -> u32 {
    let mut d = det.abs();
    let mut level = 0;
    while d <= 0.25 && level < MAX_LEVEL {
        level += 1;
        d *= 4.0;
    }
    level
}

fn size_for_level(x: u32, level: u32) -> u32 {
    x >> level
}

pub struct Mipmaps {
    images: Arena<Mipmap>,
}

impl Default for Mipmaps {
    fn default() -> Self {
        Self::new()
    }
}

impl Mipmaps {
    pub fn new() -> Self {
        Self {
            images: Arena::new(),
        }
    }

    fn image(&self, key: MipKey) -> SpryteResult<&Mipmap> {
        self.images
            .get(key)
            .ok_or_else(|| SpryteError::disposed(format!("image {key:?}")))
    }

    fn image_mut(&mut self, key: MipKey) -> SpryteResult<&mut Mipmap> {
        self.images
            .get_mut(key)
            .ok_or_else(|| SpryteError::disposed(format!("image {key:?}")))
    }

    pub fn new_image(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        width: u32,
        height: u32,
        volatile: bool,
    ) -> SpryteResult<MipKey> {
        let orig = if volatile {
            atlas.new_volatile_image(restore, gfx, width, height)?
        } else {
            atlas.new_image(width, height)
        };
        Ok(self.images.insert(Mipmap {
            width,
            height,
            volatile,
            screen: false,
            orig,
            levels: Default::default(),
        }))
    }

    pub fn new_screen_image(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        width: u32,
        height: u32,
    ) -> SpryteResult<MipKey> {
        let orig = atlas.new_screen_image(restore, gfx, width, height)?;
        Ok(self.images.insert(Mipmap {
            width,
            height,
            volatile: false,
            screen: true,
            orig,
            levels: Default::default(),
        }))
    }

    pub fn size(&self, key: MipKey) -> SpryteResult<(u32, u32)> {
        let img = self.image(key)?;
        Ok((img.width, img.height))
    }

    pub fn is_screen(&self, key: MipKey) -> SpryteResult<bool> {
        Ok(self.image(key)?.screen)
    }

    pub fn orig_key(&self, key: MipKey) -> SpryteResult<AtlasKey> {
        Ok(self.image(key)?.orig)
    }

    pub fn contains(&self, key: MipKey) -> bool {
        self.images.contains(key)
    }

    pub fn fill(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: MipKey,
        color: Color,
    ) -> SpryteResult<()> {
        let orig = self.image(key)?.orig;
        atlas.fill(restore, gfx, orig, color)?;
        self.dispose_levels(atlas, restore, gfx, key)
    }

    pub fn replace_pixels(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: MipKey,
        pixels: &[u8],
    ) -> SpryteResult<()> {
        let orig = self.image(key)?.orig;
        atlas.replace_pixels(restore, gfx, orig, pixels)?;
        self.dispose_levels(atlas, restore, gfx, key)
    }

    pub fn at(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: MipKey,
        x: i32,
        y: i32,
    ) -> SpryteResult<Color> {
        let orig = self.image(key)?.orig;
        atlas.at(restore, gfx, orig, x, y)
    }

    pub fn pixels(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: MipKey,
    ) -> SpryteResult<Vec<u8>> {
        let orig = self.image(key)?.orig;
        atlas.pixels(restore, gfx, orig)
    }

    fn level_to_draw_from(&self, key: MipKey, bounds: Region, filter: Filter, dst_screen: bool, det: f32) -> SpryteResult<u32> {
        let img = self.image(key)?;
        if filter != Filter::Linear || dst_screen || img.volatile {
            return Ok(0);
        }
        let mut level = level_for_downscale(det);
        // Step back while the source rectangle would scale to nothing.
        while level > 0
            && (size_for_level(bounds.width as u32, level) == 0
                || size_for_level(bounds.height as u32, level) == 0)
        {
            level -= 1;
        }
        Ok(level)
    }

    /// Builds (or reuses) the image for `level` >= 1: each level is a
    /// linear-filtered half-scale copy of the previous one.
    fn level(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: MipKey,
        level: u32,
    ) -> SpryteResult<Option<AtlasKey>> {
        debug_assert!(level >= 1 && level <= MAX_LEVEL);
        let slot = self.image(key)?.levels[(level - 1) as usize];
        match slot {
            LevelSlot::Ready(k) => return Ok(Some(k)),
            LevelSlot::Missing => return Ok(None),
            LevelSlot::Unbuilt => {}
        }

        let (width, height, orig) = {
            let img = self.image(key)?;
            (img.width, img.height, img.orig)
        };
        let w = size_for_level(width, level);
        let h = size_for_level(height, level);
        if w == 0 || h == 0 {
            self.image_mut(key)?.levels[(level - 1) as usize] = LevelSlot::Missing;
            return Ok(None);
        }

        let src = if level == 1 {
            Some(orig)
        } else {
            self.level(atlas, restore, gfx, key, level - 1)?
        };
        let Some(src) = src else {
            self.image_mut(key)?.levels[(level - 1) as usize] = LevelSlot::Missing;
            return Ok(None);
        };

        let src_w = size_for_level(width, level - 1);
        let src_h = size_for_level(height, level - 1);
        let built = atlas.new_image(w, h);
        let vertices = quad_vertices(
            0.0,
            0.0,
            src_w as f32,
            src_h as f32,
            GeoM::scale(0.5, 0.5),
            ColorScale::ONE,
        );
        atlas.draw_triangles(
            restore,
            gfx,
            built,
            src,
            vertices.to_vec(),
            quad_indices(),
            None,
            Blend::COPY,
            Filter::Linear,
            Address::ClampToZero,
        )?;
        self.image_mut(key)?.levels[(level - 1) as usize] = LevelSlot::Ready(built);
        Ok(Some(built))
    }

    /// Draws a source rectangle of `src` into `dst` under `geom`, routing the
    /// draw through a mipmap level when the downscale warrants it.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_image(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        dst: MipKey,
        src: MipKey,
        bounds: Region,
        geom: GeoM,
        color_matrix: Option<ColorMatrix>,
        mut scale: ColorScale,
        blend: Blend,
        filter: Filter,
        address: Address,
    ) -> SpryteResult<()> {
        let det = geom.det();
        if det == 0.0 || det.is_nan() {
            return Ok(());
        }
        if bounds.is_empty() {
            return Ok(());
        }

        let mut color_matrix = color_matrix;
        if let Some(cm) = color_matrix
            && cm.is_scale_only()
        {
            let (r, g, b, a) = cm.scale_elements();
            // A scale-only matrix acts on straight alpha; on premultiplied
            // values that is a scale by (r*a, g*a, b*a, a).
            scale = scale.mul(ColorScale::new(r * a, g * a, b * a, a));
            color_matrix = None;
        }

        let dst_screen = self.image(dst)?.screen;
        let level = self.level_to_draw_from(src, bounds, filter, dst_screen, det)?;

        let (dst_orig, src_orig) = (self.image(dst)?.orig, self.image(src)?.orig);
        if level == 0 {
            let vertices = quad_vertices(
                bounds.x as f32,
                bounds.y as f32,
                (bounds.x + bounds.width) as f32,
                (bounds.y + bounds.height) as f32,
                geom,
                scale,
            );
            atlas.draw_triangles(
                restore,
                gfx,
                dst_orig,
                src_orig,
                vertices.to_vec(),
                quad_indices(),
                color_matrix,
                blend,
                filter,
                address,
            )?;
        } else if let Some(level_image) = self.level(atlas, restore, gfx, src, level)? {
            let s = (1u32 << level) as f32;
            let sx0 = size_for_level(bounds.x as u32, level) as f32;
            let sy0 = size_for_level(bounds.y as u32, level) as f32;
            let sx1 = size_for_level((bounds.x + bounds.width) as u32, level) as f32;
            let sy1 = size_for_level((bounds.y + bounds.height) as u32, level) as f32;
            let magnified = GeoM {
                a: geom.a * s,
                b: geom.b * s,
                c: geom.c * s,
                d: geom.d * s,
                tx: geom.tx,
                ty: geom.ty,
            };
            let vertices = quad_vertices(sx0, sy0, sx1, sy1, magnified, scale);
            atlas.draw_triangles(
                restore,
                gfx,
                dst_orig,
                level_image,
                vertices.to_vec(),
                quad_indices(),
                color_matrix,
                blend,
                filter,
                address,
            )?;
        }
        self.dispose_levels(atlas, restore, gfx, dst)
    }

    /// Raw triangle path: no level selection, but the scale-only matrix fast
    /// path still folds into the vertex colours.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_triangles(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        dst: MipKey,
        src: MipKey,
        mut vertices: Vec<Vertex>,
        indices: SmallVec<[u16; 6]>,
        color_matrix: Option<ColorMatrix>,
        blend: Blend,
        filter: Filter,
        address: Address,
    ) -> SpryteResult<()> {
        let mut color_matrix = color_matrix;
        if let Some(cm) = color_matrix
            && cm.is_scale_only()
        {
            let (r, g, b, a) = cm.scale_elements();
            for v in &mut vertices {
                v.color[0] *= r * a;
                v.color[1] *= g * a;
                v.color[2] *= b * a;
                v.color[3] *= a;
            }
            color_matrix = None;
        }
        let (dst_orig, src_orig) = (self.image(dst)?.orig, self.image(src)?.orig);
        atlas.draw_triangles(
            restore,
            gfx,
            dst_orig,
            src_orig,
            vertices,
            indices,
            color_matrix,
            blend,
            filter,
            address,
        )?;
        self.dispose_levels(atlas, restore, gfx, dst)
    }

    fn dispose_levels(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: MipKey,
    ) -> SpryteResult<()> {
        let levels = std::mem::take(&mut self.image_mut(key)?.levels);
        for slot in levels {
            if let LevelSlot::Ready(k) = slot {
                atlas.dispose(restore, gfx, k)?;
            }
        }
        Ok(())
    }

    /// Disposing twice is a no-op.
    pub fn dispose(
        &mut self,
        atlas: &mut Atlas,
        restore: &mut RestoreRegistry,
        gfx: &mut Graphics,
        key: MipKey,
    ) -> SpryteResult<()> {
        if !self.images.contains(key) {
            return Ok(());
        }
        self.dispose_levels(atlas, restore, gfx, key)?;
        let orig = self.image(key)?.orig;
        atlas.dispose(restore, gfx, orig)?;
        self.images.remove(key);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn built_level_count(&self, key: MipKey) -> usize {
        self.images
            .get(key)
            .map(|img| {
                img.levels
                    .iter()
                    .filter(|slot| matches!(slot, LevelSlot::Ready(_)))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::AtlasOpts;
    use crate::driver::software::SoftwareDriver;

    fn setup() -> (Graphics, RestoreRegistry, Atlas, Mipmaps) {
        let gfx = Graphics::new(Box::new(SoftwareDriver::new()));
        let restore = RestoreRegistry::new();
        let atlas = Atlas::new(&gfx, AtlasOpts::default());
        (gfx, restore, atlas, Mipmaps::new())
    }

    #[test]
    fn downscale_levels_follow_the_determinant() {
        assert_eq!(level_for_downscale(1.0), 0);
        assert_eq!(level_for_downscale(0.5), 0);
        assert_eq!(level_for_downscale(0.25), 1);
        assert_eq!(level_for_downscale(1.0 / 16.0), 2);
        assert_eq!(level_for_downscale(1.0 / 64.0), 3);
        assert_eq!(level_for_downscale(-1.0 / 64.0), 3);
        assert_eq!(level_for_downscale(1e-12), MAX_LEVEL);
    }

    #[test]
    fn nearest_filter_never_uses_levels() {
        let (mut gfx, mut restore, mut atlas, mut mips) = setup();
        let src = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 64, 64, false)
            .unwrap();
        let dst = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 8, 8, false)
            .unwrap();
        mips.draw_image(
            &mut atlas,
            &mut restore,
            &mut gfx,
            dst,
            src,
            Region::sized(64, 64),
            GeoM::scale(0.125, 0.125),
            None,
            ColorScale::ONE,
            Blend::SOURCE_OVER,
            Filter::Nearest,
            Address::ClampToZero,
        )
        .unwrap();
        assert_eq!(mips.built_level_count(src), 0);
    }

    #[test]
    fn linear_downscale_builds_the_chain() {
        let (mut gfx, mut restore, mut atlas, mut mips) = setup();
        let src = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 64, 64, false)
            .unwrap();
        mips.fill(&mut atlas, &mut restore, &mut gfx, src, Color::WHITE)
            .unwrap();
        let dst = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 8, 8, false)
            .unwrap();
        mips.draw_image(
            &mut atlas,
            &mut restore,
            &mut gfx,
            dst,
            src,
            Region::sized(64, 64),
            GeoM::scale(0.125, 0.125),
            None,
            ColorScale::ONE,
            Blend::SOURCE_OVER,
            Filter::Linear,
            Address::ClampToZero,
        )
        .unwrap();
        // det = 1/64 -> level 3; levels 1..=3 materialised.
        assert_eq!(mips.built_level_count(src), 3);
        assert_eq!(
            mips.at(&mut atlas, &mut restore, &mut gfx, dst, 4, 4).unwrap(),
            Color::WHITE
        );
    }

    #[test]
    fn writes_invalidate_levels() {
        let (mut gfx, mut restore, mut atlas, mut mips) = setup();
        let src = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 64, 64, false)
            .unwrap();
        let dst = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 8, 8, false)
            .unwrap();
        mips.draw_image(
            &mut atlas,
            &mut restore,
            &mut gfx,
            dst,
            src,
            Region::sized(64, 64),
            GeoM::scale(0.125, 0.125),
            None,
            ColorScale::ONE,
            Blend::SOURCE_OVER,
            Filter::Linear,
            Address::ClampToZero,
        )
        .unwrap();
        assert!(mips.built_level_count(src) > 0);
        mips.fill(&mut atlas, &mut restore, &mut gfx, src, Color::WHITE)
            .unwrap();
        assert_eq!(mips.built_level_count(src), 0);
    }

    #[test]
    fn zero_determinant_draws_nothing() {
        let (mut gfx, mut restore, mut atlas, mut mips) = setup();
        let src = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 8, 8, false)
            .unwrap();
        mips.fill(&mut atlas, &mut restore, &mut gfx, src, Color::WHITE)
            .unwrap();
        let dst = mips
            .new_image(&mut atlas, &mut restore, &mut gfx, 8, 8, false)
            .unwrap();
        mips.draw_image(
            &mut atlas,
            &mut restore,
            &mut gfx,
            dst,
            src,
            Region::sized(8, 8),
            GeoM::scale(0.0, 1.0),
            None,
            ColorScale::ONE,
            Blend::SOURCE_OVER,
            Filter::Linear,
            Address::ClampToZero,
        )
        .unwrap();
        assert_eq!(
            mips.at(&mut atlas, &mut restore, &mut gfx, dst, 0, 0).unwrap(),
            Color::TRANSPARENT
        );
    }
}
