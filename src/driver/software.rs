//! Reference software implementation of the [`Driver`] contract.
//!
//! A scanline rasterizer over premultiplied RGBA8 buffers. It is the
//! pixel-exact back-end the test suite runs against, and doubles as the fault
//! injector for context-loss and flush-failure scenarios.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::foundation::blend::Blend;
use crate::foundation::color::ColorMatrix;
use crate::foundation::error::{SpryteError, SpryteResult};
use crate::foundation::geom::Region;
use crate::mesh::VERTEX_FLOAT_COUNT;

use super::{Address, Driver, DriverImageId, Filter, YDirection};

struct SoftImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    screen: bool,
    invalidated: bool,
}

#[derive(Default)]
struct ControlState {
    invalidate_all: bool,
    fail_next_draw: bool,
    draw_calls: u64,
    uploaded_bytes: u64,
}

/// Shared handle into a [`SoftwareDriver`]'s fault-injection flags and
/// counters. Clone it before boxing the driver into a pipeline.
#[derive(Clone)]
pub struct SoftwareControl {
    state: Arc<Mutex<ControlState>>,
}

impl SoftwareControl {
    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks every image live at the next `reset_for_frame` as invalidated,
    /// simulating a lost GPU context.
    pub fn break_context(&self) {
        self.state().invalidate_all = true;
    }

    /// Forces the next `draw_triangles` to fail with a driver error.
    pub fn fail_next_draw(&self) {
        self.state().fail_next_draw = true;
    }

    /// Number of `draw_triangles` calls the driver has executed.
    pub fn draw_triangles_count(&self) -> u64 {
        self.state().draw_calls
    }

    /// Total bytes uploaded through `replace_pixels`.
    pub fn uploaded_bytes(&self) -> u64 {
        self.state().uploaded_bytes
    }

    pub fn reset_counters(&self) {
        let mut s = self.state();
        s.draw_calls = 0;
        s.uploaded_bytes = 0;
    }
}

pub struct SoftwareDriver {
    images: HashMap<u32, SoftImage>,
    next_id: u32,
    needs_restoring: bool,
    control: SoftwareControl,
}

impl Default for SoftwareDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDriver {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            next_id: 1,
            needs_restoring: true,
            control: SoftwareControl {
                state: Arc::new(Mutex::new(ControlState::default())),
            },
        }
    }

    /// A driver that reports `needs_restoring() == false`, like desktop
    /// back-ends that never lose their context.
    pub fn without_restoring() -> Self {
        Self {
            needs_restoring: false,
            ..Self::new()
        }
    }

    pub fn control(&self) -> SoftwareControl {
        self.control.clone()
    }

    fn alloc(&mut self, width: u32, height: u32, screen: bool) -> SpryteResult<DriverImageId> {
        if width == 0 || height == 0 {
            return Err(SpryteError::validation(
                "software driver: image dimensions must be positive",
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.images.insert(
            id,
            SoftImage {
                width,
                height,
                pixels: vec![0; (width as usize) * (height as usize) * 4],
                screen,
                invalidated: false,
            },
        );
        Ok(DriverImageId(id))
    }

    fn image(&self, id: DriverImageId) -> SpryteResult<&SoftImage> {
        self.images
            .get(&id.0)
            .ok_or_else(|| SpryteError::driver(format!("unknown image id {}", id.0)))
    }
}

impl Driver for SoftwareDriver {
    fn new_image(&mut self, width: u32, height: u32) -> SpryteResult<DriverImageId> {
        self.alloc(width, height, false)
    }

    fn new_screen_image(&mut self, width: u32, height: u32) -> SpryteResult<DriverImageId> {
        self.alloc(width, height, true)
    }

    fn dispose_image(&mut self, id: DriverImageId) {
        self.images.remove(&id.0);
    }

    fn replace_pixels(
        &mut self,
        id: DriverImageId,
        pixels: &[u8],
        region: Region,
    ) -> SpryteResult<()> {
        let img = self
            .images
            .get_mut(&id.0)
            .ok_or_else(|| SpryteError::driver(format!("unknown image id {}", id.0)))?;
        let full = Region::sized(img.width as i32, img.height as i32);
        if !full.contains(region) || region.is_empty() {
            return Err(SpryteError::driver(format!(
                "replace_pixels region {region:?} out of bounds for {}x{}",
                img.width, img.height
            )));
        }
        let want = (region.width as usize) * (region.height as usize) * 4;
        if pixels.len() != want {
            return Err(SpryteError::driver(format!(
                "replace_pixels byte count {} != {}",
                pixels.len(),
                want
            )));
        }
        let stride = img.width as usize * 4;
        let row_bytes = region.width as usize * 4;
        for row in 0..region.height as usize {
            let dst_off = (region.y as usize + row) * stride + region.x as usize * 4;
            let src_off = row * row_bytes;
            img.pixels[dst_off..dst_off + row_bytes]
                .copy_from_slice(&pixels[src_off..src_off + row_bytes]);
        }
        self.control.state().uploaded_bytes += pixels.len() as u64;
        Ok(())
    }

    fn pixels(&mut self, id: DriverImageId) -> SpryteResult<Vec<u8>> {
        Ok(self.image(id)?.pixels.clone())
    }

    fn draw_triangles(
        &mut self,
        dst: DriverImageId,
        src: DriverImageId,
        vertices: &[f32],
        indices: &[u16],
        color_matrix: Option<&ColorMatrix>,
        blend: Blend,
        filter: Filter,
        address: Address,
        dst_region: Region,
    ) -> SpryteResult<()> {
        {
            let mut s = self.control.state();
            s.draw_calls += 1;
            if s.fail_next_draw {
                s.fail_next_draw = false;
                return Err(SpryteError::driver("injected draw failure"));
            }
        }
        if dst == src {
            return Err(SpryteError::driver(
                "software driver: src and dst must differ",
            ));
        }
        if vertices.len() % VERTEX_FLOAT_COUNT != 0 {
            return Err(SpryteError::driver("vertex buffer not a whole vertex count"));
        }
        let vertex_count = vertices.len() / VERTEX_FLOAT_COUNT;

        // Take the destination out of the map so the source can be borrowed
        // alongside it.
        let mut dst_img = self
            .images
            .remove(&dst.0)
            .ok_or_else(|| SpryteError::driver(format!("unknown image id {}", dst.0)))?;
        let result = (|| {
            let src_img = self.image(src)?;
            let clip = Region::sized(dst_img.width as i32, dst_img.height as i32);
            let clip = if dst_region.is_empty() {
                clip
            } else {
                Region::new(
                    dst_region.x.max(0),
                    dst_region.y.max(0),
                    dst_region.width.min(clip.width - dst_region.x.max(0)),
                    dst_region.height.min(clip.height - dst_region.y.max(0)),
                )
            };
            for tri in indices.chunks_exact(3) {
                for &ix in tri {
                    if ix as usize >= vertex_count {
                        return Err(SpryteError::driver("index out of vertex range"));
                    }
                }
                raster_triangle(
                    &mut dst_img,
                    src_img,
                    vertices,
                    [tri[0] as usize, tri[1] as usize, tri[2] as usize],
                    color_matrix,
                    blend,
                    filter,
                    address,
                    clip,
                );
            }
            Ok(())
        })();
        self.images.insert(dst.0, dst_img);
        result
    }

    fn reset_for_frame(&mut self) {
        let mut s = self.control.state();
        if s.invalidate_all {
            s.invalidate_all = false;
            for img in self.images.values_mut() {
                // A lost context loses contents too.
                img.invalidated = true;
                img.pixels.fill(0);
            }
        }
    }

    fn has_high_precision_float(&self) -> bool {
        true
    }

    fn max_image_size(&self) -> u32 {
        4096
    }

    fn framebuffer_y_direction(&self) -> YDirection {
        YDirection::Downward
    }

    fn needs_restoring(&self) -> bool {
        self.needs_restoring
    }

    fn is_invalidated(&self, id: DriverImageId) -> bool {
        self.images.get(&id.0).is_none_or(|img| img.invalidated)
    }
}

fn vertex_at(vertices: &[f32], i: usize) -> &[f32] {
    &vertices[i * VERTEX_FLOAT_COUNT..(i + 1) * VERTEX_FLOAT_COUNT]
}

#[allow(clippy::too_many_arguments)]
fn raster_triangle(
    dst: &mut SoftImage,
    src: &SoftImage,
    vertices: &[f32],
    tri: [usize; 3],
    color_matrix: Option<&ColorMatrix>,
    blend: Blend,
    filter: Filter,
    address: Address,
    clip: Region,
) {
    let a = vertex_at(vertices, tri[0]);
    let b = vertex_at(vertices, tri[1]);
    let c = vertex_at(vertices, tri[2]);

    let area = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
    if area == 0.0 || !area.is_finite() {
        return;
    }
    // Normalize to positive orientation so the fill rule below is uniform.
    let (v0, v1, v2, area) = if area > 0.0 {
        (a, b, c, area)
    } else {
        (a, c, b, -area)
    };
    let (x0, y0) = (v0[0], v0[1]);
    let (x1, y1) = (v1[0], v1[1]);
    let (x2, y2) = (v2[0], v2[1]);

    // Top-left fill rule: pixels exactly on a shared edge belong to exactly
    // one of the adjacent triangles, so overlapping blends never double up.
    let top_left = |ax: f32, ay: f32, bx: f32, by: f32| {
        let dx = bx - ax;
        let dy = by - ay;
        dy < 0.0 || (dy == 0.0 && dx > 0.0)
    };
    let tl0 = top_left(x1, y1, x2, y2);
    let tl1 = top_left(x2, y2, x0, y0);
    let tl2 = top_left(x0, y0, x1, y1);

    let min_x = (x0.min(x1).min(x2).floor() as i32).max(clip.x);
    let max_x = (x0.max(x1).max(x2).ceil() as i32).min(clip.x + clip.width);
    let min_y = (y0.min(y1).min(y2).floor() as i32).max(clip.y);
    let max_y = (y0.max(y1).max(y2).ceil() as i32).min(clip.y + clip.height);

    let edge = |ax: f32, ay: f32, bx: f32, by: f32, px: f32, py: f32| {
        (bx - ax) * (py - ay) - (by - ay) * (px - ax)
    };

    for py in min_y..max_y {
        for px in min_x..max_x {
            let cx = px as f32 + 0.5;
            let cy = py as f32 + 0.5;
            let e0 = edge(x1, y1, x2, y2, cx, cy);
            let e1 = edge(x2, y2, x0, y0, cx, cy);
            let e2 = edge(x0, y0, x1, y1, cx, cy);
            let inside = (e0 > 0.0 || (e0 == 0.0 && tl0))
                && (e1 > 0.0 || (e1 == 0.0 && tl1))
                && (e2 > 0.0 || (e2 == 0.0 && tl2));
            if !inside {
                continue;
            }
            let w0 = e0 / area;
            let w1 = e1 / area;
            let w2 = e2 / area;

            let lerp = |off: usize| w0 * v0[off] + w1 * v1[off] + w2 * v2[off];
            let sx = lerp(2);
            let sy = lerp(3);
            let region = [lerp(4), lerp(5), lerp(6), lerp(7)];
            let scale = [lerp(8), lerp(9), lerp(10), lerp(11)];

            let mut c = sample(src, sx, sy, region, filter, address);
            for ch in 0..4 {
                c[ch] *= scale[ch];
            }
            if let Some(m) = color_matrix {
                c = apply_color_matrix(m, c);
            }

            let idx = (py as usize * dst.width as usize + px as usize) * 4;
            let d = [
                dst.pixels[idx] as f32 / 255.0,
                dst.pixels[idx + 1] as f32 / 255.0,
                dst.pixels[idx + 2] as f32 / 255.0,
                dst.pixels[idx + 3] as f32 / 255.0,
            ];
            let out = blend.eval(c, d);
            for ch in 0..4 {
                dst.pixels[idx + ch] = (out[ch] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Applies the 4x5 matrix on straight alpha, then re-premultiplies.
fn apply_color_matrix(m: &ColorMatrix, premul: [f32; 4]) -> [f32; 4] {
    let a = premul[3];
    let straight = if a > 0.0 {
        [premul[0] / a, premul[1] / a, premul[2] / a, a]
    } else {
        [0.0, 0.0, 0.0, 0.0]
    };
    let out = m.apply(straight);
    let oa = out[3].clamp(0.0, 1.0);
    [
        out[0].clamp(0.0, 1.0) * oa,
        out[1].clamp(0.0, 1.0) * oa,
        out[2].clamp(0.0, 1.0) * oa,
        oa,
    ]
}

fn texel(img: &SoftImage, tx: i32, ty: i32) -> [f32; 4] {
    if tx < 0 || ty < 0 || tx >= img.width as i32 || ty >= img.height as i32 {
        return [0.0; 4];
    }
    let idx = (ty as usize * img.width as usize + tx as usize) * 4;
    [
        img.pixels[idx] as f32 / 255.0,
        img.pixels[idx + 1] as f32 / 255.0,
        img.pixels[idx + 2] as f32 / 255.0,
        img.pixels[idx + 3] as f32 / 255.0,
    ]
}

/// Resolves one sample position against the source region per address mode.
/// Returns `None` when clamp-to-zero rejects the position.
fn address_position(pos: f32, lo: f32, hi: f32, address: Address) -> Option<f32> {
    match address {
        Address::ClampToZero => {
            if pos < lo || pos >= hi {
                None
            } else {
                Some(pos)
            }
        }
        Address::Repeat => {
            let span = hi - lo;
            if span <= 0.0 {
                return None;
            }
            let mut p = (pos - lo) % span;
            if p < 0.0 {
                p += span;
            }
            Some(lo + p)
        }
    }
}

fn point_sample(img: &SoftImage, x: f32, y: f32, region: [f32; 4], address: Address) -> [f32; 4] {
    let Some(x) = address_position(x, region[0], region[2], address) else {
        return [0.0; 4];
    };
    let Some(y) = address_position(y, region[1], region[3], address) else {
        return [0.0; 4];
    };
    texel(img, x.floor() as i32, y.floor() as i32)
}

fn sample(
    img: &SoftImage,
    x: f32,
    y: f32,
    region: [f32; 4],
    filter: Filter,
    address: Address,
) -> [f32; 4] {
    match filter {
        Filter::Nearest => point_sample(img, x, y, region, address),
        Filter::Linear => {
            let u = x - 0.5;
            let v = y - 0.5;
            let fx = u - u.floor();
            let fy = v - v.floor();
            let x0 = u.floor() + 0.5;
            let y0 = v.floor() + 0.5;
            let c00 = point_sample(img, x0, y0, region, address);
            let c10 = point_sample(img, x0 + 1.0, y0, region, address);
            let c01 = point_sample(img, x0, y0 + 1.0, region, address);
            let c11 = point_sample(img, x0 + 1.0, y0 + 1.0, region, address);
            let mut out = [0.0f32; 4];
            for ch in 0..4 {
                let top = c00[ch] * (1.0 - fx) + c10[ch] * fx;
                let bottom = c01[ch] * (1.0 - fx) + c11[ch] * fx;
                out[ch] = top * (1.0 - fy) + bottom * fy;
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::color::ColorScale;
    use crate::foundation::geom::GeoM;
    use crate::mesh::{quad_indices, quad_vertices};

    fn flat(vs: &[crate::mesh::Vertex]) -> &[f32] {
        bytemuck::cast_slice(vs)
    }

    #[test]
    fn copy_quad_replicates_source() {
        let mut d = SoftwareDriver::new();
        let src = d.new_image(2, 2).unwrap();
        let dst = d.new_image(2, 2).unwrap();
        let pix = vec![
            255, 0, 0, 255, 0, 255, 0, 255, //
            0, 0, 255, 255, 255, 255, 255, 255,
        ];
        d.replace_pixels(src, &pix, Region::sized(2, 2)).unwrap();

        let vs = quad_vertices(0.0, 0.0, 2.0, 2.0, GeoM::IDENTITY, ColorScale::ONE);
        d.draw_triangles(
            dst,
            src,
            flat(&vs),
            &quad_indices(),
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::ClampToZero,
            Region::sized(2, 2),
        )
        .unwrap();
        assert_eq!(d.pixels(dst).unwrap(), pix);
    }

    #[test]
    fn linear_half_scale_box_filters() {
        let mut d = SoftwareDriver::new();
        let src = d.new_image(2, 2).unwrap();
        let dst = d.new_image(1, 1).unwrap();
        let pix = vec![
            200, 0, 0, 255, 0, 200, 0, 255, //
            0, 0, 200, 255, 200, 200, 200, 255,
        ];
        d.replace_pixels(src, &pix, Region::sized(2, 2)).unwrap();

        let vs = quad_vertices(0.0, 0.0, 2.0, 2.0, GeoM::scale(0.5, 0.5), ColorScale::ONE);
        d.draw_triangles(
            dst,
            src,
            flat(&vs),
            &quad_indices(),
            None,
            Blend::COPY,
            Filter::Linear,
            Address::ClampToZero,
            Region::sized(1, 1),
        )
        .unwrap();
        let out = d.pixels(dst).unwrap();
        assert_eq!(out, vec![100, 100, 100, 255]);
    }

    #[test]
    fn clamp_to_zero_outside_region_draws_nothing() {
        let mut d = SoftwareDriver::new();
        let src = d.new_image(2, 2).unwrap();
        let dst = d.new_image(4, 4).unwrap();
        d.replace_pixels(src, &[255u8; 16], Region::sized(2, 2))
            .unwrap();

        // Source rect entirely outside the image: every sample clamps to zero.
        let vs = quad_vertices(4.0, 4.0, 8.0, 8.0, GeoM::IDENTITY, ColorScale::ONE);
        d.draw_triangles(
            dst,
            src,
            flat(&vs),
            &quad_indices(),
            None,
            Blend::SOURCE_OVER,
            Filter::Nearest,
            Address::ClampToZero,
            Region::sized(4, 4),
        )
        .unwrap();
        assert!(d.pixels(dst).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn repeat_wraps_into_region() {
        let mut d = SoftwareDriver::new();
        let src = d.new_image(2, 1).unwrap();
        let dst = d.new_image(4, 1).unwrap();
        d.replace_pixels(src, &[255, 0, 0, 255, 0, 255, 0, 255], Region::sized(2, 1))
            .unwrap();

        let vs = quad_vertices(0.0, 0.0, 4.0, 1.0, GeoM::IDENTITY, ColorScale::ONE);
        // Region covers only the 2x1 source; sampling 0..4 wraps twice.
        let vs: Vec<_> = vs
            .iter()
            .map(|v| crate::mesh::Vertex {
                region: [0.0, 0.0, 2.0, 1.0],
                ..*v
            })
            .collect();
        d.draw_triangles(
            dst,
            src,
            flat(&vs),
            &quad_indices(),
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::Repeat,
            Region::sized(4, 1),
        )
        .unwrap();
        let out = d.pixels(dst).unwrap();
        assert_eq!(&out[0..4], &[255, 0, 0, 255]);
        assert_eq!(&out[8..12], &[255, 0, 0, 255]);
    }

    #[test]
    fn injected_failure_and_counters() {
        let mut d = SoftwareDriver::new();
        let control = d.control();
        let src = d.new_image(1, 1).unwrap();
        let dst = d.new_image(1, 1).unwrap();
        let vs = quad_vertices(0.0, 0.0, 1.0, 1.0, GeoM::IDENTITY, ColorScale::ONE);

        control.fail_next_draw();
        let err = d.draw_triangles(
            dst,
            src,
            flat(&vs),
            &quad_indices(),
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::ClampToZero,
            Region::sized(1, 1),
        );
        assert!(matches!(err, Err(SpryteError::Driver(_))));
        assert_eq!(control.draw_triangles_count(), 1);
    }

    #[test]
    fn break_context_invalidates_live_images() {
        let mut d = SoftwareDriver::new();
        let control = d.control();
        let img = d.new_image(1, 1).unwrap();
        assert!(!d.is_invalidated(img));
        control.break_context();
        d.reset_for_frame();
        assert!(d.is_invalidated(img));
        let fresh = d.new_image(1, 1).unwrap();
        assert!(!d.is_invalidated(fresh));
    }
}
