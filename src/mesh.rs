use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::foundation::color::ColorScale;
use crate::foundation::geom::GeoM;

/// Floats per vertex in the fixed driver layout:
/// dst.xy, src.xy, src-region x0 y0 x1 y1, color scale rgba.
pub const VERTEX_FLOAT_COUNT: usize = 12;

/// Largest index count a single flush group may carry. Indices are 16-bit;
/// the bound is rounded down to a whole number of triangles.
pub const MAX_INDICES_PER_GROUP: usize = (1 << 16) / 3 * 3;

/// One packed vertex. `#[repr(C)]` and `Pod` so a command's vertex buffer can
/// be handed to the driver as a flat `&[f32]` without copying.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    /// Destination position in destination pixels.
    pub dst: [f32; 2],
    /// Source position in source texels.
    pub src: [f32; 2],
    /// Source-region bounds (x0, y0, x1, y1) in texels; the fragment stage
    /// clamps or repeats sampling against these.
    pub region: [f32; 4],
    /// Color scale applied to the sampled premultiplied color.
    pub color: [f32; 4],
}

impl Vertex {
    pub fn new(dx: f32, dy: f32, sx: f32, sy: f32, region: [f32; 4], scale: ColorScale) -> Self {
        Self {
            dst: [dx, dy],
            src: [sx, sy],
            region,
            color: [scale.r, scale.g, scale.b, scale.a],
        }
    }
}

/// Four vertices for the source rectangle (sx0, sy0)-(sx1, sy1) transformed by
/// `geom` into destination space. The region bounds equal the source rect so
/// samples are confined to it.
pub fn quad_vertices(
    sx0: f32,
    sy0: f32,
    sx1: f32,
    sy1: f32,
    geom: GeoM,
    scale: ColorScale,
) -> [Vertex; 4] {
    let w = sx1 - sx0;
    let h = sy1 - sy0;
    let region = [sx0, sy0, sx1, sy1];
    let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)];
    let srcs = [(sx0, sy0), (sx1, sy0), (sx0, sy1), (sx1, sy1)];
    let mut out = [Vertex::new(0.0, 0.0, 0.0, 0.0, region, scale); 4];
    for i in 0..4 {
        let (dx, dy) = geom.apply(corners[i].0, corners[i].1);
        out[i] = Vertex::new(dx, dy, srcs[i].0, srcs[i].1, region, scale);
    }
    out
}

/// Index pattern for a quad built by [`quad_vertices`].
pub fn quad_indices() -> SmallVec<[u16; 6]> {
    SmallVec::from_slice(&[0, 1, 2, 1, 2, 3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_twelve_floats() {
        assert_eq!(
            std::mem::size_of::<Vertex>(),
            VERTEX_FLOAT_COUNT * std::mem::size_of::<f32>()
        );
    }

    #[test]
    fn quad_covers_scaled_rect() {
        let vs = quad_vertices(0.0, 0.0, 4.0, 2.0, GeoM::scale(2.0, 2.0), ColorScale::ONE);
        assert_eq!(vs[0].dst, [0.0, 0.0]);
        assert_eq!(vs[3].dst, [8.0, 4.0]);
        assert_eq!(vs[3].src, [4.0, 2.0]);
        assert_eq!(vs[0].region, [0.0, 0.0, 4.0, 2.0]);
    }

    #[test]
    fn quad_with_offset_source_rect() {
        let vs = quad_vertices(8.0, 8.0, 16.0, 16.0, GeoM::IDENTITY, ColorScale::ONE);
        // Destination geometry starts at the origin even for offset source rects.
        assert_eq!(vs[0].dst, [0.0, 0.0]);
        assert_eq!(vs[3].dst, [8.0, 8.0]);
        assert_eq!(vs[0].src, [8.0, 8.0]);
        assert_eq!(vs[0].region, [8.0, 8.0, 16.0, 16.0]);
    }

    #[test]
    fn index_budget_is_whole_triangles() {
        assert_eq!(MAX_INDICES_PER_GROUP % 3, 0);
        assert!(MAX_INDICES_PER_GROUP <= u16::MAX as usize + 1);
    }
}
