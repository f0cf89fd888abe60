//! Graphics driver contract: the narrow vocabulary the command queue speaks.
//!
//! Back-ends (OpenGL-style, Metal-style, the bundled software rasterizer)
//! implement [`Driver`]; everything above the command queue is back-end
//! agnostic.

pub mod software;

use crate::foundation::blend::Blend;
use crate::foundation::color::ColorMatrix;
use crate::foundation::error::SpryteResult;
use crate::foundation::geom::Region;

/// Driver-side image identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverImageId(pub u32);

/// Which way the framebuffer Y axis grows. The command queue compensates for
/// upward-Y back-ends when drawing to the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YDirection {
    Upward,
    Downward,
}

/// Sampling filter for draw sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

/// How samples outside the per-vertex source region behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Address {
    #[default]
    ClampToZero,
    Repeat,
}

/// The back-end contract. Pixels are premultiplied RGBA8, row-major, no
/// padding. Vertices arrive as flat `f32` slices in the 12-float layout of
/// [`crate::mesh::Vertex`]; indices are 16-bit.
pub trait Driver {
    fn new_image(&mut self, width: u32, height: u32) -> SpryteResult<DriverImageId>;
    fn new_screen_image(&mut self, width: u32, height: u32) -> SpryteResult<DriverImageId>;
    fn dispose_image(&mut self, id: DriverImageId);

    fn replace_pixels(
        &mut self,
        id: DriverImageId,
        pixels: &[u8],
        region: Region,
    ) -> SpryteResult<()>;

    /// Full image read-back.
    fn pixels(&mut self, id: DriverImageId) -> SpryteResult<Vec<u8>>;

    #[allow(clippy::too_many_arguments)]
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
    ) -> SpryteResult<()>;

    /// Called once at every frame start.
    fn reset_for_frame(&mut self);

    fn has_high_precision_float(&self) -> bool;
    fn max_image_size(&self) -> u32;
    fn framebuffer_y_direction(&self) -> YDirection;

    /// Whether this back-end can lose its context. When false the restorable
    /// layer skips history bookkeeping entirely.
    fn needs_restoring(&self) -> bool;

    /// Context-loss probe for a specific image.
    fn is_invalidated(&self, id: DriverImageId) -> bool;
}
