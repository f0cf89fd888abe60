//! Command queue: batches draw and upload operations and flushes them to the
//! graphics driver in submission order.
//!
//! Consecutive draws with an identical (dst, src, blend, filter, color-matrix,
//! address) tuple are merged into one driver invocation; everything else
//! executes in the order it was enqueued. Image disposal is also a queued
//! command so in-flight work referencing the image flushes first.

use crate::driver::{Address, Driver, DriverImageId, Filter, YDirection};
use crate::foundation::arena::{Arena, Handle};
use crate::foundation::blend::Blend;
use crate::foundation::color::ColorMatrix;
use crate::foundation::error::{SpryteError, SpryteResult};
use crate::foundation::geom::Region;
use crate::mesh::{MAX_INDICES_PER_GROUP, Vertex};

/// A GPU-resident image as the command layer sees it.
pub struct GpuImage {
    pub id: DriverImageId,
    pub width: u32,
    pub height: u32,
    pub screen: bool,
}

pub type GpuKey = Handle<GpuImage>;

/// Most vertices one merged draw may reference; indices are 16-bit.
const MAX_VERTICES_PER_GROUP: usize = 1 << 16;

enum Command {
    DrawTriangles {
        dst: DriverImageId,
        dst_size: (u32, u32),
        src: DriverImageId,
        vertices: Vec<Vertex>,
        indices: Vec<u16>,
        color_matrix: Option<ColorMatrix>,
        blend: Blend,
        filter: Filter,
        address: Address,
    },
    ReplacePixels {
        dst: DriverImageId,
        pixels: Vec<u8>,
        region: Region,
    },
    Dispose {
        id: DriverImageId,
    },
}

/// Owns the boxed driver, the GPU-image arena and the pending command queue.
pub struct Graphics {
    driver: Box<dyn Driver>,
    images: Arena<GpuImage>,
    queue: Vec<Command>,
    /// Vertices buffered across the whole queue; crossing the group budget
    /// triggers an early flush.
    buffered_vertices: usize,
}

impl Graphics {
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            driver,
            images: Arena::new(),
            queue: Vec::new(),
            buffered_vertices: 0,
        }
    }

    pub fn max_image_size(&self) -> u32 {
        self.driver.max_image_size()
    }

    pub fn has_high_precision_float(&self) -> bool {
        self.driver.has_high_precision_float()
    }

    pub fn needs_restoring(&self) -> bool {
        self.driver.needs_restoring()
    }

    pub fn new_image(&mut self, width: u32, height: u32) -> SpryteResult<GpuKey> {
        let id = self.driver.new_image(width, height)?;
        Ok(self.images.insert(GpuImage {
            id,
            width,
            height,
            screen: false,
        }))
    }

    pub fn new_screen_image(&mut self, width: u32, height: u32) -> SpryteResult<GpuKey> {
        let id = self.driver.new_screen_image(width, height)?;
        Ok(self.images.insert(GpuImage {
            id,
            width,
            height,
            screen: true,
        }))
    }

    fn image(&self, key: GpuKey) -> SpryteResult<&GpuImage> {
        self.images
            .get(key)
            .ok_or_else(|| SpryteError::stale_handle(format!("gpu image {key:?}")))
    }

    pub fn size(&self, key: GpuKey) -> SpryteResult<(u32, u32)> {
        let img = self.image(key)?;
        Ok((img.width, img.height))
    }

    pub fn is_screen(&self, key: GpuKey) -> SpryteResult<bool> {
        Ok(self.image(key)?.screen)
    }

    /// Enqueues a triangle draw, merging with the tail command when the
    /// parameter tuple matches and the 16-bit vertex/index budget allows.
    /// The queue flushes early once its buffered vertex total crosses that
    /// budget.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_triangles(
        &mut self,
        dst: GpuKey,
        src: GpuKey,
        mut vertices: Vec<Vertex>,
        indices: Vec<u16>,
        color_matrix: Option<ColorMatrix>,
        blend: Blend,
        filter: Filter,
        address: Address,
    ) -> SpryteResult<()> {
        if vertices.is_empty() || indices.is_empty() {
            return Ok(());
        }
        let dst_img = self.image(dst)?;
        let (dst_id, dst_size, dst_screen) =
            (dst_img.id, (dst_img.width, dst_img.height), dst_img.screen);
        let src_id = self.image(src)?.id;

        if dst_screen && self.driver.framebuffer_y_direction() == YDirection::Upward {
            for v in &mut vertices {
                v.dst[1] = dst_size.1 as f32 - v.dst[1];
            }
        }

        let added = vertices.len();
        if let Some(Command::DrawTriangles {
            dst: qdst,
            src: qsrc,
            vertices: qvs,
            indices: qis,
            color_matrix: qcm,
            blend: qblend,
            filter: qfilter,
            address: qaddress,
            ..
        }) = self.queue.last_mut()
            && *qdst == dst_id
            && *qsrc == src_id
            && *qcm == color_matrix
            && *qblend == blend
            && *qfilter == filter
            && *qaddress == address
            && qvs.len() + vertices.len() <= MAX_VERTICES_PER_GROUP
            && qis.len() + indices.len() <= MAX_INDICES_PER_GROUP
        {
            let base = qvs.len() as u16;
            qvs.append(&mut vertices);
            qis.extend(indices.iter().map(|&i| i + base));
        } else {
            self.queue.push(Command::DrawTriangles {
                dst: dst_id,
                dst_size,
                src: src_id,
                vertices,
                indices,
                color_matrix,
                blend,
                filter,
                address,
            });
        }

        self.buffered_vertices += added;
        if self.buffered_vertices >= MAX_VERTICES_PER_GROUP {
            tracing::trace!(
                vertices = self.buffered_vertices,
                "vertex budget reached, flushing"
            );
            self.flush()?;
        }
        Ok(())
    }

    pub fn replace_pixels(
        &mut self,
        dst: GpuKey,
        pixels: Vec<u8>,
        region: Region,
    ) -> SpryteResult<()> {
        let dst_id = self.image(dst)?.id;
        self.queue.push(Command::ReplacePixels {
            dst: dst_id,
            pixels,
            region,
        });
        Ok(())
    }

    /// Removes the arena entry immediately; the driver release is queued so
    /// pending commands that still reference the image execute first.
    pub fn dispose(&mut self, key: GpuKey) {
        if let Some(img) = self.images.remove(key) {
            self.queue.push(Command::Dispose { id: img.id });
        }
    }

    /// Drains the queue. A driver error aborts the flush: the remaining
    /// commands are discarded and the error is surfaced.
    #[tracing::instrument(skip(self), fields(commands = self.queue.len()))]
    pub fn flush(&mut self) -> SpryteResult<()> {
        let mut bound: Option<DriverImageId> = None;
        let commands = std::mem::take(&mut self.queue);
        self.buffered_vertices = 0;
        for command in commands {
            match command {
                Command::DrawTriangles {
                    dst,
                    dst_size,
                    src,
                    vertices,
                    indices,
                    color_matrix,
                    blend,
                    filter,
                    address,
                } => {
                    if bound != Some(dst) {
                        // Destination switch: back-ends rebind the framebuffer
                        // and viewport here.
                        tracing::trace!(dst = dst.0, "binding draw target");
                        bound = Some(dst);
                    }
                    self.driver.draw_triangles(
                        dst,
                        src,
                        bytemuck::cast_slice(&vertices),
                        &indices,
                        color_matrix.as_ref(),
                        blend,
                        filter,
                        address,
                        Region::sized(dst_size.0 as i32, dst_size.1 as i32),
                    )?;
                }
                Command::ReplacePixels {
                    dst,
                    pixels,
                    region,
                } => {
                    self.driver.replace_pixels(dst, &pixels, region)?;
                }
                Command::Dispose { id } => {
                    if bound == Some(id) {
                        bound = None;
                    }
                    self.driver.dispose_image(id);
                }
            }
        }
        Ok(())
    }

    /// Full read-back; implies a flush.
    pub fn pixels(&mut self, key: GpuKey) -> SpryteResult<Vec<u8>> {
        self.flush()?;
        let id = self.image(key)?.id;
        self.driver.pixels(id)
    }

    /// Context-loss probe; implies a flush so the queried image exists.
    pub fn is_invalidated(&mut self, key: GpuKey) -> SpryteResult<bool> {
        self.flush()?;
        let id = self.image(key)?.id;
        Ok(self.driver.is_invalidated(id))
    }

    pub fn reset_for_frame(&mut self) {
        self.driver.reset_for_frame();
    }

    #[cfg(test)]
    pub(crate) fn queued_commands(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::software::SoftwareDriver;
    use crate::foundation::color::ColorScale;
    use crate::foundation::geom::GeoM;
    use crate::mesh::{quad_indices, quad_vertices};

    fn graphics() -> (Graphics, crate::driver::software::SoftwareControl) {
        let driver = SoftwareDriver::new();
        let control = driver.control();
        (Graphics::new(Box::new(driver)), control)
    }

    fn quad() -> (Vec<Vertex>, Vec<u16>) {
        let vs = quad_vertices(0.0, 0.0, 4.0, 4.0, GeoM::IDENTITY, ColorScale::ONE);
        (vs.to_vec(), quad_indices().to_vec())
    }

    #[test]
    fn identical_draws_merge_into_one_command() {
        let (mut gfx, control) = graphics();
        let src = gfx.new_image(4, 4).unwrap();
        let dst = gfx.new_image(4, 4).unwrap();
        for _ in 0..1000 {
            let (vs, is) = quad();
            gfx.draw_triangles(
                dst,
                src,
                vs,
                is,
                None,
                Blend::SOURCE_OVER,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap();
        }
        assert_eq!(gfx.queued_commands(), 1);
        gfx.flush().unwrap();
        assert_eq!(control.draw_triangles_count(), 1);
    }

    #[test]
    fn vertex_budget_flushes_without_an_explicit_flush() {
        let (mut gfx, control) = graphics();
        let src = gfx.new_image(4, 4).unwrap();
        let dst = gfx.new_image(4, 4).unwrap();
        for _ in 0..MAX_VERTICES_PER_GROUP / 4 {
            let (vs, is) = quad();
            gfx.draw_triangles(
                dst,
                src,
                vs,
                is,
                None,
                Blend::SOURCE_OVER,
                Filter::Nearest,
                Address::ClampToZero,
            )
            .unwrap();
        }
        assert_eq!(gfx.queued_commands(), 0);
        // The index budget split the batch once before the vertex total
        // crossed the flush bound.
        assert_eq!(control.draw_triangles_count(), 2);
    }

    #[test]
    fn differing_blend_breaks_the_batch() {
        let (mut gfx, _) = graphics();
        let src = gfx.new_image(4, 4).unwrap();
        let dst = gfx.new_image(4, 4).unwrap();
        let (vs, is) = quad();
        gfx.draw_triangles(
            dst,
            src,
            vs,
            is,
            None,
            Blend::SOURCE_OVER,
            Filter::Nearest,
            Address::ClampToZero,
        )
        .unwrap();
        let (vs, is) = quad();
        gfx.draw_triangles(
            dst,
            src,
            vs,
            is,
            None,
            Blend::LIGHTER,
            Filter::Nearest,
            Address::ClampToZero,
        )
        .unwrap();
        assert_eq!(gfx.queued_commands(), 2);
    }

    #[test]
    fn merged_indices_are_rebased() {
        let (mut gfx, _) = graphics();
        let src = gfx.new_image(2, 2).unwrap();
        let dst = gfx.new_image(4, 4).unwrap();
        let (vs, is) = quad();
        gfx.draw_triangles(
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
        let (vs, is) = quad();
        gfx.draw_triangles(
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
        match gfx.queue.last().unwrap() {
            Command::DrawTriangles {
                vertices, indices, ..
            } => {
                assert_eq!(vertices.len(), 8);
                assert_eq!(&indices[6..], &[4, 5, 6, 5, 6, 7]);
            }
            _ => panic!("expected a draw command"),
        }
    }

    #[test]
    fn flush_error_discards_remaining_commands() {
        let (mut gfx, control) = graphics();
        let src = gfx.new_image(4, 4).unwrap();
        let dst_a = gfx.new_image(4, 4).unwrap();
        let dst_b = gfx.new_image(4, 4).unwrap();
        let (vs, is) = quad();
        gfx.draw_triangles(
            dst_a,
            src,
            vs,
            is,
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::ClampToZero,
        )
        .unwrap();
        let (vs, is) = quad();
        gfx.draw_triangles(
            dst_b,
            src,
            vs,
            is,
            None,
            Blend::COPY,
            Filter::Nearest,
            Address::ClampToZero,
        )
        .unwrap();
        control.fail_next_draw();
        assert!(gfx.flush().is_err());
        assert_eq!(gfx.queued_commands(), 0);
    }

    #[test]
    fn dispose_is_ordered_after_pending_draws() {
        let (mut gfx, control) = graphics();
        let src = gfx.new_image(4, 4).unwrap();
        let dst = gfx.new_image(4, 4).unwrap();
        let (vs, is) = quad();
        gfx.draw_triangles(
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
        gfx.dispose(src);
        assert!(gfx.size(src).is_err());
        gfx.flush().unwrap();
        assert_eq!(control.draw_triangles_count(), 1);
    }
}
