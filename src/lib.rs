//! Spryte is a layered 2D rendering pipeline for game frameworks.
//!
//! User draws on an [`Image`] travel down through mipmap selection, atlas
//! packing, restorable bookkeeping and a batching command queue before
//! reaching a [`driver::Driver`] back-end:
//!
//! - Create a [`Pipeline`] over a driver (the bundled
//!   [`driver::software::SoftwareDriver`] renders on the CPU)
//! - Create [`Image`]s and draw with [`Pipeline::draw_image`] /
//!   [`Pipeline::draw_triangles`]
//! - Drive frames with [`Runner::step`] or explicit
//!   [`Pipeline::begin_frame`] / [`Pipeline::end_frame`]
//!
//! The pipeline transparently recovers image contents after a GPU context
//! loss and re-packs idle images into shared atlas textures.
#![forbid(unsafe_code)]

pub mod atlas;
pub mod command;
pub mod driver;
mod foundation;
pub mod game;
pub mod image;
pub mod mesh;
pub mod mipmap;
pub mod pipeline;
pub mod restore;

pub use crate::foundation::arena::{Arena, Handle};
pub use crate::foundation::blend::{Blend, BlendFactor, BlendOperation};
pub use crate::foundation::color::{Color, ColorMatrix, ColorScale};
pub use crate::foundation::error::{SpryteError, SpryteResult};
pub use crate::foundation::geom::{GeoM, Region};

pub use crate::atlas::AtlasOpts;
pub use crate::driver::{Address, Driver, Filter};
pub use crate::game::{Game, Runner};
pub use crate::image::{DrawImageOptions, Image};
pub use crate::mesh::Vertex;
pub use crate::pipeline::{Pipeline, PipelineOpts};
