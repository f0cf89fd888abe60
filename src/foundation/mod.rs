pub mod arena;
pub mod blend;
pub mod color;
pub mod error;
pub mod geom;
