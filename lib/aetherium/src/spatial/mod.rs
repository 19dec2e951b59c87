pub mod grid;

pub use grid::{CellKey, SpatialGrid};
