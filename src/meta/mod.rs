mod layer;
mod tile;
mod tms;
pub mod xml;

pub use layer::{BoundingBox, LayerMeta, LayerStyle};
pub use tile::{LayerTms, TileFormat, TileMeta};
pub use tms::{TileMatrixMeta, TmsMeta};
