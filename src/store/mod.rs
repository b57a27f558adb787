//! The tile store contract the transfer engine reads from and writes to.
//!
//! Implementations must tolerate concurrent calls from many transfer tasks,
//! as long as concurrent writes target different tiles. Layer and tile
//! matrix set descriptors are append-only: the first save for an identifier
//! wins and later saves are ignored.

mod dir;
mod memory;

pub use dir::DirStore;
pub use memory::MemoryStore;

use crate::{
    Result,
    meta::{LayerMeta, LayerTms, TileMeta, TmsMeta},
};

use std::collections::BTreeMap;
use std::sync::Arc;

pub trait TileStore: Send + Sync {
    /// Size of the stored tile in bytes, `None` if the tile is not held.
    fn tile_size(&self, meta: &TileMeta) -> Result<Option<u64>>;

    /// Up to `limit` bytes starting at `offset`. Reading past the end yields
    /// a short or empty buffer.
    fn read_tile_range(&self, meta: &TileMeta, offset: u64, limit: u64) -> Result<Vec<u8>>;

    /// Stores a whole tile. Readers never observe a partially written tile.
    fn write_tile(&self, meta: &TileMeta, bytes: &[u8]) -> Result<()>;

    fn list_layer_tms(&self) -> Result<Vec<LayerTms>>;

    fn layer_meta(&self, id: &str) -> Result<Option<LayerMeta>>;

    fn save_layer_meta(&self, id: &str, meta: &LayerMeta) -> Result<()>;

    fn tms_meta(&self, id: &str) -> Result<Option<TmsMeta>>;

    fn save_tms_meta(&self, id: &str, meta: &TmsMeta) -> Result<()>;

    fn has_tile(&self, meta: &TileMeta) -> Result<bool> {
        Ok(self.tile_size(meta)?.is_some_and(|size| size > 0))
    }

    /// One capability fragment per described layer, with links to every
    /// tile matrix set held for it.
    fn layer_documents(&self) -> Result<Vec<String>> {
        let mut links: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for LayerTms {
            layer,
            tile_matrix_set,
        } in self.list_layer_tms()?
        {
            links.entry(layer).or_default().push(tile_matrix_set);
        }

        let mut docs = Vec::with_capacity(links.len());
        for (layer, sets) in links {
            if let Some(meta) = self.layer_meta(&layer)? {
                docs.push(meta.to_capability_xml(sets.iter().map(String::as_str)));
            }
        }
        Ok(docs)
    }

    /// One capability fragment per described tile matrix set in use.
    fn tms_documents(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .list_layer_tms()?
            .into_iter()
            .map(|l| l.tile_matrix_set)
            .collect();
        ids.sort();
        ids.dedup();

        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(meta) = self.tms_meta(&id)? {
                docs.push(meta.to_capability_xml());
            }
        }
        Ok(docs)
    }

    /// The `<Contents>` section of a capability document for everything held.
    fn capabilities_content(&self) -> Result<String> {
        let mut contents = String::from("<Contents>\n");
        for doc in self.layer_documents()? {
            contents.push_str(&doc);
        }
        for doc in self.tms_documents()? {
            contents.push_str(&doc);
        }
        contents.push_str("</Contents>\n");
        Ok(contents)
    }
}

/// Runs `f` against the store on the blocking pool, off the async workers.
pub async fn blocking<T, F>(store: &Arc<dyn TileStore>, f: F) -> Result<T>
where
    F: FnOnce(&dyn TileStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::meta::{
        BoundingBox, LayerMeta, LayerStyle, TileFormat, TileMatrixMeta, TileMeta, TmsMeta,
    };

    pub fn tile(layer: &str, tms: &str, matrix: &str, row: u32, col: u32) -> TileMeta {
        TileMeta {
            layer: layer.to_string(),
            tile_matrix_set: tms.to_string(),
            tile_matrix: matrix.to_string(),
            tile_row: row,
            tile_col: col,
            format: TileFormat::Png,
        }
    }

    /// Deterministic tile content of the given size.
    pub fn tile_bytes(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 31 % 251) as u8).collect()
    }

    pub fn layer_meta(id: &str) -> LayerMeta {
        LayerMeta {
            title: format!("{id} layer"),
            bounding_box: BoundingBox {
                min_x: -180.0,
                min_y: -85.0511,
                max_x: 180.0,
                max_y: 85.0511,
            },
            identifier: id.to_string(),
            styles: vec![LayerStyle::default()],
            formats: vec![TileFormat::Png],
        }
    }

    pub fn tms_meta(id: &str) -> TmsMeta {
        TmsMeta {
            identifier: id.to_string(),
            supported_crs: "urn:ogc:def:crs:EPSG::3857".to_string(),
            tile_matrices: vec![
                TileMatrixMeta {
                    identifier: "0".to_string(),
                    scale_denominator: 559082264.0287178,
                    top_left_corner: (-20037508.3427892, 20037508.3427892),
                    tile_width: 256,
                    tile_height: 256,
                    matrix_width: 1,
                    matrix_height: 1,
                },
                TileMatrixMeta {
                    identifier: "1".to_string(),
                    scale_denominator: 279541132.0143589,
                    top_left_corner: (-20037508.3427892, 20037508.3427892),
                    tile_width: 256,
                    tile_height: 256,
                    matrix_width: 2,
                    matrix_height: 2,
                },
            ],
        }
    }
}
