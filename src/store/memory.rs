use crate::{
    Result, TileMeshError,
    meta::{LayerMeta, LayerTms, TileMeta, TmsMeta},
};

use super::TileStore;

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Inner {
    tiles: HashMap<TileMeta, Vec<u8>>,
    layers: HashMap<String, LayerMeta>,
    tms: HashMap<String, TmsMeta>,
}

/// Tile store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tiles<I>(tiles: I) -> Self
    where
        I: IntoIterator<Item = (TileMeta, Vec<u8>)>,
    {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.write() {
            inner.tiles.extend(tiles);
        }
        store
    }

    pub fn tile(&self, meta: &TileMeta) -> Option<Vec<u8>> {
        self.read().ok()?.tiles.get(meta).cloned()
    }

    pub fn tile_count(&self) -> usize {
        self.read().map(|inner| inner.tiles.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| TileMeshError::Store("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| TileMeshError::Store("memory store lock poisoned".to_string()))
    }
}

impl TileStore for MemoryStore {
    fn tile_size(&self, meta: &TileMeta) -> Result<Option<u64>> {
        Ok(self.read()?.tiles.get(meta).map(|t| t.len() as u64))
    }

    fn read_tile_range(&self, meta: &TileMeta, offset: u64, limit: u64) -> Result<Vec<u8>> {
        let inner = self.read()?;
        let tile = inner
            .tiles
            .get(meta)
            .ok_or_else(|| TileMeshError::Store(format!("No such tile: {meta}")))?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(tile.len());
        let end = start
            .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
            .min(tile.len());
        Ok(tile[start..end].to_vec())
    }

    fn write_tile(&self, meta: &TileMeta, bytes: &[u8]) -> Result<()> {
        self.write()?.tiles.insert(meta.clone(), bytes.to_vec());
        Ok(())
    }

    fn list_layer_tms(&self) -> Result<Vec<LayerTms>> {
        let set: BTreeSet<LayerTms> = self.read()?.tiles.keys().map(TileMeta::layer_tms).collect();
        Ok(set.into_iter().collect())
    }

    fn layer_meta(&self, id: &str) -> Result<Option<LayerMeta>> {
        Ok(self.read()?.layers.get(id).cloned())
    }

    fn save_layer_meta(&self, id: &str, meta: &LayerMeta) -> Result<()> {
        self.write()?
            .layers
            .entry(id.to_string())
            .or_insert_with(|| meta.clone());
        Ok(())
    }

    fn tms_meta(&self, id: &str) -> Result<Option<TmsMeta>> {
        Ok(self.read()?.tms.get(id).cloned())
    }

    fn save_tms_meta(&self, id: &str, meta: &TmsMeta) -> Result<()> {
        self.write()?
            .tms
            .entry(id.to_string())
            .or_insert_with(|| meta.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{layer_meta, tile, tile_bytes, tms_meta};

    #[test]
    fn test_read_range() {
        let meta = tile("base", "WebMercator", "2", 1, 1);
        let store = MemoryStore::with_tiles([(meta.clone(), tile_bytes(3000))]);

        assert_eq!(store.tile_size(&meta).unwrap(), Some(3000));
        assert_eq!(
            store.read_tile_range(&meta, 2048, 4096).unwrap(),
            tile_bytes(3000)[2048..].to_vec()
        );
        assert!(store.read_tile_range(&meta, 5000, 10).unwrap().is_empty());

        let missing = tile("base", "WebMercator", "2", 9, 9);
        assert_eq!(store.tile_size(&missing).unwrap(), None);
        assert!(!store.has_tile(&missing).unwrap());
    }

    #[test]
    fn test_first_meta_wins() {
        let store = MemoryStore::new();
        store.save_layer_meta("base", &layer_meta("base")).unwrap();

        let mut other = layer_meta("base");
        other.title = "Overwritten".to_string();
        store.save_layer_meta("base", &other).unwrap();

        assert_eq!(store.layer_meta("base").unwrap(), Some(layer_meta("base")));
    }

    #[test]
    fn test_capabilities_content() {
        let store = MemoryStore::with_tiles([
            (tile("base", "WebMercator", "0", 0, 0), tile_bytes(10)),
            (tile("base", "WorldCRS84Quad", "0", 0, 0), tile_bytes(10)),
        ]);
        store.save_layer_meta("base", &layer_meta("base")).unwrap();
        store
            .save_tms_meta("WebMercator", &tms_meta("WebMercator"))
            .unwrap();

        let content = store.capabilities_content().unwrap();
        assert!(content.starts_with("<Contents>\n"));
        assert!(content.contains("<TileMatrixSet>WebMercator</TileMatrixSet>"));
        assert!(content.contains("<TileMatrixSet>WorldCRS84Quad</TileMatrixSet>"));
        assert!(content.contains("<ows:SupportedCRS>urn:ogc:def:crs:EPSG::3857</ows:SupportedCRS>"));
        assert!(content.ends_with("</Contents>\n"));
    }
}
