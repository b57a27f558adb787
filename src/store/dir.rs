use crate::{
    Result, TileMeshError,
    meta::{LayerMeta, LayerTms, TileMeta, TmsMeta},
};

use super::TileStore;

use serde::{Serialize, de::DeserializeOwned};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const LAYERS_DIR: &str = "layers";
const TMS_DIR: &str = "tms";
const LAYER_INFO_FILE: &str = "info.json";

/// Tile store on the local file system:
///
/// ```text
/// <root>/layers/<layer>/info.json
/// <root>/layers/<layer>/<tms>/<matrix>/<col>/<row>.<ext>
/// <root>/tms/<tms>.json
/// ```
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(LAYERS_DIR))?;
        fs::create_dir_all(root.join(TMS_DIR))?;
        Ok(Self { root })
    }

    fn tile_path(&self, meta: &TileMeta) -> Result<PathBuf> {
        Ok(self
            .root
            .join(LAYERS_DIR)
            .join(component(&meta.layer)?)
            .join(component(&meta.tile_matrix_set)?)
            .join(component(&meta.tile_matrix)?)
            .join(meta.tile_col.to_string())
            .join(format!("{}.{}", meta.tile_row, meta.format.extension())))
    }

    fn layer_info_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(LAYERS_DIR)
            .join(component(id)?)
            .join(LAYER_INFO_FILE))
    }

    fn tms_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(TMS_DIR)
            .join(format!("{}.json", component(id)?)))
    }
}

/// Identifiers come from remote peers, so they must stay a single path
/// component.
fn component(id: &str) -> Result<&str> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0'])
    {
        return Err(TileMeshError::Store(format!("Invalid identifier: {id:?}")));
    }
    Ok(id)
}

fn sub_dirs(path: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Creates `path` only if nothing exists there yet. The content is written
/// aside and linked into place, so readers see either nothing or all of it.
fn write_json_once<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let partial = partial_path(path);
    fs::write(&partial, serde_json::to_vec_pretty(value)?)?;
    let linked = fs::hard_link(&partial, path);
    fs::remove_file(&partial)?;

    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A sibling of `path` no other writer uses.
fn partial_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);

    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}-{n}.part", std::process::id()));
    path.with_file_name(name)
}

impl TileStore for DirStore {
    fn tile_size(&self, meta: &TileMeta) -> Result<Option<u64>> {
        match fs::metadata(self.tile_path(meta)?) {
            Ok(m) if m.is_file() => Ok(Some(m.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_tile_range(&self, meta: &TileMeta, offset: u64, limit: u64) -> Result<Vec<u8>> {
        let mut file = File::open(self.tile_path(meta)?)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = Vec::new();
        file.take(limit).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_tile(&self, meta: &TileMeta, bytes: &[u8]) -> Result<()> {
        let path = self.tile_path(meta)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write aside, then rename over the final name.
        let partial = path.with_extension(format!("{}.part", meta.format.extension()));
        fs::write(&partial, bytes)?;
        fs::rename(&partial, &path)?;
        Ok(())
    }

    fn list_layer_tms(&self) -> Result<Vec<LayerTms>> {
        let layers_dir = self.root.join(LAYERS_DIR);
        let mut list = Vec::new();
        for layer in sub_dirs(&layers_dir)? {
            for tms in sub_dirs(&layers_dir.join(&layer))? {
                list.push(LayerTms::new(layer.clone(), tms));
            }
        }
        Ok(list)
    }

    fn layer_meta(&self, id: &str) -> Result<Option<LayerMeta>> {
        read_json(&self.layer_info_path(id)?)
    }

    fn save_layer_meta(&self, id: &str, meta: &LayerMeta) -> Result<()> {
        write_json_once(&self.layer_info_path(id)?, meta)
    }

    fn tms_meta(&self, id: &str) -> Result<Option<TmsMeta>> {
        read_json(&self.tms_path(id)?)
    }

    fn save_tms_meta(&self, id: &str, meta: &TmsMeta) -> Result<()> {
        write_json_once(&self.tms_path(id)?, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{layer_meta, tile, tile_bytes, tms_meta};

    #[test]
    fn test_tile_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let meta = tile("base", "WebMercator", "2", 1, 3);

        assert_eq!(store.tile_size(&meta).unwrap(), None);
        store.write_tile(&meta, &tile_bytes(3000)).unwrap();

        assert!(dir.path().join("layers/base/WebMercator/2/3/1.png").is_file());
        assert_eq!(store.tile_size(&meta).unwrap(), Some(3000));
        assert_eq!(
            store.read_tile_range(&meta, 1000, 500).unwrap(),
            tile_bytes(3000)[1000..1500].to_vec()
        );
        assert_eq!(
            store.list_layer_tms().unwrap(),
            vec![LayerTms::new("base", "WebMercator")]
        );
    }

    #[test]
    fn test_meta_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        store
            .save_tms_meta("WebMercator", &tms_meta("WebMercator"))
            .unwrap();
        let mut changed = tms_meta("WebMercator");
        changed.supported_crs = "EPSG:4326".to_string();
        store.save_tms_meta("WebMercator", &changed).unwrap();
        assert_eq!(
            store.tms_meta("WebMercator").unwrap(),
            Some(tms_meta("WebMercator"))
        );

        store.save_layer_meta("base", &layer_meta("base")).unwrap();
        assert_eq!(store.layer_meta("base").unwrap(), Some(layer_meta("base")));
        assert_eq!(store.layer_meta("relief").unwrap(), None);
    }

    #[test]
    fn test_meta_leaves_no_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        store.save_tms_meta("WebMercator", &tms_meta("WebMercator")).unwrap();
        store.save_tms_meta("WebMercator", &tms_meta("Other")).unwrap();
        store.save_layer_meta("base", &layer_meta("base")).unwrap();

        let tms_files: Vec<_> = fs::read_dir(dir.path().join(TMS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(tms_files, vec!["WebMercator.json"]);

        let layer_files: Vec<_> = fs::read_dir(dir.path().join("layers/base"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(layer_files, vec![LAYER_INFO_FILE]);
    }

    #[test]
    fn test_concurrent_meta_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        std::thread::scope(|s| {
            for i in 0..8 {
                let store = &store;
                s.spawn(move || {
                    let mut meta = tms_meta("WebMercator");
                    meta.supported_crs = format!("EPSG:{i}");
                    store.save_tms_meta("WebMercator", &meta).unwrap();
                    // Whatever a reader sees is a whole descriptor.
                    assert!(store.tms_meta("WebMercator").unwrap().is_some());
                });
            }
        });

        assert_eq!(fs::read_dir(dir.path().join(TMS_DIR)).unwrap().count(), 1);
    }

    #[test]
    fn test_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let meta = tile("..", "WebMercator", "2", 1, 3);
        assert!(store.write_tile(&meta, b"x").is_err());
        assert!(store.tms_meta("../../etc/passwd").is_err());
    }
}
