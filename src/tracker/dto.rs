use crate::meta::{LayerTms, TileFormat, TileMeta};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Body of `POST /announce/peer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePeerInfo {
    pub peer_id: String,
    pub connected_peers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internet_download_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internet_upload_speed: Option<f64>,
}

/// A pending connection request returned by `GET /peers/check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReply {
    pub key: String,
    pub host: String,
    pub port: u16,
}

/// A candidate peer returned by `GET /peers/ask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskReply {
    pub key: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tiles: Vec<AskReplyTile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskReplyTile {
    pub tile_matrix: String,
    /// MIME type of the tiles.
    pub format: String,
    /// `[col, row]` pairs.
    pub tile_cols_and_rows: Vec<(u32, u32)>,
}

impl AskReply {
    /// Every tile this candidate offers for `layer_tms`. Parts with an
    /// unknown format are skipped.
    pub fn tile_metas(&self, layer_tms: &LayerTms) -> Vec<TileMeta> {
        let mut metas = Vec::new();
        for part in &self.tiles {
            let Some(format) = TileFormat::from_mime(&part.format) else {
                warn!(key = %self.key, "Skipping tiles with unknown format {}", part.format);
                continue;
            };

            metas.extend(part.tile_cols_and_rows.iter().map(|&(col, row)| TileMeta {
                layer: layer_tms.layer.clone(),
                tile_matrix_set: layer_tms.tile_matrix_set.clone(),
                tile_matrix: part.tile_matrix.clone(),
                tile_row: row,
                tile_col: col,
                format,
            }));
        }
        metas
    }
}
