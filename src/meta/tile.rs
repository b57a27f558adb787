use serde::{Deserialize, Serialize};
use std::fmt;

/// A layer together with one of the tile matrix sets it is tiled with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerTms {
    pub layer: String,
    pub tile_matrix_set: String,
}

impl LayerTms {
    pub fn new(layer: impl Into<String>, tile_matrix_set: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            tile_matrix_set: tile_matrix_set.into(),
        }
    }
}

impl fmt::Display for LayerTms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.layer, self.tile_matrix_set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileFormat {
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    Jpeg,
}

impl TileFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/png" => Some(Self::Png),
            "image/jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

/// Address of a single tile. Used both on the wire and as the store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMeta {
    pub layer: String,
    pub tile_matrix_set: String,
    pub tile_matrix: String,
    pub tile_row: u32,
    pub tile_col: u32,
    pub format: TileFormat,
}

impl TileMeta {
    pub fn layer_tms(&self) -> LayerTms {
        LayerTms::new(self.layer.clone(), self.tile_matrix_set.clone())
    }
}

impl fmt::Display for TileMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}.{}",
            self.layer,
            self.tile_matrix_set,
            self.tile_matrix,
            self.tile_col,
            self.tile_row,
            self.format.extension()
        )
    }
}
