use super::{LayerTms, TileFormat, TileMeta, xml::escape};

use serde::{Deserialize, Serialize};

/// One zoom level of a tile matrix set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixMeta {
    pub identifier: String,
    pub scale_denominator: f64,
    pub top_left_corner: (f64, f64),
    pub tile_width: u32,
    pub tile_height: u32,
    pub matrix_width: u32,
    pub matrix_height: u32,
}

impl TileMatrixMeta {
    pub fn tile_count(&self) -> u64 {
        self.matrix_width as u64 * self.matrix_height as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TmsMeta {
    pub identifier: String,
    pub supported_crs: String,
    pub tile_matrices: Vec<TileMatrixMeta>,
}

impl TmsMeta {
    pub fn total_tiles(&self) -> u64 {
        self.tile_matrices.iter().map(TileMatrixMeta::tile_count).sum()
    }

    /// Every tile of this set for the given layer, matrix by matrix, row-major.
    pub fn tiles<'a>(
        &'a self,
        layer_tms: &'a LayerTms,
        format: TileFormat,
    ) -> impl Iterator<Item = TileMeta> + 'a {
        self.tile_matrices.iter().flat_map(move |matrix| {
            (0..matrix.matrix_height).flat_map(move |row| {
                (0..matrix.matrix_width).map(move |col| TileMeta {
                    layer: layer_tms.layer.clone(),
                    tile_matrix_set: layer_tms.tile_matrix_set.clone(),
                    tile_matrix: matrix.identifier.clone(),
                    tile_row: row,
                    tile_col: col,
                    format,
                })
            })
        })
    }

    pub fn to_capability_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<TileMatrixSet>\n");
        xml.push_str(&format!(
            "    <ows:Identifier>{}</ows:Identifier>\n",
            escape(&self.identifier)
        ));
        xml.push_str(&format!(
            "    <ows:SupportedCRS>{}</ows:SupportedCRS>\n",
            escape(&self.supported_crs)
        ));
        for m in &self.tile_matrices {
            xml.push_str("    <TileMatrix>\n");
            xml.push_str(&format!(
                "        <ows:Identifier>{}</ows:Identifier>\n",
                escape(&m.identifier)
            ));
            xml.push_str(&format!(
                "        <ScaleDenominator>{}</ScaleDenominator>\n",
                m.scale_denominator
            ));
            xml.push_str(&format!(
                "        <TopLeftCorner>{} {}</TopLeftCorner>\n",
                m.top_left_corner.0, m.top_left_corner.1
            ));
            xml.push_str(&format!("        <TileWidth>{}</TileWidth>\n", m.tile_width));
            xml.push_str(&format!("        <TileHeight>{}</TileHeight>\n", m.tile_height));
            xml.push_str(&format!(
                "        <MatrixWidth>{}</MatrixWidth>\n",
                m.matrix_width
            ));
            xml.push_str(&format!(
                "        <MatrixHeight>{}</MatrixHeight>\n",
                m.matrix_height
            ));
            xml.push_str("    </TileMatrix>\n");
        }
        xml.push_str("</TileMatrixSet>\n");
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(id: &str, width: u32, height: u32) -> TileMatrixMeta {
        TileMatrixMeta {
            identifier: id.to_string(),
            scale_denominator: 559082264.0287178,
            top_left_corner: (-20037508.3427892, 20037508.3427892),
            tile_width: 256,
            tile_height: 256,
            matrix_width: width,
            matrix_height: height,
        }
    }

    #[test]
    fn test_total_tiles() {
        let tms = TmsMeta {
            identifier: "WebMercator".to_string(),
            supported_crs: "urn:ogc:def:crs:EPSG::3857".to_string(),
            tile_matrices: vec![matrix("0", 1, 1), matrix("1", 2, 2), matrix("2", 4, 3)],
        };
        assert_eq!(tms.total_tiles(), 1 + 4 + 12);

        let layer_tms = LayerTms::new("base", "WebMercator");
        let tiles: Vec<TileMeta> = tms.tiles(&layer_tms, TileFormat::Png).collect();
        assert_eq!(tiles.len() as u64, tms.total_tiles());
        assert_eq!(tiles[0].tile_matrix, "0");

        let last = tiles.last().unwrap();
        assert_eq!(last.tile_matrix, "2");
        assert_eq!((last.tile_col, last.tile_row), (3, 2));
    }
}
