use super::{TileFormat, xml::escape};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerStyle {
    pub identifier: String,
    pub is_default: bool,
}

impl Default for LayerStyle {
    fn default() -> Self {
        Self {
            identifier: "_null".to_string(),
            is_default: true,
        }
    }
}

/// Fixed description of a layer. Written once per layer, first writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerMeta {
    pub title: String,
    pub bounding_box: BoundingBox,
    pub identifier: String,
    pub styles: Vec<LayerStyle>,
    pub formats: Vec<TileFormat>,
}

impl LayerMeta {
    /// Capability document fragment for this layer, linked to the given
    /// tile matrix sets. The closing tag is always on its own line.
    pub fn to_capability_xml<'a, I>(&self, tile_matrix_sets: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let b = &self.bounding_box;
        let mut xml = String::new();
        xml.push_str("<Layer>\n");
        xml.push_str(&format!("    <ows:Title>{}</ows:Title>\n", escape(&self.title)));
        xml.push_str("    <ows:WGS84BoundingBox>\n");
        xml.push_str(&format!(
            "        <ows:LowerCorner>{} {}</ows:LowerCorner>\n",
            b.min_x, b.min_y
        ));
        xml.push_str(&format!(
            "        <ows:UpperCorner>{} {}</ows:UpperCorner>\n",
            b.max_x, b.max_y
        ));
        xml.push_str("    </ows:WGS84BoundingBox>\n");
        xml.push_str(&format!(
            "    <ows:Identifier>{}</ows:Identifier>\n",
            escape(&self.identifier)
        ));
        for style in &self.styles {
            xml.push_str(&format!("    <Style isDefault=\"{}\">\n", style.is_default));
            xml.push_str(&format!(
                "        <ows:Identifier>{}</ows:Identifier>\n",
                escape(&style.identifier)
            ));
            xml.push_str("    </Style>\n");
        }
        for format in &self.formats {
            xml.push_str(&format!("    <Format>{}</Format>\n", format.mime()));
        }
        for tms in tile_matrix_sets {
            xml.push_str("    <TileMatrixSetLink>\n");
            xml.push_str(&format!("    <TileMatrixSet>{}</TileMatrixSet>\n", escape(tms)));
            xml.push_str("    </TileMatrixSetLink>\n");
        }
        xml.push_str("</Layer>\n");
        xml
    }
}
