use crate::meta::{LayerTms, xml::unescape};

use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<ows:Identifier>(.*?)</ows:Identifier>").expect("valid identifier pattern")
});
static TILE_MATRIX_SET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<TileMatrixSet>(.*?)</TileMatrixSet>").expect("valid tile matrix set pattern")
});

/// Extracts `(layer, tile matrix set)` pairs from a capability document.
///
/// The document is scanned line by line. Inside a `<Layer>` block the first
/// `<ows:Identifier>` names the layer and every `<TileMatrixSet>` adds a pair.
pub fn parse_capabilities(document: &str) -> Vec<LayerTms> {
    let mut pairs = Vec::new();
    let mut in_layer = false;
    let mut layer: Option<String> = None;

    for line in document.lines().map(str::trim) {
        if line.starts_with("<Layer>") {
            in_layer = true;
            continue;
        }
        if line.starts_with("</Layer>") {
            in_layer = false;
            layer = None;
            continue;
        }
        if !in_layer {
            continue;
        }

        if layer.is_none() {
            if let Some(c) = IDENTIFIER.captures(line) {
                layer = Some(unescape(&c[1]));
                continue;
            }
        }

        if let (Some(layer), Some(c)) = (&layer, TILE_MATRIX_SET.captures(line)) {
            pairs.push(LayerTms::new(layer.clone(), unescape(&c[1])));
        }
    }

    pairs
}
