use crate::{Result, config::Config, meta::LayerTms};

use super::utils;
use tracing::debug;

pub(crate) async fn run(
    config: Config,
    layer: String,
    tms: String,
    peer: Option<String>,
    tracker: Option<String>,
) -> Result<()> {
    let store = utils::open_store(&config)?;
    let source = utils::source(&config, store, peer, tracker)?;
    let layer_tms = LayerTms::new(layer, tms);

    debug!("Downloading {layer_tms} from {}", source.name());
    let report = source
        .download(&layer_tms, |done, total| {
            debug!("Downloaded tile {done}/{total}");
        })
        .await?;

    println!(
        "Downloaded {}/{} tiles of {layer_tms} from {} peer(s), {} failed",
        report.tiles_done, report.tiles_total, report.candidates, report.failed
    );

    Ok(())
}
