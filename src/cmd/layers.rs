use crate::{Result, config::Config};

use super::utils;

pub(crate) async fn run(config: Config, peer: Option<String>, tracker: Option<String>) -> Result<()> {
    let store = utils::open_store(&config)?;
    let source = utils::source(&config, store, peer, tracker)?;

    for layer_tms in source.list_available().await? {
        println!("{layer_tms}");
    }

    Ok(())
}
