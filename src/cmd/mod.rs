pub(crate) mod download;
pub(crate) mod fetch_tile;
pub(crate) mod init_config;
pub(crate) mod layers;
pub(crate) mod ping;
pub(crate) mod serve;

mod utils;

use crate::{Cli, Command, Result, config::Config};

/// Runs one CLI command to completion.
pub async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.as_deref();
    let load = || Config::load(path);

    match cli.command {
        Command::Serve => serve::run(load()?).await,
        Command::Layers { peer, tracker } => layers::run(load()?, peer, tracker).await,
        Command::FetchTile(args) => fetch_tile::run(load()?, args).await,
        Command::Download {
            layer,
            tms,
            peer,
            tracker,
        } => download::run(load()?, layer, tms, peer, tracker).await,
        Command::Ping { peer } => ping::run(load()?, peer).await,
        Command::InitConfig => init_config::run(path),
    }
}
