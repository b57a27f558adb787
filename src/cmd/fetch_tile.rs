use crate::{
    Result, TileMeshError,
    cli::FetchTileArgs,
    config::Config,
    meta::{TileFormat, TileMeta},
    net::{
        requester::{self, PeerClient},
        transport::PeerStream,
    },
    store,
};

use super::utils;

pub(crate) async fn run(config: Config, args: FetchTileArgs) -> Result<()> {
    let format = TileFormat::from_extension(&args.format)
        .or_else(|| TileFormat::from_mime(&args.format))
        .ok_or_else(|| TileMeshError::Config(format!("Unknown tile format {}", args.format)))?;

    let meta = TileMeta {
        layer: args.layer,
        tile_matrix_set: args.tms,
        tile_matrix: args.matrix,
        tile_row: args.row,
        tile_col: args.col,
        format,
    };

    let addr = utils::resolve_peer(&args.peer).await?;
    let tile = if args.stream {
        let mut stream = PeerStream::connect(addr).await?;
        requester::pull_tile(&mut stream, &meta).await?
    } else {
        let client = PeerClient::connect(addr)
            .await?
            .with_timeout(config.timing.request_timeout(), config.timing.request_attempts)
            .with_chunk_size(args.chunk_size);
        let tile = client.request_tile(&meta).await?;
        client.close().await?;
        tile
    };

    match args.out {
        Some(path) => {
            tokio::fs::write(&path, &tile).await?;
            println!("Tile {meta} ({} bytes) written to {}", tile.len(), path.display());
        }
        None => {
            let size = tile.len();
            let local = utils::open_store(&config)?;
            let saved = meta.clone();
            store::blocking(&local, move |store| store.write_tile(&saved, &tile)).await?;
            println!("Tile {meta} ({size} bytes) saved");
        }
    }

    Ok(())
}
