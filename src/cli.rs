use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tilemesh", version, about = "Peer-to-peer map tile exchange")]
pub struct Cli {
    /// Config file. Defaults to $TILEMESH_CONFIG or the XDG config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG.
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Answer peers and run the tracker loops until Ctrl-C.
    Serve,
    /// List the layers a peer or tracker offers.
    Layers {
        #[arg(long, conflicts_with = "tracker")]
        peer: Option<String>,
        #[arg(long)]
        tracker: Option<String>,
    },
    /// Fetch a single tile from a peer.
    FetchTile(FetchTileArgs),
    /// Download every tile of a layer into the local store.
    Download {
        #[arg(long)]
        layer: String,
        #[arg(long)]
        tms: String,
        #[arg(long, conflicts_with = "tracker")]
        peer: Option<String>,
        #[arg(long)]
        tracker: Option<String>,
    },
    /// Check that a peer answers.
    Ping {
        #[arg(long)]
        peer: String,
    },
    /// Write a default config file if none exists.
    InitConfig,
}

#[derive(Args)]
pub struct FetchTileArgs {
    #[arg(long)]
    pub peer: String,
    #[arg(long)]
    pub layer: String,
    #[arg(long)]
    pub tms: String,
    #[arg(long)]
    pub matrix: String,
    #[arg(long)]
    pub row: u32,
    #[arg(long)]
    pub col: u32,
    #[arg(long, default_value = "png")]
    pub format: String,
    /// Write the tile here instead of into the local store.
    #[arg(long)]
    pub out: Option<PathBuf>,
    /// Pull over a stream connection instead of datagrams.
    #[arg(long)]
    pub stream: bool,
    #[arg(long, default_value_t = 4096)]
    pub chunk_size: u32,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serve => "serve",
            Self::Layers { .. } => "layers",
            Self::FetchTile(_) => "fetch-tile",
            Self::Download { .. } => "download",
            Self::Ping { .. } => "ping",
            Self::InitConfig => "init-config",
        }
    }
}
