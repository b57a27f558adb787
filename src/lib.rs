pub(crate) mod cli;
mod cmd;
pub mod config;
mod error;
pub mod meta;
pub mod net;
pub mod source;
pub mod store;
pub mod tracker;

pub use cli::{Cli, Command, FetchTileArgs};
pub use cmd::run;
pub use error::TileMeshError;

pub type Result<T> = std::result::Result<T, TileMeshError>;
