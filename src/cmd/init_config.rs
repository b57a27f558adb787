use crate::{Result, config::Config};
use std::path::Path;

pub(crate) fn run(path: Option<&Path>) -> Result<()> {
    let path = Config::write_default_if_missing(path)?;
    println!("Config: {}", path.display());
    Ok(())
}
