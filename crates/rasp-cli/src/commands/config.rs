use std::path::PathBuf;

use anyhow::Result;

use super::load_config;

pub fn print_effective(config_path: Option<PathBuf>) -> Result<()> {
    let loaded = load_config(config_path)?;
    let output = loaded.config.to_toml_string()?;
    println!("{}", output);
    Ok(())
}
