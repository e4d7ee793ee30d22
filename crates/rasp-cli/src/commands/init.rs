use std::path::PathBuf;

use anyhow::Result;

use rasp_core::config::{Config, ConfigPaths};
use rasp_core::paths::expand_path_template;

use super::{write_file, DEFAULT_POLICY};

pub fn execute(path: Option<PathBuf>, force: bool) -> Result<()> {
    let paths = match path {
        Some(path) => ConfigPaths::for_config_file(&path)?,
        None => ConfigPaths::resolve()?,
    };
    if paths.config_path.exists() && !force {
        return Err(anyhow::anyhow!(
            "Config already exists at {} (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    let config = Config::default_config();
    config.save(&paths.config_path)?;
    println!("Config written to {}", paths.config_path.display());

    let policy_path = expand_path_template(&config.policy.path, &paths);
    if policy_path.exists() && !force {
        println!("Keeping existing policy at {}", policy_path.display());
    } else {
        write_file(&policy_path, DEFAULT_POLICY)?;
        println!("Policy written to {}", policy_path.display());
    }
    Ok(())
}
