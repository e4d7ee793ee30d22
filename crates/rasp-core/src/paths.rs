use std::path::PathBuf;

use crate::config::ConfigPaths;

/// Expands `${HOME}`, `${DATA_DIR}` and `${CONFIG_DIR}` in a configured path.
pub fn expand_path_template(template: &str, paths: &ConfigPaths) -> PathBuf {
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    let replaced = template
        .replace("${HOME}", &home_dir)
        .replace("${DATA_DIR}", &paths.data_dir.to_string_lossy())
        .replace("${CONFIG_DIR}", &paths.config_dir().to_string_lossy());
    PathBuf::from(replaced)
}
