use refscope_core::config::{get_base_index_dir, index_dir_for};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

fn remove_dir(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub fn run(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Clearing index for project at: {}...", path.display());
        remove_dir(&index_dir_for(&path))?;
        info!("Project index cleared.");
    } else {
        let base = get_base_index_dir();
        info!("Clearing all indices at: {}...", base.display());
        remove_dir(&base)?;
        info!("All indices cleared.");
    }
    Ok(())
}
