use std::path::PathBuf;
use tracing::info;

use crate::session::{Session, SessionOptions};

pub fn run(path: PathBuf, options: SessionOptions) -> Result<(), Box<dyn std::error::Error>> {
    info!("Indexing project at: {}...", path.display());
    let session = Session::open(&path, &options)?;

    let reports = session.engine.process_pending()?;
    let committed: usize = reports.iter().map(|r| r.committed.len()).sum();
    let dropped: usize = reports.iter().map(|r| r.dropped).sum();
    let edges_added: usize = reports.iter().map(|r| r.commit.edges_added).sum();
    let edges_removed: usize = reports.iter().map(|r| r.commit.edges_removed).sum();

    let stats = session.engine.stats()?;
    info!("Indexing complete!");
    println!(
        "Indexed {committed} file(s) in {} batch(es): +{edges_added} -{edges_removed} edge(s), {dropped} dropped",
        reports.len()
    );
    println!(
        "{} file(s) tracked, {} target(s) stored, {}",
        session.files.len(),
        stats.targets,
        if stats.up_to_date { "up to date" } else { "work remaining" }
    );

    session.close()
}
