use std::path::PathBuf;
use tabled::{Table, Tabled, settings::Style};

use crate::session::{Session, SessionOptions};

#[derive(Tabled)]
struct StatView {
    name: &'static str,
    value: String,
}

/// Prints engine counters without indexing anything.
pub fn run(path: PathBuf, json: bool, options: SessionOptions) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(&path, &options)?;
    let stats = session.engine.stats()?;
    let recovery = session.engine.recovery().clone();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        let rows = vec![
            StatView { name: "index dir", value: stats.index_dir.display().to_string() },
            StatView { name: "files", value: session.files.len().to_string() },
            StatView { name: "queued", value: stats.queued.to_string() },
            StatView { name: "resolved", value: stats.resolved.to_string() },
            StatView { name: "targets", value: stats.targets.to_string() },
            StatView { name: "data bytes", value: stats.data_bytes.to_string() },
            StatView { name: "gap bytes", value: stats.gap_bytes.to_string() },
            StatView { name: "up to date", value: stats.up_to_date.to_string() },
            StatView { name: "checkpoint loaded", value: recovery.checkpoint_loaded.to_string() },
            StatView { name: "rebuilt", value: recovery.discarded.to_string() },
        ];
        println!("{}", Table::new(&rows).with(Style::psql()));
    }

    session.close()
}
