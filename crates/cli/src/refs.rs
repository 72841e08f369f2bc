use std::path::PathBuf;
use tabled::{Table, Tabled, settings::Style};

use crate::session::{Session, SessionOptions};

#[derive(Tabled)]
struct ReferrerView {
    id: u32,
    path: String,
}

/// Lists the files that refer to `file`.
pub fn run(
    path: PathBuf,
    file: PathBuf,
    options: SessionOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(&path, &options)?;
    session.engine.process_pending()?;

    let Some(target) = session.files.id_of(&file) else {
        session.close()?;
        return Err(format!("{} is not a tracked file", file.display()).into());
    };

    match session.engine.backward_ids_of(target) {
        Some(ids) if ids.is_empty() => println!("No files refer to {}", file.display()),
        Some(ids) => {
            let mut views: Vec<ReferrerView> = ids
                .into_iter()
                .filter_map(|id| {
                    let path = session.files.path_of(id)?;
                    Some(ReferrerView {
                        id: id.as_u32(),
                        path: path.display().to_string(),
                    })
                })
                .collect();
            views.sort_by(|a, b| a.path.cmp(&b.path));
            println!("{}", Table::new(&views).with(Style::psql()));
        }
        None => println!(
            "Index is stale for {}; every file is a candidate",
            file.display()
        ),
    }

    session.close()
}
