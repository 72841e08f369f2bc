//! End-to-end sessions over a real project directory.

use refscope_cli::session::{Session, SessionOptions};
use refscope_core::FileId;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    project: TempDir,
    _index: TempDir,
    options: SessionOptions,
}

impl Fixture {
    fn new(files: &[(&str, &str)]) -> Self {
        let project = TempDir::new().unwrap();
        let index = TempDir::new().unwrap();
        for (name, content) in files {
            let path = project.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        let config = index.path().join("refscope.json");
        let settings = serde_json::json!({
            "index_dir": index.path().join("graph"),
            "batch_size": 3,
            "worker_threads": 2,
        });
        fs::write(&config, settings.to_string()).unwrap();

        Self {
            project,
            _index: index,
            options: SessionOptions {
                config: Some(config),
                supertypes: false,
            },
        }
    }

    fn root(&self) -> &Path {
        self.project.path()
    }

    fn open(&self) -> Session {
        let session = Session::open(self.root(), &self.options).unwrap();
        session.engine.process_pending().unwrap();
        assert!(session.engine.is_up_to_date());
        session
    }
}

fn referrers(session: &Session, file: &str) -> Option<Vec<PathBuf>> {
    let id = session.files.id_of(Path::new(file)).unwrap();
    let mut paths: Vec<PathBuf> = session
        .engine
        .backward_ids_of(id)?
        .into_iter()
        .filter_map(|id: FileId| session.files.path_of(id))
        .collect();
    paths.sort();
    Some(paths)
}

fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

/// A fresh project is fully indexed by the first session.
#[test]
fn test_first_session_indexes_everything() {
    let fixture = Fixture::new(&[
        ("src/Service.java", "class Service { Repo repo; }"),
        ("src/Repo.java", "class Repo { Model m; }"),
        ("src/Model.java", "class Model {}"),
        ("src/Controller.java", "class Controller { Service s; Model m; }"),
    ]);
    let session = fixture.open();

    assert_eq!(
        referrers(&session, "src/Model.java"),
        Some(paths(&["src/Controller.java", "src/Repo.java"]))
    );
    assert_eq!(
        referrers(&session, "src/Service.java"),
        Some(paths(&["src/Controller.java"]))
    );
    assert_eq!(referrers(&session, "src/Controller.java"), Some(vec![]));
    session.close().unwrap();
}

/// Edits made while no session was open are picked up on the next one.
#[test]
fn test_offline_edits_are_reindexed() {
    let fixture = Fixture::new(&[
        ("A.java", "class A { B b; }"),
        ("B.java", "class B {}"),
        ("C.java", "class C {}"),
    ]);
    fixture.open().close().unwrap();

    fs::write(fixture.root().join("A.java"), "class A { C c; }").unwrap();

    let session = fixture.open();
    assert!(session.engine.recovery().checkpoint_loaded);
    assert_eq!(referrers(&session, "B.java"), Some(vec![]));
    assert_eq!(referrers(&session, "C.java"), Some(paths(&["A.java"])));
    session.close().unwrap();
}

/// Deleted files disappear from every answer, and new files are resolved.
#[test]
fn test_deleted_and_added_files() {
    let fixture = Fixture::new(&[
        ("A.java", "class A { Shared s; }"),
        ("B.java", "class B { Shared s; }"),
        ("Shared.java", "class Shared {}"),
    ]);
    fixture.open().close().unwrap();

    fs::remove_file(fixture.root().join("B.java")).unwrap();
    fs::write(fixture.root().join("D.java"), "class D { Shared s; }").unwrap();

    let session = fixture.open();
    assert_eq!(
        referrers(&session, "Shared.java"),
        Some(paths(&["A.java", "D.java"]))
    );
    assert!(session.files.id_of(Path::new("B.java")).is_none());
    session.close().unwrap();
}

/// Declared supertypes count as references when enabled.
#[test]
fn test_supertype_option_adds_ancestors() {
    let mut fixture = Fixture::new(&[
        ("App.java", "class App { Child c; }"),
        ("Child.java", "class Child extends Parent {}"),
        ("Parent.java", "class Parent extends Base {}"),
        ("Base.java", "class Base {}"),
    ]);
    fixture.options.supertypes = true;
    let session = fixture.open();

    let base = referrers(&session, "Base.java").unwrap();
    assert!(base.contains(&PathBuf::from("App.java")));
    assert!(base.contains(&PathBuf::from("Child.java")));
    assert!(base.contains(&PathBuf::from("Parent.java")));
    session.close().unwrap();
}
