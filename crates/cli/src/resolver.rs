use regex::Regex;
use refscope_core::{FileId, FileIdSet, ResolveContext, ResolveError, Resolver, SupertypeIndex};
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, LazyLock};

use crate::project::ProjectFiles;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid identifier pattern"));

static SUPERTYPE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:extends|implements)\s+([A-Za-z_][A-Za-z0-9_.,\s]*)")
        .expect("valid supertype pattern")
});

/// Tokens checked between cancellation polls.
const CANCEL_CHECK_INTERVAL: usize = 512;

/// A file refers to every project file whose stem appears as an identifier
/// in its content.
pub struct MentionResolver {
    files: Arc<ProjectFiles>,
}

impl MentionResolver {
    pub fn new(files: Arc<ProjectFiles>) -> Self {
        Self { files }
    }
}

impl Resolver for MentionResolver {
    fn resolve(&self, file: FileId, ctx: &ResolveContext<'_>) -> Result<FileIdSet, ResolveError> {
        if self.files.is_scanning() {
            return Err(ResolveError::NotReady);
        }
        let path = self
            .files
            .absolute_path_of(file)
            .ok_or_else(|| ResolveError::Fatal(format!("{file} is not registered")))?;
        let content = fs::read_to_string(&path)
            .map_err(|e| ResolveError::Fatal(format!("{}: {e}", path.display())))?;

        let mut tokens = HashSet::new();
        for (i, token) in IDENTIFIER.find_iter(&content).enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check_cancelled()?;
            }
            tokens.insert(token.as_str());
        }

        let mut forward = FileIdSet::new();
        for token in tokens {
            forward.extend(self.files.ids_with_stem(token));
        }
        Ok(forward)
    }
}

/// Supertypes named in `extends`/`implements` clauses, matched to files by stem.
pub struct DeclaredSupertypes {
    files: Arc<ProjectFiles>,
    root_stem: Option<String>,
}

impl DeclaredSupertypes {
    pub fn new(files: Arc<ProjectFiles>, root_stem: Option<String>) -> Self {
        Self { files, root_stem }
    }
}

impl SupertypeIndex for DeclaredSupertypes {
    fn supertypes(&self, file: FileId) -> Vec<FileId> {
        let Some(content) = self
            .files
            .absolute_path_of(file)
            .and_then(|path| fs::read_to_string(path).ok())
        else {
            return Vec::new();
        };

        let mut parents = Vec::new();
        for clause in SUPERTYPE_CLAUSE.captures_iter(&content) {
            for name in clause[1].split(|c: char| c == ',' || c.is_whitespace()) {
                let simple = name.rsplit('.').next().unwrap_or(name);
                if !simple.is_empty() {
                    parents.extend(self.files.ids_with_stem(simple));
                }
            }
        }
        parents.sort();
        parents.dedup();
        parents
    }

    fn root(&self) -> Option<FileId> {
        let stem = self.root_stem.as_deref()?;
        self.files.ids_with_stem(stem).first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refscope_core::SupertypeClosure;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn project(files: &[(&str, &str)]) -> (TempDir, Arc<ProjectFiles>) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let registry = Arc::new(ProjectFiles::new(dir.path()));
        registry.scan();
        (dir, registry)
    }

    fn id_of(files: &ProjectFiles, name: &str) -> FileId {
        files.id_of(Path::new(name)).unwrap()
    }

    #[test]
    fn test_mentions_resolve_to_files_by_stem() {
        let (_dir, files) = project(&[
            ("Service.java", "class Service { Repo repo; Model m; }"),
            ("Repo.java", "class Repo {}"),
            ("Model.java", "class Model {}"),
            ("Unrelated.java", "class Unrelated {}"),
        ]);
        let resolver = MentionResolver::new(files.clone());
        let cancel = CancellationToken::new();

        let forward = resolver
            .resolve(id_of(&files, "Service.java"), &ResolveContext::new(&cancel))
            .unwrap();
        let expected: FileIdSet = ["Service.java", "Repo.java", "Model.java"]
            .iter()
            .map(|name| id_of(&files, name))
            .collect();
        assert_eq!(forward, expected);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let (dir, files) = project(&[("Gone.java", "class Gone {}")]);
        let gone = id_of(&files, "Gone.java");
        fs::remove_file(dir.path().join("Gone.java")).unwrap();

        let cancel = CancellationToken::new();
        let result = MentionResolver::new(files).resolve(gone, &ResolveContext::new(&cancel));
        assert!(matches!(result, Err(ResolveError::Fatal(_))));
    }

    #[test]
    fn test_cancelled_resolution_reports_cancelled() {
        let (_dir, files) = project(&[("A.java", "class A {}")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = MentionResolver::new(files.clone())
            .resolve(id_of(&files, "A.java"), &ResolveContext::new(&cancel));
        assert_eq!(result, Err(ResolveError::Cancelled));
    }

    #[test]
    fn test_closure_adds_declared_supertypes() {
        let (_dir, files) = project(&[
            ("App.java", "class App { Child c; }"),
            ("Child.java", "class Child extends Parent {}"),
            ("Parent.java", "class Parent extends Base implements Object {}"),
            ("Base.java", "class Base {}"),
            ("Object.java", "class Object {}"),
        ]);
        let closure = SupertypeClosure::new(
            MentionResolver::new(files.clone()),
            DeclaredSupertypes::new(files.clone(), Some("Object".to_string())),
        );
        let cancel = CancellationToken::new();

        let forward = closure
            .resolve(id_of(&files, "App.java"), &ResolveContext::new(&cancel))
            .unwrap();
        assert!(forward.contains(&id_of(&files, "Parent.java")));
        assert!(forward.contains(&id_of(&files, "Base.java")));
        assert!(!forward.contains(&id_of(&files, "Object.java")));
    }
}
