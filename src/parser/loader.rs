//! Builds a module graph by following imports from an entry file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{SyntaxError, parse};
use crate::ast::{ModuleGraph, SourceFile};

const EXTENSION: &str = ".ts";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {error}")]
    Syntax {
        path: String,
        /// Kept so diagnostics can show the offending line.
        text: String,
        error: SyntaxError,
    },
}

/// Loads `path` and every module it imports, transitively.
pub fn load(path: &Path) -> Result<ModuleGraph, LoadError> {
    let root: PathBuf = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let entry = path.to_string_lossy().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io { path: entry.clone(), source })?;
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();

    load_with(&format!("/{}", stem), &entry, &text, |key| {
        let file = root.join(format!("{}{}", key.trim_start_matches('/'), EXTENSION));
        let display = file.to_string_lossy().to_string();
        std::fs::read_to_string(&file)
            .map(|text| (display.clone(), text))
            .map_err(|source| LoadError::Io { path: display, source })
    })
}

/// Loads a graph whose modules come from `read`, called with each resolved
/// module key. Returns the file name to report plus its text.
pub fn load_with<F>(entry_key: &str, entry_path: &str, entry_text: &str, mut read: F) -> Result<ModuleGraph, LoadError>
where
    F: FnMut(&str) -> Result<(String, String), LoadError>,
{
    let main = parse_file(entry_key, entry_path, entry_text)?;
    let mut modules: BTreeMap<String, SourceFile> = BTreeMap::new();
    let mut pending: Vec<String> = main.imports.iter().map(|i| i.path.clone()).collect();

    while let Some(key) = pending.pop() {
        if key == entry_key || modules.contains_key(&key) {
            continue;
        }
        let (path, text) = read(&key)?;
        let file = parse_file(&key, &path, &text)?;
        pending.extend(file.imports.iter().map(|i| i.path.clone()));
        tracing::debug!(module = %key, path = %path, "loaded module");
        modules.insert(key, file);
    }

    Ok(ModuleGraph { main, modules })
}

fn parse_file(key: &str, path: &str, text: &str) -> Result<SourceFile, LoadError> {
    let mut file = parse(text, path).map_err(|error| LoadError::Syntax {
        path: path.to_string(),
        text: text.to_string(),
        error,
    })?;
    for import in &mut file.imports {
        import.path = resolve(key, &import.path);
    }
    Ok(file)
}

/// Resolves an import relative to the importing module's key.
pub fn resolve(importer: &str, import: &str) -> String {
    let import = import.strip_suffix(EXTENSION).unwrap_or(import);
    let mut parts: Vec<&str> = Vec::new();
    if !import.starts_with('/') {
        parts.extend(importer.split('/').filter(|p| !p.is_empty()));
        parts.pop();
    }
    for segment in import.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_paths() {
        assert_eq!(resolve("/main", "./foo"), "/foo");
        assert_eq!(resolve("/lib/a", "./b.ts"), "/lib/b");
        assert_eq!(resolve("/lib/a", "../c"), "/c");
        assert_eq!(resolve("/lib/a", "/abs/d"), "/abs/d");
        assert_eq!(resolve("/main", "util/x"), "/util/x");
    }

    #[test]
    fn load_follows_imports_once() {
        let mut sources = BTreeMap::new();
        sources.insert("/a", "import * as b from \"./b\"\nexport let x = 1");
        sources.insert("/b", "import * as a from \"./a\"\nexport let y = 2");
        let mut reads = 0;
        let graph = load_with("/main", "main.ts", "import * as a from \"./a\"", |key| {
            reads += 1;
            let text = sources.get(key).ok_or_else(|| LoadError::Io {
                path: key.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?;
            Ok((format!("{}.ts", key), text.to_string()))
        })
        .unwrap();
        assert_eq!(reads, 2);
        assert_eq!(graph.modules.keys().collect::<Vec<_>>(), vec!["/a", "/b"]);
        assert_eq!(graph.main.imports[0].path, "/a");
        assert_eq!(graph.modules["/b"].imports[0].path, "/a");
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.ts"), "import * as m from \"./lib/m\"\nm.f()").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/m.ts"), "export function f() { }").unwrap();

        let graph = load(&dir.path().join("main.ts")).unwrap();
        assert!(graph.modules.contains_key("/lib/m"));
    }

    #[test]
    fn missing_module_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.ts"), "import \"./nope\"").unwrap();
        match load(&dir.path().join("main.ts")) {
            Err(LoadError::Io { path, .. }) => assert!(path.ends_with("nope.ts")),
            other => panic!("expected io error, got {:?}", other.map(|_| ())),
        }
    }
}
