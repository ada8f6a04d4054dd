//! Template sources for the file loaders.
//!
//! [`Template::parse_fs`](crate::Template::parse_fs) reads templates
//! through the [`TemplateFs`] trait, so the same namespace can be loaded
//! from a directory on disk ([`DirFs`]) or from sources compiled into the
//! binary ([`MemFs`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::error::Error;

/// A read-only tree of template files.
pub trait TemplateFs {
    /// Paths matching `pattern`, in lexical order.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, Error>;

    fn read_to_string(&self, path: &Path) -> Result<String, Error>;
}

/// Files under a directory on disk. Patterns and paths are relative to
/// the root.
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TemplateFs for DirFs {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, Error> {
        let full = self.root.join(pattern);
        let full = full.to_string_lossy();
        let bad_pattern = |source| Error::Glob {
            pattern: pattern.to_string(),
            source,
        };

        let mut paths = Vec::new();
        for entry in glob::glob(&full).map_err(bad_pattern)? {
            // Unreadable directory entries are skipped, as a shell glob does.
            let Ok(path) = entry else { continue };
            if !path.is_file() {
                continue;
            }
            let relative = path.strip_prefix(&self.root).map(Path::to_path_buf).unwrap_or(path);
            paths.push(relative);
        }
        paths.sort();
        Ok(paths)
    }

    fn read_to_string(&self, path: &Path) -> Result<String, Error> {
        let full = self.root.join(path);
        std::fs::read_to_string(&full).map_err(|source| Error::Io { path: full, source })
    }
}

/// In-memory files keyed by `/`-separated path.
///
/// ```rust
/// use pgtmpl::{MemFs, Query, Template};
///
/// let fs = MemFs::new()
///     .with("sql/author.tmpl", "SELECT * FROM author WHERE id = {{bind .}}");
/// let tpl = Template::new("author.tmpl").parse_fs(&fs, &["sql/*.tmpl"])?;
///
/// let mut q = Query::new();
/// tpl.execute(&mut q, &1)?;
/// assert_eq!(q.as_str(), "SELECT * FROM author WHERE id = $1");
/// # Ok::<(), pgtmpl::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    files: BTreeMap<PathBuf, String>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, source: impl Into<String>) -> &mut Self {
        self.files.insert(path.into(), source.into());
        self
    }

    pub fn with(mut self, path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        self.insert(path, source);
        self
    }
}

impl TemplateFs for MemFs {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, Error> {
        let compiled = Pattern::new(pattern).map_err(|source| Error::Glob {
            pattern: pattern.to_string(),
            source,
        })?;
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        Ok(self
            .files
            .keys()
            .filter(|path| compiled.matches_path_with(path, options))
            .cloned()
            .collect())
    }

    fn read_to_string(&self, path: &Path) -> Result<String, Error> {
        self.files.get(path).cloned().ok_or_else(|| Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
        })
    }
}

/// Name a template loaded from `path` by its final component.
pub(crate) fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
