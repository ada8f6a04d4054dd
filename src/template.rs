//! Template namespaces and execution.
//!
//! A [`Template`] is a named entry in a namespace of parsed templates. Every
//! template created with [`Template::new_template`], or defined inside
//! source with `{{define}}`, belongs to the same namespace and shares one
//! function [`Registry`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::ast::template::Tree;
use crate::ast::value::to_value;
use crate::bind::{BIND, BindInterceptor, IdentityBind};
use crate::error::{Error, EvalError, EvalErrorKind};
use crate::eval::{ExecOptions, Executor};
use crate::fs::{DirFs, TemplateFs, base_name};
use crate::parser;
use crate::pool::QueryPool;
use crate::query::Query;
use crate::registry::{self, FuncMap, FuncRef, Registry};

/// State shared by every template of one namespace.
struct Common {
    trees: RwLock<HashMap<String, Arc<Tree>>>,
    registry: Registry,
    options: RwLock<ExecOptions>,
}

/// A named template within a namespace.
///
/// Cloning a `Template` clones the handle: both handles see the same
/// namespace. Use [`Template::try_clone`] for an independent copy.
///
/// ```rust
/// use pgtmpl::{Query, Template};
///
/// let tpl = Template::new("authors").parse(
///     "SELECT * FROM author WHERE id IN(\
///      {{range $i, $v := .}}{{if $i}},{{end}}{{bind $v}}{{end}})",
/// )?;
///
/// let mut q = Query::new();
/// tpl.execute(&mut q, &[100, 12, 334])?;
/// assert_eq!(q.as_str(), "SELECT * FROM author WHERE id IN($1,$2,$3)");
/// assert_eq!(q.args().len(), 3);
/// # Ok::<(), pgtmpl::Error>(())
/// ```
#[derive(Clone)]
pub struct Template {
    name: String,
    common: Arc<Common>,
}

impl Template {
    /// A new namespace with an empty template `name` and a registry holding
    /// the default `bind`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            common: Arc::new(Common {
                trees: RwLock::new(HashMap::new()),
                registry: Registry::new(),
                options: RwLock::new(ExecOptions::default()),
            }),
        }
    }

    /// A new, empty template in the same namespace.
    pub fn new_template(&self, name: impl Into<String>) -> Template {
        Template {
            name: name.into(),
            common: Arc::clone(&self.common),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.common.registry
    }

    // ── Functions and options ───────────────────────────────────────────

    /// Merge `funcs` into the namespace's registry.
    pub fn funcs(self, funcs: FuncMap) -> Self {
        self.add_funcs(funcs);
        self
    }

    /// Merge `funcs` into the registry shared by every template and clone
    /// of this namespace. Last write wins per name.
    pub fn add_funcs(&self, funcs: FuncMap) {
        debug!(template = %self.name, count = funcs.len(), "registering functions");
        self.common.registry.merge(funcs);
    }

    pub fn options(self, options: ExecOptions) -> Self {
        self.set_options(options);
        self
    }

    pub fn set_options(&self, options: ExecOptions) {
        *self.common.options.write() = options;
    }

    pub fn exec_options(&self) -> ExecOptions {
        self.common.options.read().clone()
    }

    // ── Parsing ─────────────────────────────────────────────────────────

    /// Parse `text` as the body of this template.
    ///
    /// `{{define}}` and `{{block}}` definitions in `text` are added to the
    /// namespace. Nothing is registered when parsing fails.
    pub fn parse(self, text: &str) -> Result<Self, Error> {
        let trees = self.parse_source(&self.name, text)?;
        self.register(trees);
        Ok(self)
    }

    /// Parse each file as a template named by its base name.
    ///
    /// The file whose base name equals this template's name becomes its
    /// body. All files are read and parsed before anything is registered.
    pub fn parse_files<P: AsRef<Path>>(self, paths: &[P]) -> Result<Self, Error> {
        if paths.is_empty() {
            return Err(Error::NoFiles("no files named in call to parse_files".into()));
        }
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self.load(&DirFs::new(""), &paths)?;
        Ok(self)
    }

    /// Parse every file matching `pattern`, as [`Template::parse_files`].
    pub fn parse_glob(self, pattern: &str) -> Result<Self, Error> {
        let paths = glob_files(pattern)?;
        self.load(&DirFs::new(""), &paths)?;
        Ok(self)
    }

    /// Parse the files of `fs` matching any of `patterns`.
    pub fn parse_fs<F: TemplateFs + ?Sized>(self, fs: &F, patterns: &[&str]) -> Result<Self, Error> {
        let paths = fs_files(fs, patterns)?;
        self.load(fs, &paths)?;
        Ok(self)
    }

    fn parse_source(&self, name: &str, text: &str) -> Result<Vec<Tree>, Error> {
        let registry = &self.common.registry;
        let is_func = |func: &str| registry::is_func(registry, func);
        let trees = parser::parse(name, text, &is_func).map_err(|e| Error::parse(name, text, e))?;
        debug!(template = name, definitions = trees.len(), "parsed template");
        Ok(trees)
    }

    fn load<F: TemplateFs + ?Sized>(&self, fs: &F, paths: &[PathBuf]) -> Result<(), Error> {
        let mut trees = Vec::new();
        for path in paths {
            let text = fs.read_to_string(path)?;
            trees.extend(self.parse_source(&base_name(path), &text)?);
        }
        debug!(template = %self.name, files = paths.len(), "loaded template files");
        self.register(trees);
        Ok(())
    }

    /// Add parsed trees to the namespace under one write lock.
    fn register(&self, trees: Vec<Tree>) {
        let mut map = self.common.trees.write();
        for tree in trees {
            // An empty body never replaces an existing one.
            if tree.is_empty() && map.contains_key(&tree.name) {
                continue;
            }
            map.insert(tree.name.clone(), Arc::new(tree));
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// The template named `name` in this namespace.
    pub fn lookup(&self, name: &str) -> Option<Template> {
        self.common
            .trees
            .read()
            .contains_key(name)
            .then(|| self.new_template(name))
    }

    /// Every parsed template of the namespace, sorted by name.
    pub fn templates(&self) -> Vec<Template> {
        let mut names: Vec<String> = self.common.trees.read().keys().cloned().collect();
        names.sort();
        names.into_iter().map(|name| self.new_template(name)).collect()
    }

    /// `; defined templates are: "a", "b"`, or an empty string when the
    /// namespace holds no parsed template.
    pub fn defined_templates(&self) -> String {
        let mut names: Vec<String> = self
            .common
            .trees
            .read()
            .keys()
            .map(|name| format!("{name:?}"))
            .collect();
        if names.is_empty() {
            return String::new();
        }
        names.sort();
        format!("; defined templates are: {}", names.join(", "))
    }

    /// An independent copy of the namespace that shares this template's
    /// registry and options.
    pub fn try_clone(&self) -> Result<Template, Error> {
        let trees = self.common.trees.read();
        if !trees.contains_key(&self.name) {
            return Err(Error::Clone {
                name: self.name.clone(),
            });
        }
        Ok(Template {
            name: self.name.clone(),
            common: Arc::new(Common {
                trees: RwLock::new(trees.clone()),
                registry: self.common.registry.clone(),
                options: RwLock::new(self.exec_options()),
            }),
        })
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Execute the template with `data`, appending SQL text to `query` and
    /// bound values to its arguments.
    ///
    /// When `query` already holds text a `;` separates the two statements
    /// and placeholders continue from the existing argument count. Text
    /// written before a failure is kept.
    pub fn execute<T: Serialize + ?Sized>(&self, query: &mut Query, data: &T) -> Result<(), Error> {
        let clone = self.try_clone()?;
        let data = to_value(data).map_err(|e| {
            Error::execution(
                &self.name,
                EvalError::new(EvalErrorKind::InvalidData, format!("invalid data: {e}")).with_source(e),
            )
        })?;

        if query.capacity() == 0 && query.args().is_empty() {
            *query = QueryPool::global().take();
        } else if !query.is_empty() {
            query.push(';');
        }
        query.set_name(&self.name);

        let funcs = clone.exec_funcs();
        let options = clone.exec_options();
        let trees = clone.common.trees.read();
        let bound_before = query.args().len();

        let result = Executor::new(&trees, &funcs, query, &options).run(&self.name, data);
        match result {
            Ok(()) => {
                debug!(
                    template = %self.name,
                    bound = query.args().len() - bound_before,
                    "executed template"
                );
                Ok(())
            }
            Err(e) => {
                debug!(template = %self.name, error = %e, "template execution failed");
                Err(Error::execution(&self.name, e))
            }
        }
    }

    /// Execute the template `name` of this namespace.
    pub fn execute_template<T: Serialize + ?Sized>(
        &self,
        query: &mut Query,
        name: &str,
        data: &T,
    ) -> Result<(), Error> {
        match self.lookup(name) {
            Some(template) => template.execute(query, data),
            None => {
                debug!(
                    template = name,
                    root = %self.name,
                    "unknown template{}",
                    self.defined_templates()
                );
                Err(Error::UnknownTemplate {
                    name: name.to_string(),
                    root: self.name.clone(),
                })
            }
        }
    }

    /// The function table for one execution: the registry's current
    /// contents with `bind` wrapped in an interceptor.
    fn exec_funcs(&self) -> HashMap<String, FuncRef> {
        let mut funcs = self.common.registry.snapshot();
        let prior = funcs
            .get(BIND)
            .cloned()
            .unwrap_or_else(|| Arc::new(IdentityBind));
        funcs.insert(BIND.to_string(), Arc::new(BindInterceptor::new(prior)));
        funcs
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.common.trees.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("namespace", &names)
            .finish()
    }
}

// ── Free functions ──────────────────────────────────────────────────────

/// Parse `paths` into a new namespace whose root is named after the first
/// file.
pub fn parse_files<P: AsRef<Path>>(paths: &[P]) -> Result<Template, Error> {
    let Some(first) = paths.first() else {
        return Err(Error::NoFiles("no files named in call to parse_files".into()));
    };
    Template::new(base_name(first.as_ref())).parse_files(paths)
}

/// Parse the files matching `pattern` into a new namespace whose root is
/// named after the first match.
pub fn parse_glob(pattern: &str) -> Result<Template, Error> {
    let paths = glob_files(pattern)?;
    let template = Template::new(base_name(&paths[0]));
    template.load(&DirFs::new(""), &paths)?;
    Ok(template)
}

/// Parse the files of `fs` matching `patterns` into a new namespace whose
/// root is named after the first match.
pub fn parse_fs<F: TemplateFs + ?Sized>(fs: &F, patterns: &[&str]) -> Result<Template, Error> {
    let paths = fs_files(fs, patterns)?;
    let template = Template::new(base_name(&paths[0]));
    template.load(fs, &paths)?;
    Ok(template)
}

/// Unwrap a setup-time result, panicking with the error.
///
/// ```rust
/// use pgtmpl::{Template, must};
///
/// let tpl = must(Template::new("q").parse("SELECT {{bind .}}"));
/// assert_eq!(tpl.name(), "q");
/// ```
#[track_caller]
pub fn must<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{e}"),
    }
}

/// Parse `source` and execute it once into a fresh query.
///
/// ```rust
/// let q = pgtmpl::render("SELECT * FROM t WHERE a = {{bind .a}}", &serde_json::json!({"a": 5}))?;
/// assert_eq!(q.as_str(), "SELECT * FROM t WHERE a = $1");
/// assert_eq!(q.args(), &[pgtmpl::Value::Int(5)]);
/// # Ok::<(), pgtmpl::Error>(())
/// ```
pub fn render<T: Serialize + ?Sized>(source: &str, data: &T) -> Result<Query, Error> {
    let mut query = Query::new();
    Template::new("render").parse(source)?.execute(&mut query, data)?;
    Ok(query)
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>, Error> {
    let paths = DirFs::new("").glob(pattern)?;
    if paths.is_empty() {
        return Err(Error::NoFiles(format!("pattern matches no files: `{pattern}`")));
    }
    Ok(paths)
}

fn fs_files<F: TemplateFs + ?Sized>(fs: &F, patterns: &[&str]) -> Result<Vec<PathBuf>, Error> {
    if patterns.is_empty() {
        return Err(Error::NoPatterns);
    }
    let mut paths = Vec::new();
    for pattern in patterns {
        let matched = fs.glob(pattern)?;
        if matched.is_empty() {
            return Err(Error::NoFiles(format!("pattern matches no files: `{pattern}`")));
        }
        paths.extend(matched);
    }
    Ok(paths)
}
