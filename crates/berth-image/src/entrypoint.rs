//! Entry point resolution.
//!
//! The start command is fixed when the image is built. A service either runs
//! its main script directly under the interpreter's development server, or is
//! loaded by the worker loader through a zero-argument factory callable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use berth_common::constants::DEFAULT_WORKDIR;
use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

/// Default interpreter invocation for direct mode.
pub const DEFAULT_INTERPRETER: &[&str] = &["python3"];

/// Default loader invocation for supervised mode.
pub const DEFAULT_LOADER: &[&str] = &["python3", "-m", "berth_worker"];

/// Binary directories inside a rootfs searched before the host `PATH`.
const ROOTFS_BIN_DIRS: [&str; 3] = ["usr/local/bin", "usr/bin", "bin"];

/// A `module:callable` reference to an application factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryRef {
    /// Dotted module path.
    pub module: String,
    /// Zero-argument callable returning the application.
    pub callable: String,
}

impl FactoryRef {
    /// Returns the candidate source files for the module, relative to a root.
    #[must_use]
    pub fn module_paths(&self) -> [PathBuf; 2] {
        let base: PathBuf = self.module.split('.').collect();
        [base.with_extension("py"), base.join("__init__.py")]
    }

    /// Returns whether `source` binds the callable at module level, by
    /// definition, assignment or a `from ... import` re-export.
    #[must_use]
    pub fn is_defined_in(&self, source: &str) -> bool {
        let name = self.callable.as_str();
        let mut lines = source.lines();
        while let Some(line) = lines.next() {
            if defines(line, name) {
                return true;
            }
            let Some(names) = imported_names(line) else {
                continue;
            };
            let mut clause = strip_comment(names).to_string();
            loop {
                let continued = clause.trim_end().ends_with('\\');
                let open = clause.contains('(') && !clause.contains(')');
                if !continued && !open {
                    break;
                }
                let Some(next) = lines.next() else { break };
                clause.push(' ');
                clause.push_str(strip_comment(next));
            }
            if import_binds(&clause, name) {
                return true;
            }
        }
        false
    }
}

fn defines(line: &str, name: &str) -> bool {
    line.strip_prefix("def ")
        .or_else(|| line.strip_prefix("async def "))
        .and_then(|rest| rest.strip_prefix(name))
        .is_some_and(|rest| rest.trim_start().starts_with('('))
        || line
            .strip_prefix(name)
            .is_some_and(|rest| rest.trim_start().starts_with('='))
}

/// Returns the name list of a module-level `from X import ...` statement.
fn imported_names(line: &str) -> Option<&str> {
    let (_, names) = line.strip_prefix("from ")?.split_once(" import ")?;
    Some(names)
}

fn strip_comment(line: &str) -> &str {
    line.split_once('#').map_or(line, |(code, _)| code)
}

/// Returns whether an import name list binds `name`, as is or through `as`.
fn import_binds(clause: &str, name: &str) -> bool {
    let clause = clause.replace(['(', ')', '\\'], " ");
    clause.split(',').any(|item| {
        let words: Vec<&str> = item.split_whitespace().collect();
        match words.as_slice() {
            [bound] | [_, "as", bound] => *bound == name,
            _ => false,
        }
    })
}

impl FromStr for FactoryRef {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| BerthError::EntryPoint {
            message: format!("invalid factory reference `{s}`: {reason}"),
        };
        let (module, callable) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("expected module:callable"))?;
        let callable = callable.strip_suffix("()").unwrap_or(callable);
        if module.is_empty() || !module.split('.').all(is_identifier) {
            return Err(invalid("bad module path"));
        }
        if !is_identifier(callable) {
            return Err(invalid("bad callable name"));
        }
        Ok(Self {
            module: module.to_string(),
            callable: callable.to_string(),
        })
    }
}

impl fmt::Display for FactoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.callable)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// How the service process is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EntryPointMode {
    /// Run the main script under the interpreter's built-in server.
    Direct {
        /// Script path relative to the working directory.
        script: String,
    },
    /// Load the application through a factory in a supervised worker pool.
    Supervised {
        /// Factory to invoke.
        factory: FactoryRef,
    },
}

/// The resolved start command recorded in an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Selected mode.
    pub mode: EntryPointMode,
    /// Interpreter invocation (direct mode).
    pub interpreter: Vec<String>,
    /// Loader invocation (supervised mode).
    pub loader: Vec<String>,
    /// Working directory inside the rootfs.
    pub workdir: String,
}

impl EntryPoint {
    /// Creates a direct-mode entry point with default settings.
    #[must_use]
    pub fn direct(script: impl Into<String>) -> Self {
        Self::with_mode(EntryPointMode::Direct {
            script: script.into(),
        })
    }

    /// Creates a supervised entry point with default settings.
    #[must_use]
    pub fn supervised(factory: FactoryRef) -> Self {
        Self::with_mode(EntryPointMode::Supervised { factory })
    }

    fn with_mode(mode: EntryPointMode) -> Self {
        Self {
            mode,
            interpreter: DEFAULT_INTERPRETER.iter().map(ToString::to_string).collect(),
            loader: DEFAULT_LOADER.iter().map(ToString::to_string).collect(),
            workdir: DEFAULT_WORKDIR.to_string(),
        }
    }

    /// Returns whether workers are loaded through a factory.
    #[must_use]
    pub const fn is_supervised(&self) -> bool {
        matches!(self.mode, EntryPointMode::Supervised { .. })
    }

    /// Returns the factory, in supervised mode.
    #[must_use]
    pub const fn factory(&self) -> Option<&FactoryRef> {
        match &self.mode {
            EntryPointMode::Supervised { factory } => Some(factory),
            EntryPointMode::Direct { .. } => None,
        }
    }

    /// Returns the full start command.
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        match &self.mode {
            EntryPointMode::Direct { script } => {
                let mut cmd = self.interpreter.clone();
                cmd.push(script.clone());
                cmd
            }
            EntryPointMode::Supervised { factory } => {
                let mut cmd = self.loader.clone();
                cmd.push(factory.to_string());
                cmd
            }
        }
    }

    /// Checks at build time that the entry point exists in the source tree.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::EntryPoint` if the script or factory module is
    /// missing, or the invocation is empty.
    pub fn validate_source(&self, source_root: &Path) -> Result<()> {
        if self.command().len() < 2 {
            return Err(BerthError::EntryPoint {
                message: "empty interpreter or loader command".into(),
            });
        }
        match &self.mode {
            EntryPointMode::Direct { script } => {
                if !source_root.join(script).is_file() {
                    return Err(BerthError::EntryPoint {
                        message: format!("script `{script}` not found in source tree"),
                    });
                }
            }
            EntryPointMode::Supervised { factory } => {
                if find_module(source_root, factory).is_none() {
                    return Err(BerthError::EntryPoint {
                        message: format!("factory module `{}` not found in source tree", factory.module),
                    });
                }
            }
        }
        Ok(())
    }

    /// Verifies the entry point against a materialized rootfs and resolves
    /// the program to execute.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::EntryPoint` if the factory cannot be found or the
    /// program is not resolvable.
    pub fn verify(&self, rootfs: &Path) -> Result<PathBuf> {
        let workdir = rootfs.join(&self.workdir);
        match &self.mode {
            EntryPointMode::Direct { script } => {
                if !workdir.join(script).is_file() {
                    return Err(BerthError::EntryPoint {
                        message: format!("script `{script}` not found in image"),
                    });
                }
            }
            EntryPointMode::Supervised { factory } => {
                let module = find_module(&workdir, factory).ok_or_else(|| BerthError::EntryPoint {
                    message: format!("cannot import module `{}` for factory {factory}", factory.module),
                })?;
                let source =
                    std::fs::read_to_string(&module).map_err(|e| BerthError::io(&module, e))?;
                if !factory.is_defined_in(&source) {
                    return Err(BerthError::EntryPoint {
                        message: format!(
                            "module `{}` has no callable `{}`",
                            factory.module, factory.callable
                        ),
                    });
                }
            }
        }
        let program = self.command().into_iter().next().ok_or_else(|| BerthError::EntryPoint {
            message: "empty start command".into(),
        })?;
        let resolved = resolve_program(&program, rootfs, &workdir)?;
        tracing::debug!(program = %resolved.display(), "entry point verified");
        Ok(resolved)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            EntryPointMode::Direct { script } => write!(f, "direct:{script}"),
            EntryPointMode::Supervised { factory } => write!(f, "supervised:{factory}"),
        }
    }
}

fn find_module(root: &Path, factory: &FactoryRef) -> Option<PathBuf> {
    factory
        .module_paths()
        .into_iter()
        .map(|p| root.join(p))
        .find(|p| p.is_file())
}

/// Resolves a program name against the rootfs bin directories, then the
/// host `PATH`. Names containing `/` are taken relative to `workdir`.
///
/// # Errors
///
/// Returns `BerthError::EntryPoint` if the program cannot be found.
pub fn resolve_program(program: &str, rootfs: &Path, workdir: &Path) -> Result<PathBuf> {
    let not_found = |reason: String| BerthError::EntryPoint {
        message: format!("program `{program}` is not executable: {reason}"),
    };
    if program.contains('/') {
        let path = if Path::new(program).is_absolute() {
            PathBuf::from(program)
        } else {
            workdir.join(program)
        };
        return if path.is_file() {
            Ok(path)
        } else {
            Err(not_found("no such file".into()))
        };
    }

    let mut search: Vec<PathBuf> = ROOTFS_BIN_DIRS.iter().map(|d| rootfs.join(d)).collect();
    if let Some(host) = std::env::var_os("PATH") {
        search.extend(std::env::split_paths(&host));
    }
    let paths = std::env::join_paths(search).map_err(|e| not_found(e.to_string()))?;
    which::which_in(program, Some(paths), workdir).map_err(|e| not_found(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(s: &str) -> FactoryRef {
        s.parse().expect("factory")
    }

    #[test]
    fn parse_factory_accepts_call_suffix() {
        let f = factory("app:create_app()");
        assert_eq!(f.module, "app");
        assert_eq!(f.callable, "create_app");
        assert_eq!(f.to_string(), "app:create_app");
        assert_eq!(factory("pkg.web:make").module, "pkg.web");
    }

    #[test]
    fn parse_factory_rejects_malformed() {
        assert!("app".parse::<FactoryRef>().is_err());
        assert!(":create_app".parse::<FactoryRef>().is_err());
        assert!("app:".parse::<FactoryRef>().is_err());
        assert!("app:create-app".parse::<FactoryRef>().is_err());
        assert!("1app:x".parse::<FactoryRef>().is_err());
    }

    #[test]
    fn commands_per_mode() {
        let direct = EntryPoint::direct("app.py");
        assert_eq!(direct.command(), vec!["python3", "app.py"]);
        assert!(!direct.is_supervised());

        let supervised = EntryPoint::supervised(factory("app:create_app"));
        assert_eq!(
            supervised.command(),
            vec!["python3", "-m", "berth_worker", "app:create_app"]
        );
        assert!(supervised.is_supervised());
    }

    #[test]
    fn detects_module_level_definitions() {
        let f = factory("app:create_app");
        assert!(f.is_defined_in("def create_app():\n    return 1\n"));
        assert!(f.is_defined_in("async def create_app ():\n    pass\n"));
        assert!(f.is_defined_in("create_app = make_factory()\n"));
        assert!(!f.is_defined_in("def create_application():\n    pass\n"));
        assert!(!f.is_defined_in("class X:\n    def create_app(self):\n        pass\n"));
        assert!(!f.is_defined_in("create_app_flag = True\n"));
    }

    #[test]
    fn detects_re_exported_factories() {
        let f = factory("app:create_app");
        assert!(f.is_defined_in("from .factory import create_app\n"));
        assert!(f.is_defined_in("from app.factory import create_app as create_app\n"));
        assert!(f.is_defined_in("from .factory import build as create_app  # public\n"));
        assert!(f.is_defined_in("from .factory import helper, create_app\n"));
        assert!(f.is_defined_in(
            "from .factory import (\n    helper,  # internal\n    create_app,\n)\n"
        ));
        assert!(f.is_defined_in("from .factory import helper, \\\n    create_app\n"));
        assert!(!f.is_defined_in("from .factory import create_app as make\n"));
        assert!(!f.is_defined_in("from .factory import create_application\n"));
        assert!(!f.is_defined_in("import create_app\n"));
        assert!(!f.is_defined_in("def load():\n    from .factory import create_app\n"));
    }

    #[cfg(unix)]
    #[test]
    fn verify_accepts_factory_re_exported_from_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = dir.path().join("app/app");
        std::fs::create_dir_all(&app).expect("mkdir");
        std::fs::write(app.join("__init__.py"), "from .factory import create_app\n").expect("write");
        std::fs::write(app.join("factory.py"), "def create_app():\n    return None\n")
            .expect("write");

        let mut ep = EntryPoint::supervised(factory("app:create_app"));
        ep.loader = vec!["sh".into(), "-c".into(), "exit 0".into()];
        assert!(ep.verify(dir.path()).is_ok());
    }

    #[test]
    fn validate_source_requires_module_or_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("pkg")).expect("mkdir");
        std::fs::write(dir.path().join("pkg/__init__.py"), "def make():\n    pass\n").expect("write");
        std::fs::write(dir.path().join("main.py"), "").expect("write");

        assert!(EntryPoint::supervised(factory("pkg:make")).validate_source(dir.path()).is_ok());
        assert!(EntryPoint::direct("main.py").validate_source(dir.path()).is_ok());

        let err = EntryPoint::supervised(factory("missing:make"))
            .validate_source(dir.path())
            .expect_err("missing module");
        assert!(matches!(err, BerthError::EntryPoint { .. }));
        assert!(EntryPoint::direct("nope.py").validate_source(dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn verify_resolves_factory_and_program() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).expect("mkdir");
        std::fs::write(app.join("web.py"), "def create_app():\n    pass\n").expect("write");

        let mut ep = EntryPoint::supervised(factory("web:create_app"));
        ep.loader = vec!["sh".into(), "-c".into(), "exit 0".into()];
        let program = ep.verify(dir.path()).expect("verify");
        assert!(program.ends_with("sh"));

        let mut wrong = EntryPoint::supervised(factory("web:build_app"));
        wrong.loader = ep.loader.clone();
        let err = wrong.verify(dir.path()).expect_err("missing callable");
        assert!(matches!(err, BerthError::EntryPoint { .. }));
    }

    #[test]
    fn verify_rejects_unresolvable_program() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).expect("mkdir");
        std::fs::write(app.join("main.py"), "").expect("write");

        let mut ep = EntryPoint::direct("main.py");
        ep.interpreter = vec!["berth-no-such-interpreter".into()];
        let err = ep.verify(dir.path()).expect_err("unresolvable");
        assert!(matches!(err, BerthError::EntryPoint { .. }));
    }

    #[test]
    fn entry_point_serializes_with_mode_tag() {
        let ep = EntryPoint::supervised(factory("app:create_app"));
        let json = serde_json::to_string(&ep).expect("serialize");
        assert!(json.contains(r#""mode":"supervised""#));
        let back: EntryPoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ep);
    }
}
