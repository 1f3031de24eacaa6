//! The worker loader shipped in every dependency layer.
//!
//! Supervised images start `python3 -m berth_worker module:callable`. The
//! module is installed at the root of the dependency tree, which lands on
//! the workers' `PYTHONPATH` at run time. Contract with the supervisor:
//!
//! - the factory reference is the first argument, or `BERTH_FACTORY`;
//! - the shared socket is `BERTH_LISTEN_FD`, else `HOST`/`PORT` are bound;
//! - a factory that cannot be imported or called exits with status 4.

use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};

/// Module name the default loader command runs.
pub const MODULE: &str = "berth_worker";

/// Loader source.
pub const SOURCE: &str = include_str!("berth_worker.py");

/// Writes the loader module into `tree` and returns its path.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be written.
pub fn install(tree: &Path) -> Result<PathBuf> {
    let path = tree.join(format!("{MODULE}.py"));
    std::fs::write(&path, SOURCE).map_err(|e| BerthError::io(&path, e))?;
    tracing::debug!(path = %path.display(), "installed worker loader");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    use berth_common::constants::APP_LOAD_ERROR_EXIT_CODE;

    use super::*;
    use crate::entrypoint::DEFAULT_LOADER;

    const APP: &str = "\
def create_app():
    def app(environ, start_response):
        start_response('200 OK', [('Content-Type', 'text/plain')])
        return [b'hello from berth']
    return app
";

    /// Lays out `app/app.py` and a `deps` tree holding the loader.
    fn layout() -> (tempfile::TempDir, PathBuf, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = dir.path().join("app");
        let deps = dir.path().join("deps");
        std::fs::create_dir_all(&app).expect("mkdir");
        std::fs::create_dir_all(&deps).expect("mkdir");
        std::fs::write(app.join("app.py"), APP).expect("write");
        let _ = install(&deps).expect("install");
        let pythonpath = format!("{}:{}", app.display(), deps.display());
        (dir, app, pythonpath)
    }

    fn loader(workdir: &Path, pythonpath: &str, factory: &str) -> Command {
        let mut cmd = Command::new(DEFAULT_LOADER[0]);
        let _ = cmd
            .args(&DEFAULT_LOADER[1..])
            .arg(factory)
            .current_dir(workdir)
            .env("PYTHONPATH", pythonpath)
            .env_remove("BERTH_LISTEN_FD")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn python_available() -> bool {
        which::which(DEFAULT_LOADER[0]).is_ok()
    }

    #[test]
    fn loader_is_named_by_the_default_command() {
        assert!(DEFAULT_LOADER.contains(&MODULE));
        let dir = tempfile::tempdir().expect("tempdir");
        let path = install(dir.path()).expect("install");
        assert_eq!(std::fs::read_to_string(path).expect("read"), SOURCE);
    }

    #[test]
    fn missing_factory_exits_with_load_failure() {
        if !python_available() {
            return;
        }
        let (_dir, app, pythonpath) = layout();
        for factory in ["app:make_app", "missing:create_app", "not-a-reference"] {
            let status = loader(&app, &pythonpath, factory).status().expect("spawn");
            assert_eq!(status.code(), Some(APP_LOAD_ERROR_EXIT_CODE), "{factory}");
        }
    }

    #[test]
    fn serves_the_factory_application() {
        if !python_available() {
            return;
        }
        let (_dir, app, pythonpath) = layout();
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .and_then(|l| l.local_addr())
            .expect("free port")
            .port();
        let mut child = loader(&app, &pythonpath, "app:create_app")
            .env("HOST", "127.0.0.1")
            .env("PORT", port.to_string())
            .spawn()
            .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut stream = loop {
            match TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() > deadline => panic!("loader never listened: {e}"),
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        };
        stream
            .write_all(b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n")
            .expect("request");
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).expect("response");
        let _ = child.kill();
        let _ = child.wait();

        assert!(response.starts_with("HTTP/1.0 200"), "{response}");
        assert!(response.ends_with("hello from berth"), "{response}");
    }
}
