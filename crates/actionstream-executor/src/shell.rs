//! Shell selection and executable lookup.

use std::path::{Path, PathBuf};

const FALLBACK_SHELL: &str = "/bin/sh";

/// Returns the shell program and its "run this string" flag.
///
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the shell named by `$SHELL`, else `("/bin/sh", "-c")`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        let shell = unix_shell(std::env::var("SHELL").ok().as_deref());
        (shell.to_string_lossy().into_owned(), "-c")
    }
}

/// `shell` when it names an existing absolute path, else `/bin/sh`.
#[cfg_attr(windows, allow(dead_code))]
fn unix_shell(shell: Option<&str>) -> PathBuf {
    shell
        .map(Path::new)
        .filter(|path| path.is_absolute() && path.is_file())
        .map_or_else(|| PathBuf::from(FALLBACK_SHELL), Path::to_path_buf)
}

/// Resolve an executable by name.
///
/// Absolute paths are taken as-is when they exist; anything else goes
/// through a `PATH` lookup.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
