//! OS-specific helpers shared by the engine and its transports.
//!
//! Kept deliberately small: directory resolution and permission handling
//! are the only parts of the engine's filesystem contract that differ by
//! platform.

use std::io;
use std::path::{Path, PathBuf};

/// Fixed User-Agent sent with every outbound HTTP request.
///
/// A realistic, versioned UA avoids servers that reject requests from
/// generic HTTP client strings.
pub const USER_AGENT: &str = "FluxDM/0.1.0 (+https://github.com/fluxdm/fluxdm)";

/// Directory mode applied to temp roots and the downloads directory.
pub const DIR_MODE: u32 = 0o755;

/// Returns the user's downloads directory (`$HOME/Downloads` on Unix,
/// the platform equivalent elsewhere), creating it with [`DIR_MODE`] if it
/// does not already exist.
pub fn downloads_dir() -> io::Result<PathBuf> {
    let dir = dirs::download_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no downloads directory for this platform")
    })?;
    create_dir_with_mode(&dir)?;
    Ok(dir)
}

/// Returns the OS temp directory joined with the engine's namespace
/// (`"catchme"`, per the wire layout this engine was specified against).
pub fn temp_root() -> PathBuf {
    std::env::temp_dir().join("catchme")
}

/// Creates `path` (and its ancestors) if missing, applying [`DIR_MODE`] on
/// Unix. On non-Unix platforms the mode is a no-op since the platform has
/// no equivalent permission bits.
pub fn create_dir_with_mode(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(path)?;
    set_mode(path)
}

#[cfg(unix)]
fn set_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(DIR_MODE);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_root_is_namespaced() {
        let root = temp_root();
        assert_eq!(root.file_name().unwrap(), "catchme");
    }

    #[test]
    fn create_dir_with_mode_is_idempotent() {
        let base = std::env::temp_dir().join(format!("platform-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);

        create_dir_with_mode(&base).unwrap();
        assert!(base.is_dir());
        // calling again must not error
        create_dir_with_mode(&base).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&base).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, DIR_MODE);
        }

        std::fs::remove_dir_all(&base).unwrap();
    }
}
