//! PID file handling.

use std::fs;
use std::io;
use std::path::Path;

/// Write the daemon PID to `path`, truncating any stale file.
pub fn write(path: &Path) -> io::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the PID file; a missing file is not an error.
pub fn remove(path: &Path) {
    let _ = fs::remove_file(path);
}
