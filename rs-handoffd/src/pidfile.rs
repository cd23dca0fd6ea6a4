//! The PID file names the generation that currently owns the listener.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Replaces the PID file atomically so a reader never sees a partial write.
pub fn write(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    let mut file = fs::File::create(&tmp)?;
    writeln!(file, "{pid}")?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

/// Reads the pid back. Anything that cannot name a process, including `0`,
/// is `InvalidData`.
pub fn read(path: &Path) -> io::Result<u32> {
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| (1..=i32::MAX as u32).contains(pid))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: not a pid: {:?}", path.display(), contents.trim()),
            )
        })
}
