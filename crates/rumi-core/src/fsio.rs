// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable file primitives shared by the persistence layers.

use std::io;
use std::path::Path;

/// Write `bytes` to `path` via a temporary sibling and an atomic rename.
///
/// Parent directories are created as needed. Readers observe either the old
/// or the new content, never a torn write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    tmp_name.push(".tmp");
    let tmp = parent.join(tmp_name);

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
