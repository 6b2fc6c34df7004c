use crate::error::Result;
use crate::paths;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Replaces any existing file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile_beside(path)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write `data` to `path` through a tempfile in the same directory, failing
/// with `AlreadyExists` instead of replacing an existing file. Readers never
/// observe a partially written `path`.
pub fn write_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile_beside(path)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

/// Move `src` to `dst` without replacing an existing `dst`.
///
/// A plain rename is tried first. When that fails (typically because the two
/// paths live on different filesystems) the content is copied through a
/// tempfile next to `dst` and the source is removed afterwards.
pub fn move_new(src: &Path, dst: &Path) -> std::io::Result<()> {
    if dst.exists() {
        return Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{} already exists", dst.display()),
        ));
    }
    match std::fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(e),
        Err(_) => {}
    }

    let mut tmp = tempfile_beside(dst)?;
    let mut source = File::open(src)?;
    std::io::copy(&mut source, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(dst).map_err(|e| e.error)?;
    std::fs::remove_file(src)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Largest numeric file name found one directory level below `root`
/// (`<root>/<dir>/<n>`), or 0 when there is none.
pub fn max_sequence(root: &Path) -> Result<u64> {
    let mut max = 0;
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for dir in entries {
        let dir = dir?;
        if !dir.file_type()?.is_dir() {
            continue;
        }
        // another process may remove an unused destination meanwhile
        let files = match std::fs::read_dir(dir.path()) {
            Ok(files) => files,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for file in files {
            let file = file?;
            if let Some(seq) = file.file_name().to_str().and_then(paths::parse_sequence) {
                max = max.max(seq);
            }
        }
    }
    Ok(max)
}

fn tempfile_beside(path: &Path) -> std::io::Result<NamedTempFile> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    NamedTempFile::new_in(dir)
}
