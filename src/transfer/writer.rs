//! Chunk consumption for the receive path.
//!
//! A `Writer` owns one in-progress filesystem item. The receive loop
//! feeds every inbound chunk to its current writer; a chunk whose
//! relative path falls outside the writer's subtree answers with
//! `SinkError::FilenameMismatch`, which the caller catches to finish
//! that writer and open a fresh one (rollover). Folder writers apply
//! the same logic recursively to their children.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::errors::SinkError;
use crate::proto::FileChunk;
use crate::transfer::{FILE_TYPE_DIRECTORY, FILE_TYPE_SYMLINK};

const RENAME_ATTEMPTS: u32 = 1000;

pub enum Writer {
    File(FileWriter),
    Folder(FolderWriter),
    Symlink(SymlinkWriter),
}

impl Writer {
    /// Create a writer for a top-level chunk, resolving name conflicts
    /// against the save directory.
    pub fn create_root(chunk: &FileChunk, root: &Path, overwrite: bool) -> Result<Self, SinkError> {
        let desired = root.join(relative_components(&chunk.relative_path).join("/"));
        Self::create(chunk, chunk.relative_path.clone(), desired, overwrite)
    }

    fn create(
        chunk: &FileChunk,
        rel: String,
        desired: PathBuf,
        overwrite: bool,
    ) -> Result<Self, SinkError> {
        match chunk.file_type {
            FILE_TYPE_DIRECTORY => Ok(Writer::Folder(FolderWriter::create(
                rel, desired, overwrite,
            )?)),
            FILE_TYPE_SYMLINK => Ok(Writer::Symlink(SymlinkWriter::create(
                rel,
                desired,
                &chunk.symlink_target,
                overwrite,
            )?)),
            _ => Ok(Writer::File(FileWriter::create(
                rel,
                desired,
                chunk.file_mode,
                overwrite,
            )?)),
        }
    }

    /// Apply one chunk. Returns the number of payload bytes written, or
    /// `FilenameMismatch` if the chunk belongs to a different item.
    pub fn write_chunk(&mut self, chunk: &FileChunk) -> Result<u64, SinkError> {
        match self {
            Writer::File(w) => w.write_chunk(chunk),
            Writer::Folder(w) => w.write_chunk(chunk),
            Writer::Symlink(w) => w.write_chunk(chunk),
        }
    }

    /// Complete the item: flush data and apply permissions.
    pub fn finish(&mut self) -> Result<(), SinkError> {
        match self {
            Writer::File(w) => w.finish(),
            Writer::Folder(w) => w.finish(),
            Writer::Symlink(_) => Ok(()),
        }
    }

    /// Discard the unfinished item, removing whatever was written.
    pub fn fail(&mut self) {
        match self {
            Writer::File(w) => w.fail(),
            Writer::Folder(w) => w.fail(),
            Writer::Symlink(w) => w.fail(),
        }
    }

    fn rel(&self) -> &str {
        match self {
            Writer::File(w) => &w.rel,
            Writer::Folder(w) => &w.rel,
            Writer::Symlink(w) => &w.rel,
        }
    }
}

pub struct FileWriter {
    rel: String,
    path: PathBuf,
    file: Option<File>,
    mode: i32,
}

impl FileWriter {
    fn create(rel: String, desired: PathBuf, mode: i32, overwrite: bool) -> Result<Self, SinkError> {
        let path = claim_path(desired, overwrite, false)?;
        let file = File::create(&path)?;
        debug!("Writing file {}", path.display());
        Ok(Self {
            rel,
            path,
            file: Some(file),
            mode,
        })
    }

    fn write_chunk(&mut self, chunk: &FileChunk) -> Result<u64, SinkError> {
        if chunk.relative_path != self.rel {
            return Err(SinkError::FilenameMismatch);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SinkError::Undefined(already_finished()))?;
        file.write_all(&chunk.chunk)?;
        Ok(chunk.chunk.len() as u64)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            apply_mode(&self.path, self.mode);
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.file = None;
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove partial file {}: {e}", self.path.display());
        }
    }
}

pub struct FolderWriter {
    rel: String,
    path: PathBuf,
    current: Option<Box<Writer>>,
}

impl FolderWriter {
    fn create(rel: String, desired: PathBuf, overwrite: bool) -> Result<Self, SinkError> {
        let path = claim_path(desired, overwrite, true)?;
        fs::create_dir(&path)?;
        debug!("Writing directory {}", path.display());
        Ok(Self {
            rel,
            path,
            current: None,
        })
    }

    fn write_chunk(&mut self, chunk: &FileChunk) -> Result<u64, SinkError> {
        if chunk.relative_path == self.rel {
            // Repeated marker for this directory; nothing to do.
            return Ok(0);
        }
        if !is_subpath(&chunk.relative_path, &self.rel) {
            return Err(SinkError::FilenameMismatch);
        }

        if let Some(child) = self.current.as_mut() {
            match child.write_chunk(chunk) {
                Err(SinkError::FilenameMismatch) => {
                    child.finish()?;
                    self.current = None;
                }
                other => return other,
            }
        }

        // Chunks arrive depth-first, so a chunk that is not for the
        // current child starts a new one.
        let child_rel_components: Vec<&str> = relative_components(&chunk.relative_path)
            .into_iter()
            .skip(relative_components(&self.rel).len())
            .collect();
        let desired = self.path.join(child_rel_components.join("/"));
        // Children land inside a directory this writer just created, so
        // conflicts only occur when one transfer carries duplicate
        // names; never overwrite a sibling we wrote ourselves.
        let mut child = Writer::create(chunk, chunk.relative_path.clone(), desired, false)?;
        let written = child.write_chunk(chunk)?;
        self.current = Some(Box::new(child));
        Ok(written)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(child) = self.current.as_mut() {
            child.finish()?;
            self.current = None;
        }
        Ok(())
    }

    fn fail(&mut self) {
        if let Some(child) = self.current.as_mut() {
            child.fail();
            self.current = None;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(
                "Could not remove partial directory {}: {e}",
                self.path.display()
            );
        }
    }
}

pub struct SymlinkWriter {
    rel: String,
    path: PathBuf,
}

impl SymlinkWriter {
    #[cfg(unix)]
    fn create(
        rel: String,
        desired: PathBuf,
        target: &str,
        overwrite: bool,
    ) -> Result<Self, SinkError> {
        let path = claim_path(desired, overwrite, false)?;
        std::os::unix::fs::symlink(target, &path)?;
        Ok(Self { rel, path })
    }

    #[cfg(not(unix))]
    fn create(
        rel: String,
        desired: PathBuf,
        target: &str,
        _overwrite: bool,
    ) -> Result<Self, SinkError> {
        warn!("Symlink {rel} -> {target} not supported on this platform, skipping");
        Ok(Self {
            rel,
            path: desired,
        })
    }

    fn write_chunk(&mut self, chunk: &FileChunk) -> Result<u64, SinkError> {
        if chunk.relative_path != self.rel {
            return Err(SinkError::FilenameMismatch);
        }
        Ok(0)
    }

    fn fail(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// True when `parent` names an ancestor of `child` (component-wise, not
/// a string prefix: "photo" is not an ancestor of "photos/a.jpg").
pub fn is_subpath(child: &str, parent: &str) -> bool {
    let child: Vec<&str> = relative_components(child);
    let parent: Vec<&str> = relative_components(parent);
    child.len() > parent.len() && child[..parent.len()] == parent[..]
}

/// Split a wire-relative path into its safe components, dropping
/// anything that could escape the save directory.
fn relative_components(rel: &str) -> Vec<&str> {
    rel.split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .collect()
}

/// Resolve a destination path against what already exists on disk.
///
/// Overwrite disabled: pick the smallest unused numeric suffix derived
/// from the original stem, bounded at 1000 attempts. Overwrite enabled:
/// delete then reuse the name, falling back to renaming if the delete
/// fails.
fn claim_path(desired: PathBuf, overwrite: bool, is_dir: bool) -> Result<PathBuf, SinkError> {
    if !desired.exists() {
        return Ok(desired);
    }

    if overwrite {
        let removed = if desired.is_dir() {
            fs::remove_dir_all(&desired)
        } else {
            fs::remove_file(&desired)
        };
        match removed {
            Ok(()) => return Ok(desired),
            Err(e) => warn!(
                "Could not overwrite {}, renaming instead: {e}",
                desired.display()
            ),
        }
    }

    let stem = desired
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = desired
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()));
    let parent = desired.parent().map(Path::to_path_buf).unwrap_or_default();

    // Always derive candidates from the original stem so repeated
    // collisions yield "name2", never "name12".
    for suffix in 1..=RENAME_ATTEMPTS {
        let candidate = match &extension {
            Some(ext) => parent.join(format!("{stem}{suffix}{ext}")),
            None => parent.join(format!("{stem}{suffix}")),
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(if is_dir {
        SinkError::DirectoryExists(desired)
    } else {
        SinkError::FileExists(desired)
    })
}

fn apply_mode(path: &Path, mode: i32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if mode > 0 {
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode as u32)) {
                warn!("Could not set mode on {}: {e}", path.display());
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

fn already_finished() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "writer already finished")
}

/// Receive-side rollover driver: owns the current top-level writer and
/// rotates it as chunks cross item boundaries.
#[derive(Default)]
pub struct LandingArea {
    current: Option<Writer>,
}

impl LandingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one inbound chunk, rotating writers as needed. Returns
    /// payload bytes written.
    pub fn apply(
        &mut self,
        chunk: &FileChunk,
        root: &Path,
        overwrite: bool,
    ) -> Result<u64, SinkError> {
        if let Some(writer) = self.current.as_mut() {
            match writer.write_chunk(chunk) {
                Err(SinkError::FilenameMismatch) => {
                    writer.finish()?;
                    debug!("Finished {}", writer.rel());
                    self.current = None;
                }
                other => return other,
            }
        }
        let mut writer = Writer::create_root(chunk, root, overwrite)?;
        let written = writer.write_chunk(chunk)?;
        self.current = Some(writer);
        Ok(written)
    }

    /// Complete the final item after the stream ends cleanly.
    pub fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.current.as_mut() {
            writer.finish()?;
            self.current = None;
        }
        Ok(())
    }

    /// Discard the in-progress item after a failure or cancellation.
    pub fn fail(&mut self) {
        if let Some(writer) = self.current.as_mut() {
            writer.fail();
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::FileChunk;
    use crate::transfer::FILE_TYPE_FILE;
    use tempfile::tempdir;

    fn file_chunk(rel: &str, payload: &[u8]) -> FileChunk {
        FileChunk {
            relative_path: rel.to_string(),
            file_type: FILE_TYPE_FILE,
            chunk: payload.to_vec(),
            file_mode: 0o644,
            time: None,
            symlink_target: String::new(),
        }
    }

    fn dir_chunk(rel: &str) -> FileChunk {
        FileChunk {
            relative_path: rel.to_string(),
            file_type: FILE_TYPE_DIRECTORY,
            chunk: Vec::new(),
            file_mode: 0o755,
            time: None,
            symlink_target: String::new(),
        }
    }

    #[test]
    fn subpath_comparison_is_component_wise() {
        assert!(is_subpath("photos/a.jpg", "photos"));
        assert!(is_subpath("photos/trip/c.jpg", "photos"));
        assert!(!is_subpath("photos", "photos"));
        assert!(!is_subpath("photosX/a.jpg", "photos"));
        assert!(!is_subpath("other/a.jpg", "photos"));
    }

    #[test]
    fn single_file_lands_with_its_payload() {
        let dir = tempdir().unwrap();
        let mut landing = LandingArea::new();
        landing
            .apply(&file_chunk("note.txt", b"hello "), dir.path(), false)
            .unwrap();
        landing
            .apply(&file_chunk("note.txt", b"world"), dir.path(), false)
            .unwrap();
        landing.finish().unwrap();

        assert_eq!(
            fs::read(dir.path().join("note.txt")).unwrap(),
            b"hello world"
        );
    }

    #[test]
    fn conflicting_names_get_the_smallest_unused_suffix() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("report.pdf"), b"original").unwrap();

        let mut landing = LandingArea::new();
        landing
            .apply(&file_chunk("report.pdf", b"incoming"), dir.path(), false)
            .unwrap();
        landing.finish().unwrap();

        assert_eq!(
            fs::read(dir.path().join("report.pdf")).unwrap(),
            b"original",
            "the existing entry's bytes are untouched"
        );
        assert_eq!(
            fs::read(dir.path().join("report1.pdf")).unwrap(),
            b"incoming"
        );

        // A third copy takes the next free suffix, derived from the
        // original stem rather than the previous rename.
        let mut landing = LandingArea::new();
        landing
            .apply(&file_chunk("report.pdf", b"again"), dir.path(), false)
            .unwrap();
        landing.finish().unwrap();
        assert_eq!(fs::read(dir.path().join("report2.pdf")).unwrap(), b"again");
    }

    #[test]
    fn overwrite_replaces_the_existing_entry() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("note.txt"), b"old").unwrap();

        let mut landing = LandingArea::new();
        landing
            .apply(&file_chunk("note.txt", b"new"), dir.path(), true)
            .unwrap();
        landing.finish().unwrap();

        assert_eq!(fs::read(dir.path().join("note.txt")).unwrap(), b"new");
        assert!(!dir.path().join("note1.txt").exists());
    }

    #[test]
    fn nested_folder_chunks_roll_writers_over() {
        let dir = tempdir().unwrap();
        let mut landing = LandingArea::new();

        landing.apply(&dir_chunk("photos"), dir.path(), false).unwrap();
        landing
            .apply(&file_chunk("photos/a.jpg", b"aaa"), dir.path(), false)
            .unwrap();
        landing
            .apply(&dir_chunk("photos/trip"), dir.path(), false)
            .unwrap();
        landing
            .apply(&file_chunk("photos/trip/c.jpg", b"ccc"), dir.path(), false)
            .unwrap();
        landing
            .apply(&file_chunk("other.txt", b"zzz"), dir.path(), false)
            .unwrap();
        landing.finish().unwrap();

        assert_eq!(fs::read(dir.path().join("photos/a.jpg")).unwrap(), b"aaa");
        assert_eq!(
            fs::read(dir.path().join("photos/trip/c.jpg")).unwrap(),
            b"ccc"
        );
        assert_eq!(fs::read(dir.path().join("other.txt")).unwrap(), b"zzz");
    }

    #[test]
    fn fail_discards_partial_entries() {
        let dir = tempdir().unwrap();
        let mut landing = LandingArea::new();

        landing.apply(&dir_chunk("photos"), dir.path(), false).unwrap();
        landing
            .apply(&file_chunk("photos/a.jpg", b"partial"), dir.path(), false)
            .unwrap();
        landing.fail();

        assert!(!dir.path().join("photos").exists());
    }

    #[test]
    fn traversal_components_drop_escape_attempts() {
        let dir = tempdir().unwrap();
        let mut landing = LandingArea::new();
        landing
            .apply(&file_chunk("../escape.txt", b"nope"), dir.path(), false)
            .unwrap();
        landing.finish().unwrap();

        assert!(dir.path().join("escape.txt").exists());
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }
}
