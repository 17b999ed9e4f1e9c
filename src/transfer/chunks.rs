//! Chunk production for the send path.
//!
//! `ChunkIterator` walks the selected files and folders depth-first
//! with an explicit stack and yields a flat, ordered chunk sequence:
//! one DIRECTORY marker per folder, then its contents, every relative
//! path prefixed with all ancestor folder names joined with `/`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use log::warn;

use crate::proto::{FileChunk, FileTime};
use crate::transfer::{FILE_TYPE_DIRECTORY, FILE_TYPE_FILE, FILE_TYPE_SYMLINK};

/// 1MB chunks
pub const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Directory,
}

/// One item the user picked for sending. Resolves lazily: nothing is
/// opened until the iterator reaches it.
#[derive(Debug, Clone)]
pub struct TransferSelection {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
    pub kind: ItemKind,
}

impl TransferSelection {
    pub fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = fs::symlink_metadata(&path)?;
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .to_string();
        let kind = if meta.is_dir() {
            ItemKind::Directory
        } else {
            ItemKind::File
        };
        Ok(Self {
            name,
            size: if meta.is_dir() { 0 } else { meta.len() },
            path,
            kind,
        })
    }
}

/// Totals advertised in the transfer request.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub total_size: u64,
    pub file_count: u64,
    pub top_dir_basenames: Vec<String>,
}

/// Walk all selections up front to compute the advertised totals.
/// Folders contribute their recursive file sizes; the count is the
/// number of files and symlinks, not directories.
pub fn summarize(selections: &[TransferSelection]) -> io::Result<Summary> {
    let mut summary = Summary::default();
    for selection in selections {
        summary.top_dir_basenames.push(selection.name.clone());
        let mut stack = vec![selection.path.clone()];
        while let Some(path) = stack.pop() {
            let meta = fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                summary.file_count += 1;
            } else if meta.is_dir() {
                for entry in fs::read_dir(&path)? {
                    stack.push(entry?.path());
                }
            } else {
                summary.file_count += 1;
                summary.total_size += meta.len();
            }
        }
    }
    Ok(summary)
}

struct PendingEntry {
    path: PathBuf,
    rel: String,
}

struct OpenFile {
    file: File,
    rel: String,
    mode: i32,
    time: Option<FileTime>,
    emitted: bool,
}

/// Depth-first chunk producer over a list of selections.
pub struct ChunkIterator {
    stack: Vec<PendingEntry>,
    current: Option<OpenFile>,
    chunk_size: usize,
}

impl ChunkIterator {
    pub fn new(selections: &[TransferSelection]) -> Self {
        Self::with_chunk_size(selections, CHUNK_SIZE)
    }

    pub fn with_chunk_size(selections: &[TransferSelection], chunk_size: usize) -> Self {
        // The stack pops from the back; reverse so selections stream in
        // the order the user picked them.
        let stack = selections
            .iter()
            .rev()
            .map(|s| PendingEntry {
                path: s.path.clone(),
                rel: s.name.clone(),
            })
            .collect();
        Self {
            stack,
            current: None,
            chunk_size,
        }
    }

    /// Drop any open file handle and pending entries. Called when a
    /// transfer stops early.
    pub fn close(&mut self) {
        self.current = None;
        self.stack.clear();
    }

    fn next_entry(&mut self) -> Option<io::Result<FileChunk>> {
        let entry = self.stack.pop()?;
        let meta = match fs::symlink_metadata(&entry.path) {
            Ok(meta) => meta,
            Err(e) => return Some(Err(e)),
        };

        if meta.file_type().is_symlink() {
            let target = match fs::read_link(&entry.path) {
                Ok(target) => target.to_string_lossy().to_string(),
                Err(e) => return Some(Err(e)),
            };
            return Some(Ok(FileChunk {
                relative_path: entry.rel,
                file_type: FILE_TYPE_SYMLINK,
                chunk: Vec::new(),
                file_mode: 0o777,
                time: file_time(&meta),
                symlink_target: target,
            }));
        }

        if meta.is_dir() {
            let mut names: Vec<PathBuf> = match fs::read_dir(&entry.path) {
                Ok(dir) => match dir.map(|e| e.map(|e| e.path())).collect() {
                    Ok(names) => names,
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(e)),
            };
            names.sort();
            for path in names.into_iter().rev() {
                let Some(name) = path.file_name() else {
                    warn!("Skipping unnameable entry under {}", entry.path.display());
                    continue;
                };
                self.stack.push(PendingEntry {
                    rel: format!("{}/{}", entry.rel, name.to_string_lossy()),
                    path,
                });
            }
            // Leading marker so the receiver creates the directory
            // before any of its contents arrive.
            return Some(Ok(FileChunk {
                relative_path: entry.rel,
                file_type: FILE_TYPE_DIRECTORY,
                chunk: Vec::new(),
                file_mode: mode_of(&meta),
                time: file_time(&meta),
                symlink_target: String::new(),
            }));
        }

        let file = match File::open(&entry.path) {
            Ok(file) => file,
            Err(e) => return Some(Err(e)),
        };
        self.current = Some(OpenFile {
            file,
            rel: entry.rel,
            mode: mode_of(&meta),
            time: file_time(&meta),
            emitted: false,
        });
        self.read_current()
    }

    fn read_current(&mut self) -> Option<io::Result<FileChunk>> {
        let open = self.current.as_mut()?;
        let mut buf = vec![0u8; self.chunk_size];
        match open.file.read(&mut buf) {
            Ok(0) => {
                // An empty file still needs one chunk so the receiver
                // creates it.
                if open.emitted {
                    self.current = None;
                    None
                } else {
                    let chunk = FileChunk {
                        relative_path: open.rel.clone(),
                        file_type: FILE_TYPE_FILE,
                        chunk: Vec::new(),
                        file_mode: open.mode,
                        time: open.time.clone(),
                        symlink_target: String::new(),
                    };
                    self.current = None;
                    Some(Ok(chunk))
                }
            }
            Ok(n) => {
                buf.truncate(n);
                open.emitted = true;
                Some(Ok(FileChunk {
                    relative_path: open.rel.clone(),
                    file_type: FILE_TYPE_FILE,
                    chunk: buf,
                    file_mode: open.mode,
                    time: open.time.clone(),
                    symlink_target: String::new(),
                }))
            }
            Err(e) => {
                self.current = None;
                Some(Err(e))
            }
        }
    }
}

impl Iterator for ChunkIterator {
    type Item = io::Result<FileChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_some() {
                if let Some(result) = self.read_current() {
                    return Some(result);
                }
                continue;
            }
            // next_entry only returns None once the stack is drained.
            return self.next_entry();
        }
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() as i32
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata) -> i32 {
    0o644
}

fn file_time(meta: &fs::Metadata) -> Option<FileTime> {
    let modified = meta.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(FileTime {
        mtime: since_epoch.as_secs(),
        mtime_usec: since_epoch.subsec_micros(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_file(path: &Path, contents: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }

    #[test]
    fn folder_traversal_emits_markers_and_prefixed_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("photos");
        fs::create_dir(&root).unwrap();
        write_file(&root.join("a.jpg"), b"aaa");
        write_file(&root.join("b.jpg"), b"bbb");
        let sub = root.join("trip");
        fs::create_dir(&sub).unwrap();
        write_file(&sub.join("c.jpg"), b"ccc");

        let selection = TransferSelection::from_path(&root).unwrap();
        let chunks: Vec<FileChunk> = ChunkIterator::new(&[selection])
            .map(|c| c.unwrap())
            .collect();

        let markers: Vec<&FileChunk> = chunks
            .iter()
            .filter(|c| c.file_type == FILE_TYPE_DIRECTORY)
            .collect();
        assert_eq!(markers.len(), 2, "one marker per directory");
        assert_eq!(markers[0].relative_path, "photos");
        assert_eq!(markers[1].relative_path, "photos/trip");

        let payload_paths: Vec<&str> = chunks
            .iter()
            .filter(|c| c.file_type == FILE_TYPE_FILE)
            .map(|c| c.relative_path.as_str())
            .collect();
        assert_eq!(
            payload_paths,
            vec!["photos/a.jpg", "photos/b.jpg", "photos/trip/c.jpg"]
        );

        // A directory's marker precedes all of its contents.
        let trip_marker = chunks
            .iter()
            .position(|c| c.relative_path == "photos/trip")
            .unwrap();
        let trip_file = chunks
            .iter()
            .position(|c| c.relative_path == "photos/trip/c.jpg")
            .unwrap();
        assert!(trip_marker < trip_file);
    }

    #[test]
    fn large_files_split_into_ordered_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.dat");
        write_file(&path, &vec![0x55u8; 2500]);

        let selection = TransferSelection::from_path(&path).unwrap();
        let chunks: Vec<FileChunk> = ChunkIterator::with_chunk_size(&[selection], 1000)
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk.len(), 1000);
        assert_eq!(chunks[1].chunk.len(), 1000);
        assert_eq!(chunks[2].chunk.len(), 500);
        assert!(chunks.iter().all(|c| c.relative_path == "big.dat"));
    }

    #[test]
    fn empty_files_still_produce_one_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        write_file(&path, b"");

        let selection = TransferSelection::from_path(&path).unwrap();
        let chunks: Vec<FileChunk> = ChunkIterator::new(&[selection])
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].chunk.is_empty());
        assert_eq!(chunks[0].file_type, FILE_TYPE_FILE);
    }

    #[test]
    fn summary_counts_files_not_directories() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("docs");
        fs::create_dir(&root).unwrap();
        write_file(&root.join("one.txt"), b"12345");
        let sub = root.join("inner");
        fs::create_dir(&sub).unwrap();
        write_file(&sub.join("two.txt"), b"1234567890");

        let selection = TransferSelection::from_path(&root).unwrap();
        let summary = summarize(&[selection]).unwrap();
        assert_eq!(summary.total_size, 15);
        assert_eq!(summary.file_count, 2);
        assert_eq!(summary.top_dir_basenames, vec!["docs"]);
    }
}
