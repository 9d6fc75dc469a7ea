//! Directory traversal for snapshots and uploads.
//!
//! Both the local copy and the remote upload need the same view of a tree:
//! every directory before anything inside it, siblings in name order, so a
//! run over an unchanged tree always visits entries in the same sequence.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links to directories
    pub follow_links: bool,

    /// Entry names containing any of these substrings are skipped,
    /// together with everything below them
    pub exclude_patterns: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(patterns: &[String]) -> Self {
        Self {
            follow_links: false,
            exclude_patterns: patterns.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One entry below the walk root
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Full path on disk
    pub path: PathBuf,

    /// Path relative to the walk root
    pub relative_path: PathBuf,

    pub kind: EntryKind,

    /// Size in bytes (0 for directories)
    pub size: u64,
}

impl TreeEntry {
    /// Classify a walkdir entry.
    /// Symlinks to files count as the file they point to; symlinks to
    /// directories and dangling links are skipped.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = entry.file_type();

        let (kind, size) = if file_type.is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => (EntryKind::File, resolved.len()),
                _ => return Ok(None),
            }
        } else if file_type.is_dir() {
            (EntryKind::Directory, 0)
        } else if file_type.is_file() {
            (EntryKind::File, entry.metadata()?.len())
        } else {
            // sockets, fifos, devices
            return Ok(None);
        };

        Ok(Some(Self {
            path,
            relative_path,
            kind,
            size,
        }))
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Relative path with `/` separators, for remote paths
    pub fn relative_slash_path(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Walk a tree depth-first, directories before their contents.
///
/// The root itself is not included. Any unreadable entry fails the walk:
/// a snapshot that silently misses files is worse than no snapshot.
///
/// # Example
/// ```no_run
/// use dated_backup::fs::walker::{walk_tree, WalkOptions};
/// use std::path::Path;
///
/// let entries = walk_tree(Path::new("/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn walk_tree(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    walk_tree_with_callback(root, options, |entry| entries.push(entry))?;
    Ok(entries)
}

/// Walk a tree calling `callback` for every entry, in walk order
pub fn walk_tree_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(TreeEntry),
{
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !should_exclude(e, &options.exclude_patterns));

    for entry in walker {
        let entry = entry?;
        if let Some(tree_entry) = TreeEntry::from_entry(&entry, root)? {
            callback(tree_entry);
        }
    }

    Ok(())
}

/// Total size of all files in a tree
pub fn calculate_total_size(root: &Path, options: &WalkOptions) -> std::io::Result<u64> {
    let mut total_size = 0u64;

    walk_tree_with_callback(root, options, |entry| {
        total_size += entry.size;
    })?;

    Ok(total_size)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
