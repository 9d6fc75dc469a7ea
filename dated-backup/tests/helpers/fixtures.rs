use dated_backup::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const REMOTE_ROOT: &str = "/backups/notes";

/// A source tree, an empty backup root and an empty "remote" mount
pub struct Fixture {
    _temp: TempDir,
    pub source: PathBuf,
    pub backup_root: PathBuf,
    pub mount: PathBuf,
}

impl Fixture {
    /// Two-file source: `a.md` at the top, `sub/b.md` one level down
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("notes");
        let backup_root = temp.path().join("backup");
        let mount = temp.path().join("nas");

        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("a.md"), b"alpha").unwrap();
        fs::write(source.join("sub/b.md"), b"beta").unwrap();
        fs::create_dir(&backup_root).unwrap();
        fs::create_dir(&mount).unwrap();

        Self {
            _temp: temp,
            source,
            backup_root,
            mount,
        }
    }

    /// Directory-remote config with fast retries
    pub fn config(&self) -> Config {
        let toml = format!(
            r#"
[source]
path = "{}"

[local]
backup_root = "{}"

[remote]
kind = "directory"
mount = "{}"
root = "{}"

[upload]
attempts = 3
backoff_ms = 1
max_backoff_ms = 4
"#,
            self.source.display(),
            self.backup_root.display(),
            self.mount.display(),
            REMOTE_ROOT
        );
        Config::from_toml(&toml).unwrap()
    }

    pub fn remote_root(&self) -> PathBuf {
        self.mount.join(REMOTE_ROOT.trim_start_matches('/'))
    }

    pub fn local_generation(&self, id: &str) -> PathBuf {
        self.backup_root.join(id)
    }

    pub fn remote_generation(&self, id: &str) -> PathBuf {
        self.remote_root().join(id)
    }

    /// Plant an older generation on both ends
    pub fn seed(&self, id: &str) {
        for dir in [self.local_generation(id), self.remote_generation(id)] {
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("a.md"), b"old").unwrap();
        }
    }

    pub fn local_ids(&self) -> Vec<String> {
        visible_dirs(&self.backup_root)
    }

    pub fn remote_ids(&self) -> Vec<String> {
        visible_dirs(&self.remote_root())
    }

    /// Hidden entries below the backup root
    pub fn local_hidden(&self) -> Vec<String> {
        hidden_entries(&self.backup_root)
    }

    /// Hidden entries below the remote root
    pub fn remote_hidden(&self) -> Vec<String> {
        hidden_entries(&self.remote_root())
    }
}

fn hidden_entries(path: &Path) -> Vec<String> {
    let Ok(read_dir) = fs::read_dir(path) else {
        return Vec::new();
    };
    let mut names: Vec<String> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with('.'))
        .collect();
    names.sort();
    names
}

fn visible_dirs(path: &Path) -> Vec<String> {
    let Ok(read_dir) = fs::read_dir(path) else {
        return Vec::new();
    };
    let mut names: Vec<String> = read_dir
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}
