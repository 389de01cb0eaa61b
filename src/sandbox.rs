//! Path-contained filesystem operations.
//!
//! Every request path resolves through [`Sandbox::resolve`] before any
//! filesystem touch. Resolution prevents traversal attacks by:
//! 1. Rejecting NUL bytes in levels
//! 2. Rejecting parent, root, and prefix components outright
//! 3. Canonicalizing the existing part of the target to resolve symlinks
//! 4. Verifying the result is still under the root

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// The served root directory. Created (with parents) and canonicalized at
/// startup; cheap to clone into per-connection state.
#[derive(Clone, Debug)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn open(root: &Path) -> Result<Sandbox> {
        fs::create_dir_all(root)
            .with_context(|| format!("create root directory {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("canonicalize root {}", root.display()))?;
        Ok(Sandbox { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve request path levels to an absolute path under the root.
    /// `None` means the path escapes the sandbox (or cannot be proven to
    /// stay inside it) and the operation must be denied.
    pub fn resolve(&self, levels: &[String]) -> Option<PathBuf> {
        let mut rel = PathBuf::new();
        for level in levels {
            if level.contains('\0') {
                return None;
            }
            for component in Path::new(level).components() {
                match component {
                    Component::CurDir => {}
                    Component::Normal(s) => rel.push(s),
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return None;
                    }
                }
            }
        }
        let joined = self.root.join(&rel);

        // For existing targets canonicalize the whole path; for targets still
        // to be created canonicalize the nearest existing parent and re-append.
        // Either way a symlink pointing outside the root is caught.
        let resolved = if joined.exists() {
            joined.canonicalize().ok()?
        } else if let Some(parent) = joined.parent() {
            if parent.exists() {
                let canonical_parent = parent.canonicalize().ok()?;
                match joined.file_name() {
                    Some(name) => canonical_parent.join(name),
                    None => canonical_parent,
                }
            } else {
                joined
            }
        } else {
            joined
        };

        if !resolved.starts_with(&self.root) {
            return None;
        }
        Some(resolved)
    }

    /// Recursively enumerate files under `target` (itself a resolved path),
    /// as root-relative level sequences. A plain file yields itself;
    /// directories contribute contained files only. Unreadable entries are
    /// skipped. Sorted for deterministic listings.
    pub fn collect_files(&self, target: &Path) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(target)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let levels: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(levels);
        }
        out
    }
}

/// Open the PUT destination for writing, creating parent directories.
/// Without overwrite the create is exclusive; with it an existing file is
/// truncated.
pub fn create_for_write(path: &Path, overwrite: bool) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut opts = OpenOptions::new();
    opts.write(true);
    if overwrite {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    opts.open(path)
}

/// Delete a file, or a directory tree recursively.
pub fn remove(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn levels(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_safe_paths() {
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::open(tmp.path()).unwrap();

        let p = sandbox.resolve(&levels(&["sub", "file.txt"])).unwrap();
        assert!(p.starts_with(sandbox.root()));
        assert!(p.ends_with("sub/file.txt"));

        // current-dir markers are skipped
        let p = sandbox.resolve(&levels(&["./sub", "./file.txt"])).unwrap();
        assert!(p.ends_with("sub/file.txt"));

        // the root itself
        assert_eq!(sandbox.resolve(&[]).unwrap(), sandbox.root());
    }

    #[test]
    fn resolve_denies_escapes() {
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::open(tmp.path()).unwrap();

        assert_eq!(sandbox.resolve(&levels(&["..", "etc", "passwd"])), None);
        assert_eq!(sandbox.resolve(&levels(&["sub", "..", "..", "x"])), None);
        assert_eq!(sandbox.resolve(&levels(&["a/../../x"])), None);
        assert_eq!(sandbox.resolve(&levels(&["/etc/passwd"])), None);
        assert_eq!(sandbox.resolve(&levels(&["file\0.txt"])), None);
    }

    #[cfg(unix)]
    #[test]
    fn resolve_denies_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::open(tmp.path()).unwrap();
        std::os::unix::fs::symlink(outside.path(), sandbox.root().join("exit")).unwrap();

        assert_eq!(sandbox.resolve(&levels(&["exit"])), None);
        assert_eq!(sandbox.resolve(&levels(&["exit", "new.txt"])), None);
    }

    #[test]
    fn create_for_write_is_exclusive_without_overwrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deep/nested/file.bin");

        let mut f = create_for_write(&path, false).unwrap();
        f.write_all(b"first").unwrap();
        drop(f);
        assert!(create_for_write(&path, false).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"first");
    }

    #[test]
    fn create_for_write_truncates_with_overwrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.bin");
        fs::write(&path, b"old contents").unwrap();

        let mut f = create_for_write(&path, true).unwrap();
        f.write_all(b"new").unwrap();
        drop(f);
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn remove_handles_files_and_trees() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f.txt");
        fs::write(&file, b"x").unwrap();
        remove(&file).unwrap();
        assert!(!file.exists());

        let dir = tmp.path().join("d");
        fs::create_dir_all(dir.join("inner")).unwrap();
        fs::write(dir.join("inner/g.txt"), b"y").unwrap();
        remove(&dir).unwrap();
        assert!(!dir.exists());

        assert!(remove(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn collect_files_returns_sorted_relative_levels() {
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::open(tmp.path()).unwrap();
        fs::create_dir_all(sandbox.root().join("b/sub")).unwrap();
        fs::write(sandbox.root().join("a.txt"), b"1").unwrap();
        fs::write(sandbox.root().join("b/sub/c.txt"), b"2").unwrap();
        fs::create_dir_all(sandbox.root().join("empty")).unwrap();

        let files = sandbox.collect_files(sandbox.root());
        assert_eq!(
            files,
            vec![levels(&["a.txt"]), levels(&["b", "sub", "c.txt"])]
        );

        // a file target yields just itself
        let one = sandbox.collect_files(&sandbox.root().join("a.txt"));
        assert_eq!(one, vec![levels(&["a.txt"])]);

        // an empty directory yields nothing
        assert!(sandbox
            .collect_files(&sandbox.root().join("empty"))
            .is_empty());
    }
}
