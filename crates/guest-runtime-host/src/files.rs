//! Sandboxed filesystem capabilities (`file` module).
//!
//! Guest paths are always relative to the configured sandbox root. `..` may
//! not climb above the root and symlinks may not lead out of it. Without a
//! configured root every call fails with its safe default.

use std::io;
use std::path::{Component, Path, PathBuf};

use guest_runtime_common::{HostFunctionError, RuntimeError};
use guest_runtime_core::GuestState;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use crate::bridge::{flag, link_error, text_arg, text_result};

const MODULE: &str = "file";

/// A directory the guest may read and write below.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Open the sandbox at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a guest path onto the host filesystem.
    ///
    /// # Errors
    ///
    /// [`HostFunctionError::SandboxViolation`] when the path leaves the root.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, RuntimeError> {
        let violation = || HostFunctionError::SandboxViolation {
            path: guest_path.to_string(),
        };

        if guest_path.contains('\0') {
            return Err(violation().into());
        }

        let mut relative = PathBuf::new();
        for component in Path::new(guest_path).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(violation().into());
                    }
                }
                Component::Prefix(_) => return Err(violation().into()),
            }
        }

        let path = self.root.join(relative);

        // The deepest entry that exists decides where symlinks lead.
        let mut existing = path.as_path();
        while existing.symlink_metadata().is_err() {
            existing = existing.parent().ok_or_else(violation)?;
        }
        let real = existing.canonicalize().map_err(|_| violation())?;
        if !real.starts_with(&self.root) {
            return Err(violation().into());
        }

        Ok(path)
    }

    pub async fn read(&self, path: &str) -> Result<String, RuntimeError> {
        let bytes = tokio::fs::read(self.resolve(path)?).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write or append `contents`, creating parent directories.
    pub async fn write(&self, path: &str, contents: &str, append: bool) -> Result<(), RuntimeError> {
        let target = self.resolve(path)?;
        if target == self.root {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot write to sandbox root").into());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&target)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(target) => tokio::fs::try_exists(target).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Remove a file or an empty directory.
    pub async fn delete(&self, path: &str) -> Result<(), RuntimeError> {
        let target = self.resolve(path)?;
        if target == self.root {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot delete sandbox root").into());
        }

        if tokio::fs::symlink_metadata(&target).await?.is_dir() {
            tokio::fs::remove_dir(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    /// Entry names in a directory, sorted.
    pub async fn list(&self, path: &str) -> Result<Vec<String>, RuntimeError> {
        let mut entries = tokio::fs::read_dir(self.resolve(path)?).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

fn sandbox(caller: &Caller<'_, GuestState>) -> Option<Sandbox> {
    let root = caller.data().services().settings().sandbox_root.as_ref()?;
    Sandbox::new(root)
        .map_err(|e| warn!(root = %root.display(), error = %e, "Sandbox root unavailable"))
        .ok()
}

fn report<T>(capability: &str, path: &str, result: Result<T, RuntimeError>) -> Option<T> {
    result
        .map_err(|e| debug!(capability, path, error = %e, "File operation failed"))
        .ok()
}

/// Register the `file` capabilities.
#[allow(clippy::too_many_lines)]
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            MODULE,
            "file_read",
            |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let path = text_arg(&mut caller, "file_read", ptr, len);
                    let Some(sandbox) = sandbox(&caller) else {
                        return 0;
                    };
                    match report("file_read", &path, sandbox.read(&path).await) {
                        Some(contents) => text_result(&mut caller, "file_read", &contents).await,
                        None => 0,
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "file_read", &e))?;

    for (name, append) in [("file_write", false), ("file_append", true)] {
        linker
            .func_wrap_async(
                MODULE,
                name,
                move |mut caller: Caller<'_, GuestState>,
                      (path_ptr, path_len, data_ptr, data_len): (i32, i32, i32, i32)| {
                    Box::new(async move {
                        let path = text_arg(&mut caller, name, path_ptr, path_len);
                        let contents = text_arg(&mut caller, name, data_ptr, data_len);
                        let Some(sandbox) = sandbox(&caller) else {
                            return 0;
                        };
                        let written = sandbox.write(&path, &contents, append).await;
                        flag(report(name, &path, written).is_some())
                    })
                },
            )
            .map_err(|e| link_error(MODULE, name, &e))?;
    }

    linker
        .func_wrap_async(
            MODULE,
            "file_exists",
            |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let path = text_arg(&mut caller, "file_exists", ptr, len);
                    match sandbox(&caller) {
                        Some(sandbox) => flag(sandbox.exists(&path).await),
                        None => 0,
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "file_exists", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "file_delete",
            |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let path = text_arg(&mut caller, "file_delete", ptr, len);
                    let Some(sandbox) = sandbox(&caller) else {
                        return 0;
                    };
                    let deleted = sandbox.delete(&path).await;
                    flag(report("file_delete", &path, deleted).is_some())
                })
            },
        )
        .map_err(|e| link_error(MODULE, "file_delete", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "file_list",
            |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let path = text_arg(&mut caller, "file_list", ptr, len);
                    let Some(sandbox) = sandbox(&caller) else {
                        return 0;
                    };
                    match report("file_list", &path, sandbox.list(&path).await) {
                        Some(names) => {
                            let json = serde_json::to_string(&names).unwrap_or_else(|_| "[]".into());
                            text_result(&mut caller, "file_list", &json).await
                        }
                        None => 0,
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "file_list", &e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path().join("data")).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn test_resolve_stays_inside_root() {
        let (_dir, sandbox) = sandbox();

        assert_eq!(sandbox.resolve("a/b.txt").unwrap(), sandbox.root().join("a/b.txt"));
        assert_eq!(sandbox.resolve("/a/./b.txt").unwrap(), sandbox.root().join("a/b.txt"));
        assert_eq!(sandbox.resolve("a/../b.txt").unwrap(), sandbox.root().join("b.txt"));
        assert_eq!(sandbox.resolve("").unwrap(), sandbox.root());
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let (_dir, sandbox) = sandbox();

        for path in ["..", "../etc/passwd", "a/../../x", "/../x", "nul\0byte"] {
            let err = sandbox.resolve(path).unwrap_err();
            assert!(
                matches!(err, RuntimeError::HostFunction(HostFunctionError::SandboxViolation { .. })),
                "{path}: {err}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (dir, sandbox) = sandbox();
        let outside = dir.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, sandbox.root().join("link")).unwrap();

        assert!(sandbox.resolve("link/secret.txt").is_err());
        assert!(sandbox.resolve("link").is_err());
    }

    #[tokio::test]
    async fn test_write_read_append_list_delete() {
        let (_dir, sandbox) = sandbox();

        sandbox.write("notes/today.txt", "hello", false).await.unwrap();
        sandbox.write("notes/today.txt", " world", true).await.unwrap();
        assert_eq!(sandbox.read("notes/today.txt").await.unwrap(), "hello world");

        sandbox.write("notes/today.txt", "replaced", false).await.unwrap();
        assert_eq!(sandbox.read("notes/today.txt").await.unwrap(), "replaced");

        sandbox.write("notes/a.txt", "", false).await.unwrap();
        assert_eq!(sandbox.list("notes").await.unwrap(), vec!["a.txt", "today.txt"]);

        assert!(sandbox.exists("notes/a.txt").await);
        sandbox.delete("notes/a.txt").await.unwrap();
        assert!(!sandbox.exists("notes/a.txt").await);
        assert!(!sandbox.exists("../escape").await);
    }

    #[tokio::test]
    async fn test_root_cannot_be_deleted_or_overwritten() {
        let (_dir, sandbox) = sandbox();

        assert!(sandbox.delete("").await.is_err());
        assert!(sandbox.write("/", "x", false).await.is_err());
        assert!(sandbox.read("missing.txt").await.is_err());
    }
}
