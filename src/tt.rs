//! Tarball Transfer (TT): moves a directory or file between local and
//! remote safely, layered entirely on [`RemoteShell`].

use crate::error::Error;
use crate::rsh::RemoteShell;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-host staging directories, created with mode 0700 before use.
pub struct TarballTransfer<'a> {
    shell: &'a dyn RemoteShell,
    local_staging: PathBuf,
    remote_staging: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathType {
    File,
    Directory,
}

impl<'a> TarballTransfer<'a> {
    pub fn new(shell: &'a dyn RemoteShell, local_staging: PathBuf, remote_staging: String) -> Self {
        TarballTransfer {
            shell,
            local_staging,
            remote_staging,
        }
    }

    fn archive_name() -> String {
        format!("transfer-{}.tar.gz", &uuid::Uuid::new_v4().simple().to_string()[..8])
    }

    fn ensure_local_staging(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.local_staging)
            .map_err(|e| Error::structure(self.local_staging.display().to_string(), e))?;
        set_mode_0700(&self.local_staging)?;
        Ok(())
    }

    async fn ensure_remote_staging(&self) -> Result<(), Error> {
        self.shell
            .execute(
                &format!("mkdir -p -m 0700 {}", self.remote_staging),
                true,
                &[],
            )
            .await?;
        Ok(())
    }

    async fn local_type(&self, path: &Path) -> Result<PathType, Error> {
        if path.is_dir() {
            Ok(PathType::Directory)
        } else if path.is_file() {
            Ok(PathType::File)
        } else {
            Err(Error::NotFound {
                host: "localhost".to_string(),
                path: path.display().to_string(),
            })
        }
    }

    async fn remote_type(&self, path: &str) -> Result<PathType, Error> {
        let exists = self
            .shell
            .execute(&format!("[ -e {path} ]"), false, &[])
            .await?;
        if exists.exit_code != 0 {
            return Err(Error::NotFound {
                host: self.shell.host().to_string(),
                path: path.to_string(),
            });
        }
        let is_dir = self
            .shell
            .execute(&format!("[ -d {path} ]"), false, &[])
            .await?;
        Ok(if is_dir.exit_code == 0 {
            PathType::Directory
        } else {
            PathType::File
        })
    }

    /// Packs `src` into a gzipped archive in a local staging directory,
    /// transfers it, unpacks it in a remote staging directory, and moves it
    /// into `dst`.
    pub async fn send(&self, src: &Path, dst: &str) -> Result<(), Error> {
        self.ensure_local_staging()?;
        self.ensure_remote_staging().await?;

        let src_type = self.local_type(src).await?;
        let archive = self.local_staging.join(Self::archive_name());

        let parent = src.parent().unwrap_or(Path::new("."));
        let base = src.file_name().and_then(|n| n.to_str()).unwrap_or(".");
        let pack = std::process::Command::new("tar")
            .arg("-C")
            .arg(parent)
            .arg("-czf")
            .arg(&archive)
            .arg(base)
            .output()
            .map_err(|e| Error::structure(src.display().to_string(), e))?;
        let cleanup = || {
            let _ = fs::remove_file(&archive);
        };
        if !pack.status.success() {
            cleanup();
            return Err(Error::structure(src.display().to_string(), "tar pack failed"));
        }

        let remote_archive = format!("{}/{}", self.remote_staging, Self::archive_name());
        if let Err(e) = self.shell.put(&archive, &remote_archive).await {
            cleanup();
            return Err(e);
        }

        let unpack_cmd = match src_type {
            PathType::Directory => format!(
                "mkdir -p -m 0700 {dst} && tar -C {dst} -xpzf {remote_archive} --strip-components=1"
            ),
            PathType::File => {
                let dst_path = Path::new(dst);
                let parent = dst_path.parent().and_then(|p| p.to_str()).unwrap_or(".");
                format!("mkdir -p -m 0700 {parent} && tar -C {parent} -xpzf {remote_archive}")
            }
        };
        let result = self.shell.execute(&unpack_cmd, true, &[]).await;
        let _ = self
            .shell
            .execute(&format!("rm -f {remote_archive}"), false, &[])
            .await;
        cleanup();
        result.map(|_| ())
    }

    /// Symmetric with [`Self::send`]: probes remote existence/type via
    /// `execute(can_fail=false)`; a missing remote source raises not-found.
    pub async fn receive(&self, src: &str, dst: &Path) -> Result<(), Error> {
        self.ensure_local_staging()?;
        self.ensure_remote_staging().await?;

        let src_type = self.remote_type(src).await?;
        let remote_archive = format!("{}/{}", self.remote_staging, Self::archive_name());
        let pack_cmd = match src_type {
            PathType::Directory => format!("tar -C {src} -czf {remote_archive} ."),
            PathType::File => {
                let src_path = Path::new(src);
                let parent = src_path.parent().and_then(|p| p.to_str()).unwrap_or(".");
                let base = src_path.file_name().and_then(|n| n.to_str()).unwrap_or(src);
                format!("tar -C {parent} -czf {remote_archive} {base}")
            }
        };
        let pack_result = self.shell.execute(&pack_cmd, true, &[]).await;
        if pack_result.is_err() {
            let _ = self
                .shell
                .execute(&format!("rm -f {remote_archive}"), false, &[])
                .await;
            return pack_result.map(|_| ());
        }

        let archive = self.local_staging.join(Self::archive_name());
        let fetch = self.shell.get(&remote_archive, &archive).await;
        let _ = self
            .shell
            .execute(&format!("rm -f {remote_archive}"), false, &[])
            .await;
        fetch?;

        let final_dst = match src_type {
            PathType::Directory => dst.to_path_buf(),
            PathType::File if dst.is_dir() => {
                let basename = Path::new(src).file_name().unwrap_or_default();
                dst.join(basename)
            }
            PathType::File => dst.to_path_buf(),
        };
        fs::create_dir_all(final_dst.parent().unwrap_or(Path::new(".")))
            .map_err(|e| Error::structure(final_dst.display().to_string(), e))?;

        let unpack = std::process::Command::new("tar")
            .arg("-C")
            .arg(final_dst.parent().unwrap_or(Path::new(".")))
            .arg("-xpzf")
            .arg(&archive)
            .output()
            .map_err(|e| Error::structure(final_dst.display().to_string(), e))?;
        let _ = fs::remove_file(&archive);
        if !unpack.status.success() {
            return Err(Error::structure(final_dst.display().to_string(), "tar unpack failed"));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode_0700(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::structure(path.display().to_string(), e))
}

#[cfg(not(unix))]
fn set_mode_0700(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsh::fake::FakeShell;
    use crate::rsh::Output as ShOutput;

    mod receive {
        use super::*;

        #[tokio::test]
        async fn missing_remote_source_is_not_found() {
            let shell = FakeShell::new("h1");
            shell.push_ok(ShOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }); // mkdir -p remote staging
            shell.push_ok(ShOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: String::new(),
            }); // [ -e src ] fails

            let local = tempfile::tempdir().unwrap();
            let tt = TarballTransfer::new(
                &shell,
                local.path().join("staging"),
                "/tmp/remote-staging".to_string(),
            );
            let result = tt.receive("/no/such/path", local.path()).await;
            assert!(matches!(result, Err(Error::NotFound { .. })));
        }
    }
}
