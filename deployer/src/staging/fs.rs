use serde::Serialize;
use std::{
    fmt::Debug,
    fs::{self, File},
    io::{self, BufWriter, Write},
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, error};

/// Filesystem shared by the submitting client and every node of the cluster
pub trait SharedFileSystem: Send + Sync + Debug {
    fn exists(&self, path: &Path) -> io::Result<bool>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// upload a single local file, returns the number of bytes written
    fn copy_file(&self, local: &Path, remote: &Path) -> io::Result<u64>;

    /// upload a local directory recursively, returns the number of bytes written
    fn copy_directory(&self, local: &Path, remote: &Path) -> io::Result<u64>;

    /// the file is closed once the returned writer is flushed and dropped
    fn open_for_write(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Shared filesystem mounted at the same paths on every node
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl SharedFileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn copy_file(&self, local: &Path, remote: &Path) -> io::Result<u64> {
        if let Some(parent) = remote.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::copy(local, remote)
    }

    fn copy_directory(&self, local: &Path, remote: &Path) -> io::Result<u64> {
        fs::create_dir_all(remote)?;
        let mut written = 0;

        for entry in fs::read_dir(local)? {
            let entry = entry?;
            let target = remote.join(entry.file_name());

            written += if entry.file_type()?.is_dir() {
                self.copy_directory(&entry.path(), &target)?
            } else {
                fs::copy(entry.path(), target)?
            };
        }

        Ok(written)
    }

    fn open_for_write(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }
}

/// Serialize `value` as yaml into `path` and close the file
pub fn write_yaml<T: Serialize>(
    fs: &dyn SharedFileSystem,
    path: &Path,
    value: &T,
) -> io::Result<()> {
    let mut writer = fs.open_for_write(path)?;

    serde_yaml::to_writer(&mut writer, value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.flush()
}

/// Staging directory on the shared filesystem that is removed on drop unless persisted
#[derive(Debug)]
pub struct StagingDirectory {
    fs: Arc<dyn SharedFileSystem>,
    path: PathBuf,
    persisted: bool,
}

impl StagingDirectory {
    pub fn create(fs: Arc<dyn SharedFileSystem>, path: PathBuf) -> io::Result<Self> {
        fs.create_dir_all(&path)?;

        Ok(Self {
            fs,
            path,
            persisted: false,
        })
    }

    /// keep the directory beyond the lifetime of this value
    pub fn persist(mut self) -> PathBuf {
        self.persisted = true;

        std::mem::take(&mut self.path)
    }
}

impl Drop for StagingDirectory {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }

        match self.fs.remove_dir_all(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed abandoned staging directory"),
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to clean up staging directory"),
        }
    }
}

impl Deref for StagingDirectory {
    type Target = PathBuf;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}
