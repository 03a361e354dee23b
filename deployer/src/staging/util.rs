use super::STAGING_DIR;
use crate::manager::ApplicationId;
use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
};

/// Staging root of an application, `<home>/.harbor/<application id>`
pub fn staging_root(home: &Path, id: &ApplicationId) -> PathBuf {
    home.join(STAGING_DIR).join(id.to_string())
}

/// Name a local file or directory keeps below the staging root
pub fn remote_name(path: &Path) -> io::Result<&OsStr> {
    path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.to_string_lossy()),
        )
    })
}

/// classpath entry as seen from the staging root
pub fn classpath_entry(root: &Path, remote: &Path) -> String {
    remote
        .strip_prefix(root)
        .unwrap_or(remote)
        .to_string_lossy()
        .into_owned()
}
