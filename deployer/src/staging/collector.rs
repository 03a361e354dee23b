use globset::GlobSet;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Files below a local directory that have to be uploaded, relative to that directory
#[derive(Debug, Clone)]
pub struct Collector {
    root: PathBuf,
    // kept in reverse order so `next` can pop
    paths: Vec<PathBuf>,
}

impl Collector {
    /// walk `root` and keep every regular file not matched by `excludes`
    pub fn load(root: &Path, excludes: &GlobSet) -> io::Result<Self> {
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", root.to_string_lossy()),
            ));
        }

        let mut builder = WalkBuilder::new(root);
        // ship everything, hidden files and ignore files included
        builder.standard_filters(false).follow_links(true);

        let mut paths = Vec::new();
        for entry in builder.build() {
            let entry = entry.map_err(|error| {
                let message = error.to_string();
                error
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message))
            })?;

            if !entry.file_type().is_some_and(|kind| kind.is_file()) {
                continue;
            }

            let relative = relative_path(root, &entry);
            if excludes.is_match(&relative)
                || relative
                    .file_name()
                    .is_some_and(|name| excludes.is_match(name))
            {
                debug!(path = ?relative, "Excluded from upload");
                continue;
            }

            paths.push(relative);
        }

        if paths.is_empty() {
            warn!(root = ?root, "Nothing to upload below directory");
        }

        Ok(Self {
            root: root.to_path_buf(),
            paths: paths.into_iter().sorted().rev().collect_vec(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn relative_path(root: &Path, entry: &DirEntry) -> PathBuf {
    entry
        .path()
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| entry.path().to_path_buf())
}

impl Iterator for Collector {
    type Item = PathBuf;

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.paths.len(), Some(self.paths.len()))
    }

    /// next file in lexicographic order
    fn next(&mut self) -> Option<Self::Item> {
        self.paths.pop()
    }
}
