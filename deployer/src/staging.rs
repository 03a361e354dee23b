pub mod collector;
pub mod fs;
pub mod util;


use self::{
    collector::Collector,
    fs::{write_yaml, SharedFileSystem, StagingDirectory},
    util::{classpath_entry, remote_name, staging_root},
};
use crate::{
    config::DeployerConfig,
    deploy::DeployError,
    job::JobDescriptor,
    manager::ApplicationId,
    specification::{DeploymentRequest, UserJarInclusion},
};
use globset::GlobSet;
use std::{
    collections::BTreeMap,
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, instrument};

/// directory below the resource manager home that holds all staging roots
pub const STAGING_DIR: &str = ".harbor";
/// distributed cache files are uploaded below this directory of the staging root
pub const CACHE_DIR: &str = "cache";
pub const JOB_FILE: &str = "job.yaml";
pub const CONFIG_FILE: &str = "harbor-conf.yaml";

/// Local artifacts and the remote paths they were uploaded to, for a single application
#[derive(Debug)]
pub struct StagingManifest {
    id: ApplicationId,
    directory: StagingDirectory,
    entries: BTreeMap<PathBuf, PathBuf>,
    classpath: Vec<String>,
    shared_lib_dirs: Vec<PathBuf>,
    job_file: PathBuf,
}

impl StagingManifest {
    pub fn id(&self) -> &ApplicationId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.directory
    }

    /// local path -> remote path
    pub fn entries(&self) -> &BTreeMap<PathBuf, PathBuf> {
        &self.entries
    }

    pub fn classpath(&self) -> &[String] {
        &self.classpath
    }

    pub fn shared_lib_dirs(&self) -> &[PathBuf] {
        &self.shared_lib_dirs
    }

    pub fn job_file(&self) -> &Path {
        &self.job_file
    }

    /// keep the staging root after the manifest is gone, cleanup moves to teardown
    pub(crate) fn persist(self) -> PathBuf {
        self.directory.persist()
    }
}

pub struct ArtifactStager<'a> {
    fs: &'a Arc<dyn SharedFileSystem>,
    config: &'a DeployerConfig,
    excludes: &'a GlobSet,
    home: PathBuf,
}

impl<'a> ArtifactStager<'a> {
    pub fn new(
        fs: &'a Arc<dyn SharedFileSystem>,
        config: &'a DeployerConfig,
        excludes: &'a GlobSet,
        home: PathBuf,
    ) -> Self {
        Self {
            fs,
            config,
            excludes,
            home,
        }
    }

    pub fn staging_root(&self, id: &ApplicationId) -> PathBuf {
        staging_root(&self.home, id)
    }

    /// Upload everything the application needs below its staging root.
    /// The root is removed again if any upload fails.
    #[instrument(skip_all, fields(app = %id), level = "info")]
    pub fn stage(
        &self,
        request: &DeploymentRequest,
        job: &JobDescriptor,
        id: ApplicationId,
    ) -> Result<StagingManifest, DeployError> {
        let root = self.staging_root(&id);
        let failed = |path: &Path| {
            let path = path.to_path_buf();

            move |source: io::Error| DeployError::StagingIOError {
                app: id,
                path,
                source,
            }
        };

        let directory =
            StagingDirectory::create(self.fs.clone(), root.clone()).map_err(failed(&root))?;
        let mut entries = BTreeMap::new();
        let mut lib_classpath = Vec::new();

        if request.has_provided_lib_dirs() {
            for dir in request.provided_lib_dirs() {
                if !self.fs.exists(dir).map_err(failed(dir))? {
                    return Err(failed(dir)(io::Error::new(
                        io::ErrorKind::NotFound,
                        "provided library directory does not exist",
                    )));
                }

                lib_classpath.push(dir.to_string_lossy().into_owned());
            }

            info!(
                provided = ?request.provided_lib_dirs(),
                "Library directory is provided, skipping upload of {}",
                request.lib_dir().to_string_lossy()
            );
        } else {
            let lib_dir = request.lib_dir();
            let remote_lib = root.join(remote_name(lib_dir).map_err(failed(lib_dir))?);
            let collector = Collector::load(lib_dir, self.excludes).map_err(failed(lib_dir))?;

            self.fs
                .create_dir_all(&remote_lib)
                .map_err(failed(&remote_lib))?;

            for relative in collector {
                let local = lib_dir.join(&relative);
                let remote = remote_lib.join(&relative);

                self.fs.copy_file(&local, &remote).map_err(failed(&remote))?;
                lib_classpath.push(classpath_entry(&root, &remote));
                entries.insert(local, remote);
            }

            debug!(files = lib_classpath.len(), "Uploaded library directory");
        }

        // names the deployment itself writes below the root
        let mut reserved = vec![root.join(JOB_FILE), root.join(CONFIG_FILE), root.join(CACHE_DIR)];
        if let Ok(lib_name) = remote_name(request.lib_dir()) {
            reserved.push(root.join(lib_name));
        }

        let mut user_classpath = Vec::new();
        for jar in request.user_jars() {
            let remote = root.join(remote_name(jar).map_err(failed(jar))?);

            if entries.get(jar) == Some(&remote) {
                debug!(jar = ?jar, "User jar is listed twice, staging it once");
                continue;
            }
            claim(&entries, &reserved, &remote).map_err(failed(jar))?;

            self.fs.copy_file(jar, &remote).map_err(failed(jar))?;
            user_classpath.push(classpath_entry(&root, &remote));
            entries.insert(jar.clone(), remote);
        }

        for cache in job.cache_files.iter() {
            if !is_single_component(&cache.name) {
                return Err(failed(&cache.path)(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cache file name '{}' must be a plain file name", cache.name),
                )));
            }

            let remote = root.join(CACHE_DIR).join(&cache.name);
            claim(&entries, &[], &remote).map_err(failed(&cache.path))?;

            let uploaded = if cache.path.is_dir() {
                self.fs.copy_directory(&cache.path, &remote)
            } else {
                self.fs.copy_file(&cache.path, &remote)
            };

            uploaded.map_err(failed(&cache.path))?;
            entries.insert(cache.path.clone(), remote);
        }

        let job_file = root.join(JOB_FILE);
        write_yaml(self.fs.as_ref(), &job_file, job).map_err(failed(&job_file))?;

        let config_file = root.join(CONFIG_FILE);
        write_yaml(self.fs.as_ref(), &config_file, self.config).map_err(failed(&config_file))?;

        let classpath = match request.user_jar_inclusion() {
            UserJarInclusion::IncludeFirst => user_classpath.into_iter().chain(lib_classpath).collect(),
            UserJarInclusion::IncludeLast => lib_classpath.into_iter().chain(user_classpath).collect(),
            UserJarInclusion::Disabled => lib_classpath,
        };

        info!(
            root = ?root,
            uploaded = entries.len(),
            "Staged application files"
        );

        Ok(StagingManifest {
            id,
            directory,
            entries,
            classpath,
            shared_lib_dirs: request.provided_lib_dirs().to_vec(),
            job_file,
        })
    }
}

/// fails if `remote` is reserved or already holds another uploaded file
fn claim(entries: &BTreeMap<PathBuf, PathBuf>, reserved: &[PathBuf], remote: &Path) -> io::Result<()> {
    if reserved.iter().chain(entries.values()).any(|taken| taken == remote) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is already staged", remote.to_string_lossy()),
        ));
    }

    Ok(())
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();

    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// true if the library directory is present below the staging root of `id`
pub fn verify_staging(
    fs: &dyn SharedFileSystem,
    home: &Path,
    config: &DeployerConfig,
    id: &ApplicationId,
) -> io::Result<bool> {
    let lib = staging_root(home, id).join(remote_name(&config.lib_dir)?);

    fs.exists(&lib)
}

/// true if the library directory was uploaded exactly when no provided library directories are set
pub fn staging_matches_policy(
    fs: &dyn SharedFileSystem,
    home: &Path,
    config: &DeployerConfig,
    id: &ApplicationId,
) -> io::Result<bool> {
    Ok(verify_staging(fs, home, config, id)? != config.has_provided_lib_dirs())
}
