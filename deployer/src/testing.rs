use crate::{
    config::DeployerConfig,
    deploy::ClusterDescriptor,
    job::{JobDescriptor, Operator},
    manager::local::{LocalCluster, LocalClusterConfig},
    specification::UserJarInclusion,
    staging::fs::{LocalFileSystem, SharedFileSystem},
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tempfile::TempDir;

/// Local cluster session plus a fake distribution, scoped to one test
pub struct Fixture {
    // dropped first so every application is gone before the directory is removed
    pub cluster: Arc<LocalCluster>,
    pub config: DeployerConfig,
    pub lib_dir: PathBuf,
    pub jar: PathBuf,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_cluster(|_| {})
    }

    pub fn with_cluster(configure: impl FnOnce(&mut LocalClusterConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let lib_dir = dir.path().join("dist").join("lib");

        fs::create_dir_all(lib_dir.join("plugins")).unwrap();
        fs::write(lib_dir.join("harbor-dist.jar"), b"dist").unwrap();
        fs::write(lib_dir.join("log4j.properties"), b"rootLogger.level = INFO").unwrap();
        fs::write(lib_dir.join("plugins").join("metrics.jar"), b"metrics").unwrap();

        let jar = dir.path().join("harbor-tests.jar");
        fs::write(&jar, b"tests").unwrap();

        let mut cluster_config = LocalClusterConfig::new(dir.path().join("cluster"));
        cluster_config.exit_delay = Duration::from_millis(50);
        configure(&mut cluster_config);

        let mut config = DeployerConfig::with_lib_dir(&lib_dir);
        config.classpath_include_user_jar = UserJarInclusion::Disabled;

        Self {
            cluster: Arc::new(LocalCluster::start(cluster_config).unwrap()),
            config,
            lib_dir,
            jar,
            dir,
        }
    }

    pub fn descriptor(&self) -> ClusterDescriptor {
        ClusterDescriptor::new(
            self.config.clone(),
            self.cluster.clone(),
            Arc::new(LocalFileSystem),
        )
        .unwrap()
    }

    /// copy the library directory somewhere else and configure it as provided
    pub fn provide_lib_dir(&mut self) -> PathBuf {
        let provided = self.dir.path().join("provided-lib");

        LocalFileSystem
            .copy_directory(&self.lib_dir, &provided)
            .unwrap();
        self.config.provided_lib_dirs = Some(vec![provided.clone()]);

        provided
    }

    pub fn staging_base(&self) -> PathBuf {
        self.cluster.home_directory().join(".harbor")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// parallelism 2, a source without data shuffled into a discarding sink
pub fn testing_job(jar: &Path) -> JobDescriptor {
    let mut job = JobDescriptor::builder("testing job")
        .parallelism(2)
        .source(Operator::NoDataSource)
        .shuffle()
        .sink(Operator::DiscardingSink)
        .build();

    job.add_jar(jar);
    job
}
