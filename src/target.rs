//! Target resolution.
//!
//! Installing versions is someone else's job; this layer only maps a version
//! label to the command that starts it. The trial driver consumes the
//! resulting `SpawnConfig` without knowing where it came from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Configuration for spawning a target process.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnConfig {
    /// The program to execute (bare name or path).
    pub program: String,
    /// Arguments to pass to the program.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub work_dir: String,
    /// Environment variables to set (key, value pairs).
    pub env: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(program: impl Into<String>, work_dir: &Path) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            work_dir: work_dir.to_string_lossy().to_string(),
            env: vec![],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no executable configured for version {0}")]
    Unknown(String),
    #[error("executable for version {version} not found at {}", path.display())]
    Missing { version: String, path: PathBuf },
}

/// Maps a version label to a spawnable command.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, version: &str) -> Result<SpawnConfig, ResolveError>;
}

/// Explicit `version → executable` table.
pub struct StaticTargets {
    targets: BTreeMap<String, String>,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl StaticTargets {
    pub fn new(targets: BTreeMap<String, String>, work_dir: &Path) -> Self {
        Self {
            targets,
            args: vec![],
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl TargetResolver for StaticTargets {
    fn resolve(&self, version: &str) -> Result<SpawnConfig, ResolveError> {
        let program = self
            .targets
            .get(version)
            .ok_or_else(|| ResolveError::Unknown(version.to_string()))?;
        Ok(SpawnConfig::new(program.clone(), &self.work_dir).with_args(self.args.clone()))
    }
}

/// Versions installed side by side as `<root>/<version>/<binary>`.
pub struct InstallRootTargets {
    root: PathBuf,
    binary: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl InstallRootTargets {
    pub fn new(root: &Path, binary: &Path, work_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            binary: binary.to_path_buf(),
            args: vec![],
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Where `version` is expected to live.
    pub fn binary_path(&self, version: &str) -> PathBuf {
        self.root.join(version).join(&self.binary)
    }
}

impl TargetResolver for InstallRootTargets {
    fn resolve(&self, version: &str) -> Result<SpawnConfig, ResolveError> {
        let path = self.binary_path(version);
        if !path.is_file() {
            return Err(ResolveError::Missing {
                version: version.to_string(),
                path,
            });
        }
        Ok(
            SpawnConfig::new(path.to_string_lossy(), &self.work_dir)
                .with_args(self.args.clone()),
        )
    }
}

/// Tries each resolver in order; reports the last error when all fail.
pub struct ChainedResolver {
    resolvers: Vec<Box<dyn TargetResolver>>,
}

impl ChainedResolver {
    pub fn new(resolvers: Vec<Box<dyn TargetResolver>>) -> Self {
        Self { resolvers }
    }
}

impl TargetResolver for ChainedResolver {
    fn resolve(&self, version: &str) -> Result<SpawnConfig, ResolveError> {
        let mut last = ResolveError::Unknown(version.to_string());
        for resolver in &self.resolvers {
            match resolver.resolve(version) {
                Ok(spawn) => return Ok(spawn),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}
