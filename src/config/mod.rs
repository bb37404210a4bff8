use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::DEFAULT_SAMPLES;
use crate::detector::{DEFAULT_EXPECTED_MIN_VERSION, DetectorConfig};
use crate::prompt::DEFAULT_TRUST_PROMPT_PATTERNS;
use crate::target::{ChainedResolver, InstallRootTargets, StaticTargets, TargetResolver};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".startup-bench";

fn default_samples() -> u32 {
    DEFAULT_SAMPLES
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_stabilization_delay_ms() -> u64 {
    500
}

fn default_trust_prompt_response_delay_ms() -> u64 {
    100
}

fn default_expected_min_version() -> String {
    DEFAULT_EXPECTED_MIN_VERSION.to_string()
}

fn default_trust_prompt_patterns() -> Vec<String> {
    DEFAULT_TRUST_PROMPT_PATTERNS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BenchSettings {
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra arguments passed to every target.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            timeout_ms: default_timeout_ms(),
            args: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorSettings {
    #[serde(default = "default_stabilization_delay_ms")]
    pub stabilization_delay_ms: u64,
    #[serde(default = "default_trust_prompt_response_delay_ms")]
    pub trust_prompt_response_delay_ms: u64,
    #[serde(default = "default_expected_min_version")]
    pub expected_min_version: String,
    #[serde(default = "default_trust_prompt_patterns")]
    pub trust_prompt_patterns: Vec<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            stabilization_delay_ms: default_stabilization_delay_ms(),
            trust_prompt_response_delay_ms: default_trust_prompt_response_delay_ms(),
            expected_min_version: default_expected_min_version(),
            trust_prompt_patterns: default_trust_prompt_patterns(),
        }
    }
}

impl DetectorSettings {
    pub fn to_detector_config(&self, timeout: Duration) -> DetectorConfig {
        DetectorConfig {
            timeout,
            stabilization_delay: Duration::from_millis(self.stabilization_delay_ms),
            trust_prompt_response_delay: Duration::from_millis(
                self.trust_prompt_response_delay_ms,
            ),
            expected_min_version: self.expected_min_version.clone(),
            trust_prompt_patterns: self.trust_prompt_patterns.clone(),
        }
    }
}

/// Side-by-side installs laid out as `<root>/<version>/<binary>`.
///
/// ```toml
/// [install]
/// root = "~/.cache/cli-versions"
/// binary = "bin/cli"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstallSettings {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub bench: BenchSettings,
    #[serde(default)]
    pub detector: DetectorSettings,
    /// Explicit `version = "executable"` table.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
    #[serde(default)]
    pub install: InstallSettings,
}

impl BenchConfig {
    /// Search upward from `start` for a `.startup-bench/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: BenchConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((BenchConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.bench.timeout_ms)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        self.detector.to_detector_config(self.timeout())
    }

    /// Resolver consulting `[targets]` first, then the install root when one
    /// is configured.
    pub fn resolver(&self, work_dir: &Path) -> ChainedResolver {
        let mut resolvers: Vec<Box<dyn TargetResolver>> = vec![Box::new(
            StaticTargets::new(self.targets.clone(), work_dir).with_args(self.bench.args.clone()),
        )];
        if let (Some(root), Some(binary)) = (&self.install.root, &self.install.binary) {
            resolvers.push(Box::new(
                InstallRootTargets::new(root, binary, work_dir).with_args(self.bench.args.clone()),
            ));
        }
        ChainedResolver::new(resolvers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = BenchConfig::default();
        assert_eq!(config.bench.samples, 3);
        assert_eq!(config.bench.timeout_ms, 30_000);
        assert!(config.bench.args.is_empty());
        assert_eq!(config.detector.stabilization_delay_ms, 500);
        assert_eq!(config.detector.trust_prompt_response_delay_ms, 100);
        assert_eq!(config.detector.expected_min_version, "1.0.24");
        assert_eq!(
            config.detector.trust_prompt_patterns,
            vec!["Do you trust the files in this folder?", "Yes, proceed"]
        );
        assert!(config.targets.is_empty());
        assert!(config.install.root.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[bench]
samples = 5
timeout_ms = 10000
args = ["--no-update"]

[detector]
stabilization_delay_ms = 750
trust_prompt_response_delay_ms = 250
expected_min_version = "2.0.0"
trust_prompt_patterns = ["Trust this workspace?"]

[targets]
"1.0.24" = "/opt/cli/1.0.24/cli"
"1.0.30" = "/opt/cli/1.0.30/cli"

[install]
root = "/opt/cli"
binary = "bin/cli"
"#;
        let config: BenchConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bench.samples, 5);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.bench.args, vec!["--no-update"]);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.install.root.as_deref(), Some(Path::new("/opt/cli")));

        let detector = config.detector_config();
        assert_eq!(detector.timeout, Duration::from_secs(10));
        assert_eq!(detector.stabilization_delay, Duration::from_millis(750));
        assert_eq!(detector.trust_prompt_response_delay, Duration::from_millis(250));
        assert_eq!(detector.expected_min_version, "2.0.0");
        assert_eq!(detector.trust_prompt_patterns, vec!["Trust this workspace?"]);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[bench]
samples = 1
"#;
        let config: BenchConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bench.samples, 1);
        assert_eq!(config.bench.timeout_ms, 30_000);
        assert_eq!(config.detector.stabilization_delay_ms, 500);
        assert_eq!(config.detector.trust_prompt_patterns.len(), 2);
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let toml = r#"
[bench]
samples = "three"
"#;
        assert!(toml::from_str::<BenchConfig>(toml).is_err());
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".startup-bench");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[bench]
timeout_ms = 5000
"#,
        )
        .unwrap();

        let (config, path) = BenchConfig::load(tmp.path()).unwrap();
        assert_eq!(path, Some(dir.join("config.toml")));
        assert_eq!(config.bench.timeout_ms, 5000);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = BenchConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.bench.samples, 3);
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".startup-bench");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.toml"), "[bench\n").unwrap();

        let err = BenchConfig::load(tmp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse"));
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".startup-bench");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[targets]
"1.0.0" = "cli-one"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = BenchConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.targets.get("1.0.0").unwrap(), "cli-one");
    }

    #[test]
    fn resolver_prefers_targets_then_install_root() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = BenchConfig::default();
        config.bench.args = vec!["--quiet".to_string()];
        config
            .targets
            .insert("1.0.0".to_string(), "cli-one".to_string());
        config.install.root = Some(tmp.path().to_path_buf());
        config.install.binary = Some(PathBuf::from("cli"));

        let installed = tmp.path().join("2.0.0").join("cli");
        fs::create_dir_all(installed.parent().unwrap()).unwrap();
        fs::write(&installed, "").unwrap();

        let resolver = config.resolver(tmp.path());
        let one = resolver.resolve("1.0.0").unwrap();
        assert_eq!(one.program, "cli-one");
        assert_eq!(one.args, vec!["--quiet"]);
        assert_eq!(
            resolver.resolve("2.0.0").unwrap().program,
            installed.to_string_lossy()
        );
        assert!(resolver.resolve("3.0.0").is_err());
    }
}
