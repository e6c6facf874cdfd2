//! Vision stages run as hloc subprocesses.
//!
//! Each stage is a short Python driver executed with the configured
//! interpreter. The resolved stage configuration is handed over as JSON so
//! registry overrides reach the vision code unchanged. Children are spawned
//! with `kill_on_drop`, which turns a dropped stage future into a killed
//! process.

use super::{feature_path, match_path, StageFuture, VisionBackend};
use crate::config::VisionConfig;
use crate::registry::StageConf;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

const EXTRACT_DRIVER: &str = r#"
import json, sys
from pathlib import Path
from {package} import extract_features
conf = json.loads(sys.argv[1])
print(extract_features.main(conf, Path(sys.argv[2]), Path(sys.argv[3])))
"#;

const PAIRS_DRIVER: &str = r#"
import sys
from pathlib import Path
from {package} import pairs_from_retrieval
pairs_from_retrieval.main(Path(sys.argv[1]), Path(sys.argv[2]), num_matched=int(sys.argv[3]))
print(sys.argv[2])
"#;

const MATCH_DRIVER: &str = r#"
import json, sys
from pathlib import Path
from {package} import match_features
conf = json.loads(sys.argv[1])
print(match_features.main(conf, Path(sys.argv[2]), sys.argv[3], Path(sys.argv[4])))
"#;

const RECONSTRUCT_DRIVER: &str = r#"
import sys
from pathlib import Path
from {package} import reconstruction
model = reconstruction.main(Path(sys.argv[1]), Path(sys.argv[2]), Path(sys.argv[3]), Path(sys.argv[4]), Path(sys.argv[5]))
if model is None:
    sys.exit("reconstruction did not produce a model")
print(sys.argv[1])
"#;

/// Lines of child stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Backend running the hloc toolbox through a Python interpreter.
#[derive(Debug, Clone)]
pub struct HlocBackend {
    python: String,
    package: String,
    env: BTreeMap<String, String>,
}

impl HlocBackend {
    pub fn new(python: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            package: package.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &VisionConfig) -> Self {
        Self {
            python: config.python.clone(),
            package: config.package.clone(),
            env: config.env.clone(),
        }
    }

    fn command(&self, driver: &str) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-c")
            .arg(driver.replace("{package}", &self.package))
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a driver and return the artifact path it reports, falling back to
    /// `expected` when it prints nothing.
    async fn run(&self, stage: &str, mut cmd: Command, expected: PathBuf) -> Result<PathBuf> {
        let start = Instant::now();
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to launch '{}' for {}", self.python, stage))?;

        if !output.status.success() {
            anyhow::bail!(
                "{}.{} exited with {}: {}",
                self.package,
                stage,
                output.status,
                stderr_tail(&output.stderr)
            );
        }

        tracing::debug!("{}.{} finished in {:.1}s", self.package, stage, start.elapsed().as_secs_f64());

        let reported = last_line(&output.stdout).map(PathBuf::from);
        let artifact = reported.unwrap_or(expected);
        if !artifact.exists() {
            anyhow::bail!(
                "{}.{} reported success but {} does not exist",
                self.package,
                stage,
                artifact.display()
            );
        }
        Ok(artifact)
    }
}

impl VisionBackend for HlocBackend {
    fn extract_features<'a>(
        &'a self,
        conf: &'a StageConf,
        image_dir: &'a Path,
        export_dir: &'a Path,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let conf_json = serde_json::to_string(conf)?;
            let mut cmd = self.command(EXTRACT_DRIVER);
            cmd.arg(conf_json).arg(image_dir).arg(export_dir);
            self.run("extract_features", cmd, feature_path(export_dir, conf)).await
        })
    }

    fn pairs_from_retrieval<'a>(
        &'a self,
        descriptors: &'a Path,
        output: &'a Path,
        num_matched: usize,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let mut cmd = self.command(PAIRS_DRIVER);
            cmd.arg(descriptors).arg(output).arg(num_matched.to_string());
            self.run("pairs_from_retrieval", cmd, output.to_path_buf()).await
        })
    }

    fn match_features<'a>(
        &'a self,
        conf: &'a StageConf,
        pairs: &'a Path,
        features: &'a Path,
        export_dir: &'a Path,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let conf_json = serde_json::to_string(conf)?;
            // hloc addresses a feature set by its name inside export_dir
            let features_name = features
                .file_stem()
                .and_then(|s| s.to_str())
                .with_context(|| format!("invalid feature path {}", features.display()))?;
            let mut cmd = self.command(MATCH_DRIVER);
            cmd.arg(conf_json).arg(pairs).arg(features_name).arg(export_dir);
            let expected = match_path(export_dir, features, conf, pairs);
            self.run("match_features", cmd, expected).await
        })
    }

    fn reconstruct<'a>(
        &'a self,
        sfm_dir: &'a Path,
        image_dir: &'a Path,
        pairs: &'a Path,
        features: &'a Path,
        matches: &'a Path,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let mut cmd = self.command(RECONSTRUCT_DRIVER);
            cmd.arg(sfm_dir).arg(image_dir).arg(pairs).arg(features).arg(matches);
            self.run("reconstruction", cmd, sfm_dir.to_path_buf()).await
        })
    }
}

fn last_line(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return "no stderr output".to_string();
    }
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_embeds_package() {
        let backend = HlocBackend::new("python3", "my_hloc");
        let cmd = backend.command(EXTRACT_DRIVER);
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "python3");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0], "-c");
        assert!(args[1].contains("from my_hloc import extract_features"));
        assert!(!args[1].contains("{package}"));
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line(b"loading\n/ws/out.h5\n\n").as_deref(), Some("/ws/out.h5"));
        assert_eq!(last_line(b"  \n"), None);
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let stderr: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(stderr.as_bytes());
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.ends_with("line 49"));
        assert_eq!(stderr_tail(b""), "no stderr output");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error() {
        let backend = HlocBackend::new("/nonexistent/python-for-tests", "hloc");
        let temp = tempfile::TempDir::new().unwrap();
        let conf = StageConf::new("netvlad", "global-feats-netvlad", json!({"name": "netvlad"}));

        let err = backend
            .extract_features(&conf, temp.path(), temp.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        // `false` ignores its arguments and exits 1
        let backend = HlocBackend::new("false", "hloc");
        let temp = tempfile::TempDir::new().unwrap();

        let err = backend
            .pairs_from_retrieval(&temp.path().join("d.h5"), &temp.path().join("pairs.txt"), 3)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hloc.pairs_from_retrieval exited with"));
    }
}
