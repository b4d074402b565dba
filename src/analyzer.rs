//! The analyzer is the external function that actually looks at the image.
//! This crate only knows its contract: it takes a path to an image file plus
//! the request parameters, and returns a JSON object holding the metrics that
//! were asked for.

use crate::upload::RawFile;
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// The output of an analyzer. Keys that were not computed are absent.
pub type Analysis = Map<String, Value>;

/// The gender of the photographed person
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Female,
    Male,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Female => "f",
            Gender::Male => "m",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "f" => Some(Gender::Female),
            "m" => Some(Gender::Male),
            _ => None,
        }
    }
}

/// Everything an analyzer is told besides the image path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisParams {
    pub score: bool,
    pub classification: bool,
    pub age: i64,
    pub gender: Gender,
}

/// An image analysis function. Implementations block; the server calls them
/// from the blocking thread pool.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, path: &Path, params: &AnalysisParams) -> Result<Analysis>;
}

impl<F> Analyzer for F
where
    F: Fn(&Path, &AnalysisParams) -> Result<Analysis> + Send + Sync,
{
    fn analyze(&self, path: &Path, params: &AnalysisParams) -> Result<Analysis> {
        self(path, params)
    }
}

/// Write `file` into a fresh temporary directory and run `analyzer` on it.
/// The directory is removed on every exit path, analyzer errors included.
pub fn analyze_upload(
    analyzer: &dyn Analyzer,
    file: &RawFile,
    params: &AnalysisParams,
) -> Result<Analysis> {
    let dir = tempfile::Builder::new()
        .prefix("meron-")
        .tempdir()
        .context("failed to create a temporary directory")?;
    let path = dir.path().join(&file.name);
    std::fs::write(&path, &file.content)
        .with_context(|| format!("failed to write {}", path.display()))?;

    debug!("running analyzer on {} with {params:?}", path.display());
    let result = analyzer.analyze(&path, params);

    if let Err(err) = dir.close() {
        warn!("failed to remove temporary directory: {err}");
    }

    result
}

/// Stands in for the detection model until one is configured. Reports the
/// image size and fixed values for the requested metrics.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderAnalyzer;

impl Analyzer for PlaceholderAnalyzer {
    fn analyze(&self, path: &Path, params: &AnalysisParams) -> Result<Analysis> {
        let (width, height) = image::image_dimensions(path)?;

        let mut analysis = Analysis::new();
        analysis.insert("width".into(), width.into());
        analysis.insert("height".into(), height.into());
        if params.score {
            analysis.insert("score".into(), 1.into());
        }
        if params.classification {
            analysis.insert("classification".into(), 1.into());
        }
        Ok(analysis)
    }
}

/// Runs an external program for every request:
///
/// `<program> [args...] <image path> --age <age> --gender <f|m> [--score] [--classification]`
///
/// The program must print a single JSON object to stdout and exit with 0.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        CommandAnalyzer {
            program: program.into(),
            args,
        }
    }

    fn command(&self, path: &Path, params: &AnalysisParams) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(path)
            .arg("--age")
            .arg(params.age.to_string())
            .arg("--gender")
            .arg(params.gender.as_str());
        if params.score {
            command.arg("--score");
        }
        if params.classification {
            command.arg("--classification");
        }
        command
    }
}

impl Analyzer for CommandAnalyzer {
    fn analyze(&self, path: &Path, params: &AnalysisParams) -> Result<Analysis> {
        let output = self
            .command(path, params)
            .output()
            .with_context(|| format!("failed to start analyzer {}", self.program.display()))?;

        if !output.status.success() {
            return Err(anyhow!(
                "analyzer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let printed = serde_json::from_slice::<Value>(&output.stdout)
            .context("analyzer printed invalid JSON")?;
        match printed {
            Value::Object(analysis) => Ok(analysis),
            other => Err(anyhow!("analyzer printed {other} instead of a JSON object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::tests::encode_test_image;
    use image::ImageOutputFormat;
    use std::sync::Mutex;

    fn params(score: bool, classification: bool) -> AnalysisParams {
        AnalysisParams {
            score,
            classification,
            age: 24,
            gender: Gender::Female,
        }
    }

    fn test_file() -> RawFile {
        RawFile::new("pixel.png", encode_test_image(ImageOutputFormat::Png))
    }

    #[test]
    fn test_placeholder_omits_unrequested() {
        let analysis =
            analyze_upload(&PlaceholderAnalyzer, &test_file(), &params(false, true)).unwrap();
        assert_eq!(analysis["width"], 4);
        assert_eq!(analysis["height"], 3);
        assert_eq!(analysis["classification"], 1);
        assert!(!analysis.contains_key("score"));
    }

    #[test]
    fn test_temp_file_lifetime() {
        let seen = Mutex::new(None);
        let analyzer = |path: &Path, _: &AnalysisParams| -> Result<Analysis> {
            assert!(path.exists());
            assert_eq!(path.file_name().unwrap(), "pixel.png");
            *seen.lock().unwrap() = Some(path.to_path_buf());
            Ok(Analysis::new())
        };

        analyze_upload(&analyzer, &test_file(), &params(true, true)).unwrap();

        let path = seen.lock().unwrap().clone().unwrap();
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_temp_dir_removed_on_error() {
        let seen = Mutex::new(None);
        let analyzer = |path: &Path, _: &AnalysisParams| -> Result<Analysis> {
            *seen.lock().unwrap() = Some(path.to_path_buf());
            Err(anyhow!("model crashed"))
        };

        let err = analyze_upload(&analyzer, &test_file(), &params(true, true)).unwrap_err();
        assert_eq!(err.to_string(), "model crashed");

        let path = seen.lock().unwrap().clone().unwrap();
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_command_arguments() {
        let analyzer = CommandAnalyzer::new("analyze", vec!["--model".into(), "m.pt".into()]);
        let command = analyzer.command(Path::new("/tmp/a.png"), &params(true, false));
        let args: Vec<_> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["--model", "m.pt", "/tmp/a.png", "--age", "24", "--gender", "f", "--score"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_command_output() {
        let analyzer = CommandAnalyzer::new(
            "sh",
            vec!["-c".into(), r#"echo '{"score": 0.5}'"#.into(), "analyzer".into()],
        );
        let analysis = analyzer
            .analyze(Path::new("/tmp/a.png"), &params(true, false))
            .unwrap();
        assert_eq!(analysis["score"], 0.5);

        let failing = CommandAnalyzer::new("sh", vec!["-c".into(), "exit 3".into()]);
        assert!(failing
            .analyze(Path::new("/tmp/a.png"), &params(true, false))
            .is_err());

        let not_object = CommandAnalyzer::new("sh", vec!["-c".into(), "echo 1".into()]);
        assert!(not_object
            .analyze(Path::new("/tmp/a.png"), &params(true, false))
            .is_err());
    }
}
