//! Classification collaborator used by the Triage step.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::nudge::{extract_json_object, retry_once_with_nudge};
use crate::core::types::Verdict;
use crate::error::ClassificationError;
use crate::io::config::ClassifierConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::TemplateEngine;

const VERDICT_SCHEMA: &str = include_str!("../../schemas/verdict.schema.json");

/// Verdict and rationale returned for one failing test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub verdict: Verdict,
    pub rationale: String,
}

/// Classifies one failing test at a time.
///
/// Calls for different tests are independent, so implementations must be
/// `Sync`: Triage may issue them from several threads.
pub trait Classifier: Sync {
    fn classify(&self, test_name: &str, detail: &str) -> Result<Classification, ClassificationError>;
}

impl<T: Classifier + ?Sized> Classifier for Box<T> {
    fn classify(&self, test_name: &str, detail: &str) -> Result<Classification, ClassificationError> {
        (**self).classify(test_name, detail)
    }
}

/// Placeholder used when no classifier command is configured.
pub struct UnconfiguredClassifier;

impl Classifier for UnconfiguredClassifier {
    fn classify(&self, _test_name: &str, _detail: &str) -> Result<Classification, ClassificationError> {
        Err(ClassificationError::Unavailable(
            "no classifier command configured".to_string(),
        ))
    }
}

/// Classifier that pipes a rendered prompt into an external command (usually
/// a language-model CLI) and reads a JSON verdict from its stdout.
pub struct CommandClassifier {
    config: ClassifierConfig,
    environment: String,
    workdir: PathBuf,
    templates: TemplateEngine,
    validator: Validator,
}

impl CommandClassifier {
    pub fn new(config: ClassifierConfig, environment: &str, workdir: PathBuf) -> Result<Self> {
        let templates = TemplateEngine::new(config.prompt_template.as_deref());
        Ok(Self {
            config,
            environment: environment.to_string(),
            workdir,
            templates,
            validator: verdict_validator()?,
        })
    }
}

impl Classifier for CommandClassifier {
    #[instrument(skip_all, fields(test = test_name))]
    fn classify(&self, test_name: &str, detail: &str) -> Result<Classification, ClassificationError> {
        let prompt = self
            .templates
            .render_classify(&self.environment, test_name, detail)
            .map_err(|err| ClassificationError::Failed(format!("{err:#}")))?;

        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| ClassificationError::Unavailable("classifier command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.config.output_limit_bytes,
            None,
        )
        .map_err(|err| ClassificationError::Unavailable(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "classifier timed out");
            return Err(ClassificationError::Timeout(timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            return Err(ClassificationError::Failed(format!(
                "exit status {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let stdout = output.stdout_lossy();
        let classification = parse_classification(&self.validator, &stdout)?;
        debug!(verdict = %classification.verdict, "classified");
        Ok(classification)
    }
}

/// Compile the embedded verdict schema (Draft 2020-12).
pub fn verdict_validator() -> Result<Validator> {
    let schema: Value = serde_json::from_str(VERDICT_SCHEMA).context("parse verdict schema")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile verdict schema")
}

/// Parse classifier stdout into a verdict.
///
/// Output that is not a bare JSON object gets one corrective pass that pulls
/// the object out of prose or a code fence before giving up.
pub fn parse_classification(
    validator: &Validator,
    stdout: &str,
) -> Result<Classification, ClassificationError> {
    retry_once_with_nudge(
        stdout,
        |text| parse_verdict_json(validator, text),
        extract_json_object,
    )
    .map_err(|failure| ClassificationError::Unparseable {
        message: failure.to_string(),
        raw: failure.raw,
    })
}

fn parse_verdict_json(validator: &Validator, text: &str) -> Result<Classification, String> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|err| format!("invalid JSON: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!("schema validation failed: {}", messages.join("; ")));
    }
    serde_json::from_value(value).map_err(|err| format!("decode verdict: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(script: &str) -> (tempfile::TempDir, CommandClassifier) {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = ClassifierConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 5,
            ..ClassifierConfig::default()
        };
        let classifier =
            CommandClassifier::new(config, "staging", temp.path().to_path_buf()).expect("new");
        (temp, classifier)
    }

    #[test]
    fn parses_bare_json_verdict() {
        let validator = verdict_validator().expect("schema");
        let parsed = parse_classification(
            &validator,
            r#"{"verdict": "likely_flaky", "rationale": "network blip"}"#,
        )
        .expect("parse");
        assert_eq!(parsed.verdict, Verdict::LikelyFlaky);
        assert_eq!(parsed.rationale, "network blip");
    }

    #[test]
    fn recovers_verdict_from_fenced_output() {
        let validator = verdict_validator().expect("schema");
        let stdout = "Sure!\n```json\n{\"verdict\": \"likely_regression\", \"rationale\": \"button removed\"}\n```\n";
        let parsed = parse_classification(&validator, stdout).expect("parse");
        assert_eq!(parsed.verdict, Verdict::LikelyRegression);
    }

    #[test]
    fn schema_violation_is_unparseable_and_keeps_raw() {
        let validator = verdict_validator().expect("schema");
        let stdout = r#"{"verdict": "probably_fine", "rationale": "?"}"#;
        match parse_classification(&validator, stdout) {
            Err(ClassificationError::Unparseable { message, raw }) => {
                assert!(message.contains("schema validation failed"));
                assert_eq!(raw, stdout);
            }
            other => panic!("expected unparseable, got {other:?}"),
        }
    }

    #[test]
    fn command_classifier_reads_prompt_and_returns_verdict() {
        let (_temp, classifier) = classifier(
            "grep -q 'test_login' && echo '{\"verdict\": \"likely_flaky\", \"rationale\": \"retry passed\"}'",
        );
        let parsed = classifier
            .classify("test_login", "TimeoutError")
            .expect("classify");
        assert_eq!(parsed.verdict, Verdict::LikelyFlaky);
    }

    #[test]
    fn non_zero_exit_is_a_failure() {
        let (_temp, classifier) = classifier("cat >/dev/null; echo 'quota exceeded' >&2; exit 2");
        let err = classifier.classify("t", "d").unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn unconfigured_classifier_always_errors() {
        let err = UnconfiguredClassifier.classify("t", "d").unwrap_err();
        assert!(matches!(err, ClassificationError::Unavailable(_)));
    }
}
