//! Template rendering for collaborator commands and the classification prompt.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, context};

const CLASSIFY_TEMPLATE: &str = include_str!("../../prompts/classify.md.j2");

/// Template engine wrapper around minijinja.
///
/// Undefined variables are errors so a typo in `uiexec.toml` fails loudly
/// instead of rendering an empty argument.
pub struct TemplateEngine {
    env: Environment<'static>,
    classify_template: String,
}

impl TemplateEngine {
    pub fn new(classify_override: Option<&str>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            env,
            classify_template: classify_override.unwrap_or(CLASSIFY_TEMPLATE).to_string(),
        }
    }

    /// Render every argument of a command template against `vars`.
    pub fn render_args(&self, args: &[String], vars: &BTreeMap<String, String>) -> Result<Vec<String>> {
        args.iter()
            .map(|arg| {
                self.env
                    .render_str(arg, vars)
                    .with_context(|| format!("render command argument '{arg}'"))
            })
            .collect()
    }

    /// Render the classification prompt for one failing test.
    pub fn render_classify(&self, environment: &str, test_name: &str, detail: &str) -> Result<String> {
        self.env
            .render_str(
                &self.classify_template,
                context! {
                    environment => environment,
                    test_name => test_name,
                    detail => detail,
                },
            )
            .context("render classification prompt")
    }
}

/// Variables visible to command templates: overrides plus `suite`,
/// `environment` and `attempt` (which win over same-named overrides).
pub fn template_vars(
    suite: &str,
    environment: &str,
    attempt: u32,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut vars = overrides.clone();
    vars.insert("suite".to_string(), suite.to_string());
    vars.insert("environment".to_string(), environment.to_string());
    vars.insert("attempt".to_string(), attempt.to_string());
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_command_arguments() {
        let engine = TemplateEngine::new(None);
        let mut overrides = BTreeMap::new();
        overrides.insert("browser".to_string(), "firefox".to_string());
        let vars = template_vars("tests/ui", "staging", 2, &overrides);
        let args = vec![
            "pytest".to_string(),
            "{{ suite }}".to_string(),
            "--browser={{ browser }}".to_string(),
            "--base-url=https://{{ environment }}.example.com".to_string(),
        ];
        let rendered = engine.render_args(&args, &vars).expect("render");
        assert_eq!(
            rendered,
            vec![
                "pytest",
                "tests/ui",
                "--browser=firefox",
                "--base-url=https://staging.example.com"
            ]
        );
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let engine = TemplateEngine::new(None);
        let vars = template_vars("tests/ui", "local", 1, &BTreeMap::new());
        let err = engine
            .render_args(&["{{ sute }}".to_string()], &vars)
            .unwrap_err();
        assert!(format!("{err:#}").contains("{{ sute }}"));
    }

    #[test]
    fn classify_prompt_includes_test_and_detail() {
        let engine = TemplateEngine::new(None);
        let prompt = engine
            .render_classify("staging", "test_checkout", "TimeoutError: #pay not visible")
            .expect("render");
        assert!(prompt.contains("test_checkout"));
        assert!(prompt.contains("TimeoutError: #pay not visible"));
        assert!(prompt.contains("likely_regression"));
    }

    #[test]
    fn classify_prompt_can_be_overridden() {
        let engine = TemplateEngine::new(Some("{{ test_name }}|{{ detail }}"));
        let prompt = engine.render_classify("local", "a", "b").expect("render");
        assert_eq!(prompt, "a|b");
    }
}
