//! Configuration: TOML file, then environment overrides, then validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default config file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "autodev.toml";

/// Top-level configuration.
///
/// Missing fields fall back to defaults so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutodevConfig {
    /// Attempts (apply + validate passes) allowed per run.
    pub max_attempts: u32,

    /// Parent directory for per-run clones and run logs.
    pub workspace_root: PathBuf,

    pub llm: LlmConfig,
    pub github: GitHubConfig,
    pub sandbox: SandboxConfig,
    pub validation: ValidationConfig,
    pub apply: ApplyConfig,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible API base, e.g. `https://api.groq.com/openai/v1`.
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitHubConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub api_base_url: String,
    /// Pull request base. Defaults to the branch checked out after cloning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    Docker,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub runtime: SandboxRuntime,
    pub image: String,
    /// Per-command wall-clock limit.
    pub timeout_secs: u64,
    pub memory_mb: u64,
    /// Percent of one CPU core (50 = half a core).
    pub cpu_percent: u32,
    pub network: bool,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// Pull the image when it is not present locally.
    pub auto_pull: bool,
}

/// What a validation run reports when no sandbox is available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Optional dependency setup, run before the checks. Never gates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    pub syntax: String,
    pub tests: String,
    /// Advisory only.
    pub lint: String,
    pub on_sandbox_unavailable: UnavailablePolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApplyConfig {
    /// Copy an existing file to `<file>.backup` before overwriting it.
    pub backup_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanConfig {
    pub extensions: Vec<String>,
    /// Extensions the fallback plan treats as source code.
    pub source_extensions: Vec<String>,
    pub max_depth: usize,
    pub max_tree_entries: usize,
    pub max_relevant_files: usize,
}

impl Default for AutodevConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            workspace_root: PathBuf::from("./workspace"),
            llm: LlmConfig::default(),
            github: GitHubConfig::default(),
            sandbox: SandboxConfig::default(),
            validation: ValidationConfig::default(),
            apply: ApplyConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base_url: "https://api.github.com".to_string(),
            base_branch: None,
            author_name: "autodev".to_string(),
            author_email: "autodev@users.noreply.github.com".to_string(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: SandboxRuntime::Docker,
            image: "python:3.10-slim".to_string(),
            timeout_secs: 60,
            memory_mb: 512,
            cpu_percent: 50,
            network: false,
            output_limit_bytes: 100_000,
            auto_pull: true,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            setup: None,
            syntax: "find . -name '*.py' -not -path './.git/*' -exec python -m py_compile {} +"
                .to_string(),
            tests: "python -m pytest . -v --tb=short".to_string(),
            lint: "python -m flake8 . --max-line-length=100".to_string(),
            on_sandbox_unavailable: UnavailablePolicy::Pass,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: [
                ".py", ".js", ".ts", ".jsx", ".tsx", ".json", ".yaml", ".yml", ".md", ".txt",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            source_extensions: vec![".py".to_string()],
            max_depth: 5,
            max_tree_entries: 100,
            max_relevant_files: 15,
        }
    }
}

impl AutodevConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.memory_mb == 0 {
            return Err(anyhow!("sandbox.memory_mb must be > 0"));
        }
        if self.sandbox.cpu_percent == 0 {
            return Err(anyhow!("sandbox.cpu_percent must be > 0"));
        }
        if self.sandbox.image.trim().is_empty() {
            return Err(anyhow!("sandbox.image must not be empty"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(anyhow!("llm.request_timeout_secs must be > 0"));
        }
        for (name, command) in [
            ("validation.syntax", &self.validation.syntax),
            ("validation.tests", &self.validation.tests),
            ("validation.lint", &self.validation.lint),
        ] {
            if command.trim().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        if self.scan.max_relevant_files == 0 {
            return Err(anyhow!("scan.max_relevant_files must be > 0"));
        }
        Ok(())
    }

    /// Names of credentials a full run needs but that are unset.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.llm.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            missing.push("LLM_API_KEY");
        }
        if self.github.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
            missing.push("GITHUB_TOKEN");
        }
        missing
    }

    /// Apply environment overrides. `lookup` returns the value of a variable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key).filter(|v| !v.trim().is_empty()))
        };

        if let Some(v) = first(&["LLM_BASE_URL"]) {
            self.llm.base_url = v;
        }
        if let Some(v) = first(&["LLM_API_KEY", "GROQ_API_KEY"]) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = first(&["LLM_MODEL", "GROQ_MODEL"]) {
            self.llm.model = v;
        }
        if let Some(v) = first(&["GITHUB_TOKEN"]) {
            self.github.token = Some(v);
        }
        if let Some(v) = first(&["SANDBOX_IMAGE", "DOCKER_IMAGE"]) {
            self.sandbox.image = v;
        }
        if let Some(v) = first(&["SANDBOX_TIMEOUT", "DOCKER_TIMEOUT"]) {
            self.sandbox.timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("parse SANDBOX_TIMEOUT '{v}'"))?;
        }
        if let Some(v) = first(&["SANDBOX_RUNTIME"]) {
            self.sandbox.runtime = match v.trim().to_lowercase().as_str() {
                "docker" => SandboxRuntime::Docker,
                "local" => SandboxRuntime::Local,
                other => return Err(anyhow!("unknown SANDBOX_RUNTIME '{other}'")),
            };
        }
        if let Some(v) = first(&["MAX_RETRY_ATTEMPTS"]) {
            self.max_attempts = v
                .trim()
                .parse()
                .with_context(|| format!("parse MAX_RETRY_ATTEMPTS '{v}'"))?;
        }
        if let Some(v) = first(&["WORK_DIR"]) {
            self.workspace_root = PathBuf::from(v);
        }
        Ok(())
    }
}

/// Load config from a TOML file, then the process environment.
///
/// If the file is missing, starts from `AutodevConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutodevConfig> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

pub fn load_config_with_env<F>(path: &Path, lookup: F) -> Result<AutodevConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        debug!(path = %path.display(), "config file missing, using defaults");
        AutodevConfig::default()
    };
    cfg.apply_env(lookup)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename). Secrets are never written.
pub fn write_config(path: &Path, cfg: &AutodevConfig) -> Result<()> {
    cfg.validate()?;
    let mut public = cfg.clone();
    public.llm.api_key = None;
    public.github.token = None;
    let mut buf = toml::to_string_pretty(&public).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Show only the last four characters of a secret.
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None => "not set".to_string(),
        Some(s) => {
            let count = s.chars().count();
            if count <= 4 {
                return "****".to_string();
            }
            let tail: String = s.chars().skip(count - 4).collect();
            format!("****{tail}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config_with_env(&temp.path().join("missing.toml"), env(&[])).expect("load");
        assert_eq!(cfg, AutodevConfig::default());
    }

    #[test]
    fn write_then_load_round_trips_without_secrets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("autodev.toml");
        let mut cfg = AutodevConfig::default();
        cfg.llm.api_key = Some("sk-secret".to_string());
        cfg.max_attempts = 5;
        write_config(&path, &cfg).expect("write");

        let written = fs::read_to_string(&path).expect("read");
        assert!(!written.contains("sk-secret"));
        let loaded = load_config_with_env(&path, env(&[])).expect("load");
        assert_eq!(loaded.max_attempts, 5);
        assert_eq!(loaded.llm.api_key, None);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("autodev.toml");
        fs::write(&path, "[sandbox]\nruntime = \"local\"\ntimeout_secs = 5\n").expect("write");
        let cfg = load_config_with_env(&path, env(&[])).expect("load");
        assert_eq!(cfg.sandbox.runtime, SandboxRuntime::Local);
        assert_eq!(cfg.sandbox.timeout_secs, 5);
        assert_eq!(cfg.sandbox.memory_mb, 512);
        assert_eq!(cfg.max_attempts, 3);
    }

    #[test]
    fn env_overrides_file_and_accepts_legacy_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config_with_env(
            &temp.path().join("missing.toml"),
            env(&[
                ("GROQ_API_KEY", "gk"),
                ("LLM_MODEL", "m1"),
                ("DOCKER_TIMEOUT", "90"),
                ("MAX_RETRY_ATTEMPTS", "4"),
                ("WORK_DIR", "/tmp/ws"),
                ("SANDBOX_RUNTIME", "Local"),
            ]),
        )
        .expect("load");
        assert_eq!(cfg.llm.api_key.as_deref(), Some("gk"));
        assert_eq!(cfg.llm.model, "m1");
        assert_eq!(cfg.sandbox.timeout_secs, 90);
        assert_eq!(cfg.max_attempts, 4);
        assert_eq!(cfg.workspace_root, PathBuf::from("/tmp/ws"));
        assert_eq!(cfg.sandbox.runtime, SandboxRuntime::Local);
        assert_eq!(cfg.missing_credentials(), vec!["GITHUB_TOKEN"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("missing.toml");
        assert!(load_config_with_env(&missing, env(&[("MAX_RETRY_ATTEMPTS", "0")])).is_err());
        assert!(load_config_with_env(&missing, env(&[("SANDBOX_TIMEOUT", "soon")])).is_err());
        assert!(load_config_with_env(&missing, env(&[("SANDBOX_RUNTIME", "vm")])).is_err());
    }

    #[test]
    fn masks_secrets() {
        assert_eq!(mask_secret(None), "not set");
        assert_eq!(mask_secret(Some("abc")), "****");
        assert_eq!(mask_secret(Some("ghp_123456789")), "****6789");
    }
}
