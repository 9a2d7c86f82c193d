use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub headers: HeaderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Origins allowed to talk to the sandbox. Every outbound envelope
    /// is posted once per entry; must match `frame-ancestors`.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_code_size")]
    pub max_code_size: usize,
    #[serde(default = "default_max_heap_mb")]
    pub max_heap_mb: usize,
    /// Delay before a render failure that was not surfaced synchronously
    /// is reported. A heuristic, not a correctness constant.
    #[serde(default = "default_deferred_error_delay_ms")]
    pub deferred_error_delay_ms: u64,
    #[serde(default = "default_max_render_depth")]
    pub max_render_depth: usize,
    #[serde(default = "default_max_mount_nodes")]
    pub max_mount_nodes: usize,
    #[serde(default = "default_max_mount_bytes")]
    pub max_mount_bytes: usize,
}

/// Content-Security-Policy source lists. `frame-ancestors` is not
/// configurable here: it always mirrors `sandbox.allowed_origins`.
#[derive(Debug, Deserialize, Clone)]
pub struct HeaderConfig {
    #[serde(default = "default_script_src")]
    pub script_src: Vec<String>,
    #[serde(default = "default_style_src")]
    pub style_src: Vec<String>,
    #[serde(default = "default_font_src")]
    pub font_src: Vec<String>,
    #[serde(default = "default_img_src")]
    pub img_src: Vec<String>,
    #[serde(default = "default_connect_src")]
    pub connect_src: Vec<String>,
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "https://app.deskrex.com".to_string(),
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_code_size() -> usize {
    64 * 1024
}

fn default_max_heap_mb() -> usize {
    64
}

fn default_deferred_error_delay_ms() -> u64 {
    100
}

fn default_max_render_depth() -> usize {
    64
}

fn default_max_mount_nodes() -> usize {
    10_000
}

fn default_max_mount_bytes() -> usize {
    1024 * 1024
}

fn sources(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_script_src() -> Vec<String> {
    sources(&[
        "'self'",
        "'unsafe-inline'",
        "'unsafe-eval'",
        "https://unpkg.com",
        "https://cdn.tailwindcss.com",
        "https://esm.sh",
    ])
}

fn default_style_src() -> Vec<String> {
    sources(&[
        "'self'",
        "'unsafe-inline'",
        "https://fonts.googleapis.com",
        "https://cdn.tailwindcss.com",
    ])
}

fn default_font_src() -> Vec<String> {
    sources(&["https://fonts.gstatic.com", "data:"])
}

fn default_img_src() -> Vec<String> {
    sources(&["'self'", "data:", "blob:", "https:"])
}

fn default_connect_src() -> Vec<String> {
    sources(&[
        "'self'",
        "https://unpkg.com",
        "https://esm.sh",
        "https://fonts.googleapis.com",
    ])
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_code_size: default_max_code_size(),
            max_heap_mb: default_max_heap_mb(),
            deferred_error_delay_ms: default_deferred_error_delay_ms(),
            max_render_depth: default_max_render_depth(),
            max_mount_nodes: default_max_mount_nodes(),
            max_mount_bytes: default_max_mount_bytes(),
        }
    }
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            script_src: default_script_src(),
            style_src: default_style_src(),
            font_src: default_font_src(),
            img_src: default_img_src(),
            connect_src: default_connect_src(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn deferred_error_delay(&self) -> Duration {
        Duration::from_millis(self.deferred_error_delay_ms)
    }

    pub fn max_heap_bytes(&self) -> usize {
        self.max_heap_mb * 1024 * 1024
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = shellexpand::env(&content)?;
        Self::parse(&expanded)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects allowlists that could never match a browser-reported origin.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sandbox.allowed_origins.is_empty() {
            bail!("sandbox.allowed_origins must not be empty");
        }
        for origin in &self.sandbox.allowed_origins {
            normalize_origin(origin)?;
        }
        Ok(())
    }

    /// Exact membership test. Browsers report origins already
    /// serialized, so no normalization happens on the inbound side.
    pub fn is_allowed_origin(&self, origin: &str) -> bool {
        self.sandbox
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin)
    }
}

/// Parses `origin` and checks it is its own ASCII serialization
/// (scheme + host + optional port, nothing else).
fn normalize_origin(origin: &str) -> anyhow::Result<String> {
    let url = Url::parse(origin).map_err(|e| anyhow!("invalid origin '{origin}': {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("origin '{origin}' must use http or https");
    }
    let serialized = url.origin().ascii_serialization();
    if serialized != origin {
        bail!("origin '{origin}' is not a bare origin (expected '{serialized}')");
    }
    Ok(serialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_origins(origins: Vec<&str>) -> Config {
        Config {
            sandbox: SandboxConfig {
                allowed_origins: origins.into_iter().map(String::from).collect(),
            },
            ..Config::default()
        }
    }

    // ── is_allowed_origin tests ──────────────────────────

    #[test]
    fn test_is_allowed_origin_exact_match() {
        let config = config_with_origins(vec!["https://app.deskrex.com"]);
        assert!(config.is_allowed_origin("https://app.deskrex.com"));
    }

    #[test]
    fn test_is_allowed_origin_rejects_unlisted() {
        let config = config_with_origins(vec!["https://app.deskrex.com"]);
        assert!(!config.is_allowed_origin("https://evil.example"));
        assert!(!config.is_allowed_origin("null"));
        assert!(!config.is_allowed_origin(""));
    }

    #[test]
    fn test_is_allowed_origin_scheme_and_port_matter() {
        let config = config_with_origins(vec!["http://localhost:3000"]);
        assert!(!config.is_allowed_origin("https://localhost:3000"));
        assert!(!config.is_allowed_origin("http://localhost:3001"));
        assert!(!config.is_allowed_origin("http://localhost"));
    }

    #[test]
    fn test_is_allowed_origin_no_suffix_tricks() {
        let config = config_with_origins(vec!["https://app.deskrex.com"]);
        assert!(!config.is_allowed_origin("https://app.deskrex.com.evil.example"));
        assert!(!config.is_allowed_origin("https://app.deskrex.com/"));
    }

    #[test]
    fn test_default_origins() {
        let config = Config::default();
        assert_eq!(config.sandbox.allowed_origins.len(), 3);
        assert!(config.is_allowed_origin("https://app.deskrex.com"));
        assert!(config.is_allowed_origin("http://localhost:3000"));
        assert!(config.is_allowed_origin("http://127.0.0.1:3000"));
    }

    // ── validation tests ─────────────────────────────────

    #[test]
    fn test_validate_rejects_empty_allowlist() {
        let config = config_with_origins(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_paths_and_trailing_slash() {
        assert!(config_with_origins(vec!["https://app.deskrex.com/"]).validate().is_err());
        assert!(config_with_origins(vec!["https://app.deskrex.com/runner"]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_schemes() {
        assert!(config_with_origins(vec!["file:///tmp"]).validate().is_err());
        assert!(config_with_origins(vec!["not an origin"]).validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    // ── parsing tests ────────────────────────────────────

    #[test]
    fn test_parse_minimal_uses_defaults() {
        let config = Config::parse("[sandbox]\n").unwrap();
        assert_eq!(config.sandbox.allowed_origins.len(), 3);
        assert_eq!(config.engine.deferred_error_delay_ms, 100);
        assert_eq!(config.engine.timeout(), Duration::from_secs(5));
        assert!(config.headers.font_src.contains(&"data:".to_string()));
    }

    #[test]
    fn test_parse_overrides() {
        let config = Config::parse(
            r#"
            [sandbox]
            allowed_origins = ["https://example.org"]

            [engine]
            timeout_ms = 250
            deferred_error_delay_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.allowed_origins, vec!["https://example.org"]);
        assert_eq!(config.engine.timeout(), Duration::from_millis(250));
        assert_eq!(config.engine.deferred_error_delay(), Duration::from_millis(10));
        assert_eq!(config.engine.max_code_size, 64 * 1024);
    }

    #[test]
    fn test_parse_rejects_invalid_origin() {
        let err = Config::parse("[sandbox]\nallowed_origins = [\"https://a.example/x\"]\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_load_expands_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        std::env::set_var("FRAME_SANDBOX_TEST_ORIGIN", "https://parent.example");
        std::fs::write(
            &path,
            "[sandbox]\nallowed_origins = [\"${FRAME_SANDBOX_TEST_ORIGIN}\"]\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert!(config.is_allowed_origin("https://parent.example"));
    }

    #[test]
    fn test_max_heap_bytes() {
        let engine = EngineConfig {
            max_heap_mb: 2,
            ..EngineConfig::default()
        };
        assert_eq!(engine.max_heap_bytes(), 2 * 1024 * 1024);
    }
}
