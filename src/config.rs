//! Service configuration.
//!
//! Every knob lives in [`ServerConfig`], built through [`ServerConfigBuilder`].
//! The binary seeds the builder from the environment with
//! [`ServerConfig::builder_from_env`], applies command-line overrides, and
//! only then calls [`ServerConfigBuilder::build`], so validation always sees
//! the final values.
//!
//! The analysis credential is read here, once, at startup and handed to the
//! analysis backend explicitly. Request handlers never touch the environment.

use crate::error::A11yError;
use std::fmt;
use std::path::PathBuf;

/// Default analysis backend: native Anthropic Messages streaming.
pub const DEFAULT_PROVIDER: &str = "anthropic";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
/// Upload ceiling applied to the `file` field.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;
/// Characters of document text forwarded to the model (~4000 tokens).
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 15_000;
/// Local frontend dev/preview servers.
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 3] = [
    "http://localhost:5173",
    "http://localhost:4173",
    "http://localhost:5175",
];

/// Top-level configuration for the HTTP service and the pipeline it runs.
#[derive(Clone)]
pub struct ServerConfig {
    /// Interface to bind. Default: `0.0.0.0`.
    pub host: String,

    /// TCP port. Default: 8000.
    pub port: u16,

    /// Maximum size of the uploaded PDF in bytes. Default: 25 MB.
    ///
    /// Enforced while the multipart field is streamed in, so oversized
    /// uploads are rejected without being buffered in full.
    pub max_upload_bytes: u64,

    /// Directory for scoped upload files. `None` uses the OS temp dir.
    pub upload_dir: Option<PathBuf>,

    /// Origins allowed by CORS, i.e. the frontend base URL(s).
    pub allowed_origins: Vec<String>,

    /// Cap on document text included in the analysis prompt. Default: 15 000.
    ///
    /// Structural metadata (headings, tables, images) is always complete;
    /// only the running text is truncated.
    pub max_content_chars: usize,

    /// Explicit pdfium shared library. `None` auto-downloads and caches it.
    pub pdfium_lib_path: Option<PathBuf>,

    pub analysis: AnalysisConfig,
}

/// Settings for the analysis backend.
#[derive(Clone)]
pub struct AnalysisConfig {
    /// `anthropic` selects the native streaming client; any other name
    /// (`openai`, `gemini`, `ollama`, `azure`, ...) goes through the
    /// edgequake-llm provider factory.
    pub provider: String,

    pub model: String,

    /// Anthropic API key. Required when `provider == "anthropic"`.
    pub api_key: Option<String>,

    /// Anthropic API base URL. Overridable for proxies and tests.
    pub base_url: String,

    /// Maximum tokens the model may generate for the whole report. Default: 8192.
    pub max_tokens: u32,

    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Whole-request timeout for one analysis in seconds. Default: 300.
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            max_tokens: 8192,
            temperature: 0.2,
            timeout_secs: 300,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            upload_dir: None,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect(),
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            pdfium_lib_path: None,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("upload_dir", &self.upload_dir)
            .field("allowed_origins", &self.allowed_origins)
            .field("max_content_chars", &self.max_content_chars)
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .field("analysis", &self.analysis)
            .finish()
    }
}

impl ServerConfig {
    /// Create a builder seeded with defaults.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Create a builder seeded from the process environment.
    ///
    /// Loads `.env` first (missing file is fine). See [`Self::builder_from_lookup`]
    /// for the variables read.
    pub fn builder_from_env() -> Result<ServerConfigBuilder, A11yError> {
        dotenvy::dotenv().ok();
        Self::builder_from_lookup(|key| std::env::var(key).ok())
    }

    /// Create a builder seeded from an arbitrary key lookup.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `HOST`, `PORT` | bind address |
    /// | `A11Y_MAX_UPLOAD_MB` | upload ceiling |
    /// | `A11Y_UPLOAD_DIR` | temp file directory |
    /// | `A11Y_ALLOWED_ORIGINS` | comma-separated CORS origins |
    /// | `A11Y_MAX_CONTENT_CHARS` | prompt text cap |
    /// | `PDFIUM_LIB_PATH` | pdfium library |
    /// | `A11Y_LLM_PROVIDER`, `A11Y_MODEL` | analysis backend |
    /// | `ANTHROPIC_API_KEY`, `ANTHROPIC_BASE_URL` | Anthropic credentials |
    /// | `A11Y_MAX_TOKENS`, `A11Y_TEMPERATURE`, `A11Y_API_TIMEOUT_SECS` | sampling and timeout |
    ///
    /// Empty values are treated as unset. Unparseable numbers are an error.
    pub fn builder_from_lookup<F>(lookup: F) -> Result<ServerConfigBuilder, A11yError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut b = Self::builder();

        if let Some(host) = get("HOST") {
            b = b.host(host);
        }
        if let Some(port) = parse_var::<u16>("PORT", get("PORT"))? {
            b = b.port(port);
        }
        if let Some(mb) = parse_var::<u64>("A11Y_MAX_UPLOAD_MB", get("A11Y_MAX_UPLOAD_MB"))? {
            b = b.max_upload_bytes(mb.saturating_mul(1024 * 1024));
        }
        if let Some(dir) = get("A11Y_UPLOAD_DIR") {
            b = b.upload_dir(dir);
        }
        if let Some(origins) = get("A11Y_ALLOWED_ORIGINS") {
            b = b.allowed_origins(
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from),
            );
        }
        if let Some(n) = parse_var::<usize>("A11Y_MAX_CONTENT_CHARS", get("A11Y_MAX_CONTENT_CHARS"))? {
            b = b.max_content_chars(n);
        }
        if let Some(path) = get("PDFIUM_LIB_PATH") {
            b = b.pdfium_lib_path(path);
        }
        if let Some(provider) = get("A11Y_LLM_PROVIDER") {
            b = b.provider(provider);
        }
        if let Some(model) = get("A11Y_MODEL") {
            b = b.model(model);
        }
        if let Some(key) = get("ANTHROPIC_API_KEY") {
            b = b.api_key(key);
        }
        if let Some(url) = get("ANTHROPIC_BASE_URL") {
            b = b.base_url(url);
        }
        if let Some(n) = parse_var::<u32>("A11Y_MAX_TOKENS", get("A11Y_MAX_TOKENS"))? {
            b = b.max_tokens(n);
        }
        if let Some(t) = parse_var::<f32>("A11Y_TEMPERATURE", get("A11Y_TEMPERATURE"))? {
            b = b.temperature(t);
        }
        if let Some(secs) = parse_var::<u64>("A11Y_API_TIMEOUT_SECS", get("A11Y_API_TIMEOUT_SECS"))? {
            b = b.timeout_secs(secs);
        }

        Ok(b)
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Uses the native Anthropic streaming client rather than edgequake-llm.
    pub fn uses_anthropic(&self) -> bool {
        self.analysis.provider.eq_ignore_ascii_case(DEFAULT_PROVIDER)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, A11yError>
where
    T::Err: fmt::Display,
{
    raw.map(|v| {
        v.parse::<T>()
            .map_err(|e| A11yError::InvalidConfig(format!("{key}='{v}': {e}")))
    })
    .transpose()
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn max_upload_bytes(mut self, n: u64) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_dir = Some(dir.into());
        self
    }

    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_content_chars(mut self, n: usize) -> Self {
        self.config.max_content_chars = n;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.config.analysis.provider = name.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.analysis.model = model.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.analysis.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.analysis.base_url = url.into();
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.analysis.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.analysis.temperature = t.clamp(0.0, 1.0);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.analysis.timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServerConfig, A11yError> {
        let c = &self.config;
        if c.port == 0 {
            return Err(A11yError::InvalidConfig("PORT must be 1–65535".into()));
        }
        if c.max_upload_bytes == 0 {
            return Err(A11yError::InvalidConfig(
                "Upload ceiling must be at least 1 byte".into(),
            ));
        }
        if c.max_content_chars == 0 {
            return Err(A11yError::InvalidConfig(
                "A11Y_MAX_CONTENT_CHARS must be ≥ 1".into(),
            ));
        }
        if let Some(bad) = c
            .allowed_origins
            .iter()
            .find(|o| !(o.starts_with("http://") || o.starts_with("https://")))
        {
            return Err(A11yError::InvalidConfig(format!(
                "CORS origin '{bad}' must start with http:// or https://"
            )));
        }
        let a = &c.analysis;
        if a.provider.trim().is_empty() {
            return Err(A11yError::InvalidConfig("Analysis provider must not be empty".into()));
        }
        if a.model.trim().is_empty() {
            return Err(A11yError::InvalidConfig("Analysis model must not be empty".into()));
        }
        if a.max_tokens == 0 {
            return Err(A11yError::InvalidConfig("A11Y_MAX_TOKENS must be ≥ 1".into()));
        }
        if a.timeout_secs == 0 {
            return Err(A11yError::InvalidConfig(
                "A11Y_API_TIMEOUT_SECS must be ≥ 1".into(),
            ));
        }
        if c.uses_anthropic() && a.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(A11yError::InvalidConfig(
                "ANTHROPIC_API_KEY is required for the anthropic provider".into(),
            ));
        }
        Ok(self.config)
    }
}
