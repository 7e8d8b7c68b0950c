use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default config file template with comments, used by `config init`.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# bdg configuration file
# See: https://github.com/Nunley-Media-Group/bdg

# Chrome connection/launch defaults
# [chrome]
# port = 9222
# headless = false
# chrome_path = "/path/to/chrome"
# user_data_dir = "/path/to/profile"

# Telemetry defaults
# [telemetry]
# enabled = ["network", "console", "dom"]
# include_all = false
# max_body_size_mb = 5
# network_include = ["*.example.com*"]
# network_exclude = []

# Session defaults
# [session]
# timeout_secs = 0           # 0 = no auto-timeout
# preview_interval_secs = 5
# preview_max_entries = 1000
"#;

// ---------------------------------------------------------------------------
// Config structs (parsed from TOML)
// ---------------------------------------------------------------------------

/// Represents the parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub chrome: ChromeConfig,
    pub telemetry: TelemetryConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChromeConfig {
    pub port: Option<u16>,
    pub headless: Option<bool>,
    pub chrome_path: Option<String>,
    pub user_data_dir: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: Option<Vec<String>>,
    pub include_all: Option<bool>,
    pub max_body_size_mb: Option<u64>,
    pub network_include: Option<Vec<String>>,
    pub network_exclude: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_secs: Option<u64>,
    pub preview_interval_secs: Option<u64>,
    pub preview_max_entries: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults filled in)
// ---------------------------------------------------------------------------

/// Fully resolved configuration with all defaults filled in, used as the
/// base for `start_session` params before CLI flags override it.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub chrome: ResolvedChrome,
    pub telemetry: ResolvedTelemetry,
    pub session: ResolvedSession,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedChrome {
    pub port: u16,
    pub headless: bool,
    pub chrome_path: Option<String>,
    pub user_data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedTelemetry {
    pub enabled: Vec<String>,
    #[serde(rename = "includeAll")]
    pub include_all: bool,
    #[serde(rename = "maxBodySizeMb")]
    pub max_body_size_mb: u64,
    #[serde(rename = "networkInclude")]
    pub network_include: Vec<String>,
    #[serde(rename = "networkExclude")]
    pub network_exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSession {
    #[serde(rename = "timeoutSecs")]
    pub timeout_secs: u64,
    #[serde(rename = "previewIntervalSecs")]
    pub preview_interval_secs: u64,
    #[serde(rename = "previewMaxEntries")]
    pub preview_max_entries: usize,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing config file.
    Io(std::io::Error),
    /// Config file already exists (for `config init`).
    AlreadyExists(PathBuf),
    /// Could not determine config directory.
    NoConfigDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::AlreadyExists(p) => {
                write!(f, "Config file already exists: {}", p.display())
            }
            Self::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for crate::error::AppError {
    fn from(e: ConfigError) -> Self {
        use crate::error::ExitCode;
        Self {
            message: e.to_string(),
            code: ExitCode::GeneralError,
            custom_json: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config file search
// ---------------------------------------------------------------------------

/// Find the first config file that exists, checking locations in priority order.
///
/// Search order:
/// 1. `explicit_path` (from `--config` flag)
/// 2. `$BDG_CONFIG` environment variable
/// 3. `./.bdg.toml` (project-local)
/// 4. `<config_dir>/bdg/config.toml` (XDG / platform config dir)
/// 5. `~/.bdg.toml` (home directory fallback)
#[must_use]
pub fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
    find_config_file_with(explicit_path, std::env::var("BDG_CONFIG").ok())
}

/// Testable variant of [`find_config_file`] that accepts an explicit env value.
#[must_use]
pub fn find_config_file_with(
    explicit_path: Option<&Path>,
    env_config: Option<String>,
) -> Option<PathBuf> {
    // 1. Explicit --config path
    if let Some(p) = explicit_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    // 2. $BDG_CONFIG
    if let Some(env_path) = env_config {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }

    // 3. ./.bdg.toml (project-local)
    let local = PathBuf::from(".bdg.toml");
    if local.exists() {
        return Some(local);
    }

    // 4. XDG / platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("bdg").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    // 5. ~/.bdg.toml
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".bdg.toml");
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load and parse a config file. Returns the file path (if found) and the parsed config.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config(explicit_path: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let path = find_config_file(explicit_path);
    match &path {
        Some(p) => {
            let config = load_config_from(p);
            (path, config)
        }
        None => (None, ConfigFile::default()),
    }
}

/// Load and parse a config file from a specific path.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "warning: could not read config file {}: {e}",
                path.display()
            );
            return ConfigFile::default();
        }
    };

    parse_config(&contents, path)
}

/// Parse TOML content into a `ConfigFile`.
///
/// Uses a two-pass strategy: first tries strict parsing (to detect unknown keys),
/// then falls back to lenient parsing if strict fails due to unknown fields.
#[must_use]
pub fn parse_config(contents: &str, path: &Path) -> ConfigFile {
    // First pass: strict (deny_unknown_fields via a wrapper)
    match toml::from_str::<StrictConfigFile>(contents) {
        Ok(strict) => strict.into(),
        Err(strict_err) => {
            // Second pass: lenient
            match toml::from_str::<ConfigFile>(contents) {
                Ok(config) => {
                    // Strict failed but lenient succeeded → unknown keys
                    eprintln!(
                        "warning: unknown keys in config file {}: {strict_err}",
                        path.display()
                    );
                    config
                }
                Err(parse_err) => {
                    // Both failed → invalid TOML
                    eprintln!(
                        "warning: could not parse config file {}: {parse_err}",
                        path.display()
                    );
                    ConfigFile::default()
                }
            }
        }
    }
}

/// Strict variant used for the first-pass parse to detect unknown keys.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictConfigFile {
    #[serde(default)]
    chrome: StrictChromeConfig,
    #[serde(default)]
    telemetry: StrictTelemetryConfig,
    #[serde(default)]
    session: StrictSessionConfig,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictChromeConfig {
    port: Option<u16>,
    headless: Option<bool>,
    chrome_path: Option<String>,
    user_data_dir: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictTelemetryConfig {
    enabled: Option<Vec<String>>,
    include_all: Option<bool>,
    max_body_size_mb: Option<u64>,
    network_include: Option<Vec<String>>,
    network_exclude: Option<Vec<String>>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictSessionConfig {
    timeout_secs: Option<u64>,
    preview_interval_secs: Option<u64>,
    preview_max_entries: Option<usize>,
}

impl From<StrictConfigFile> for ConfigFile {
    fn from(s: StrictConfigFile) -> Self {
        Self {
            chrome: ChromeConfig {
                port: s.chrome.port,
                headless: s.chrome.headless,
                chrome_path: s.chrome.chrome_path,
                user_data_dir: s.chrome.user_data_dir,
            },
            telemetry: TelemetryConfig {
                enabled: s.telemetry.enabled,
                include_all: s.telemetry.include_all,
                max_body_size_mb: s.telemetry.max_body_size_mb,
                network_include: s.telemetry.network_include,
                network_exclude: s.telemetry.network_exclude,
            },
            session: SessionConfig {
                timeout_secs: s.session.timeout_secs,
                preview_interval_secs: s.session.preview_interval_secs,
                preview_max_entries: s.session.preview_max_entries,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Config resolution
// ---------------------------------------------------------------------------

/// Default CDP port for a freshly launched Chrome (spec.md §6.1).
pub const DEFAULT_PORT: u16 = 9222;
/// Default `maxBodySize` in MB (spec.md §4.2, §5: 5 MB).
pub const DEFAULT_MAX_BODY_SIZE_MB: u64 = 5;
/// Default preview rewrite interval (spec.md §4.7).
pub const DEFAULT_PREVIEW_INTERVAL_SECS: u64 = 5;
/// Default preview bound per array (spec.md §4.7).
pub const DEFAULT_PREVIEW_MAX_ENTRIES: usize = 1000;

/// Resolve a config file into a fully-populated `ResolvedConfig` with all defaults.
#[must_use]
pub fn resolve_config(file: &ConfigFile, config_path: Option<PathBuf>) -> ResolvedConfig {
    let port = file.chrome.port.unwrap_or(DEFAULT_PORT);
    let port = if port == 0 { DEFAULT_PORT } else { port };

    ResolvedConfig {
        config_path,
        chrome: ResolvedChrome {
            port,
            headless: file.chrome.headless.unwrap_or(false),
            chrome_path: file.chrome.chrome_path.clone(),
            user_data_dir: file.chrome.user_data_dir.clone(),
        },
        telemetry: ResolvedTelemetry {
            enabled: file
                .telemetry
                .enabled
                .clone()
                .unwrap_or_else(|| vec!["network".into(), "console".into(), "dom".into()]),
            include_all: file.telemetry.include_all.unwrap_or(false),
            max_body_size_mb: file
                .telemetry
                .max_body_size_mb
                .unwrap_or(DEFAULT_MAX_BODY_SIZE_MB),
            network_include: file.telemetry.network_include.clone().unwrap_or_default(),
            network_exclude: file.telemetry.network_exclude.clone().unwrap_or_default(),
        },
        session: ResolvedSession {
            timeout_secs: file.session.timeout_secs.unwrap_or(0),
            preview_interval_secs: file
                .session
                .preview_interval_secs
                .unwrap_or(DEFAULT_PREVIEW_INTERVAL_SECS),
            preview_max_entries: file
                .session
                .preview_max_entries
                .unwrap_or(DEFAULT_PREVIEW_MAX_ENTRIES),
        },
    }
}

/// `BDG_REQUEST_TIMEOUT_MS` override for the CLI→daemon request timeout
/// (spec.md §4.5), falling back to `crate::ipc::CLIENT_REQUEST_TIMEOUT_MS`.
#[must_use]
pub fn request_timeout_ms() -> u64 {
    std::env::var("BDG_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(crate::ipc::CLIENT_REQUEST_TIMEOUT_MS)
}

// ---------------------------------------------------------------------------
// Config init
// ---------------------------------------------------------------------------

/// Default path for `config init`: `<config_dir>/bdg/config.toml`.
///
/// # Errors
///
/// Returns `ConfigError::NoConfigDir` if the platform config directory cannot be determined.
pub fn default_init_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("bdg").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Create a default config file at the given path (or the default XDG path).
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
/// - `ConfigError::NoConfigDir` if no target path and platform config dir unknown
pub fn init_config(target_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match target_path {
        Some(p) => p.to_path_buf(),
        None => default_init_path()?,
    };

    init_config_to(&path)
}

/// Testable variant of [`init_config`] that writes to an explicit path.
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
pub fn init_config_to(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
