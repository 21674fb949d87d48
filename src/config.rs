use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::downloads::SettlePolicy;
use crate::ytdlp::ToolConfig;

pub const DEFAULT_CONFIG_FILE: &str = "lumina-env";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DOWNLOADS_SUBDIR: &str = "downloads";
pub const DEFAULT_TOOL: &str = "yt-dlp";
pub const METADATA_TIMEOUT_SECS: u64 = 10;
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// Command line of the `lumina` binary.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Local web front-end for yt-dlp downloads.")]
pub struct Cli {
    #[arg(value_name = "PORT", help = "TCP port to listen on (default 8000)")]
    pub port: Option<u16>,
    #[arg(long = "host", value_name = "ADDR", help = "Address to bind (default 127.0.0.1)")]
    pub host: Option<String>,
    #[arg(
        long = "root",
        value_name = "DIR",
        help = "Base directory (default: the directory holding the executable)"
    )]
    pub root: Option<PathBuf>,
    #[arg(long = "www-root", value_name = "DIR", help = "Directory served as static files")]
    pub www_root: Option<PathBuf>,
    #[arg(
        long = "downloads-dir",
        value_name = "DIR",
        help = "Staging directory for downloaded files"
    )]
    pub downloads_dir: Option<PathBuf>,
    #[arg(long = "config", value_name = "FILE", help = "Path to the env config file")]
    pub config: Option<PathBuf>,
    #[arg(long = "ytdlp", value_name = "PATH", help = "yt-dlp executable to invoke")]
    pub ytdlp: Option<PathBuf>,
    #[arg(long = "skip-install", help = "Do not check, install or upgrade yt-dlp")]
    pub skip_install: bool,
    #[arg(long = "no-browser", help = "Do not open a browser window on startup")]
    pub no_browser: bool,
}

/// Values read from the optional `KEY=VALUE` config file.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub www_root: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
    pub metadata_timeout: Option<Duration>,
    pub download_timeout: Option<Duration>,
}

/// Everything a running server needs. Built once at startup and handed to the
/// router; nothing here changes while requests are served.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub www_root: PathBuf,
    pub downloads_dir: PathBuf,
    pub tool: ToolConfig,
    pub settle: SettlePolicy,
}

impl ServerConfig {
    /// Config rooted at `root` with every default applied.
    pub fn with_root(root: &Path) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            www_root: root.to_path_buf(),
            downloads_dir: root.join(DOWNLOADS_SUBDIR),
            tool: ToolConfig::default(),
            settle: SettlePolicy::default(),
        }
    }

    pub fn base_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "localhost",
            other => other,
        };
        format!("http://{host}:{}", self.port)
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "LUMINA_HOST" => cfg.host = Some(value.to_string()),
                "LUMINA_PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("Parsing LUMINA_PORT from {}", path.display()))?;
                    cfg.port = Some(port);
                }
                "WWW_ROOT" => cfg.www_root = Some(PathBuf::from(value)),
                "DOWNLOADS_DIR" => cfg.downloads_dir = Some(PathBuf::from(value)),
                "YTDLP_PATH" => cfg.ytdlp_path = Some(PathBuf::from(value)),
                "METADATA_TIMEOUT_SECS" => {
                    cfg.metadata_timeout = Some(parse_secs(value, "METADATA_TIMEOUT_SECS", path)?)
                }
                "DOWNLOAD_TIMEOUT_SECS" => {
                    cfg.download_timeout = Some(parse_secs(value, "DOWNLOAD_TIMEOUT_SECS", path)?)
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

fn parse_secs(value: &str, key: &str, path: &Path) -> Result<Duration> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("Parsing {key} from {}", path.display()))?;
    Ok(Duration::from_secs(secs))
}

/// Directory holding the running executable. Stands in for "the program's own
/// location" when no `--root` is given.
pub fn executable_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("Failed to locate the running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Executable {} has no parent directory", exe.display()))
}

pub fn load_server_config(cli: &Cli) -> Result<ServerConfig> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => executable_dir()?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join(DEFAULT_CONFIG_FILE));
    let env_cfg = read_env_config(&config_path)?;
    Ok(resolve_server_config(cli, &root, env_cfg.unwrap_or_default()))
}

/// Merges CLI flags over the env file over the built-in defaults.
pub fn resolve_server_config(cli: &Cli, root: &Path, env_cfg: EnvConfig) -> ServerConfig {
    let mut config = ServerConfig::with_root(root);

    if let Some(host) = cli.host.clone().or(env_cfg.host) {
        config.host = host;
    }
    if let Some(port) = cli.port.or(env_cfg.port) {
        config.port = port;
    }
    if let Some(www_root) = cli.www_root.clone().or(env_cfg.www_root) {
        config.www_root = www_root;
    }
    if let Some(downloads_dir) = cli.downloads_dir.clone().or(env_cfg.downloads_dir) {
        config.downloads_dir = downloads_dir;
    }
    if let Some(program) = cli.ytdlp.clone().or(env_cfg.ytdlp_path) {
        config.tool.program = program;
    }
    if let Some(timeout) = env_cfg.metadata_timeout {
        config.tool.metadata_timeout = timeout;
    }
    if let Some(timeout) = env_cfg.download_timeout {
        config.tool.download_timeout = timeout;
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_port() {
        let cfg = make_config("# comment\nLUMINA_PORT=\"4242\"\nDOWNLOADS_DIR=\"/tmp/dl\"\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.port, Some(4242));
        assert_eq!(parsed.downloads_dir, Some(PathBuf::from("/tmp/dl")));
    }

    #[test]
    fn read_env_config_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_config(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn read_env_config_rejects_bad_timeout() {
        let cfg = make_config("DOWNLOAD_TIMEOUT_SECS=soon\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("DOWNLOAD_TIMEOUT_SECS"));
    }

    #[test]
    fn defaults_derive_from_root() {
        let cli = Cli::try_parse_from(["lumina"]).unwrap();
        let config = resolve_server_config(&cli, Path::new("/srv/lumina"), EnvConfig::default());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.www_root, PathBuf::from("/srv/lumina"));
        assert_eq!(config.downloads_dir, PathBuf::from("/srv/lumina/downloads"));
        assert_eq!(config.tool.program, PathBuf::from(DEFAULT_TOOL));
        assert_eq!(
            config.tool.download_timeout,
            Duration::from_secs(DOWNLOAD_TIMEOUT_SECS)
        );
    }

    #[test]
    fn positional_port_beats_env_file() {
        let cli = Cli::try_parse_from(["lumina", "9001"]).unwrap();
        let cfg = make_config("LUMINA_PORT=4242\nLUMINA_HOST=0.0.0.0\nMETADATA_TIMEOUT_SECS=3\n");
        let env_cfg = read_env_config(cfg.path()).unwrap().unwrap();
        let config = resolve_server_config(&cli, Path::new("/r"), env_cfg);
        assert_eq!(config.port, 9001);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.tool.metadata_timeout, Duration::from_secs(3));
        assert_eq!(config.base_url(), "http://localhost:9001");
    }

    #[test]
    fn cli_rejects_non_numeric_port() {
        assert!(Cli::try_parse_from(["lumina", "eighty"]).is_err());
    }
}
