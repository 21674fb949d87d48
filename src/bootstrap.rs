//! Startup conveniences: making sure yt-dlp is installed (and fresh), and
//! opening the UI in a browser. None of this touches request handling.

use anyhow::{Context, Result, anyhow, bail};
use std::{
    env,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tokio::task;
use tracing::{info, warn};

use crate::ytdlp::ToolConfig;

const PYTHON_CANDIDATES: [&str; 3] = ["python3", "python", "py"];
const PIP_PACKAGE: &str = "yt-dlp";
const PYTHON_MODULE: &str = "yt_dlp";

/// Installs or upgrades yt-dlp through `python -m pip`.
#[derive(Debug, Clone)]
pub struct Installer {
    python: Option<PathBuf>,
}

impl Installer {
    /// Uses the first python interpreter found on `PATH`.
    pub fn detect() -> Self {
        let python = PYTHON_CANDIDATES
            .into_iter()
            .find(|bin| command_exists(bin))
            .map(PathBuf::from);
        Self { python }
    }

    pub fn with_python(python: Option<PathBuf>) -> Self {
        Self { python }
    }

    /// Returns a runnable tool command, installing yt-dlp when it is missing.
    ///
    /// An already present tool is upgraded on a best-effort basis. A failed
    /// first install is fatal. When pip succeeds but the binary is still not on
    /// `PATH`, the tool is run as `python -m yt_dlp` instead.
    pub fn ensure_tool(&self, tool: ToolConfig) -> Result<ToolConfig> {
        match tool_version(&tool) {
            Ok(version) => {
                info!(%version, tool = %tool.display(), "yt-dlp already installed");
                self.upgrade();
                Ok(tool)
            }
            Err(err) => {
                info!(%err, "installing yt-dlp");
                let python = self.python.as_deref().ok_or_else(|| {
                    anyhow!("yt-dlp is not installed and no python interpreter was found; install it with: pip install yt-dlp")
                })?;
                run_command(python, &["-m", "pip", "install", PIP_PACKAGE, "-q"])
                    .context("Failed to install yt-dlp")?;
                info!("yt-dlp installed");

                if let Ok(version) = tool_version(&tool) {
                    info!(%version, tool = %tool.display(), "using installed yt-dlp");
                    return Ok(tool);
                }

                let fallback = ToolConfig {
                    program: python.to_path_buf(),
                    leading_args: vec!["-m".to_string(), PYTHON_MODULE.to_string()],
                    ..tool
                };
                let version = tool_version(&fallback).with_context(|| {
                    format!("yt-dlp was installed but `{}` does not run", fallback.display())
                })?;
                info!(%version, tool = %fallback.display(), "using yt-dlp python module");
                Ok(fallback)
            }
        }
    }

    /// YouTube breaks old extractors regularly, so try to stay current.
    fn upgrade(&self) {
        let Some(python) = self.python.as_deref() else {
            warn!("no python interpreter found, skipping yt-dlp upgrade");
            return;
        };
        info!("upgrading yt-dlp to the latest version");
        if let Err(err) = run_command(python, &["-m", "pip", "install", "--upgrade", PIP_PACKAGE, "-q"])
        {
            warn!(%err, "yt-dlp upgrade failed, continuing with the installed version");
        }
    }
}

/// Runs `<tool> --version` and returns the trimmed output.
pub fn tool_version(tool: &ToolConfig) -> Result<String> {
    let output = tool
        .std_command()
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("{} is not installed or not in PATH", tool.display()))?;
    if !output.status.success() {
        bail!(
            "{} is installed but returned a failure status ({})",
            tool.display(),
            output.status
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_command(cmd: &Path, args: &[&str]) -> Result<()> {
    let printable = format_command(cmd, args);
    info!(command = %printable, "running");
    let status = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .with_context(|| format!("Failed to run {}", cmd.display()))?;
    if !status.success() {
        bail!("Command {printable} failed with status {status}");
    }
    Ok(())
}

fn format_command(cmd: &Path, args: &[&str]) -> String {
    let mut printable = cmd.display().to_string();
    for arg in args {
        printable.push(' ');
        printable.push_str(arg);
    }
    printable
}

fn command_exists(bin: &str) -> bool {
    if let Some(paths) = env::var_os("PATH") {
        for path in env::split_paths(&paths) {
            if path.join(bin).is_file() {
                return true;
            }
            if cfg!(windows) && path.join(format!("{bin}.exe")).is_file() {
                return true;
            }
        }
    }
    false
}

/// Opens `url` in the default browser after `delay`, in the background.
pub fn open_browser_later(url: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match task::spawn_blocking(move || open_browser(&url)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "could not open a browser"),
            Err(err) => warn!(%err, "browser task failed"),
        }
    });
}

fn open_browser(url: &str) -> Result<()> {
    let (cmd, args) = browser_command(url);
    let status = Command::new(cmd)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("Failed to run {cmd}"))?;
    if !status.success() {
        bail!("{cmd} exited with status {status}");
    }
    Ok(())
}

fn browser_command(url: &str) -> (&'static str, Vec<String>) {
    if cfg!(target_os = "windows") {
        (
            "cmd",
            vec!["/C".into(), "start".into(), String::new(), url.into()],
        )
    } else if cfg!(target_os = "macos") {
        ("open", vec![url.into()])
    } else {
        ("xdg-open", vec![url.into()])
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\n{body}")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn tool_at(program: PathBuf) -> ToolConfig {
        ToolConfig {
            program,
            ..ToolConfig::default()
        }
    }

    #[test]
    fn format_command_joins_args() {
        assert_eq!(
            format_command(Path::new("python3"), &["-m", "pip", "install"]),
            "python3 -m pip install"
        );
    }

    #[test]
    fn present_tool_is_upgraded_best_effort() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("pip.log");
        let tool = write_script(dir.path(), "yt-dlp", "echo 2025.01.15\n");
        let python = write_script(
            dir.path(),
            "python",
            &format!("echo \"$@\" >> '{}'\nexit 1\n", log.display()),
        );

        let installer = Installer::with_python(Some(python));
        let resolved = installer.ensure_tool(tool_at(tool.clone())).unwrap();
        assert_eq!(resolved.program, tool);
        assert!(resolved.leading_args.is_empty());
        let calls = fs::read_to_string(&log).unwrap();
        assert!(calls.contains("-m pip install --upgrade yt-dlp -q"));
    }

    #[test]
    fn missing_tool_without_python_is_fatal() {
        let dir = tempdir().unwrap();
        let installer = Installer::with_python(None);
        assert!(installer
            .ensure_tool(tool_at(dir.path().join("yt-dlp")))
            .is_err());
    }

    #[test]
    fn failed_install_is_fatal() {
        let dir = tempdir().unwrap();
        let python = write_script(dir.path(), "python", "exit 1\n");
        let installer = Installer::with_python(Some(python));
        let err = installer
            .ensure_tool(tool_at(dir.path().join("yt-dlp")))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to install yt-dlp"));
    }

    #[test]
    fn falls_back_to_python_module() {
        let dir = tempdir().unwrap();
        let python = write_script(
            dir.path(),
            "python",
            r#"if [[ "$1 $2" == "-m pip" ]]; then exit 0; fi
if [[ "$1 $2 $3" == "-m yt_dlp --version" ]]; then echo 2025.01.15; exit 0; fi
exit 2
"#,
        );
        let installer = Installer::with_python(Some(python.clone()));
        let resolved = installer
            .ensure_tool(tool_at(dir.path().join("yt-dlp")))
            .unwrap();
        assert_eq!(resolved.program, python);
        assert_eq!(resolved.leading_args, vec!["-m", "yt_dlp"]);
        assert_eq!(tool_version(&resolved).unwrap(), "2025.01.15");
    }
}
