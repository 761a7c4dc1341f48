//! Chromium process management

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::{RecorderError, Result};

/// Executable names tried on `PATH` when none is configured
const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

/// Well-known install locations outside `PATH`
const BROWSER_LOCATIONS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

const DEVTOOLS_PREFIX: &str = "DevTools listening on ";

/// A launched browser with its DevTools endpoint
pub struct BrowserProcess {
    child: Child,
    ws_url: String,
    // Removed when the process handle is dropped
    _profile: TempDir,
}

impl BrowserProcess {
    /// Launch a browser with remote debugging on an ephemeral port
    ///
    /// # Errors
    ///
    /// Returns error if no executable is found, the process cannot be
    /// spawned, or the DevTools endpoint does not come up in time
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let executable = match &config.executable {
            Some(path) => path.clone(),
            None => find_browser().ok_or_else(|| {
                RecorderError::Launch(
                    "no Chromium executable found; set browser.executable or CHROME_PATH"
                        .to_string(),
                )
            })?,
        };

        let profile = tempfile::Builder::new()
            .prefix("apitape-profile-")
            .tempdir()?;

        let mut command = Command::new(&executable);
        command
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking");
        if config.headless {
            command.arg("--headless=new");
        }
        command
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RecorderError::Launch(format!("{}: {e}", executable.display())))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RecorderError::Launch("browser stderr not captured".to_string()))?;

        let timeout = Duration::from_millis(config.launch_timeout_ms);
        let (ws_url, rest) = tokio::time::timeout(timeout, wait_for_devtools(stderr))
            .await
            .map_err(|_| {
                RecorderError::Launch(format!(
                    "DevTools endpoint not reported within {timeout:?}"
                ))
            })??;

        // Keep the pipe drained so the browser never blocks on stderr
        tokio::spawn(async move {
            let mut rest = rest;
            while let Ok(Some(line)) = rest.next_line().await {
                debug!(target: "apitape::browser", "{}", line);
            }
        });

        info!("Browser started: {}", executable.display());
        debug!("DevTools endpoint: {}", ws_url);

        Ok(Self {
            child,
            ws_url,
            _profile: profile,
        })
    }

    /// Browser-level DevTools WebSocket URL
    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Wait for the process to exit, killing it after `grace`
    ///
    /// # Errors
    ///
    /// Returns error if the process can neither be waited on nor killed
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Browser exited: {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(RecorderError::Release(format!(
                "failed to wait for browser: {e}"
            ))),
            Err(_) => {
                warn!("Browser did not exit within {:?}, killing it", grace);
                self.child
                    .kill()
                    .await
                    .map_err(|e| RecorderError::Release(format!("failed to kill browser: {e}")))
            }
        }
    }
}

/// Locate a Chromium-family executable
///
/// `CHROME_PATH` wins; otherwise `PATH` is searched for the usual names.
#[must_use]
pub fn find_browser() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("CHROME_PATH") {
        return Some(PathBuf::from(path));
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .flat_map(|dir| BROWSER_CANDIDATES.iter().map(move |name| dir.join(name)))
        .chain(BROWSER_LOCATIONS.iter().map(PathBuf::from))
        .find(|path| path.is_file())
}

async fn wait_for_devtools(
    stderr: ChildStderr,
) -> Result<(String, Lines<BufReader<ChildStderr>>)> {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(url) = parse_devtools_line(&line) {
            return Ok((url.to_string(), lines));
        }
        debug!(target: "apitape::browser", "{}", line);
    }

    Err(RecorderError::Launch(
        "browser exited before reporting a DevTools endpoint".to_string(),
    ))
}

fn parse_devtools_line(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(DEVTOOLS_PREFIX)
        .map(str::trim)
        .filter(|url| url.starts_with("ws://") || url.starts_with("wss://"))
}
