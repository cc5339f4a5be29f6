//! Browser process management - spawning Chrome and discovering its DevTools endpoint

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::{HarnessError, HarnessResult};

const EXECUTABLE_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "headless_shell",
];

#[cfg(target_os = "macos")]
const MACOS_CHROME: &str = "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome";

/// Handle to the shared browser process
pub struct BrowserProcess {
    child: Option<Child>,
    endpoint: String,
    pub debugging_port: u16,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "Browser", default)]
    browser: Option<String>,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

impl BrowserProcess {
    /// Spawn a headless browser and wait for its DevTools endpoint
    pub async fn launch(config: &BrowserConfig, profile_dir: &Path) -> HarnessResult<Self> {
        let executable = resolve_executable(config)?;
        let port = find_free_port()?;
        std::fs::create_dir_all(profile_dir)?;

        let args = build_args(config, port, profile_dir);
        debug!("Browser command: {} {}", executable.display(), args.join(" "));

        let child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                HarnessError::BrowserLaunch(format!(
                    "Failed to spawn {}: {}",
                    executable.display(),
                    e
                ))
            })?;

        info!("Browser started with PID {} (debugging port {})", child.id(), port);

        let mut process = BrowserProcess {
            child: Some(child),
            endpoint: String::new(),
            debugging_port: port,
        };

        match process.wait_for_endpoint(config.launch_timeout()).await {
            Ok(endpoint) => {
                process.endpoint = endpoint;
                Ok(process)
            }
            Err(e) => {
                process.stop().await;
                Err(e)
            }
        }
    }

    /// Poll `/json/version` until the browser reports its websocket address
    async fn wait_for_endpoint(&mut self, timeout_duration: Duration) -> HarnessResult<String> {
        let version_url = format!("http://127.0.0.1:{}/json/version", self.debugging_port);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(HarnessError::BrowserLaunch(format!(
                        "browser exited during startup with {}",
                        status
                    )));
                }
            }

            match client.get(&version_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let info: VersionInfo = resp.json().await?;
                    if !info.web_socket_debugger_url.is_empty() {
                        info!(
                            "DevTools endpoint ready ({})",
                            info.browser.as_deref().unwrap_or("unknown browser")
                        );
                        return Ok(info.web_socket_debugger_url);
                    }
                }
                Ok(resp) => {
                    warn!("DevTools version probe returned {}", resp.status());
                }
                Err(e) => {
                    // Connection refused is expected while the browser is starting
                    if !e.is_connect() {
                        warn!("DevTools version probe error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(HarnessError::BrowserLaunch(format!(
            "no DevTools endpoint on port {} after {} attempts",
            self.debugging_port, attempts
        )))
    }

    /// Websocket address other processes attach to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Terminate the browser, escalating to SIGKILL after two seconds. Safe
    /// to call more than once.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Stopping browser (pid: {})", child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                for _ in 0..20 {
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        return;
                    }
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }

        // Force kill if still running
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Leave the browser running after this handle goes away
    pub fn detach(mut self) -> Option<u32> {
        let pid = self.pid();
        // Dropping a std Child does not kill the process.
        self.child.take();
        pid
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("Killing browser (pid: {}) on drop", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Command line for a headless, deterministic browser
pub fn build_args(config: &BrowserConfig, port: u16, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--headless=new".to_string(),
        format!("--remote-debugging-port={}", port),
        "--remote-debugging-address=127.0.0.1".to_string(),
        format!("--user-data-dir={}", profile_dir.display()),
        format!(
            "--window-size={},{}",
            config.viewport_width, config.viewport_height
        ),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        // Stable glyph rasterization and colour across machines
        "--font-render-hinting=none".to_string(),
        "--force-color-profile=srgb".to_string(),
        "--force-device-scale-factor=1".to_string(),
    ];

    if config.no_sandbox {
        args.push("--no-sandbox".to_string());
    }

    args.extend(config.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

/// Configured executable, or the first known browser name found on PATH
pub fn resolve_executable(config: &BrowserConfig) -> HarnessResult<PathBuf> {
    if let Some(path) = &config.executable {
        if path.components().count() > 1 {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(HarnessError::BrowserLaunch(format!(
                "configured browser not found: {}",
                path.display()
            )));
        }
        return search_path(&path.to_string_lossy()).ok_or(HarnessError::BrowserNotFound);
    }

    for name in EXECUTABLE_CANDIDATES {
        if let Some(found) = search_path(name) {
            return Ok(found);
        }
    }

    #[cfg(target_os = "macos")]
    {
        let app = PathBuf::from(MACOS_CHROME);
        if app.exists() {
            return Ok(app);
        }
    }

    Err(HarnessError::BrowserNotFound)
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Find a free port to use
fn find_free_port() -> HarnessResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port() {
        let port = find_free_port().unwrap();
        assert!(port > 1024);
    }

    #[test]
    fn test_build_args_fixed_viewport() {
        let config = BrowserConfig {
            viewport_width: 1024,
            viewport_height: 768,
            no_sandbox: false,
            extra_args: vec!["--lang=en-US".to_string()],
            ..Default::default()
        };
        let args = build_args(&config, 9222, Path::new("/tmp/profile"));

        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(args.contains(&"--window-size=1024,768".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(!args.contains(&"--no-sandbox".to_string()));
        assert_eq!(args[args.len() - 2], "--lang=en-US");
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn test_missing_configured_executable() {
        let config = BrowserConfig {
            executable: Some(PathBuf::from("/nonexistent/bin/chrome")),
            ..Default::default()
        };
        let err = resolve_executable(&config).unwrap_err();
        assert!(matches!(err, HarnessError::BrowserLaunch(_)));
        assert!(err.is_fatal());
    }

    fn spawned(script: &str) -> BrowserProcess {
        let child = Command::new("sh").arg("-c").arg(script).spawn().unwrap();
        BrowserProcess {
            child: Some(child),
            endpoint: "ws://127.0.0.1:1/devtools/browser/test".to_string(),
            debugging_port: 1,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_and_is_idempotent() {
        let mut process = spawned("exec sleep 30");
        assert!(process.pid().is_some());

        let start = Instant::now();
        process.stop().await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(process.pid().is_none());

        process.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn test_stop_escalation_does_not_block_runtime() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut process = spawned("trap '' TERM; exec sleep 30");
        // Let the shell install its trap before signalling
        sleep(Duration::from_millis(200)).await;

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
            }
        });

        process.stop().await;
        ticker.abort();

        assert!(process.pid().is_none());
        assert!(ticks.load(Ordering::SeqCst) >= 10);
    }

    #[test]
    fn test_detach_leaves_process_running() {
        let process = spawned("exec sleep 30");
        let pid = process.detach().unwrap();

        let mut reaper = Command::new("kill").arg(pid.to_string()).spawn().unwrap();
        assert!(reaper.wait().unwrap().success());
    }

    #[test]
    fn test_version_info_parse() {
        let body = r#"{
            "Browser": "HeadlessChrome/120.0.6099.109",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
        }"#;
        let info: VersionInfo = serde_json::from_str(body).unwrap();
        assert_eq!(info.web_socket_debugger_url, "ws://127.0.0.1:9222/devtools/browser/abc");
        assert_eq!(info.browser.as_deref(), Some("HeadlessChrome/120.0.6099.109"));
    }
}
