//! Platform challenge resolvers driving a local Google Chrome.
//!
//! macOS uses AppleScript through `osascript` and supports inspection.
//! Windows activates the browser window through PowerShell and sends Ctrl+R;
//! it can refresh but not inspect.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use super::resolver::{ChallengeResolver, ChallengeState, ResolverError};
use super::SurfaceSelector;
use crate::models::RefreshMethod;

/// Longest a single automation script may run.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Concurrent automation scripts.
const MAX_CONCURRENT_SCRIPTS: usize = 2;

/// Chrome's refusal messages when "Allow JavaScript from Apple Events" is off.
const SCRIPTING_DISABLED_MARKERS: &[&str] = &["Apple events JavaScript", "允许 Apple 事件中的 JavaScript"];

const TAG_READ_JS: &str = "(() => { try { return window.name || ''; } catch (e) { return ''; } })();";

const CAPTCHA_CHECK_JS: &str = "(() => {  try {    const hasCaptcha = !!document.querySelector(\
    '.yidun_modal,.yidun,.yidun_panel,.yidun_control,.yidun_bgimg');    if (hasCaptcha) {\
    window.dispatchEvent(new Event('codex-run-captcha'));      return 'PENDING';    }    return 'OK';\
  } catch (e) {    return 'JSERR:' + String(e);  }})();";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Mac,
    Windows,
}

fn host_platform() -> Option<Platform> {
    if cfg!(target_os = "macos") {
        Some(Platform::Mac)
    } else if cfg!(target_os = "windows") {
        Some(Platform::Windows)
    } else {
        None
    }
}

fn platform_for(method: RefreshMethod) -> Option<Platform> {
    match method {
        RefreshMethod::Mac => Some(Platform::Mac),
        RefreshMethod::Windows => Some(Platform::Windows),
        RefreshMethod::Auto => host_platform(),
    }
}

/// Escape text for an AppleScript string literal.
fn applescript_quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// What to do with the matching Chrome tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TabAction {
    Reload,
    CheckCaptcha,
    Location,
}

impl TabAction {
    fn body(&self) -> String {
        match self {
            TabAction::Reload => "tell t to reload\n                return \"OK\"".to_string(),
            TabAction::CheckCaptcha => format!(
                "set r to execute t javascript \"{}\"\n                if r is missing value then return \"PENDING\"\n                return r as text",
                applescript_quote(CAPTCHA_CHECK_JS)
            ),
            TabAction::Location => "return u as text".to_string(),
        }
    }
}

/// AppleScript that finds the selector's tab and applies `action` to it.
///
/// A window tag matches the tab's `window.name`; otherwise the first tab whose
/// URL contains the URL keyword matches. A window index restricts the search
/// to that window.
fn chrome_tab_script(selector: &SurfaceSelector, action: TabAction) -> String {
    let url_keyword = applescript_quote(&selector.url_keyword);
    let window_tag = applescript_quote(&selector.window_tag);
    let use_index = selector.window_index > 0;
    let use_tag = !window_tag.is_empty();
    let url_check = if url_keyword.is_empty() {
        "true".to_string()
    } else {
        format!("(u contains \"{}\")", url_keyword)
    };
    let matcher = if use_tag {
        format!(
            "set n to execute t javascript \"{}\"\n            if n is missing value then set n to \"\"\n            if (n as text) is \"{}\" then",
            applescript_quote(TAG_READ_JS),
            window_tag
        )
    } else {
        format!("if {} then", url_check)
    };

    format!(
        r#"
tell application "Google Chrome"
    if (count of windows) is 0 then return "NO_WINDOW"
    set winStart to 1
    set winEnd to (count of windows)
    if {use_index} then
        if ({index} > winEnd) then return "NO_WINDOW_INDEX"
        set winStart to {index}
        set winEnd to {index}
    end if
    repeat with wi from winStart to winEnd
        set w to window wi
        repeat with ti from 1 to (count of tabs of w)
            set t to tab (ti as integer) of w
            set u to URL of t
            {matcher}
                {body}
            end if
        end repeat
    end repeat
    return "NO_TAB"
end tell
"#,
        use_index = use_index,
        index = selector.window_index,
        matcher = matcher,
        body = action.body(),
    )
}

fn windows_refresh_command(window_keyword: &str) -> String {
    let keyword = window_keyword.replace('\'', "''");
    format!(
        "$ws=New-Object -ComObject WScript.Shell; \
         if(-not $ws.AppActivate('{}')){{ Write-Output 'NO_WINDOW'; exit 2 }}; \
         Start-Sleep -Milliseconds 200; \
         $ws.SendKeys('^r'); \
         Write-Output 'OK';",
        keyword
    )
}

/// Map a failed script's output to a resolver error.
fn classify_failure(stdout: &str, stderr: &str, status: Option<i32>) -> ResolverError {
    let reason = if !stdout.is_empty() {
        stdout.to_string()
    } else if !stderr.is_empty() {
        stderr.to_string()
    } else {
        format!("returncode={}", status.map_or("signal".to_string(), |c| c.to_string()))
    };
    if SCRIPTING_DISABLED_MARKERS
        .iter()
        .any(|marker| stdout.contains(marker) || stderr.contains(marker))
    {
        ResolverError::ScriptingDisabled(reason)
    } else {
        ResolverError::Failed(reason)
    }
}

struct ScriptOutput {
    success: bool,
    stdout: String,
    stderr: String,
    status: Option<i32>,
}

/// Resolver that picks the automation for each selector's method and the host OS.
pub struct PlatformResolver {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl Default for PlatformResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformResolver {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_SCRIPTS)),
            timeout: SCRIPT_TIMEOUT,
        }
    }

    fn require(&self, selector: &SurfaceSelector, wanted: Platform) -> Result<(), ResolverError> {
        match (platform_for(selector.method), host_platform()) {
            (Some(p), Some(host)) if p == wanted && p == host => Ok(()),
            (Some(Platform::Mac), _) => Err(ResolverError::Unsupported(
                "mac automation requires macOS".to_string(),
            )),
            (Some(Platform::Windows), _) => Err(ResolverError::Unsupported(
                "windows automation requires Windows".to_string(),
            )),
            (None, _) => Err(ResolverError::Unsupported(format!(
                "{} has no automation on {}",
                selector.method.as_str(),
                std::env::consts::OS
            ))),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<ScriptOutput, ResolverError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ResolverError::Failed("automation pool closed".to_string()))?;

        debug!("Running {} automation script", program);
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ResolverError::Failed(format!("{} timed out after {:?}", program, self.timeout)))?
            .map_err(|e| ResolverError::Failed(format!("{} failed: {}", program, e)))?;

        Ok(ScriptOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            status: output.status.code(),
        })
    }

    async fn osascript(&self, script: &str) -> Result<String, ResolverError> {
        let out = self.run("osascript", &["-e", script]).await?;
        if !out.success {
            return Err(classify_failure(&out.stdout, &out.stderr, out.status));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl ChallengeResolver for PlatformResolver {
    fn supports_inspection(&self, selector: &SurfaceSelector) -> bool {
        self.require(selector, Platform::Mac).is_ok()
    }

    async fn refresh(&self, selector: &SurfaceSelector) -> Result<(), ResolverError> {
        match platform_for(selector.method) {
            Some(Platform::Mac) => {
                self.require(selector, Platform::Mac)?;
                let out = self
                    .osascript(&chrome_tab_script(selector, TabAction::Reload))
                    .await?;
                if out == "OK" {
                    Ok(())
                } else {
                    Err(classify_failure(&out, "", Some(0)))
                }
            }
            Some(Platform::Windows) => {
                self.require(selector, Platform::Windows)?;
                let command = windows_refresh_command(&selector.window_keyword);
                let out = self
                    .run("powershell", &["-NoProfile", "-Command", &command])
                    .await?;
                if out.success && out.stdout.contains("OK") {
                    Ok(())
                } else {
                    Err(classify_failure(&out.stdout, &out.stderr, out.status))
                }
            }
            None => Err(self
                .require(selector, Platform::Mac)
                .err()
                .unwrap_or_else(|| ResolverError::Unsupported("no automation".to_string()))),
        }
    }

    async fn poll_state(&self, selector: &SurfaceSelector) -> Result<ChallengeState, ResolverError> {
        self.require(selector, Platform::Mac)?;
        let out = self
            .osascript(&chrome_tab_script(selector, TabAction::CheckCaptcha))
            .await?;
        Ok(ChallengeState::parse(&out))
    }

    async fn current_location(&self, selector: &SurfaceSelector) -> Result<String, ResolverError> {
        self.require(selector, Platform::Mac)?;
        let out = self
            .osascript(&chrome_tab_script(selector, TabAction::Location))
            .await?;
        match out.as_str() {
            "" | "NO_WINDOW" | "NO_WINDOW_INDEX" | "NO_TAB" => Err(ResolverError::Failed(if out.is_empty() {
                "empty location".to_string()
            } else {
                out
            })),
            _ => Ok(out),
        }
    }
}
