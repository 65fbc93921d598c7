//! Shell hooks fired on phase entry and exit

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::HooksConfig;
use crate::domain::Phase;
use crate::git::wait_with_timeout;

/// What a hook is told about the transition
#[derive(Debug, Clone)]
pub struct HookContext {
    pub session_id: String,
    pub branch: Option<String>,
    pub from: Phase,
    pub to: Phase,
    pub work_dir: PathBuf,
}

/// Receives phase transitions after they are persisted
///
/// Errors are reported back to the engine, which logs them; a hook can never
/// undo a transition.
pub trait PhaseHooks {
    fn on_exit(&self, phase: Phase, ctx: &HookContext) -> Result<(), String>;
    fn on_enter(&self, phase: Phase, ctx: &HookContext) -> Result<(), String>;
}

/// Runs configured commands with `sh -c`
#[derive(Debug, Clone)]
pub struct ShellHooks {
    on_enter: BTreeMap<Phase, String>,
    on_exit: BTreeMap<Phase, String>,
    timeout: Duration,
}

impl ShellHooks {
    pub fn from_config(config: &HooksConfig) -> Self {
        Self {
            on_enter: config.on_enter.clone(),
            on_exit: config.on_exit.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn run(&self, event: &str, command: Option<&String>, ctx: &HookContext) -> Result<(), String> {
        let Some(command) = command else {
            return Ok(());
        };
        debug!(%event, %command, "ShellHooks::run: called");

        let mut output = tempfile::tempfile().map_err(|e| format!("hook output file: {}", e))?;
        let stderr = output.try_clone().map_err(|e| format!("hook output file: {}", e))?;
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.work_dir)
            .env("PX_EVENT", event)
            .env("PX_SESSION", &ctx.session_id)
            .env("PX_BRANCH", ctx.branch.as_deref().unwrap_or(""))
            .env("PX_PHASE_FROM", ctx.from.to_string())
            .env("PX_PHASE_TO", ctx.to.to_string())
            .stdin(Stdio::null())
            .stdout(output.try_clone().map_err(|e| format!("hook output file: {}", e))?)
            .stderr(stderr)
            .spawn()
            .map_err(|e| format!("cannot start hook '{}': {}", command, e))?;

        let status = wait_with_timeout(child, self.timeout).map_err(|e| format!("hook '{}': {}", command, e))?;
        let mut text = String::new();
        if output.seek(SeekFrom::Start(0)).is_ok() {
            let _ = output.read_to_string(&mut text);
        }
        match status {
            Some(status) if status.success() => {
                info!(%event, %command, "Hook completed");
                debug!(output = %text.trim(), "ShellHooks::run: hook output");
                Ok(())
            }
            Some(status) => Err(format!(
                "hook '{}' exited with {}: {}",
                command,
                status.code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
                text.trim()
            )),
            None => Err(format!("hook '{}' timed out after {:?}", command, self.timeout)),
        }
    }
}

impl PhaseHooks for ShellHooks {
    fn on_exit(&self, phase: Phase, ctx: &HookContext) -> Result<(), String> {
        self.run("exit", self.on_exit.get(&phase), ctx)
    }

    fn on_enter(&self, phase: Phase, ctx: &HookContext) -> Result<(), String> {
        self.run("enter", self.on_enter.get(&phase), ctx)
    }
}
