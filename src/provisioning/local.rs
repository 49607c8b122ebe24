//! Local subprocess provisioner.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use super::{KernelProvisioner, LaunchCommand};
use crate::connection::ConnectionInfo;
use crate::kernelspec::KernelSpec;
use crate::types::{Error, Result};

/// Registry name of the bundled local provisioner.
pub const LOCAL_PROVISIONER: &str = "local";

/// Spawns the kernel as a local subprocess from the spec's argv template.
/// The process leads its own group on unix, and signals target the group,
/// so interrupts reach any workers the kernel forks.
#[derive(Debug, Default)]
pub struct LocalProvisioner {
    child: Option<Child>,
    /// Exit code observed by poll/wait after the child was reaped.
    exit_code: Option<i32>,
    connection_info: Option<ConnectionInfo>,
    /// Close the child's stdin instead of keeping a pipe open.
    pub close_stdin: bool,
}

impl LocalProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    fn record_exit(&mut self, status: std::process::ExitStatus) -> i32 {
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        self.child = None;
        code
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| -status.signal().unwrap_or(1))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

/// Substitute the launch-template tokens in one argv element.
fn substitute(arg: &str, connection_file: &Path, resource_dir: &Path) -> String {
    arg.replace("{connection_file}", &connection_file.to_string_lossy())
        .replace("{resource_dir}", &resource_dir.to_string_lossy())
}

#[async_trait]
impl KernelProvisioner for LocalProvisioner {
    fn has_process(&self) -> bool {
        self.child.is_some()
    }

    async fn pre_launch(
        &mut self,
        spec: &KernelSpec,
        connection_file: &Path,
    ) -> Result<LaunchCommand> {
        spec.validate()?;
        let cmd: Vec<String> = spec
            .argv
            .iter()
            .map(|arg| substitute(arg, connection_file, &spec.resource_dir))
            .collect();

        let mut env: HashMap<String, String> = std::env::vars().collect();
        for (k, v) in &spec.env {
            env.insert(k.clone(), v.clone());
        }

        Ok(LaunchCommand {
            cmd,
            env,
            cwd: None,
        })
    }

    async fn launch(&mut self, command: LaunchCommand) -> Result<()> {
        if self.child.is_some() {
            return Err(Error::state_transition("provisioner already has a process"));
        }
        let (program, args) = command
            .cmd
            .split_first()
            .ok_or_else(|| Error::validation("empty launch command"))?;

        let mut builder = Command::new(program);
        builder
            .args(args)
            .envs(&command.env)
            .stdin(if self.close_stdin {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // The kernel leads its own process group; interrupts and shutdown
        // signals must reach any workers it forks, not just the one pid.
        #[cfg(unix)]
        builder.process_group(0);
        if let Some(cwd) = &command.cwd {
            builder.current_dir(cwd);
        }

        let child = builder
            .spawn()
            .map_err(|e| Error::start_failed(format!("spawning {:?}: {}", program, e)))?;
        tracing::info!(pid = child.id(), program = %program, "kernel process launched");
        self.exit_code = None;
        self.child = Some(child);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<i32>> {
        match self.child.as_mut() {
            Some(child) => match child.try_wait()? {
                Some(status) => Ok(Some(self.record_exit(status))),
                None => Ok(None),
            },
            None => Ok(self.exit_code),
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Option<i32>> {
        if timeout.is_zero() {
            return self.poll().await;
        }
        match self.child.as_mut() {
            Some(child) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => Ok(Some(self.record_exit(status?))),
                Err(_) => Ok(None),
            },
            None => Ok(self.exit_code),
        }
    }

    async fn send_signal(&mut self, signum: i32) -> Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(()); // already gone
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let signal = Signal::try_from(signum)
                .map_err(|e| Error::validation(format!("bad signal {}: {}", signum, e)))?;
            // The child was launched as a process-group leader; target the
            // group (negative pid, the killpg form) so forked workers get
            // the signal too. Fall back to the single pid if that fails.
            match kill(Pid::from_raw(-(pid as i32)), signal) {
                Ok(()) => return Ok(()),
                Err(nix::errno::Errno::ESRCH) => return Ok(()), // group gone
                Err(group_err) => {
                    tracing::debug!(pid, signum, error = %group_err, "group signal failed; trying pid");
                }
            }
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) => Ok(()),
                Err(nix::errno::Errno::ESRCH) => Ok(()), // already exited
                Err(e) => Err(Error::Io(std::io::Error::other(format!(
                    "signal {} to pid {}: {}",
                    signum, pid, e
                )))),
            }
        }
        #[cfg(not(unix))]
        {
            // No real signals: anything but a plain kill is handled at the
            // manager level via control-channel messages.
            tracing::debug!(pid, signum, "signals unavailable; ignoring");
            Ok(())
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            self.send_signal(nix::sys::signal::Signal::SIGTERM as i32).await
        }
        #[cfg(not(unix))]
        {
            if let Some(child) = self.child.as_mut() {
                child.start_kill().ok();
            }
            Ok(())
        }
    }

    async fn kill(&mut self) -> Result<()> {
        // Take the whole group down, then the child handle itself.
        #[cfg(unix)]
        if self.child.is_some() {
            self.send_signal(nix::sys::signal::Signal::SIGKILL as i32)
                .await
                .ok();
        }
        if let Some(child) = self.child.as_mut() {
            match child.start_kill() {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                    // already exited
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self, _restart: bool) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            match child.try_wait()? {
                Some(status) => {
                    self.exit_code = Some(exit_code_of(status));
                }
                None => {
                    // Still running at cleanup time: force it down and reap.
                    child.start_kill().ok();
                    if let Ok(status) = child.wait().await {
                        self.exit_code = Some(exit_code_of(status));
                    }
                }
            }
        }
        Ok(())
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.connection_info.clone()
    }

    fn load_connection_info(&mut self, info: &ConnectionInfo) {
        self.connection_info = Some(info.clone());
    }
}
