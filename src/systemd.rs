/// Linux backend: resolves and controls services through `systemctl`, and
/// reads resident memory from `/proc/<pid>/status`.
///
/// Resolution is two queries: `systemctl show` answers whether the unit
/// exists and which PID is its main process, then `/proc` answers how much
/// memory that PID holds right now.
use crate::config::SystemdConfig;
use crate::control::{ControlError, ServiceControl};
use crate::resolver::{ProcessResolver, ProcessSample, ResolveError, ServiceHandle};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

const SHOW_PROPERTIES: &str = "Id,Description,LoadState,MainPID";
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Systemd {
    systemctl: PathBuf,
    leading_args: Vec<OsString>,
    user: bool,
    stop_wait: Duration,
    proc_root: PathBuf,
}

impl Systemd {
    pub fn new(config: &SystemdConfig) -> Self {
        Self {
            systemctl: config.systemctl.clone(),
            leading_args: Vec::new(),
            user: config.user,
            stop_wait: Duration::from_secs(config.stop_wait_secs),
            proc_root: config.proc_root.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.systemctl);
        cmd.args(&self.leading_args);
        if self.user {
            cmd.arg("--user");
        }
        cmd
    }

    fn show(&self, unit: &str, properties: &str) -> Result<HashMap<String, String>, ResolveError> {
        let output = self
            .command()
            .args(["show", unit, "--property", properties])
            .output()
            .map_err(|e| ResolveError::Spawn {
                program: self.systemctl.clone(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(ResolveError::Command {
                program: self.systemctl.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(parse_properties(&String::from_utf8_lossy(&output.stdout)))
    }

    fn control(&self, action: &'static str, unit: &str) -> Result<(), ControlError> {
        tracing::debug!(action, unit, "invoking systemctl");
        let output: Output = self
            .command()
            .args([action, unit])
            .output()
            .map_err(|e| ControlError::Spawn {
                program: self.systemctl.clone(),
                source: e,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ControlError::Command {
                action,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    fn active_state(&self, unit: &str) -> Result<String, ResolveError> {
        let mut props = self.show(unit, "ActiveState")?;
        props.remove("ActiveState").ok_or_else(|| ResolveError::Parse {
            detail: format!("no ActiveState reported for {unit}"),
        })
    }

    /// Resident memory of `pid` in bytes, or `None` if the process is gone.
    fn resident_bytes(&self, pid: u32) -> Result<Option<u64>, ResolveError> {
        let path = self.proc_root.join(pid.to_string()).join("status");
        let status = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ResolveError::Io { path, source: e }),
        };
        Ok(parse_vm_rss_kb(&status).map(|kb| kb.saturating_mul(1024)))
    }
}

/// Whether `pid` names a live process. EPERM still means it exists.
fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Parse `systemctl show` output (`Key=Value` per line).
fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Extract the `VmRSS` value (kB) from a `/proc/<pid>/status` file.
///
/// Kernel threads and zombies have no `VmRSS` line.
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        line.strip_prefix("VmRSS:")?
            .split_whitespace()
            .next()?
            .parse::<u64>()
            .ok()
    })
}

fn service_from_properties(
    name: &str,
    props: &HashMap<String, String>,
) -> Result<Option<ServiceHandle>, ResolveError> {
    let load_state = props.get("LoadState").ok_or_else(|| ResolveError::Parse {
        detail: format!("no LoadState reported for {name}"),
    })?;
    if load_state == "not-found" {
        return Ok(None);
    }

    let display_name = props
        .get("Description")
        .filter(|d| !d.is_empty())
        .or_else(|| props.get("Id").filter(|id| !id.is_empty()))
        .cloned()
        .unwrap_or_else(|| name.to_string());

    Ok(Some(ServiceHandle {
        name: name.to_string(),
        display_name,
    }))
}

fn main_pid(name: &str, props: &HashMap<String, String>) -> Result<Option<u32>, ResolveError> {
    let raw = props.get("MainPID").ok_or_else(|| ResolveError::Parse {
        detail: format!("no MainPID reported for {name}"),
    })?;
    let pid: u32 = raw.parse().map_err(|_| ResolveError::Parse {
        detail: format!("MainPID={raw}"),
    })?;
    Ok((pid != 0).then_some(pid))
}

impl ProcessResolver for Systemd {
    fn find_service(&self, name: &str) -> Result<Option<ServiceHandle>, ResolveError> {
        let props = self.show(name, SHOW_PROPERTIES)?;
        service_from_properties(name, &props)
    }

    fn find_process(
        &self,
        service: &ServiceHandle,
    ) -> Result<Option<ProcessSample>, ResolveError> {
        let props = self.show(&service.name, "MainPID")?;
        let Some(pid) = main_pid(&service.name, &props)? else {
            return Ok(None);
        };
        if !process_alive(pid) {
            tracing::debug!(pid, service = %service.name, "main PID no longer alive");
            return Ok(None);
        }
        Ok(self
            .resident_bytes(pid)?
            .map(|bytes| ProcessSample::new(pid, bytes)))
    }
}

impl ServiceControl for Systemd {
    fn stop(&self, service: &ServiceHandle) -> Result<(), ControlError> {
        self.control("stop", &service.name)
    }

    fn wait_for_stopped(&self, service: &ServiceHandle) -> Result<(), ControlError> {
        let started = Instant::now();
        loop {
            let state = self.active_state(&service.name)?;
            if state == "inactive" || state == "failed" {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.stop_wait {
                return Err(ControlError::Timeout {
                    service: service.name.clone(),
                    waited,
                });
            }
            tracing::debug!(state = %state, service = %service.name, "waiting for service to stop");
            std::thread::sleep(STATE_POLL_INTERVAL);
        }
    }

    fn start(&self, service: &ServiceHandle) -> Result<(), ControlError> {
        self.control("start", &service.name)
    }
}
