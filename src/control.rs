/// Service control: the stop/start half of the service manager interface.
use crate::resolver::{ResolveError, ServiceHandle};
use std::path::PathBuf;
use std::time::Duration;

/// Stops and starts services.
///
/// `wait_for_stopped` blocks until the service manager reports the service
/// stopped. Any bound on that wait belongs to the implementation.
pub trait ServiceControl: Send + Sync + 'static {
    fn stop(&self, service: &ServiceHandle) -> Result<(), ControlError>;

    fn wait_for_stopped(&self, service: &ServiceHandle) -> Result<(), ControlError>;

    fn start(&self, service: &ServiceHandle) -> Result<(), ControlError>;
}

impl<T: ServiceControl> ServiceControl for std::sync::Arc<T> {
    fn stop(&self, service: &ServiceHandle) -> Result<(), ControlError> {
        (**self).stop(service)
    }

    fn wait_for_stopped(&self, service: &ServiceHandle) -> Result<(), ControlError> {
        (**self).wait_for_stopped(service)
    }

    fn start(&self, service: &ServiceHandle) -> Result<(), ControlError> {
        (**self).start(service)
    }
}

/// Errors raised by a stop, start or wait.
#[derive(Debug)]
pub enum ControlError {
    /// The control command could not be spawned.
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// The control command exited unsuccessfully.
    Command {
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    /// The service did not reach the stopped state in time.
    Timeout { service: String, waited: Duration },
    /// Querying the service state failed while waiting.
    Resolve { source: ResolveError },
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Spawn { program, source } => {
                write!(f, "failed to run {}: {}", program.display(), source)
            }
            ControlError::Command {
                action,
                code,
                stderr,
            } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                write!(f, "{action} exited with {code}: {}", stderr.trim())
            }
            ControlError::Timeout { service, waited } => write!(
                f,
                "service {service} did not stop within {}s",
                waited.as_secs()
            ),
            ControlError::Resolve { source } => {
                write!(f, "failed to query service state: {source}")
            }
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Spawn { source, .. } => Some(source),
            ControlError::Resolve { source } => Some(source),
            ControlError::Command { .. } | ControlError::Timeout { .. } => None,
        }
    }
}

impl From<ResolveError> for ControlError {
    fn from(source: ResolveError) -> Self {
        ControlError::Resolve { source }
    }
}
