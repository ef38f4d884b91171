/// Service-to-process resolution.
///
/// Mapping a service name to the process backing it takes a second query
/// against the service manager, and the answer changes every time the
/// service restarts. Implementations are consulted fresh on every cycle.
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// A service registered with the OS service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Stable name used to address the service (e.g. `CorsairService`).
    pub name: String,
    /// Human-readable name used in log messages.
    pub display_name: String,
}

/// Resident memory of a service's process, read at `sampled_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSample {
    pub pid: u32,
    pub resident_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

impl ProcessSample {
    pub fn new(pid: u32, resident_bytes: u64) -> Self {
        Self {
            pid,
            resident_bytes,
            sampled_at: Utc::now(),
        }
    }

    /// Resident memory in whole kilobytes (sub-kilobyte remainder dropped).
    pub fn resident_kb(&self) -> u64 {
        self.resident_bytes / 1024
    }
}

/// Looks up a service and the process currently backing it.
///
/// "Not found" is an expected outcome (the service may be mid-restart) and is
/// reported as `Ok(None)`. `Err` means the lookup itself could not be done.
pub trait ProcessResolver: Send + Sync + 'static {
    fn find_service(&self, name: &str) -> Result<Option<ServiceHandle>, ResolveError>;

    fn find_process(&self, service: &ServiceHandle)
        -> Result<Option<ProcessSample>, ResolveError>;
}

impl<T: ProcessResolver> ProcessResolver for std::sync::Arc<T> {
    fn find_service(&self, name: &str) -> Result<Option<ServiceHandle>, ResolveError> {
        (**self).find_service(name)
    }

    fn find_process(
        &self,
        service: &ServiceHandle,
    ) -> Result<Option<ProcessSample>, ResolveError> {
        (**self).find_process(service)
    }
}

/// Errors that prevent a lookup from producing an answer.
#[derive(Debug)]
pub enum ResolveError {
    /// The introspection command could not be spawned.
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// The introspection command ran but reported failure.
    Command { program: PathBuf, stderr: String },
    /// The command output could not be interpreted.
    Parse { detail: String },
    /// Reading process information failed for a reason other than absence.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Spawn { program, source } => {
                write!(f, "failed to run {}: {}", program.display(), source)
            }
            ResolveError::Command { program, stderr } => {
                write!(f, "{} failed: {}", program.display(), stderr.trim())
            }
            ResolveError::Parse { detail } => write!(f, "unexpected output: {detail}"),
            ResolveError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::Spawn { source, .. } => Some(source),
            ResolveError::Io { source, .. } => Some(source),
            ResolveError::Command { .. } | ResolveError::Parse { .. } => None,
        }
    }
}
