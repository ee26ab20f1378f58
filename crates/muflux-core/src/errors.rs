//! Error kinds and the pluggable error handler.
//!
//! Two reporting channels coexist, mirroring how the library distinguishes
//! construction failures from in-flight anomalies:
//!
//! - Constructors return [`MufluxResult`]; the caller gets the error
//!   directly.
//! - In-flight anomalies (bad inputs, driver refusals) produce zero or
//!   sentinel results and are *signalled* through an error handler: the
//!   fluxmeter's per-instance handler when installed, otherwise the
//!   process-wide default set with [`set_error_handler`]. Without either,
//!   the error is logged through `tracing` — the library never aborts the
//!   process.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use muflux_physics::PhysicsError;

/// Error type of the fluxmeter library.
#[derive(Error, Debug)]
pub enum MufluxError {
    /// A caller-provided value is out of range.
    #[error("{0}")]
    BadInput(String),
    /// A file could not be opened or read.
    #[error("could not open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A file's content is inconsistent with its format.
    #[error("bad format ({0})")]
    Format(String),
    /// An allocation or capacity limit was hit.
    #[error("resource exhausted ({0})")]
    Resource(String),
    /// The physics driver refused a setup request.
    #[error("{0}")]
    PhysicsSetup(String),
}

/// Convenience alias for `Result<T, MufluxError>`.
pub type MufluxResult<T> = Result<T, MufluxError>;

impl From<PhysicsError> for MufluxError {
    fn from(err: PhysicsError) -> Self {
        match err {
            PhysicsError::Io { path, source } => MufluxError::Io { path, source },
            PhysicsError::Format(what) => MufluxError::Format(what),
            PhysicsError::UnknownMaterial(name) => {
                MufluxError::PhysicsSetup(format!("unknown material ({name})"))
            }
            PhysicsError::StepLimit => {
                MufluxError::Resource("transport step budget exhausted".to_string())
            }
        }
    }
}

/// Signature of an installable error handler.
pub type ErrorHandler = Arc<dyn Fn(&MufluxError) + Send + Sync>;

static DEFAULT_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

/// Install the process-wide default error handler.
///
/// Returns the previous handler so callers can restore it deterministically.
pub fn set_error_handler(handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
    let mut guard = DEFAULT_HANDLER
        .write()
        .expect("error handler lock poisoned");
    std::mem::replace(&mut *guard, handler)
}

/// Signal an error through `instance`, the process default, or tracing.
pub(crate) fn report(instance: Option<&ErrorHandler>, error: &MufluxError) {
    if let Some(handler) = instance {
        handler(error);
        return;
    }
    let guard = DEFAULT_HANDLER.read().expect("error handler lock poisoned");
    match guard.as_ref() {
        Some(handler) => handler(error),
        None => tracing::error!(target: "muflux", "{error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn handler_installation_returns_predecessor() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let previous = set_error_handler(Some(Arc::new(move |err: &MufluxError| {
            sink.lock().unwrap().push(err.to_string());
        })));

        report(None, &MufluxError::BadInput("bad kinetic energy (0)".into()));
        // Other tests may report through the global handler concurrently, so
        // only require that our message went through it.
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|message| message == "bad kinetic energy (0)"));

        let installed = set_error_handler(previous);
        assert!(installed.is_some());
    }

    #[test]
    fn instance_handler_wins_over_default() {
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let instance: ErrorHandler = Arc::new(move |_| *sink.lock().unwrap() += 1);
        report(
            Some(&instance),
            &MufluxError::PhysicsSetup("unknown material (Mud)".into()),
        );
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn physics_errors_map_onto_core_kinds() {
        let err: MufluxError = PhysicsError::UnknownMaterial("Mud".into()).into();
        assert!(matches!(err, MufluxError::PhysicsSetup(_)));
        assert_eq!(err.to_string(), "unknown material (Mud)");

        let err: MufluxError = PhysicsError::Format("truncated".into()).into();
        assert!(matches!(err, MufluxError::Format(_)));
    }
}
