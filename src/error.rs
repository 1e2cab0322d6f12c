//! Runtime error types.
//!
//! Defines error variants for the engine lifecycle: operations on a released
//! engine, construction failures, and the user-facing compatibility hint for
//! models in a legacy format.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Operation attempted on an engine that has already been released.
    #[error("engine closed")]
    Closed,

    #[error("failed to construct engine: {0}")]
    ConstructionFailed(#[source] LoadError),

    #[error("{source}: this model may be incompatible with your version of the runtime. If you previously pulled this model, try updating `{short_name}`")]
    Incompatible {
        short_name: String,
        #[source]
        source: LoadError,
    },

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Errors produced by the engine construction collaborator.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The model artifact uses a format this runtime cannot read.
    #[error("unsupported model format")]
    UnsupportedFormat,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Classify a construction failure.
    ///
    /// Some older models are not compatible with newer engine builds. Until
    /// there is a real compatibility probe, recognizable failures get a
    /// generalized hint naming the model so the user knows what to re-pull.
    pub(crate) fn from_load(err: LoadError, short_name: &str) -> Self {
        let recognizable = matches!(err, LoadError::UnsupportedFormat)
            || err.to_string().contains("failed to load model");
        if recognizable {
            RuntimeError::Incompatible {
                short_name: short_name.to_string(),
                source: err,
            }
        } else {
            RuntimeError::ConstructionFailed(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_gets_compat_hint() {
        let err = RuntimeError::from_load(LoadError::UnsupportedFormat, "llama2:7b");
        match &err {
            RuntimeError::Incompatible { short_name, .. } => {
                assert_eq!(short_name, "llama2:7b");
            }
            other => panic!("expected Incompatible, got {other:?}"),
        }
        assert!(err.to_string().contains("llama2:7b"));
    }

    #[test]
    fn load_failure_message_gets_compat_hint() {
        let err = RuntimeError::from_load(
            LoadError::Other("failed to load model /models/old.bin".to_string()),
            "old-model",
        );
        assert!(matches!(err, RuntimeError::Incompatible { .. }));
    }

    #[test]
    fn other_failures_pass_through() {
        let err = RuntimeError::from_load(LoadError::Other("out of memory".to_string()), "m");
        match err {
            RuntimeError::ConstructionFailed(source) => {
                assert_eq!(source.to_string(), "out of memory");
            }
            other => panic!("expected ConstructionFailed, got {other:?}"),
        }
    }
}
