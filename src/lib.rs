//! Lifecycle management for a single resident inference engine.
//!
//! A long-running server keeps at most one loaded engine in memory. Building
//! one is slow, so identical requests share the resident instance, a
//! configuration change swaps it atomically, and an idle timeout releases it
//! automatically. The serving layer maps client requests onto
//! [`EngineRegistry::load`] / [`EngineRegistry::runner`] /
//! [`EngineRegistry::close`]; everything below that surface lives here.

pub mod engine;
pub mod error;
pub mod registry;
pub mod synced;

pub use engine::{
    Engine, EngineDescriptor, EngineLoader, EngineOptions, PredictCallback, PredictChunk,
    PredictRequest,
};
pub use error::{LoadError, RuntimeError, RuntimeResult};
pub use registry::{EngineRegistry, DEFAULT_KEEP_ALIVE};
pub use synced::SyncedEngine;
