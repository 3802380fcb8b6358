//! passage-core — identity matching and liveness decision engine.
//!
//! Grants or denies physical access by matching embeddings from an external
//! face detector against a persistent identity index, gated by a temporal
//! liveness check that rejects photo and replay attacks. This crate owns
//! only the decision logic; camera capture, model inference, storage of user
//! records and the service transport live with its callers.

pub mod config;
pub mod engine;
pub mod index;
pub mod liveness;
pub mod matcher;
pub mod quality;
pub mod raster;
pub mod types;

pub use config::{ConfigError, EngineConfig, LivenessConfig};
pub use engine::{AccessDecision, AccessEngine, EngineError, EngineStats};
pub use index::{IdentityIndex, IndexError};
pub use liveness::{LivenessSession, LivenessStats, SessionState};
pub use matcher::{Matcher, Recognition};
pub use quality::{Precision, QualityFilter};
pub use types::{BoundingBox, Detection, Embedding, FrameSample, GrayFrame, EMBEDDING_DIM};
