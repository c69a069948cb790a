//! Error taxonomy for correction calls.
//!
//! Correspondence-level failures (a ray missing the mesh, a range outside the
//! sensor bounds) are never errors; they are statistical exclusions handled in
//! the reduction. Errors here are call-level: bad input shapes or a failing
//! compute backend.

use thiserror::Error;

/// Errors produced by correction engines.
#[derive(Debug, Error)]
pub enum CorrectionError {
    /// Range buffer length does not match the sensor model's ray count.
    /// The call is rejected before any work is done.
    #[error("ranges length {got} does not match sensor model ray count {expected}")]
    InputShape { expected: usize, got: usize },

    /// No sensor model was set on the corrector.
    #[error("no sensor model set, call set_model() first")]
    MissingModel,

    /// No range data was set on the corrector.
    #[error("no range data set, call set_input_data() first")]
    MissingRanges,

    /// Multi-source merge weights do not sum to one.
    #[error("merge weights must sum to 1, got {0}")]
    InvalidWeights(f64),

    /// Multi-source merge inputs disagree on pose count.
    #[error("merge sources have mismatched pose counts")]
    SourceShape,

    /// The underlying compute backend failed. Fatal for the whole call;
    /// no partial results are returned.
    #[error("compute backend failure: {0}")]
    Backend(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CorrectionError>;
