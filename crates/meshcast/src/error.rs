use thiserror::Error;

/// Errors produced while building meshes, validating placements, planning
/// casts, or executing graphs.
#[derive(Debug, Error)]
pub enum Error {
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    /// A distribution vector does not fit its mesh or its tensor.
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    /// Source and target hierarchies disagree on the total device count.
    ///
    /// A cast between such placements is rejected before any collective
    /// communication is dispatched.
    #[error(
        "device count mismatch: source hierarchy {src:?} has {src_count} devices, \
         target hierarchy {dst:?} has {dst_count}"
    )]
    DeviceCountMismatch {
        /// Mesh shape of the source placement.
        src: Vec<usize>,
        /// Mesh shape of the target placement.
        dst: Vec<usize>,
        /// Device count of the source placement.
        src_count: usize,
        /// Device count of the target placement.
        dst_count: usize,
    },

    /// Tensor shapes are incompatible with the requested operation.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An operand had the wrong element kind.
    #[error("dtype mismatch: {0}")]
    DTypeMismatch(String),

    /// Graph construction or execution failed.
    #[error("graph error: {0}")]
    Graph(String),

    /// Optimizer or learning-rate schedule configuration is invalid.
    #[error("optimizer error: {0}")]
    Optim(String),
}

/// Convenience alias for results carrying [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
