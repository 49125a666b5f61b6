use thiserror::Error;

/// Domain failures that abort a run. I/O problems are reported through `anyhow` context.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Column '{0}' not found in vote table")]
    MissingColumn(String),

    #[error("Vote table has no count columns matching the configured pattern")]
    NoCountColumns,

    #[error("Malformed vote table row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    #[error("District code part {value} does not fit in {width} digits")]
    CodeOverflow { value: u64, width: usize },

    #[error("District '{0}' appears more than once in the geometry source")]
    DuplicateDistrict(String),

    #[error("Unsupported coordinate reference system in {path}: {reason}")]
    UnsupportedCrs { path: String, reason: String },

    #[error("Archive {archive} does not contain {member}")]
    MissingArchiveMember { archive: String, member: String },
}

/// Why a smoother could not produce a surface for one party.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("{coords} coordinates but {targets} targets")]
    LengthMismatch { coords: usize, targets: usize },

    #[error("Non-finite value in training data")]
    NonFinite,

    #[error("Need at least {needed} distinct locations, got {got}")]
    TooFewLocations { needed: usize, got: usize },

    #[error("Linear solve failed: {0}")]
    Solve(String),
}
