//! Error types for the halo finder.

use thiserror::Error;

/// Failure inside a collective exchange.
#[derive(Error, Debug)]
pub enum CommError {
    /// A payload could not be encoded or decoded
    #[error("failed to encode collective payload: {0}")]
    Encode(String),
    /// A worker's contribution was absent from the exchange
    #[error("worker {rank} contributed no payload")]
    Missing {
        /// Rank that was expected to contribute
        rank: usize,
    },
    /// Workers contributed arrays of different lengths, meaning they diverged
    #[error("collective length mismatch: expected {expected}, worker {rank} sent {found}")]
    LengthMismatch {
        /// Length on the calling worker
        expected: usize,
        /// Length received
        found: usize,
        /// Rank whose contribution disagreed
        rank: usize,
    },
    /// Broadcast root outside the worker range
    #[error("root rank {root} out of range for {size} workers")]
    BadRoot {
        /// Requested root
        root: usize,
        /// Number of workers
        size: usize,
    },
}

/// Errors surfaced by the halo finder.
#[derive(Error, Debug)]
pub enum HaloError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Not enough particles for the requested neighbor count
    #[error("only {found} particles available but num_neighbors = {required}")]
    InsufficientParticles {
        /// Global particle count
        found: u64,
        /// Requested neighbor count
        required: usize,
    },
    /// A particle carries a negative index
    #[error("particle index {index} is negative")]
    InvalidParticleIndex {
        /// Offending index
        index: i64,
    },
    /// A particle index appears more than once
    #[error("particle index {index} appears more than once")]
    DuplicateParticleIndex {
        /// Offending index
        index: i64,
    },
    /// Another worker hit a fatal precondition and the run was stopped collectively
    #[error("run aborted collectively: {0}")]
    CollectiveAbort(String),
    /// Collective transport failure
    #[error(transparent)]
    Comm(#[from] CommError),
    /// A worker thread panicked
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
    /// A property needs mass but the halo has none
    #[error("halo {0} has no particles")]
    EmptyHalo(usize),
    /// Halo id outside the catalog
    #[error("halo {id} out of range for catalog of {len}")]
    UnknownHalo {
        /// Requested id
        id: usize,
        /// Catalog length
        len: usize,
    },
    /// File system failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
    /// Malformed catalog or index text
    #[error("malformed line {line} in {path}: {message}")]
    Format {
        /// File involved
        path: String,
        /// One-based line number
        line: usize,
        /// What was wrong
        message: String,
    },
    /// Particle record file could not be encoded or decoded
    #[error("particle record file {path}: {message}")]
    Encode {
        /// File involved
        path: String,
        /// Encoder message
        message: String,
    },
}

impl HaloError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        HaloError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HaloError>;
