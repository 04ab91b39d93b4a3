use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an overmount-related operation.
pub type OvermountResult<T> = Result<T, OvermountError>;

/// An error that occurred while planning, mounting or supervising an overlay filesystem.
#[derive(Debug, Error)]
pub enum OvermountError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// A mapping source that was expected to be a directory is not one.
    #[error("source is not a directory: {0}")]
    SourceNotADirectory(String),

    /// A mapping destination exists but is not a directory.
    #[error("destination is not a directory: {0}")]
    DestinationNotADirectory(String),

    /// A file mapping source is a directory.
    #[error("source file must not be a directory: {0}")]
    SourceIsADirectory(String),

    /// A configured directory does not exist and creating it was not allowed.
    #[error("directory does not exist: {0}")]
    DirectoryMissing(String),

    /// A path appears as both a source and a destination in the mapping set.
    #[error("source {0} cannot simultaneously be a destination")]
    SourceIsAlsoDestination(String),

    /// More than one `overwrite` source was mapped onto the same destination.
    #[error("multiple overwrite layers mapped onto {0}")]
    MultipleOverwriteLayers(String),

    /// A file-mapping destination directory coincides with a directory-mapping destination.
    #[error("file destination {0} must not exist in directory destinations")]
    FileDestinationCollision(String),

    /// A previous mount attempt left groups mounted; they must be unmounted first.
    #[error("previous mount attempt left mounted groups, unmount before mounting again")]
    PartialMount,

    /// The external utility could not be resolved to an executable.
    #[error("could not resolve {program}: {source}")]
    UtilityNotFound {
        /// The configured utility name.
        program: String,
        /// The resolution failure.
        source: which::Error,
    },

    /// The external utility exited with a non-zero status.
    #[error("{program} failed for {target} with {status}: {output}")]
    UtilityFailed {
        /// The invoked utility.
        program: String,
        /// The mount point the utility ran against.
        target: String,
        /// The exit status.
        status: std::process::ExitStatus,
        /// The captured merged output.
        output: String,
    },

    /// The external utility did not finish within the fixed wait bound.
    #[error("{program} timed out for {target}, the process may still be running")]
    UtilityTimeout {
        /// The invoked utility.
        program: String,
        /// The mount point the utility ran against.
        target: String,
    },

    /// A whiteout device node could not be created.
    #[error("could not create whiteout file {path}: {source}")]
    WhiteoutCreate {
        /// The node path inside the upper layer.
        path: String,
        /// The underlying `mknod` failure.
        source: nix::Error,
    },

    /// A client process could not be spawned.
    #[error("error creating process {name}: {source}")]
    ProcessSpawn {
        /// The application that failed to start.
        name: String,
        /// The underlying spawn failure.
        source: std::io::Error,
    },

    /// A spawned process reported no process identifier.
    #[error("process id not found for {0}")]
    ProcessIdNotFound(String),

    /// A command line contained an unterminated quote.
    #[error("unbalanced quotes in command line: {0}")]
    UnbalancedQuotes(String),

    /// A log file path without a file name was supplied.
    #[error("invalid log file path: {0}")]
    InvalidLogFile(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OvermountError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> OvermountError {
        OvermountError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `OvermountResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> OvermountResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
