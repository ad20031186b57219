use thiserror::Error;

/// Errors found while validating a `Configuration`.
///
/// These are only ever produced before the pipeline is live.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A metric family was configured with zero worker threads.
    #[error("{0} must have at least one worker thread")]
    NoThreads(&'static str),

    /// A period of zero milliseconds would spin the workers.
    #[error("{0} period must be greater than zero")]
    ZeroPeriod(&'static str),

    /// The path table of a family needs at least one bucket.
    #[error("{0} hash size must be greater than zero")]
    ZeroHashSize(&'static str),

    /// A percentile threshold could not be parsed or makes no sense.
    #[error("invalid threshold {0:?}: {1}")]
    InvalidThreshold(String, &'static str),

    /// A path filter regex did not compile.
    #[error("invalid path pattern: {0}")]
    InvalidPattern(String),

    /// A synthetic metric definition is incomplete or inconsistent.
    #[error("synthetic {0:?}: {1}")]
    InvalidSynthetic(String, String),

    /// A target definition is inconsistent.
    #[error("target {0:?}: {1}")]
    InvalidTarget(String, &'static str),

    /// The output buffer cannot hold a single report line.
    #[error("output buffer size must be greater than its high-water mark")]
    InvalidBufferSize,
}

/// Errors for data points rejected at the ingestion boundary.
#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    /// The metric path was empty.
    #[error("empty metric path")]
    EmptyPath,

    /// The value was NaN or infinite.
    #[error("non-finite value for {0}")]
    InvalidValue(String),
}

/// Errors starting the threaded runtime.
#[derive(Debug, Error)]
pub enum StartError {
    /// The operating system refused to give us a thread.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
