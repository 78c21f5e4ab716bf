use thiserror::Error;

/// Error taxonomy for the crush crate.
///
/// Each variant carries a message; loader errors additionally carry a
/// breadcrumb trail describing the path through the input that produced
/// the error (e.g. `trees[2].items[0]`), mirroring the trace Ceph's own
/// JSON loader accumulates while walking nested records.
#[derive(Error, Debug)]
pub enum CrushError {
    /// A caller-supplied argument is malformed independent of any map
    /// state: out-of-range rule id, negative size, unknown bucket
    /// algorithm name, a JSON record missing a required key, etc.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A reference to a bucket, device, rule, or type name does not
    /// resolve against the map it is being resolved against.
    #[error("not found: {0}")]
    NotFound(String),

    /// An internal invariant the map relies on does not hold: a bucket
    /// claims a size inconsistent with its item list, a parent pointer
    /// forms a cycle, an algorithm-specific table has the wrong length.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The operation is well-formed but disallowed by policy: an
    /// algorithm excluded by `allowed_bucket_algs`, a feature bit the
    /// caller's tunables don't permit, a choose-args id collision.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// A `map()` call could not produce enough distinct results to
    /// satisfy `result_max`; this is an expected outcome of a valid
    /// input (e.g. too few devices of the requested type), not a bug.
    #[error("unmappable: {0}")]
    Unmappable(String),

    /// Binary wire data failed to parse: bad magic, truncated buffer,
    /// a length prefix that overruns the remaining bytes, invalid UTF-8
    /// in a name table.
    #[error("corrupt: {0}")]
    Corrupt(String),
}

impl CrushError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CrushError::InvalidInput(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        CrushError::NotFound(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        CrushError::InvariantViolation(msg.into())
    }

    pub(crate) fn not_allowed(msg: impl Into<String>) -> Self {
        CrushError::NotAllowed(msg.into())
    }

    pub(crate) fn unmappable(msg: impl Into<String>) -> Self {
        CrushError::Unmappable(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        CrushError::Corrupt(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CrushError>;
