//! Error and Result types for state history operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for state history operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// The error type for state history operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// A query or insertion time lies outside the store's valid range.
    #[error("Time {time} is outside the valid range [{start}, {end}]")]
    TimeRange {
        /// Offending timestamp.
        time: i64,
        /// Start of the valid range (inclusive).
        start: i64,
        /// End of the valid range (inclusive).
        end: i64,
    },

    /// The requested attribute (path or quark) does not exist.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// A state value was unboxed as the wrong type.
    #[error("State value type mismatch: expected {expected}, got {actual}")]
    StateValueType {
        /// Type the caller asked for.
        expected: &'static str,
        /// Type actually held by the value.
        actual: &'static str,
    },

    /// The state system or backend was disposed.
    #[error("State system has been disposed")]
    Disposed,

    /// Building is over; no more intervals can be inserted.
    #[error("State history is already built, cannot insert")]
    BuildingFinished,

    /// An interval with `start > end` was supplied.
    #[error("Invalid interval: start {start} is after end {end}")]
    InvalidInterval {
        /// Interval start.
        start: i64,
        /// Interval end.
        end: i64,
    },

    /// An interval does not fit even in an empty node.
    #[error("Interval of {size} bytes exceeds node capacity of {capacity} bytes")]
    IntervalTooLarge {
        /// Encoded interval size.
        size: usize,
        /// Usable bytes in an empty node.
        capacity: usize,
    },

    /// Invalid magic number in a history tree file header.
    #[error("Invalid magic number: {0:#010x}")]
    InvalidMagic(u32),

    /// Unsupported history tree file format version.
    #[error("Unsupported file version: {0}")]
    UnsupportedVersion(u32),

    /// The file was written by a different state provider version.
    #[error("Provider version mismatch: expected {expected}, found {actual}")]
    ProviderVersionMismatch {
        /// Version requested by the caller.
        expected: u32,
        /// Version stored in the file.
        actual: u32,
    },

    /// A block checksum does not match its contents.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC32 stored on disk.
        expected: u32,
        /// CRC32 computed from the data read.
        actual: u32,
    },

    /// A configuration value is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Structurally invalid on-disk data.
    #[error("Corrupted history file: {0}")]
    Corrupted(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A range query was cancelled by its caller.
    #[error("Query cancelled")]
    Cancelled,

    /// A stack attribute exceeded the maximum depth.
    #[error("Stack depth {0} exceeds the maximum allowed")]
    StackTooDeep(usize),

    /// An earlier asynchronous insertion failed on the builder thread.
    ///
    /// The current call itself did nothing wrong; it is only the first
    /// call to observe the failure.
    #[error("A previous insertion failed: {0}")]
    PriorBuildFailure(#[source] Box<StateError>),

    /// Building was aborted by an earlier failure that was already reported.
    #[error("Building was aborted by an earlier failure")]
    BuildAborted,
}
