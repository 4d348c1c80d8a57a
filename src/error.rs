//! Centralized error types and recovery strategies for gpu-scan.
//!
//! Every failure mode of a scan has a defined recovery action:
//!
//! | Error                  | Recovery                                      |
//! |------------------------|-----------------------------------------------|
//! | Codegen                | Fatal at plan time, nothing was launched      |
//! | Chunk                  | Fatal, the chunk store was misused            |
//! | Config                 | Fatal, reported before the scan starts        |
//! | DeviceOutOfMemory      | Reduce in-flight tasks, wait, retry           |
//! | DeviceFault            | Fatal for the task and the whole scan         |
//! | FallbackDisabled       | Fatal, device asked for a recheck             |
//! | Evaluation             | Fatal, host evaluation raised a real error    |
//! | DeviceUnavailable      | Fatal                                         |
//! | Cancelled              | Discard, not reported to the user             |
//!
//! Device-reported recheck and no-space statuses are not errors at all; they
//! route the chunk through host evaluation (see `gpu::device::KernelStatus`).

use std::path::PathBuf;

use crate::storage::chunk::ChunkFormat;
use crate::storage::types::DataType;

/// Chunk store misuse or corrupt chunk contents.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("{format} chunk of {length} bytes cannot hold its {required}-byte header")]
    TooSmall {
        format: ChunkFormat,
        length: usize,
        required: usize,
    },

    #[error("{op} is not supported on {format} chunks")]
    FormatMismatch {
        op: &'static str,
        format: ChunkFormat,
    },

    #[error("hash index already built ({nslots} slots)")]
    HashIndexExists { nslots: u32 },

    #[error("cannot relocate {format} chunk with {usage} bytes of extra data")]
    ExtraInUse { format: ChunkFormat, usage: u32 },

    #[error("tuple has {got} attributes, chunk expects {expected}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("attribute {attnum} expects {expected}, got {got}")]
    TypeMismatch {
        attnum: usize,
        expected: DataType,
        got: DataType,
    },

    #[error("corrupt chunk data: {0}")]
    Corrupt(String),
}

/// Kernel generation failures. Always fatal, always at plan time.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("whole-row or system attribute {attnum} cannot be referenced on the device")]
    UnsupportedAttribute { attnum: i16 },

    #[error("attribute {attnum} is out of range for a {natts}-column tuple")]
    AttributeOutOfRange { attnum: i16, natts: usize },

    #[error("attribute {attnum} is declared {declared} but the tuple stores {stored}")]
    AttributeType {
        attnum: i16,
        declared: DataType,
        stored: DataType,
    },

    #[error("type {0} has no device implementation")]
    UnsupportedType(DataType),

    #[error("variable references relation {found}, scan relation is {expected}")]
    RelationMismatch { expected: u32, found: u32 },

    #[error("filter expression has type {0}, expected bool")]
    NotBoolean(DataType),

    #[error("malformed expression: {0}")]
    Malformed(String),
}

/// Expression evaluation failures, host or device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("{0} out of range")]
    Overflow(DataType),

    #[error("division by zero")]
    DivisionByZero,

    #[error("numeric value exceeds device precision")]
    DevicePrecision,

    #[error("cannot apply {op} to {operand}")]
    TypeMismatch { op: &'static str, operand: String },

    #[error("attribute {0} is not available in this tuple")]
    MissingAttribute(i16),
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid size '{0}' (expected e.g. 4096, 64KB, 32MB, 1GB)")]
    InvalidSize(String),

    #[error("{name} must be at least {min} (got {value})")]
    BelowMinimum {
        name: &'static str,
        min: usize,
        value: usize,
    },

    #[error("chunk_limit ({limit}) must not be smaller than chunk_size ({size})")]
    LimitBelowChunkSize { limit: usize, size: usize },

    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Central error type for scan execution.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device out of memory: requested {requested} bytes, {available} available")]
    DeviceOutOfMemory { requested: usize, available: usize },

    #[error("device fault in task {task_id}: {message}")]
    DeviceFault { task_id: u64, message: String },

    #[error("task {task_id} reported {status} but CPU fallback is disabled")]
    FallbackDisabled { task_id: u64, status: String },

    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvalError),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("scan cancelled")]
    Cancelled,
}

/// Type alias for Results using ScanError.
pub type Result<T> = std::result::Result<T, ScanError>;

// ============================================================================
// Recovery actions
// ============================================================================

/// Describes how the pipeline should react to a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Abort the scan and surface the error.
    Fatal,
    /// Re-run the chunk with the host evaluator.
    FallbackToCpu,
    /// Lower the number of in-flight tasks, wait for one, retry.
    ReduceConcurrency,
    /// Silently discard; not a real error.
    Discard,
}

impl ScanError {
    /// Determine the appropriate recovery action for this error.
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            ScanError::DeviceOutOfMemory { .. } => RecoveryAction::ReduceConcurrency,
            ScanError::Cancelled => RecoveryAction::Discard,
            ScanError::Chunk(_)
            | ScanError::Codegen(_)
            | ScanError::Config(_)
            | ScanError::DeviceFault { .. }
            | ScanError::FallbackDisabled { .. }
            | ScanError::Evaluation(_)
            | ScanError::DeviceUnavailable(_) => RecoveryAction::Fatal,
        }
    }

    /// Whether the scan must stop.
    pub fn is_fatal(&self) -> bool {
        self.recovery_action() == RecoveryAction::Fatal
    }

    /// Whether this error deserves a log line (cancellation does not).
    pub fn should_log(&self) -> bool {
        self.recovery_action() != RecoveryAction::Discard
    }
}
