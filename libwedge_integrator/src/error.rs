use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is invalid: {0}")]
    Invalid(String),
    #[error("Config failed due to detector error: {0}")]
    DetectorError(#[from] DetectorError),
}

#[derive(Debug, Clone, Error)]
pub enum DetectorError {
    #[error("Found invalid detector name: {0}")]
    InvalidName(String),
}

#[derive(Debug, Error)]
pub enum JobFileError {
    #[error("Beam {axis} coordinate {value:.2} px lies outside the detector panel (0 to {limit} px)")]
    GeometryOutOfBounds {
        axis: &'static str,
        value: f64,
        limit: u32,
    },
    #[error("Could not find detector default parameters at {0:?}")]
    MissingDefaults(PathBuf),
    #[error("Control file has no {0} directive")]
    MissingDirective(&'static str),
    #[error("Control file directive {0} has a malformed value: {1}")]
    BadDirective(&'static str, String),
    #[error("JobFileBuilder failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Could not launch {program}: {source}")]
    LaunchFailure {
        program: String,
        source: std::io::Error,
    },
    #[error("Tool run of {0} was cancelled")]
    Cancelled(String),
    #[error("ToolInvoker failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error)]
pub enum LogParseError {
    #[error("Log {log} has no '{marker}' marker")]
    MissingMarker { log: &'static str, marker: &'static str },
    #[error("Log {log} ended before line {line} of the expected layout")]
    Truncated { log: &'static str, line: usize },
    #[error("Log {log} has a malformed value: {value}")]
    BadValue { log: &'static str, value: String },
    #[error("Log {log} has {found} tables; expected {expected}")]
    TableCount {
        log: &'static str,
        found: usize,
        expected: usize,
    },
}

#[derive(Debug, Error)]
pub enum SymmetryError {
    #[error("Unknown space group symbol {0}")]
    UnknownSpacegroup(String),
    #[error("SymmetryReconciler failed due to log error: {0}")]
    LogError(#[from] LogParseError),
    #[error("SymmetryReconciler failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OrientationError {
    #[error("Geometry file {0:?} is malformed: {1}")]
    BadFormat(PathBuf, String),
    #[error("Orientation matrix is singular")]
    Singular,
    #[error("Orientation failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("Integration in {dir:?} failed: {reason}")]
    HardFailure { dir: PathBuf, reason: String },
    #[error("Integration failed due to JobFile error: {0}")]
    JobFileError(#[from] JobFileError),
    #[error("Integration failed due to tool error: {0}")]
    ToolError(#[from] ToolError),
    #[error("Integration failed due to symmetry error: {0}")]
    SymmetryError(#[from] SymmetryError),
    #[error("Integration failed due to log error: {0}")]
    LogError(#[from] LogParseError),
    #[error("Integration failed due to results error: {0}")]
    ResultsError(#[from] ResultsError),
    #[error("Integration failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("Pointless did not produce a mergeable file; see {0:?}")]
    MergeVerificationFailure(PathBuf),
    #[error("ResultsAssembler failed due to tool error: {0}")]
    ToolError(#[from] ToolError),
    #[error("ResultsAssembler failed due to log error: {0}")]
    LogError(#[from] LogParseError),
    #[error("ResultsAssembler failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ResultsAssembler failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Finalization failed due to tool error: {0}")]
    ToolError(#[from] ToolError),
    #[error("Finalization could not fix scalepack file {0:?}")]
    ScalepackFormat(PathBuf),
    #[error("Finalization failed because {0:?} was not produced")]
    MissingOutput(PathBuf),
    #[error("Finalization failed due to orientation error: {0}")]
    OrientationError(#[from] OrientationError),
    #[error("Finalization failed due to results error: {0}")]
    ResultsError(#[from] ResultsError),
    #[error("Finalization failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Collection produced no images starting at {0:?}")]
    NoImages(PathBuf),
    #[error("Final integration failed: {0}")]
    FinalFailed(#[from] IntegrationError),
    #[error("Scheduler failed due to JobFile error: {0}")]
    JobFileError(#[from] JobFileError),
    #[error("Scheduler failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Scheduler failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to JobFile error: {0}")]
    JobFileError(#[from] JobFileError),
    #[error("Processor failed due to Scheduler error: {0}")]
    SchedulerError(#[from] SchedulerError),
    #[error("Processor failed due to Results error: {0}")]
    ResultsError(#[from] ResultsError),
    #[error("Processor failed due to Finalize error: {0}")]
    FinalizeError(#[from] FinalizeError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
