use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Command execution error: {0}")]
    CommandExecutionError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Platform tool unavailable: {0}")]
    PlatformToolMissing(String),

    #[error("Operation timed out: {0}")]
    TimeoutError(String),
}
