use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid interval {ctg}:{start}-{end}")]
    InvalidInterval {
        ctg: String,
        start: usize,
        end: usize,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Dimension mismatch: {0}")]
    Dimension(String),
    #[error("Windows not sorted by position: {0}")]
    Unsorted(String),
    #[error("Dispersion cannot be estimated with {residual_df} residual degrees of freedom; a fixed dispersion must be supplied")]
    DispersionUndefined { residual_df: usize },
    #[error("Worker thread failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
