use thiserror::Error;

#[derive(Error, Debug)]
pub enum ThrottleError {
    /// A throttle spec refused to answer a limit query for a bin. The
    /// operation that needed the value is aborted; nothing was created.
    #[error("Throttle spec rejected bin [{bin}]: {source}")]
    Spec {
        bin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Cluster registry error: {0}")]
    Registry(String),

    #[error("Invalid throttle configuration: {0}")]
    Validation(String),

    #[error("Failed to read spec file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse spec TOML: {0}")]
    Toml(#[from] toml::de::Error),
}
