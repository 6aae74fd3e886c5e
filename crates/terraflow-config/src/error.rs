use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error(
        "Config file not found: {0}\n\
        Search order:\n\
        - TERRAFLOW_CONFIG_PATH environment variable\n\
        - current directory: terraflow.yaml, .terraflow.yaml\n\
        - ~/.config/terraflow/config.yaml"
    )]
    ConfigFileNotFound(PathBuf),

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
