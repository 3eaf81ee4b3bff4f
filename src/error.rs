use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the core.
///
/// `Player` and `EngineProcess` errors are caught at the coordinator/manager
/// boundary and converted into a knockout or a stopped session; `Command`
/// errors abort only the current command.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Command(String),

    #[error("player {name}: {cause}")]
    Player { name: String, cause: String },

    #[error("engine {name}: {source}")]
    EngineProcess {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn player(name: &str, cause: impl Into<String>) -> Error {
        Error::Player {
            name: name.to_string(),
            cause: cause.into(),
        }
    }

    pub fn command(msg: impl Into<String>) -> Error {
        Error::Command(msg.into())
    }
}
