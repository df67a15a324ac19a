use std::io;

/// Error returned by fallible runtime operations.
///
/// Programmer contract violations (resuming an executing fiber, registering
/// the same fd event twice, stopping a scheduler from the wrong thread) are
/// not represented here: those abort with a diagnostic instead.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "IO error: {}", _0)]
    IO(io::Error),

    #[fail(display = "YAML error: {}", _0)]
    Yaml(serde_yaml::Error),

    #[fail(display = "JSON error: {}", _0)]
    Json(serde_json::Error),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Yaml(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json(error)
    }
}
