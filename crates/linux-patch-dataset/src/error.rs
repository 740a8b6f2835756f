use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    General,
    // The patch endpoint did not answer 200. Aborts the whole run.
    PatchUnavailable,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::General,
            msg: msg.into(),
        }
    }

    pub fn patch_unavailable<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::PatchUnavailable,
            msg: msg.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::PatchUnavailable
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json error: {err}"))
    }
}

impl From<git2::Error> for Error {
    fn from(err: git2::Error) -> Self {
        Self::msg(format!("git error: {}", err.message()))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::msg(format!("http error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
