//! Error taxonomy for the container core.
//!
//! Four kinds of failure: a book that cannot be understood (`InvalidBook`),
//! DRM that blocks it (`Drm`), a caller violating an operation's
//! precondition (`PreconditionViolation`), and everything below the book
//! model (`Io`/`Xml`/`Zip`/`Worker`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("not a valid book: {0}")]
    InvalidBook(String),

    #[error("DRM prevents this book from being opened: {0}")]
    Drm(String),

    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("zip archive error: {0}")]
    Zip(String),

    #[error("external worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;
