//! In-memory, edit-capable model of an Open E-Book package: lazy parsing,
//! dirty tracking, a whitespace-preserving XML tree, manifest/spine/guide
//! manipulation, and link rewriting. Format-specific opening/committing
//! (EPUB's zip, KF8's binary) lives in the `container-epub` and
//! `container-kf8` crates, both built on [`container::BaseContainer`].

pub mod cache;
pub mod container;
pub mod error;
pub mod html;
pub mod links;
pub mod names;
pub mod opf;
pub mod xmltree;

pub use cache::{DirtyTracker, ParsedArtifact};
pub use container::{BaseContainer, ClonedState};
pub use error::{ContainerError, Result};
pub use links::LinkOccurrence;
pub use xmltree::{XmlDocument, XmlElement};
