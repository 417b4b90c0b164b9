//! EPUB binding for the container core: zip extraction/rebuilding,
//! `META-INF/container.xml` rootfile discovery, and Adobe/IDPF font
//! de-obfuscation (spec.md 4.9, 4.11).

pub mod container;
pub mod font;

pub use container::EpubContainer;
pub use font::Algorithm;
