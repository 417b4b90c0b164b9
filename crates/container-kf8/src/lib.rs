//! KF8/MOBI binding for the container core: header sniff/reject, and
//! delegation to an external exploder/re-packager worker process
//! (spec.md 4.10).

pub mod container;
pub mod header;
pub mod worker;

pub use container::{open_with_default_worker, Kf8Container};
pub use header::{HeaderInfo, Kf8Type};
pub use worker::{ExplodeResult, ExternalKf8Worker, Kf8Worker};
