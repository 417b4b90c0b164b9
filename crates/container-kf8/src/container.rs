//! KF8/MOBI binding: header sniff/reject, delegate to an external
//! exploder/re-packager, and forbid renames since the converter re-derives
//! the whole OPF tree on commit (spec.md 4.10).

use std::fs;
use std::path::{Path, PathBuf};

use container_core::error::{ContainerError, Result};
use container_core::names::abspath_to_name;
use container_core::BaseContainer;

use crate::header::{self, Kf8Type};
use crate::worker::{ExternalKf8Worker, Kf8Worker};

pub struct Kf8Container {
    pub base: BaseContainer,
    source_path: Option<PathBuf>,
}

impl Kf8Container {
    /// Sniffs `path`, rejects anything that isn't a clean single-KF8 file,
    /// then delegates to `worker` to explode it into `work_dir` before
    /// building the `BaseContainer` over the result (spec.md 4.10).
    pub fn open(path: &Path, work_dir: PathBuf, worker: &dyn Kf8Worker) -> Result<Self> {
        let data = fs::read(path)?;
        let info = header::inspect(&data)?;

        if info.encryption_type != 0 {
            return Err(ContainerError::Drm(
                "MOBI header reports non-zero encryption".to_string(),
            ));
        }
        match info.kf8_type {
            Kf8Type::None => {
                return Err(ContainerError::InvalidBook(
                    "this MOBI file has no KF8 section; only Mobi6 content".to_string(),
                ));
            }
            Kf8Type::Joint => {
                return Err(ContainerError::InvalidBook(
                    "this MOBI file contains both KF8 and older Mobi6 data; only pure KF8 files can be edited".to_string(),
                ));
            }
            Kf8Type::Pure => {}
        }

        fs::create_dir_all(&work_dir)?;
        let exploded = worker.explode(path, &work_dir)?;
        let opf_name = abspath_to_name(&exploded.opf_path, &work_dir)?;
        Self::from_exploded(work_dir, opf_name, path.to_path_buf())
    }

    /// Builds a container over an already-exploded working tree. Split out
    /// of `open` so the "every name is locked" bookkeeping is reachable
    /// without needing a real KF8 binary to sniff.
    fn from_exploded(work_dir: PathBuf, opf_name: String, source_path: PathBuf) -> Result<Self> {
        let mut base = BaseContainer::from_directory(work_dir, opf_name)?;
        // The re-packager re-derives the whole tree from the OPF at
        // commit time; any rename here would simply be discarded.
        let all_names: Vec<String> = base.names().map(|n| n.to_string()).collect();
        base.names_that_must_not_be_changed.extend(all_names);

        Ok(Kf8Container {
            base,
            source_path: Some(source_path),
        })
    }

    pub fn path_to_ebook(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Commits every dirtied file, then asks the worker to re-pack the OPF
    /// tree into `out_path`.
    pub fn commit(&mut self, out_path: &Path, worker: &dyn Kf8Worker) -> Result<()> {
        self.base.commit(false)?;
        let opf_name = self.base.opf_name.clone();
        let opf_path = container_core::names::name_to_abspath(&opf_name, &self.base.root);
        worker.repack(&opf_path, out_path)
    }
}

/// Convenience constructor using the default `PATH`-located worker
/// binaries (spec.md 6 lists the exploder/re-packager as external
/// collaborators; most callers don't need a custom `Kf8Worker`).
pub fn open_with_default_worker(path: &Path, work_dir: PathBuf) -> Result<Kf8Container> {
    Kf8Container::open(path, work_dir, &ExternalKf8Worker::default())
}
