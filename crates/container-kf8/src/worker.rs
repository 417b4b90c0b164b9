//! The KF8 exploder/re-packager, modeled as an external worker process
//! (spec.md 4.10, 6): the core only ever blocks on one running, it never
//! understands KF8's binary records itself. Mirrors
//! `convert-input-pdf::pdftohtml`'s subprocess pattern: confirm the binary
//! is on `PATH` with `which`, run it with `std::process::Command`, and
//! turn a missing binary or nonzero exit into a single error variant.

use std::path::{Path, PathBuf};
use std::process::Command;

use container_core::error::{ContainerError, Result};

/// What `explode` reports back: where the generated OPF landed, and which
/// font files the worker itself found already obfuscated (it parsed the
/// KF8 records, so it saw their encryption info first).
pub struct ExplodeResult {
    pub opf_path: PathBuf,
    pub obfuscated_fonts: Vec<PathBuf>,
}

pub trait Kf8Worker {
    /// Explodes the KF8 binary at `source` into `dest_dir`.
    fn explode(&self, source: &Path, dest_dir: &Path) -> Result<ExplodeResult>;
    /// Re-packages the OPF tree at `opf_path` into a KF8/AZW3 binary at `out_path`.
    fn repack(&self, opf_path: &Path, out_path: &Path) -> Result<()>;
}

/// A `Kf8Worker` that shells out to named binaries on `PATH`.
pub struct ExternalKf8Worker {
    pub exploder_bin: String,
    pub repackager_bin: String,
}

impl Default for ExternalKf8Worker {
    fn default() -> Self {
        ExternalKf8Worker {
            exploder_bin: "kf8_exploder".to_string(),
            repackager_bin: "kf8_repackager".to_string(),
        }
    }
}

impl Kf8Worker for ExternalKf8Worker {
    fn explode(&self, source: &Path, dest_dir: &Path) -> Result<ExplodeResult> {
        let bin = locate(&self.exploder_bin)?;
        let output = Command::new(&bin)
            .arg(source)
            .arg(dest_dir)
            .output()
            .map_err(|e| ContainerError::Worker(format!("failed to run {}: {e}", self.exploder_bin)))?;
        if !output.status.success() {
            return Err(ContainerError::Worker(format!(
                "{} failed: {}",
                self.exploder_bin,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_explode_output(&stdout, dest_dir)
    }

    fn repack(&self, opf_path: &Path, out_path: &Path) -> Result<()> {
        let bin = locate(&self.repackager_bin)?;
        let output = Command::new(&bin)
            .arg(opf_path)
            .arg(out_path)
            .output()
            .map_err(|e| ContainerError::Worker(format!("failed to run {}: {e}", self.repackager_bin)))?;
        if !output.status.success() {
            return Err(ContainerError::Worker(format!(
                "{} failed: {}",
                self.repackager_bin,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

fn locate(bin: &str) -> Result<PathBuf> {
    which::which(bin).map_err(|_| {
        ContainerError::Worker(format!("{bin} is not on PATH"))
    })
}

/// The exploder's contract: first line is the OPF path, every following
/// non-empty line is a font path it flagged as obfuscated.
fn parse_explode_output(stdout: &str, dest_dir: &Path) -> Result<ExplodeResult> {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
    let opf_line = lines
        .next()
        .ok_or_else(|| ContainerError::Worker("exploder produced no output".to_string()))?;
    let opf_path = dest_dir.join(opf_line.trim());
    let obfuscated_fonts = lines.map(|l| dest_dir.join(l.trim())).collect();
    Ok(ExplodeResult {
        opf_path,
        obfuscated_fonts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_opf_path_and_font_list() {
        let stdout = "content.opf\nfonts/a.ttf\nfonts/b.ttf\n";
        let result = parse_explode_output(stdout, Path::new("/work")).unwrap();
        assert_eq!(result.opf_path, Path::new("/work/content.opf"));
        assert_eq!(result.obfuscated_fonts.len(), 2);
    }

    #[test]
    fn rejects_empty_output() {
        assert!(parse_explode_output("", Path::new("/work")).is_err());
    }

    #[test]
    fn locate_rejects_missing_binary() {
        let err = locate("definitely-not-a-real-binary-xyz").unwrap_err();
        assert!(matches!(err, ContainerError::Worker(_)));
    }
}
