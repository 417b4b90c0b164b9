//! ZIP archive utilities for reading/writing EPUB and DOCX files.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Extract all files from a ZIP archive to a directory.
pub fn extract_zip(zip_path: &Path, output_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let file = File::open(zip_path)?;
    let archive = ZipArchive::new(file)?;
    extract_zip_archive(archive, output_dir)
}

fn extract_zip_archive(mut archive: ZipArchive<File>, output_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();

        // Skip directories
        if name.ends_with('/') {
            let dir_path = output_dir.join(&name);
            std::fs::create_dir_all(&dir_path)?;
            continue;
        }

        let out_path = output_dir.join(&name);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        extracted.push(out_path);
    }

    Ok(extracted)
}

/// Extract a ZIP archive, retrying entry-by-entry and skipping any entry
/// whose local header or CRC the `zip` crate's strict reader rejects,
/// instead of failing the whole extraction on one bad entry. Many
/// real-world EPUBs in the wild are subtly malformed this way.
pub fn extract_zip_lenient(zip_path: &Path, output_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let file = File::open(zip_path)?;
    let mut archive = match ZipArchive::new(file) {
        Ok(a) => a,
        Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    };
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.name().to_string();
        if name.ends_with('/') {
            std::fs::create_dir_all(output_dir.join(&name))?;
            continue;
        }
        let out_path = output_dir.join(&name);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        if io::copy(&mut entry, &mut outfile).is_ok() {
            extracted.push(out_path);
        }
    }

    Ok(extracted)
}

/// Read a single file from inside a ZIP archive.
pub fn read_zip_entry(zip_path: &Path, entry_name: &str) -> io::Result<Vec<u8>> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut entry = archive.by_name(entry_name)?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

/// List all entries in a ZIP archive.
pub fn list_zip_entries(zip_path: &Path) -> io::Result<Vec<String>> {
    let file = File::open(zip_path)?;
    let archive = ZipArchive::new(file)?;
    let entries = (0..archive.len())
        .filter_map(|i| archive.name_for_index(i).map(|s| s.to_string()))
        .collect();
    Ok(entries)
}

/// Builder for creating ZIP archives (used for EPUB output).
pub struct ZipBuilder {
    writer: ZipWriter<File>,
}

impl ZipBuilder {
    /// Create a new ZIP file at the given path.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: ZipWriter::new(file),
        })
    }

    /// Add a file entry with the given content.
    pub fn add_file(&mut self, name: &str, content: &[u8]) -> io::Result<()> {
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        self.writer.start_file(name, options)?;
        self.writer.write_all(content)?;
        Ok(())
    }

    /// Add a file entry stored without compression (used for mimetype in EPUB).
    pub fn add_stored(&mut self, name: &str, content: &[u8]) -> io::Result<()> {
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        self.writer.start_file(name, options)?;
        self.writer.write_all(content)?;
        Ok(())
    }

    /// Add a directory entry.
    pub fn add_directory(&mut self, name: &str) -> io::Result<()> {
        let options = SimpleFileOptions::default();
        self.writer.add_directory(name, options)?;
        Ok(())
    }

    /// Finish writing the ZIP archive.
    pub fn finish(self) -> io::Result<()> {
        self.writer.finish()?;
        Ok(())
    }
}

/// Rebuilds an entire directory tree into a ZIP at `out_path`, the way an
/// EPUB commit must: `mimetype`, if present at the directory root, is
/// written first and stored (uncompressed); everything else follows in
/// directory-walk order, deflated.
pub fn zip_directory(dir: &Path, out_path: &Path) -> io::Result<()> {
    let mut builder = ZipBuilder::new(out_path)?;

    let mimetype_path = dir.join("mimetype");
    if mimetype_path.is_file() {
        let content = std::fs::read(&mimetype_path)?;
        builder.add_stored("mimetype", &content)?;
    }

    let mut entries = Vec::new();
    collect_files(dir, dir, &mut entries)?;
    entries.sort();
    for rel in entries {
        if rel == "mimetype" {
            continue;
        }
        let content = std::fs::read(dir.join(&rel))?;
        builder.add_file(&rel, &content)?;
    }

    builder.finish()
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_roundtrip() {
        let tmp = std::env::temp_dir().join("test_zip_roundtrip.zip");

        // Create
        {
            let mut builder = ZipBuilder::new(&tmp).unwrap();
            builder
                .add_stored("mimetype", b"application/epub+zip")
                .unwrap();
            builder.add_file("content.xml", b"<root/>").unwrap();
            builder.finish().unwrap();
        }

        // Read back
        let entries = list_zip_entries(&tmp).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&"mimetype".to_string()));

        let content = read_zip_entry(&tmp, "content.xml").unwrap();
        assert_eq!(content, b"<root/>");

        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn test_zip_directory_puts_mimetype_first_and_stored() {
        let tmp_dir = tempfile::tempdir().unwrap();
        std::fs::write(tmp_dir.path().join("mimetype"), b"application/epub+zip").unwrap();
        std::fs::create_dir_all(tmp_dir.path().join("OEBPS")).unwrap();
        std::fs::write(tmp_dir.path().join("OEBPS/content.opf"), b"<package/>").unwrap();

        let out = tmp_dir.path().join("out.epub");
        zip_directory(tmp_dir.path(), &out).unwrap();

        let file = File::open(&out).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        assert_eq!(archive.by_index(0).unwrap().name(), "mimetype");
        assert_eq!(
            archive.by_index(0).unwrap().compression(),
            zip::CompressionMethod::Stored
        );
        let names = list_zip_entries(&out).unwrap();
        assert!(names.contains(&"OEBPS/content.opf".to_string()));
    }
}
