//! EPUB binding: zip extraction/rebuilding, `META-INF/container.xml`
//! rootfile discovery, and font de/obfuscation layered on top of
//! [`BaseContainer`] (spec.md 4.9).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use container_core::names::{href_to_name, name_to_abspath};
use container_core::xmltree::XmlDocument;
use container_core::{BaseContainer, ContainerError, Result};
use container_utils::archive::{extract_zip_lenient, zip_directory};

use crate::font::{self, Algorithm};

const CONTAINER_XML: &str = "META-INF/container.xml";
const ENCRYPTION_XML: &str = "META-INF/encryption.xml";
const MIMETYPE: &str = "mimetype";

/// An opened EPUB: the base container plus the bits that are specific to
/// the zip/OCF packaging -- which fonts were de-obfuscated on open (so
/// they can be re-obfuscated on commit) and the names the zip format
/// itself requires that have no place in the OPF manifest.
pub struct EpubContainer {
    pub base: BaseContainer,
    /// name -> (algorithm, key) for every font `process_encryption` cleared.
    obfuscated_fonts: HashMap<String, (Algorithm, Vec<u8>)>,
    source_path: Option<PathBuf>,
}

impl EpubContainer {
    /// Extracts `path` into `work_dir`, finds the OPF via
    /// `META-INF/container.xml`, builds the [`BaseContainer`], and clears
    /// any obfuscated fonts declared in `META-INF/encryption.xml`
    /// (spec.md 4.9, steps 1-7).
    pub fn open(path: &Path, work_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&work_dir)?;
        extract_zip_lenient(path, &work_dir)
            .map_err(|e| ContainerError::Zip(format!("failed to extract {}: {e}", path.display())))?;

        let opf_name = read_container_xml(&work_dir)?;
        let mut base = BaseContainer::from_directory(work_dir, opf_name)?;

        base.names_that_need_not_be_manifested.insert(MIMETYPE.to_string());
        base.names_that_need_not_be_manifested.insert(CONTAINER_XML.to_string());
        base.names_that_need_not_be_manifested.insert(ENCRYPTION_XML.to_string());
        base.names_that_must_not_be_removed.insert(CONTAINER_XML.to_string());
        base.names_that_must_not_be_changed.insert(CONTAINER_XML.to_string());
        base.names_that_must_not_be_changed.insert(MIMETYPE.to_string());

        let obfuscated_fonts = process_encryption(&mut base)?;

        Ok(EpubContainer {
            base,
            obfuscated_fonts,
            source_path: Some(path.to_path_buf()),
        })
    }

    pub fn path_to_ebook(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Removes `name`, plus (when it was an obfuscated font) its
    /// `encryption.xml` entry, falling back to dropping the whole file if
    /// `encryption.xml` is left with no remaining `<EncryptedData>`.
    pub fn remove_item(&mut self, name: &str, remove_from_guide: bool) -> Result<()> {
        self.base.remove_item(name, remove_from_guide)?;
        if self.obfuscated_fonts.remove(name).is_some() {
            self.drop_encryption_entry(name)?;
        }
        Ok(())
    }

    /// Renames `current` to `new`, carrying forward its obfuscation entry
    /// under the new name so `commit` re-encrypts the right key.
    pub fn rename(&mut self, current: &str, new: &str) -> Result<()> {
        self.base.rename(current, new)?;
        if let Some(entry) = self.obfuscated_fonts.remove(current) {
            self.obfuscated_fonts.insert(new.to_string(), entry);
            self.rewrite_encryption_reference(current, new)?;
        }
        Ok(())
    }

    /// Commits every dirtied file through the base container, re-obfuscates
    /// fonts that were cleared on open, writes a fresh `mimetype`, then
    /// rebuilds the zip with `mimetype` first and stored uncompressed
    /// (spec.md 4.9 step 8, 4.11).
    pub fn commit(&mut self, out_path: &Path) -> Result<()> {
        self.base.commit(false)?;

        for (name, (algorithm, key)) in &self.obfuscated_fonts {
            let path = name_to_abspath(name, &self.base.root);
            let mut data = fs::read(&path)?;
            font::xor_obfuscate(&mut data, key, *algorithm)?;
            fs::write(&path, data)?;
        }

        fs::write(self.base.root.join(MIMETYPE), b"application/epub+zip")?;

        zip_directory(&self.base.root, out_path)
            .map_err(|e| ContainerError::Zip(format!("failed to rebuild {}: {e}", out_path.display())))
    }

    /// Hard-links the working tree into `dest_dir` and returns a sibling
    /// container sharing this one's obfuscation bookkeeping (spec.md 4.8).
    pub fn clone_data(&mut self, dest_dir: &Path) -> Result<EpubContainer> {
        let state = self.base.clone_data(dest_dir)?;
        let mut base = BaseContainer::from_cloned_state(state);
        base.names_that_need_not_be_manifested = self.base.names_that_need_not_be_manifested.clone();
        base.names_that_must_not_be_removed = self.base.names_that_must_not_be_removed.clone();
        base.names_that_must_not_be_changed = self.base.names_that_must_not_be_changed.clone();
        Ok(EpubContainer {
            base,
            obfuscated_fonts: self.obfuscated_fonts.clone(),
            source_path: self.source_path.clone(),
        })
    }

    fn drop_encryption_entry(&mut self, name: &str) -> Result<()> {
        if !self.base.exists(ENCRYPTION_XML) {
            return Ok(());
        }
        let opf_name = self.base.opf_name.clone();
        let href = container_core::names::name_to_href(name, Some(&opf_name));
        let doc = self.base.parsed_xml_mut(ENCRYPTION_XML)?;
        let mut i = 0;
        while i < doc.root.children.len() {
            let is_match = doc.root.children[i]
                .find("CipherData")
                .and_then(|cd| cd.find("CipherReference"))
                .and_then(|cr| cr.attr("URI"))
                .map(|uri| uri == href)
                .unwrap_or(false);
            if is_match {
                container_core::xmltree::remove_from_xml(&mut doc.root, i);
            } else {
                i += 1;
            }
        }
        let remaining = doc.root.children.len();
        self.base.dirty(ENCRYPTION_XML)?;
        if remaining == 0 {
            self.base.remove_item(ENCRYPTION_XML, false)?;
        }
        Ok(())
    }

    fn rewrite_encryption_reference(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if !self.base.exists(ENCRYPTION_XML) {
            return Ok(());
        }
        let opf_name = self.base.opf_name.clone();
        let old_href = container_core::names::name_to_href(old_name, Some(&opf_name));
        let new_href = container_core::names::name_to_href(new_name, Some(&opf_name));
        let doc = self.base.parsed_xml_mut(ENCRYPTION_XML)?;
        for entry in doc.root.children.iter_mut() {
            if let Some(cipher_ref) = entry
                .find_mut("CipherData")
                .and_then(|cd| cd.find_mut("CipherReference"))
            {
                if cipher_ref.attr("URI") == Some(old_href.as_str()) {
                    cipher_ref.set_attr("URI", new_href.clone());
                }
            }
        }
        self.base.dirty(ENCRYPTION_XML)
    }
}

/// Reads `META-INF/container.xml` and returns the name of the first
/// `<rootfile>` whose media-type is the OPF package document type.
fn read_container_xml(root: &Path) -> Result<String> {
    let path = root.join(CONTAINER_XML);
    let text = fs::read_to_string(&path).map_err(|_| {
        ContainerError::InvalidBook(format!("{CONTAINER_XML} is missing"))
    })?;
    let doc = XmlDocument::parse(&text)?;
    let rootfiles = doc
        .root
        .find("rootfiles")
        .ok_or_else(|| ContainerError::InvalidBook("container.xml has no <rootfiles>".to_string()))?;
    for rootfile in rootfiles.find_all("rootfile") {
        if rootfile.attr("media-type") == Some("application/oebps-package+xml") {
            if let Some(href) = rootfile.attr("full-path") {
                return Ok(href.trim_start_matches('/').to_string());
            }
        }
    }
    Err(ContainerError::InvalidBook(
        "container.xml has no OPF rootfile".to_string(),
    ))
}

/// Parses `META-INF/encryption.xml` (if present), derives the obfuscation
/// key for each `<EncryptedData>` whose algorithm is Adobe's or IDPF's
/// font-obfuscation URI, de-obfuscates the referenced font in place, and
/// returns the bookkeeping `commit` needs to re-obfuscate it later.
/// Any other `EncryptionMethod` means real DRM: reject the book
/// (spec.md 4.9 step 6, 4.11).
fn process_encryption(base: &mut BaseContainer) -> Result<HashMap<String, (Algorithm, Vec<u8>)>> {
    let mut obfuscated = HashMap::new();
    if !base.exists(ENCRYPTION_XML) {
        return Ok(obfuscated);
    }

    let opf_name = base.opf_name.clone();
    let unique_identifier = unique_identifier_text(base)?;

    let doc = base.parsed_xml(ENCRYPTION_XML)?.clone();
    for entry in doc.root.find_all("EncryptedData") {
        let Some(method) = entry.find("EncryptionMethod").and_then(|m| m.attr("Algorithm")) else {
            continue;
        };
        let Some(uri) = entry
            .find("CipherData")
            .and_then(|cd| cd.find("CipherReference"))
            .and_then(|cr| cr.attr("URI"))
        else {
            continue;
        };
        let Some(algorithm) = Algorithm::from_uri(method) else {
            return Err(ContainerError::Drm(format!(
                "unsupported encryption algorithm: {method}"
            )));
        };
        let Some(name) = href_to_name(uri, Some(&opf_name)) else {
            continue;
        };
        if !base.exists(&name) {
            continue;
        }

        let key = match algorithm {
            Algorithm::Idpf => font::idpf_key(&unique_identifier),
            Algorithm::Adobe => font::adobe_key(&unique_identifier).ok_or_else(|| {
                ContainerError::Drm("Adobe font obfuscation key is not a valid UUID".to_string())
            })?,
        };

        let path = name_to_abspath(&name, &base.root);
        let mut data = fs::read(&path)?;
        font::xor_obfuscate(&mut data, &key, algorithm)?;
        fs::write(&path, data)?;

        obfuscated.insert(name, (algorithm, key));
    }

    Ok(obfuscated)
}

/// Text of the element the OPF's `unique-identifier` attribute points at
/// -- the seed for both obfuscation key derivations (spec.md 4.11).
fn unique_identifier_text(base: &mut BaseContainer) -> Result<String> {
    let opf_name = base.opf_name.clone();
    let package = base.opf_mut()?;
    let Some(id_name) = package.attr("unique-identifier").map(|s| s.to_string()) else {
        return Err(ContainerError::InvalidBook(
            "OPF package has no unique-identifier attribute".to_string(),
        ));
    };
    let metadata = package
        .find("metadata")
        .ok_or_else(|| ContainerError::InvalidBook(format!("{opf_name} has no <metadata>")))?;
    for child in &metadata.children {
        if child.attr("id") == Some(id_name.as_str()) {
            return Ok(child.text.clone().unwrap_or_default());
        }
    }
    Err(ContainerError::InvalidBook(format!(
        "no metadata element with id={id_name}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_utils::archive::ZipBuilder;

    fn sample_opf() -> &'static str {
        r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="bookid" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="bookid">urn:uuid:f47ac10b-58cc-4372-a567-0e02b2c3d479</dc:identifier>
  </metadata>
  <manifest>
    <item id="c1" href="text/chapter1.xhtml" media-type="application/xhtml+xml"/>
    <item id="f1" href="fonts/font.ttf" media-type="application/x-font-truetype"/>
  </manifest>
  <spine><itemref idref="c1"/></spine>
</package>"#
    }

    fn container_xml() -> &'static str {
        r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#
    }

    fn build_epub(zip_path: &Path, with_encryption: bool) {
        let mut builder = ZipBuilder::new(zip_path).unwrap();
        builder.add_stored("mimetype", b"application/epub+zip").unwrap();
        builder.add_file(CONTAINER_XML, container_xml().as_bytes()).unwrap();
        builder.add_file("content.opf", sample_opf().as_bytes()).unwrap();
        builder
            .add_file("text/chapter1.xhtml", b"<html><body>hi</body></html>")
            .unwrap();

        let mut font_bytes: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        if with_encryption {
            let key = font::adobe_key("urn:uuid:f47ac10b-58cc-4372-a567-0e02b2c3d479").unwrap();
            font::xor_obfuscate(&mut font_bytes, &key, Algorithm::Adobe).unwrap();
        }
        builder.add_file("fonts/font.ttf", &font_bytes).unwrap();

        if with_encryption {
            let encryption_xml = format!(
                r#"<?xml version="1.0"?>
<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <EncryptedData xmlns="http://www.w3.org/2001/04/xmlenc#">
    <EncryptionMethod Algorithm="{}"/>
    <CipherData><CipherReference URI="fonts/font.ttf"/></CipherData>
  </EncryptedData>
</encryption>"#,
                font::ADOBE_OBFUSCATION_URI
            );
            builder.add_file(ENCRYPTION_XML, encryption_xml.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn open_finds_opf_via_container_xml() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("book.epub");
        build_epub(&zip_path, false);
        let work = tmp.path().join("work");
        let epub = EpubContainer::open(&zip_path, work).unwrap();
        assert_eq!(epub.base.opf_name, "content.opf");
        assert!(epub.base.exists("text/chapter1.xhtml"));
    }

    #[test]
    fn open_deobfuscates_font_and_commit_reobfuscates() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("book.epub");
        build_epub(&zip_path, true);
        let work = tmp.path().join("work");
        let mut epub = EpubContainer::open(&zip_path, work).unwrap();
        assert_eq!(epub.obfuscated_fonts.len(), 1);

        let font_path = epub.base.root.join("fonts/font.ttf");
        let cleared = fs::read(&font_path).unwrap();
        let expected: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(cleared, expected);

        let out_path = tmp.path().join("out.epub");
        epub.commit(&out_path).unwrap();
        let reobfuscated = fs::read(&font_path).unwrap();
        assert_ne!(reobfuscated, expected);
    }

    #[test]
    fn rejects_unknown_encryption_algorithm() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("book.epub");
        let mut builder = ZipBuilder::new(&zip_path).unwrap();
        builder.add_stored("mimetype", b"application/epub+zip").unwrap();
        builder.add_file(CONTAINER_XML, container_xml().as_bytes()).unwrap();
        builder.add_file("content.opf", sample_opf().as_bytes()).unwrap();
        builder.add_file("text/chapter1.xhtml", b"<html/>").unwrap();
        builder.add_file("fonts/font.ttf", b"fontdata").unwrap();
        let encryption_xml = r#"<?xml version="1.0"?>
<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <EncryptedData xmlns="http://www.w3.org/2001/04/xmlenc#">
    <EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes256-cbc"/>
    <CipherData><CipherReference URI="fonts/font.ttf"/></CipherData>
  </EncryptedData>
</encryption>"#;
        builder.add_file(ENCRYPTION_XML, encryption_xml.as_bytes()).unwrap();
        builder.finish().unwrap();

        let work = tmp.path().join("work");
        let err = EpubContainer::open(&zip_path, work).unwrap_err();
        assert!(matches!(err, ContainerError::Drm(_)));
    }
}
