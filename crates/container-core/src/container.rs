//! The Base Container: file inventory, OPF manifest/spine/guide operations,
//! link rewriting, and commit -- everything spec.md 4.3-4.8 describes
//! before a format binding (EPUB, KF8) gets involved.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use container_utils::mime::{is_css_family, is_html_family, is_xml_family, mime_from_path, OPF_MIME};

use crate::cache::{DirtyTracker, ParsedArtifact};
use crate::error::{ContainerError, Result};
use crate::links;
use crate::names::{abspath_to_name, href_to_name, name_to_abspath, name_to_href, validate_name};
use crate::xmltree::{insert_into_xml, remove_from_xml, XmlDocument, XmlElement};

/// Bits of state that survive into a `clone_data` bundle and can seed a new
/// container without re-walking the filesystem (spec.md 4.8).
pub struct ClonedState {
    pub root: PathBuf,
    pub opf_name: String,
    pub name_path_map: HashMap<String, PathBuf>,
    pub mime_map: HashMap<String, String>,
    pub pretty_print: HashSet<String>,
    pub encoding_map: HashMap<String, String>,
    pub tweak_mode: bool,
}

pub struct BaseContainer {
    pub root: PathBuf,
    pub opf_name: String,
    name_path_map: HashMap<String, PathBuf>,
    mime_map: HashMap<String, String>,
    parsed_cache: HashMap<String, ParsedArtifact>,
    encoding_map: HashMap<String, String>,
    dirtied: DirtyTracker,
    pretty_print: HashSet<String>,
    pub cloned: bool,
    pub tweak_mode: bool,
    /// Names a binding synthesizes (container.xml, encryption.xml, ...)
    /// that never need a manifest entry.
    pub names_that_need_not_be_manifested: HashSet<String>,
    pub names_that_must_not_be_removed: HashSet<String>,
    pub names_that_must_not_be_changed: HashSet<String>,
}

impl BaseContainer {
    /// Walks `root`, builds the name/path/mime maps, and overlays MIME
    /// types declared in the OPF manifest (the OPF's own MIME is always
    /// forced to [`OPF_MIME`]), per spec.md 3 invariant 1 and 2.0 data flow.
    pub fn from_directory(root: PathBuf, opf_name: String) -> Result<Self> {
        let mut name_path_map = HashMap::new();
        let mut mime_map = HashMap::new();
        walk_dir(&root, &root, &mut name_path_map, &mut mime_map)?;

        if !name_path_map.contains_key(&opf_name) {
            return Err(ContainerError::InvalidBook(format!(
                "OPF {opf_name} not found under container root"
            )));
        }
        mime_map.insert(opf_name.clone(), OPF_MIME.to_string());

        let mut container = BaseContainer {
            root,
            opf_name,
            name_path_map,
            mime_map,
            parsed_cache: HashMap::new(),
            encoding_map: HashMap::new(),
            dirtied: DirtyTracker::new(),
            pretty_print: HashSet::new(),
            cloned: false,
            tweak_mode: false,
            names_that_need_not_be_manifested: HashSet::new(),
            names_that_must_not_be_removed: HashSet::new(),
            names_that_must_not_be_changed: HashSet::new(),
        };
        container.overlay_manifest_mime_types()?;
        Ok(container)
    }

    /// Reconstructs a container directly from a `clone_data` bundle,
    /// bypassing the filesystem walk (spec.md 4.8).
    pub fn from_cloned_state(state: ClonedState) -> Self {
        BaseContainer {
            root: state.root,
            opf_name: state.opf_name,
            name_path_map: state.name_path_map,
            mime_map: state.mime_map,
            parsed_cache: HashMap::new(),
            encoding_map: state.encoding_map,
            dirtied: DirtyTracker::new(),
            pretty_print: state.pretty_print,
            cloned: true,
            tweak_mode: state.tweak_mode,
            names_that_need_not_be_manifested: HashSet::new(),
            names_that_must_not_be_removed: HashSet::new(),
            names_that_must_not_be_changed: HashSet::new(),
        }
    }

    fn overlay_manifest_mime_types(&mut self) -> Result<()> {
        let opf_name = self.opf_name.clone();
        let doc = self.parsed_xml(&opf_name)?.clone();
        let manifest = doc
            .root
            .find("manifest")
            .ok_or_else(|| ContainerError::InvalidBook("OPF has no <manifest>".to_string()))?;
        for item in manifest.find_all("item") {
            let (Some(href), Some(media_type)) = (item.attr("href"), item.attr("media-type")) else {
                continue;
            };
            if let Some(name) = href_to_name(href, Some(&opf_name)) {
                if self.name_path_map.contains_key(&name) {
                    self.mime_map.insert(name, media_type.to_string());
                }
            }
        }
        Ok(())
    }

    // -- Name/Href helpers bound to this container's root --------------

    pub fn href_to_name(&self, href: &str, base_name: Option<&str>) -> Option<String> {
        href_to_name(href, base_name)
    }

    pub fn name_to_href(&self, name: &str, base_name: Option<&str>) -> String {
        name_to_href(name, base_name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.name_path_map.contains_key(name)
    }

    pub fn mime_type_of(&self, name: &str) -> Option<&str> {
        self.mime_map.get(name).map(|s| s.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.name_path_map.keys().map(|s| s.as_str())
    }

    fn abspath(&self, name: &str) -> PathBuf {
        name_to_abspath(name, &self.root)
    }

    // -- Parse cache & decoding (spec.md 4.2) ---------------------------

    /// Materializes and returns the parsed artifact for `name`, parsing on
    /// first access and caching the result.
    pub fn parsed(&mut self, name: &str) -> Result<&ParsedArtifact> {
        if !self.parsed_cache.contains_key(name) {
            let artifact = self.parse_fresh(name)?;
            self.parsed_cache.insert(name.to_string(), artifact);
        }
        Ok(self.parsed_cache.get(name).expect("just inserted"))
    }

    pub fn parsed_mut(&mut self, name: &str) -> Result<&mut ParsedArtifact> {
        self.parsed(name)?;
        Ok(self.parsed_cache.get_mut(name).expect("parsed() just populated this entry"))
    }

    fn parsed_xml(&mut self, name: &str) -> Result<&XmlDocument> {
        self.parsed(name)?
            .as_xml()
            .ok_or_else(|| ContainerError::InvalidBook(format!("{name} is not an XML/HTML document")))
    }

    pub fn parsed_xml_mut(&mut self, name: &str) -> Result<&mut XmlDocument> {
        self.parsed_mut(name)?
            .as_xml_mut()
            .ok_or_else(|| ContainerError::InvalidBook(format!("{name} is not an XML/HTML document")))
    }

    fn parse_fresh(&mut self, name: &str) -> Result<ParsedArtifact> {
        let mime = self
            .mime_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let raw = fs::read(self.abspath(name))?;

        if is_css_family(&mime) {
            let (text, encoding) = container_utils::encoding::decode_to_utf8(&raw);
            self.encoding_map.insert(name.to_string(), encoding.to_string());
            return Ok(ParsedArtifact::Css(text));
        }

        if is_html_family(&mime) {
            let (text, encoding) = container_utils::encoding::decode_to_utf8(&raw);
            self.encoding_map.insert(name.to_string(), encoding.to_string());
            return Ok(ParsedArtifact::Html(crate::html::parse_html(&text)?));
        }

        if is_xml_family(&mime) {
            let (text, encoding) = container_utils::encoding::decode_to_utf8(&raw);
            self.encoding_map.insert(name.to_string(), encoding.to_string());
            return Ok(ParsedArtifact::Xml(XmlDocument::parse(&text)?));
        }

        Err(ContainerError::PreconditionViolation(format!(
            "{name} ({mime}) has no parsed representation; use raw_data instead"
        )))
    }

    /// Raw on-disk bytes for `name`, decoded to UTF-8 text if its MIME is
    /// text-like and `decode` is set.
    pub fn raw_data(&self, name: &str, decode: bool) -> Result<Vec<u8>> {
        let path = self
            .name_path_map
            .get(name)
            .ok_or_else(|| ContainerError::PreconditionViolation(format!("no such name: {name}")))?;
        let bytes = fs::read(path)?;
        if !decode {
            return Ok(bytes);
        }
        let mime = self.mime_map.get(name).map(|s| s.as_str()).unwrap_or("");
        if container_utils::mime::is_text_mime(mime) {
            let (text, _) = container_utils::encoding::decode_to_utf8(&bytes);
            Ok(text.into_bytes())
        } else {
            Ok(bytes)
        }
    }

    // -- Dirty tracking & commit (spec.md 4.3) --------------------------

    /// Marks `name` dirty, guaranteeing the invariant `dirtied ⊆
    /// keys(parsed_cache)` by parsing it first if necessary. This is the
    /// single guarded primitive spec.md's design notes call for.
    pub fn dirty(&mut self, name: &str) -> Result<()> {
        self.parsed(name)?;
        self.dirtied.mark(name);
        Ok(())
    }

    pub fn replace(&mut self, name: &str, artifact: ParsedArtifact) -> Result<()> {
        self.parsed_cache.insert(name.to_string(), artifact);
        self.dirtied.mark(name);
        Ok(())
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirtied.is_dirty(name)
    }

    /// Serializes the cached artifact for `name` and writes it to disk,
    /// breaking copy-on-write sharing first if this container is cloned.
    pub fn commit_item(&mut self, name: &str, keep_parsed: bool) -> Result<()> {
        if !self.dirtied.is_dirty(name) {
            return Ok(());
        }
        let bytes = self.serialize_item_bytes(name)?;
        let path = self.abspath(name);
        if self.cloned {
            decouple_plain(&path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        self.dirtied.clear(name);
        if !keep_parsed {
            self.parsed_cache.remove(name);
        }
        Ok(())
    }

    pub fn commit(&mut self, keep_parsed: bool) -> Result<()> {
        for name in self.dirtied.names() {
            self.commit_item(&name, keep_parsed)?;
        }
        Ok(())
    }

    /// Commits `name` with its parsed form retained, then returns its
    /// on-disk size -- guarantees size queries never read a stale file.
    pub fn filesize(&mut self, name: &str) -> Result<u64> {
        self.commit_item(name, true)?;
        Ok(fs::metadata(self.abspath(name))?.len())
    }

    /// Produces the serialized bytes for `name`'s cached parsed form,
    /// applying OPF format normalization first when `name` is the OPF
    /// (spec.md 4.4). `pub(crate)` so `links`'s line-number position scan
    /// can read a dirty name's current text without committing it first.
    pub(crate) fn serialize_item_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        let is_opf = name == self.opf_name;
        let pretty = self.pretty_print.contains(name);
        let artifact = self
            .parsed_cache
            .get_mut(name)
            .ok_or_else(|| ContainerError::PreconditionViolation(format!("{name} has no cached parsed form")))?;
        match artifact {
            ParsedArtifact::Xml(doc) | ParsedArtifact::Html(doc) => {
                if is_opf {
                    crate::opf::format_opf(&mut doc.root);
                }
                let mut out = doc.to_string_pretty(pretty);
                if is_opf {
                    out = strip_opf_namespace_prefix(&out);
                }
                Ok(out.into_bytes())
            }
            ParsedArtifact::Css(text) => Ok(text.clone().into_bytes()),
        }
    }

    // -- Manifest, spine, guide operations (spec.md 4.5) ----------------

    pub fn opf_mut(&mut self) -> Result<&mut XmlElement> {
        let opf_name = self.opf_name.clone();
        Ok(&mut self.parsed_xml_mut(&opf_name)?.root)
    }

    /// Ensures a top-level OPF section (`manifest`, `spine`, `guide`)
    /// exists, creating an empty one as the last child if missing.
    pub fn opf_get_or_create(&mut self, section_name: &str) -> Result<()> {
        let opf_name = self.opf_name.clone();
        let package = self.opf_mut()?;
        if package.find(section_name).is_none() {
            insert_into_xml(package, XmlElement::new(section_name), None, None);
        }
        self.dirty(&opf_name)
    }

    fn generate_id(&mut self, prefix: &str) -> Result<String> {
        let existing: HashSet<String> = self.manifest_id_map()?.into_keys().collect();
        if !existing.contains(prefix) {
            return Ok(prefix.to_string());
        }
        let mut n = 1;
        loop {
            let candidate = format!("{prefix}{n}");
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// `id -> href` (raw, as written in the manifest).
    pub fn manifest_id_map(&mut self) -> Result<HashMap<String, String>> {
        let opf_name = self.opf_name.clone();
        let doc = self.parsed_xml(&opf_name)?;
        let mut map = HashMap::new();
        if let Some(manifest) = doc.root.find("manifest") {
            for item in manifest.find_all("item") {
                if let (Some(id), Some(href)) = (item.attr("id"), item.attr("href")) {
                    map.insert(id.to_string(), href.to_string());
                }
            }
        }
        Ok(map)
    }

    /// `media-type -> names with that type`.
    pub fn manifest_type_map(&mut self) -> Result<HashMap<String, Vec<String>>> {
        let opf_name = self.opf_name.clone();
        let doc = self.parsed_xml(&opf_name)?;
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(manifest) = doc.root.find("manifest") {
            for item in manifest.find_all("item") {
                if let (Some(href), Some(mt)) = (item.attr("href"), item.attr("media-type")) {
                    if let Some(name) = href_to_name(href, Some(&opf_name)) {
                        map.entry(mt.to_string()).or_default().push(name);
                    }
                }
            }
        }
        Ok(map)
    }

    /// `guide type -> name`.
    pub fn guide_type_map(&mut self) -> Result<HashMap<String, String>> {
        let opf_name = self.opf_name.clone();
        let doc = self.parsed_xml(&opf_name)?;
        let mut map = HashMap::new();
        if let Some(guide) = doc.root.find("guide") {
            for reference in guide.find_all("reference") {
                if let (Some(ty), Some(href)) = (reference.attr("type"), reference.attr("href")) {
                    if let Some(name) = href_to_name(href, Some(&opf_name)) {
                        map.insert(ty.to_string(), name);
                    }
                }
            }
        }
        Ok(map)
    }

    /// Names in the manifest whose href resolves to `name`.
    fn manifest_ids_for(&mut self, name: &str) -> Result<Vec<String>> {
        let opf_name = self.opf_name.clone();
        let doc = self.parsed_xml(&opf_name)?;
        let mut ids = Vec::new();
        if let Some(manifest) = doc.root.find("manifest") {
            for item in manifest.find_all("item") {
                if let (Some(id), Some(href)) = (item.attr("id"), item.attr("href")) {
                    if href_to_name(href, Some(&opf_name)).as_deref() == Some(name) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Writes `data` to a new file at `name` and manifests it (spec.md
    /// 4.5 `add_file`). Fails on a duplicate name, a duplicate resolved
    /// href, or a `..`-containing name.
    pub fn add_file(&mut self, name: &str, data: &[u8], media_type: Option<&str>) -> Result<()> {
        validate_name(name)?;
        if self.name_path_map.contains_key(name) {
            return Err(ContainerError::PreconditionViolation(format!(
                "{name} already exists"
            )));
        }
        let opf_name = self.opf_name.clone();
        let href = name_to_href(name, Some(&opf_name));
        let existing_hrefs: HashSet<String> = self.manifest_id_map()?.into_values().collect();
        if existing_hrefs.contains(&href) {
            return Err(ContainerError::PreconditionViolation(format!(
                "manifest already has an item with href {href}"
            )));
        }

        let path = self.abspath(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;

        let mime = media_type
            .map(|m| m.to_string())
            .unwrap_or_else(|| mime_from_path(Path::new(name)).to_string());
        self.name_path_map.insert(name.to_string(), path);
        self.mime_map.insert(name.to_string(), mime.clone());

        if self.names_that_need_not_be_manifested.contains(name) {
            return Ok(());
        }

        let id = self.generate_id("id")?;
        self.opf_get_or_create("manifest")?;
        let mut item = XmlElement::new("item");
        item.set_attr("id", id.clone());
        item.set_attr("href", href);
        item.set_attr("media-type", mime.clone());
        let manifest = self.opf_mut()?.find_mut("manifest").expect("just created");
        insert_into_xml(manifest, item, None, None);

        if is_html_family(&mime) {
            self.opf_get_or_create("spine")?;
            let mut itemref = XmlElement::new("itemref");
            itemref.set_attr("idref", id);
            let spine = self.opf_mut()?.find_mut("spine").expect("just created");
            insert_into_xml(spine, itemref, None, None);
        }

        self.dirty(&opf_name)
    }

    /// Like `add_file`, but creates an empty file and generates a unique
    /// href (suffixing `_N` to the stem) if the derived one collides.
    pub fn generate_item(&mut self, name: &str, id_prefix: Option<&str>, media_type: Option<&str>) -> Result<String> {
        let mut candidate = name.to_string();
        let mut n = 1;
        while self.name_path_map.contains_key(&candidate) {
            let path = Path::new(name);
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
            let ext = path.extension().and_then(|s| s.to_str());
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let new_base = match ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            candidate = match dir {
                Some(d) => format!("{}/{}", d.display(), new_base),
                None => new_base,
            };
            n += 1;
        }
        self.add_file(&candidate, b"", media_type)?;
        if let Some(prefix) = id_prefix {
            let opf_name = self.opf_name.clone();
            let href = name_to_href(&candidate, Some(&opf_name));
            if let Some(manifest) = self.opf_mut()?.find_mut("manifest") {
                for item in manifest.children.iter_mut() {
                    if item.attr("href") == Some(href.as_str()) {
                        let new_id = format!("{prefix}_{}", item.attr("id").unwrap_or_default());
                        item.set_attr("id", new_id);
                        break;
                    }
                }
            }
            self.dirty(&opf_name)?;
        }
        Ok(candidate)
    }

    /// Removes every manifest item whose href resolves to `name`, their
    /// spine itemrefs, a dangling `toc`/cover meta reference, optionally
    /// their guide references, and finally the file and all cache entries
    /// (spec.md 4.5 `remove_item`).
    pub fn remove_item(&mut self, name: &str, remove_from_guide: bool) -> Result<()> {
        if self.names_that_must_not_be_removed.contains(name) {
            return Err(ContainerError::PreconditionViolation(format!(
                "{name} must not be removed"
            )));
        }
        let opf_name = self.opf_name.clone();
        let freed_ids: HashSet<String> = self.manifest_ids_for(name)?.into_iter().collect();

        if !freed_ids.is_empty() {
            let package = self.opf_mut()?;

            if let Some(manifest) = package.find_mut("manifest") {
                let mut i = 0;
                while i < manifest.children.len() {
                    if manifest.children[i]
                        .attr("id")
                        .map(|id| freed_ids.contains(id))
                        .unwrap_or(false)
                    {
                        remove_from_xml(manifest, i);
                    } else {
                        i += 1;
                    }
                }
            }

            if let Some(spine) = package.find_mut("spine") {
                if spine.attr("toc").map(|t| freed_ids.contains(t)).unwrap_or(false) {
                    spine.remove_attr("toc");
                }
                let mut i = 0;
                while i < spine.children.len() {
                    if spine.children[i]
                        .attr("idref")
                        .map(|id| freed_ids.contains(id))
                        .unwrap_or(false)
                    {
                        remove_from_xml(spine, i);
                    } else {
                        i += 1;
                    }
                }
            }

            if let Some(metadata) = package.find_mut("metadata") {
                let mut i = 0;
                while i < metadata.children.len() {
                    let is_cover_meta = metadata.children[i].local_name() == "meta"
                        && metadata.children[i].attr("name") == Some("cover")
                        && metadata.children[i]
                            .attr("content")
                            .map(|c| freed_ids.contains(c))
                            .unwrap_or(false);
                    if is_cover_meta {
                        remove_from_xml(metadata, i);
                    } else {
                        i += 1;
                    }
                }
            }

            if remove_from_guide {
                if let Some(guide) = package.find_mut("guide") {
                    let mut i = 0;
                    while i < guide.children.len() {
                        let matches = guide.children[i]
                            .attr("href")
                            .and_then(|h| href_to_name(h, Some(&opf_name)))
                            .as_deref()
                            == Some(name);
                        if matches {
                            remove_from_xml(guide, i);
                        } else {
                            i += 1;
                        }
                    }
                }
            }

            self.dirty(&opf_name)?;
        }

        if let Some(path) = self.name_path_map.remove(name) {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        self.mime_map.remove(name);
        self.parsed_cache.remove(name);
        self.dirtied.clear(name);
        self.encoding_map.remove(name);
        self.pretty_print.remove(name);
        Ok(())
    }

    /// Moves `current` to `new`, refusing protected names and case-only
    /// collisions against a different existing name. Commits the current
    /// parsed state first, migrates cache entries, and rebases intra-file
    /// links only if the directory segment changed (spec.md 4.5 `rename`,
    /// design notes "link rebasing on rename").
    pub fn rename(&mut self, current: &str, new: &str) -> Result<()> {
        validate_name(new)?;
        if self.names_that_must_not_be_changed.contains(current) {
            return Err(ContainerError::PreconditionViolation(format!(
                "{current} must not be renamed"
            )));
        }
        if !self.name_path_map.contains_key(current) {
            return Err(ContainerError::PreconditionViolation(format!("no such name: {current}")));
        }
        if current == new {
            return Ok(());
        }
        if self.name_path_map.contains_key(new) && !current.eq_ignore_ascii_case(new) {
            return Err(ContainerError::PreconditionViolation(format!(
                "{new} already exists"
            )));
        }

        self.commit_item(current, true)?;

        let old_path = self.abspath(current);
        let new_path = self.abspath(new);
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&old_path, &new_path)?;
        remove_empty_ancestors(old_path.parent(), &self.root);

        let mime = self.mime_map.remove(current);
        if let Some(mime) = mime {
            self.mime_map.insert(new.to_string(), mime);
        }
        self.name_path_map.remove(current);
        self.name_path_map.insert(new.to_string(), new_path);
        if let Some(art) = self.parsed_cache.remove(current) {
            self.parsed_cache.insert(new.to_string(), art);
        }
        if let Some(enc) = self.encoding_map.remove(current) {
            self.encoding_map.insert(new.to_string(), enc);
        }
        if self.pretty_print.remove(current) {
            self.pretty_print.insert(new.to_string());
        }
        self.dirtied.rename(current, new);

        // Update every manifest href that pointed at `current`.
        let opf_name = self.opf_name.clone();
        let new_href = name_to_href(new, Some(&opf_name));
        if let Some(manifest) = self.opf_mut()?.find_mut("manifest") {
            for item in manifest.children.iter_mut() {
                if item
                    .attr("href")
                    .and_then(|h| href_to_name(h, Some(&opf_name)))
                    .as_deref()
                    == Some(current)
                {
                    item.set_attr("href", new_href.clone());
                }
            }
        }
        self.dirty(&opf_name)?;

        let old_dir = dir_of(current);
        let new_dir = dir_of(new);
        if old_dir != new_dir {
            links::rebase_links_on_rename(self, current, new)?;
        }

        Ok(())
    }

    /// Replaces the spine's itemrefs with `items` (`(name, linear)` pairs
    /// in order), inheriting tail whitespace from the previous spine
    /// children.
    pub fn set_spine(&mut self, items: &[(String, bool)]) -> Result<()> {
        let opf_name = self.opf_name.clone();
        let id_map = self.manifest_id_map()?;
        let mut href_to_id: HashMap<String, String> = HashMap::new();
        for (id, href) in &id_map {
            if let Some(name) = href_to_name(href, Some(&opf_name)) {
                href_to_id.insert(name, id.clone());
            }
        }
        for (name, _) in items {
            if !href_to_id.contains_key(name) {
                return Err(ContainerError::PreconditionViolation(format!(
                    "set_spine: {name} is not in the manifest"
                )));
            }
        }

        self.opf_get_or_create("spine")?;
        let spine = self.opf_mut()?.find_mut("spine").expect("just created");
        let old_tails: Vec<Option<String>> = spine.children.iter().map(|c| c.tail.clone()).collect();
        spine.children.clear();

        for (i, (name, linear)) in items.iter().enumerate() {
            let mut itemref = XmlElement::new("itemref");
            itemref.set_attr("idref", href_to_id[name].clone());
            if !linear {
                itemref.set_attr("linear", "no");
            }
            itemref.tail = old_tails.get(i).cloned().flatten().or_else(|| old_tails.last().cloned().flatten());
            spine.children.push(itemref);
        }

        self.dirty(&opf_name)
    }

    /// Removes spine itemrefs matching `items` in order; if
    /// `also_from_book`, any name no longer referenced from the spine
    /// afterward is also removed as a file.
    pub fn remove_from_spine(&mut self, items: &[String], also_from_book: bool) -> Result<()> {
        let opf_name = self.opf_name.clone();
        let id_map = self.manifest_id_map()?;
        let mut name_to_id: HashMap<String, String> = HashMap::new();
        for (id, href) in &id_map {
            if let Some(name) = href_to_name(href, Some(&opf_name)) {
                name_to_id.insert(name, id.clone());
            }
        }
        let target_ids: HashSet<String> = items.iter().filter_map(|n| name_to_id.get(n).cloned()).collect();

        if let Some(spine) = self.opf_mut()?.find_mut("spine") {
            let mut i = 0;
            while i < spine.children.len() {
                if spine.children[i]
                    .attr("idref")
                    .map(|id| target_ids.contains(id))
                    .unwrap_or(false)
                {
                    remove_from_xml(spine, i);
                } else {
                    i += 1;
                }
            }
        }
        self.dirty(&opf_name)?;

        if also_from_book {
            let remaining_ids: HashSet<String> = self
                .spine_iter()?
                .into_iter()
                .map(|(idref, _, _)| idref)
                .collect();
            for name in items {
                if let Some(id) = name_to_id.get(name) {
                    if !remaining_ids.contains(id) {
                        self.remove_item(name, false)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// `(idref, name, linear)` for every spine item: linear items first in
    /// document order, then non-linear items in document order (spec.md
    /// 4.5 `spine_iter`, scenario 15).
    pub fn spine_iter(&mut self) -> Result<Vec<(String, String, bool)>> {
        let opf_name = self.opf_name.clone();
        let id_map = self.manifest_id_map()?;
        let doc = self.parsed_xml(&opf_name)?;
        let mut linear_items = Vec::new();
        let mut nonlinear_items = Vec::new();
        if let Some(spine) = doc.root.find("spine") {
            for itemref in spine.find_all("itemref") {
                let Some(idref) = itemref.attr("idref") else { continue };
                let Some(href) = id_map.get(idref) else { continue };
                let Some(name) = href_to_name(href, Some(&opf_name)) else { continue };
                let linear = itemref.attr("linear") != Some("no");
                if linear {
                    linear_items.push((idref.to_string(), name, true));
                } else {
                    nonlinear_items.push((idref.to_string(), name, false));
                }
            }
        }
        linear_items.extend(nonlinear_items);
        Ok(linear_items)
    }

    // -- Link iteration/rewriting (spec.md 4.6) -------------------------

    /// Resolved link targets in `name`; pass `get_line_numbers` to get each
    /// occurrence's `(line, column)` position instead of a bare name
    /// (spec.md 4.6).
    pub fn iterlinks(&mut self, name: &str, get_line_numbers: bool) -> Result<Vec<links::LinkOccurrence>> {
        links::iterlinks(self, name, get_line_numbers)
    }

    pub fn replace_links(&mut self, name: &str, f: &mut dyn FnMut(&str) -> Option<String>) -> Result<bool> {
        links::replace_links(self, name, f)
    }

    // -- Clone engine (spec.md 4.8) --------------------------------------

    /// Commits in-place, then hard-links (falling back to a plain copy)
    /// the whole working tree into `dest_dir`, returning a bundle a
    /// binding can use to construct a sibling container without
    /// re-walking the filesystem.
    pub fn clone_data(&mut self, dest_dir: &Path) -> Result<ClonedState> {
        self.commit(true)?;
        fs::create_dir_all(dest_dir)?;
        clone_dir(&self.root, dest_dir)?;

        let mut new_name_path_map = HashMap::new();
        for (name, _) in &self.name_path_map {
            new_name_path_map.insert(name.clone(), name_to_abspath(name, dest_dir));
        }

        Ok(ClonedState {
            root: dest_dir.to_path_buf(),
            opf_name: self.opf_name.clone(),
            name_path_map: new_name_path_map,
            mime_map: self.mime_map.clone(),
            pretty_print: self.pretty_print.clone(),
            encoding_map: self.encoding_map.clone(),
            tweak_mode: self.tweak_mode,
        })
    }

    /// Byte-for-byte diff of two containers' file sets: names present in
    /// only one side, plus names present in both whose bytes differ.
    pub fn compare_to(&self, other: &BaseContainer) -> Vec<String> {
        let mut diffs = Vec::new();
        let self_names: HashSet<&str> = self.name_path_map.keys().map(|s| s.as_str()).collect();
        let other_names: HashSet<&str> = other.name_path_map.keys().map(|s| s.as_str()).collect();
        for only_here in self_names.difference(&other_names) {
            diffs.push(format!("only in self: {only_here}"));
        }
        for only_there in other_names.difference(&self_names) {
            diffs.push(format!("only in other: {only_there}"));
        }
        for name in self_names.intersection(&other_names) {
            let a = fs::read(self.abspath(name));
            let b = fs::read(other.abspath(name));
            if a.ok() != b.ok() {
                diffs.push(format!("differs: {name}"));
            }
        }
        diffs
    }
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    name_path_map: &mut HashMap<String, PathBuf>,
    mime_map: &mut HashMap<String, String>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path, name_path_map, mime_map)?;
        } else {
            let name = abspath_to_name(&path, root)?;
            let mime = mime_from_path(&path).to_string();
            mime_map.insert(name.clone(), mime);
            name_path_map.insert(name, path);
        }
    }
    Ok(())
}

fn dir_of(name: &str) -> &str {
    match name.rfind('/') {
        Some(i) => &name[..i],
        None => "",
    }
}

fn remove_empty_ancestors(mut dir: Option<&Path>, root: &Path) {
    while let Some(d) = dir {
        if d == root {
            break;
        }
        match fs::read_dir(d) {
            Ok(mut entries) if entries.next().is_none() => {
                let _ = fs::remove_dir(d);
                dir = d.parent();
            }
            _ => break,
        }
    }
}

#[cfg(unix)]
fn hard_link_count(path: &Path) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(path)?.nlink())
}

#[cfg(not(unix))]
fn hard_link_count(_path: &Path) -> Result<u64> {
    Ok(1)
}

/// `commit_item`'s copy-on-write decouple: the file is about to be fully
/// overwritten, so a plain unlink before the write is enough -- there is
/// no need for the safer copy-then-rename dance `open()` uses, because
/// nothing reads the old inode again after this call (spec.md 4.3, and
/// the original's `commit_item` vs. `open` distinction).
fn decouple_plain(path: &Path) -> Result<()> {
    if path.exists() && hard_link_count(path)? > 1 {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// `open()`'s copy-on-write decouple: copy to a temporary sibling, unlink
/// the original, then rename the temporary into place, so a reader that
/// still holds the original inode (e.g. another clone) is never mutated
/// mid-read.
pub fn decouple_safely(path: &Path) -> Result<()> {
    if !path.exists() || hard_link_count(path)? <= 1 {
        return Ok(());
    }
    let tmp = path.with_extension(format!(
        "{}.decouple-tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::copy(path, &tmp)?;
    fs::remove_file(path)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn clone_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dest_path = dest.join(entry.file_name());
        if path.is_dir() {
            fs::create_dir_all(&dest_path)?;
            clone_dir(&path, &dest_path)?;
        } else if fs::hard_link(&path, &dest_path).is_err() {
            fs::copy(&path, &dest_path)?;
        }
    }
    Ok(())
}

/// `lxml`/lincensed serializers sometimes resolve the OPF default
/// namespace to an `opf:` prefix on every element; downstream validators
/// require the unprefixed form, so it is stripped as the final
/// serialization step, matching the original's `serialize_item`.
fn strip_opf_namespace_prefix(xml: &str) -> String {
    xml.replace("<opf:", "<").replace("</opf:", "</")
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_utils::mime::OPF_MIME;

    fn make_book(dir: &Path) -> (PathBuf, String) {
        fs::create_dir_all(dir.join("OEBPS/text")).unwrap();
        fs::write(
            dir.join("content.opf"),
            r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="bookid" version="2.0">
  <metadata/>
  <manifest>
    <item id="c1" href="OEBPS/text/chapter1.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine>
    <itemref idref="c1"/>
  </spine>
</package>"#,
        )
        .unwrap();
        fs::write(
            dir.join("OEBPS/text/chapter1.xhtml"),
            r#"<html><body><a href="chapter1.xhtml">self</a></body></html>"#,
        )
        .unwrap();
        (dir.to_path_buf(), "content.opf".to_string())
    }

    #[test]
    fn opens_and_overlays_manifest_mime() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let c = BaseContainer::from_directory(root, opf).unwrap();
        assert_eq!(c.mime_type_of("content.opf"), Some(OPF_MIME));
        assert_eq!(
            c.mime_type_of("OEBPS/text/chapter1.xhtml"),
            Some("application/xhtml+xml")
        );
    }

    #[test]
    fn add_file_appends_manifest_and_spine() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let mut c = BaseContainer::from_directory(root, opf).unwrap();
        c.add_file("OEBPS/text/chapter2.xhtml", b"<html/>", Some("application/xhtml+xml"))
            .unwrap();
        let ids = c.manifest_id_map().unwrap();
        assert!(ids.values().any(|h| h.ends_with("chapter2.xhtml")));
        let spine = c.spine_iter().unwrap();
        assert_eq!(spine.len(), 2);
    }

    #[test]
    fn add_file_rejects_duplicate_name() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let mut c = BaseContainer::from_directory(root, opf).unwrap();
        let err = c.add_file("OEBPS/text/chapter1.xhtml", b"x", None);
        assert!(err.is_err());
    }

    #[test]
    fn add_file_css_has_no_spine_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let mut c = BaseContainer::from_directory(root, opf).unwrap();
        c.add_file("styles/new.css", b"body{}", Some("text/css")).unwrap();
        assert_eq!(c.spine_iter().unwrap().len(), 1);
    }

    #[test]
    fn remove_item_cleans_every_index() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let mut c = BaseContainer::from_directory(root, opf).unwrap();
        c.remove_item("OEBPS/text/chapter1.xhtml", true).unwrap();
        assert!(!c.exists("OEBPS/text/chapter1.xhtml"));
        assert!(c.manifest_id_map().unwrap().is_empty());
        assert!(c.spine_iter().unwrap().is_empty());
    }

    #[test]
    fn rename_updates_manifest_href_and_rebases_links() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let mut c = BaseContainer::from_directory(root.clone(), opf).unwrap();
        c.rename("OEBPS/text/chapter1.xhtml", "chapter1.xhtml").unwrap();
        let ids = c.manifest_id_map().unwrap();
        assert_eq!(ids.get("c1").map(|s| s.as_str()), Some("chapter1.xhtml"));
        c.commit(false).unwrap();
        let content = fs::read_to_string(root.join("chapter1.xhtml")).unwrap();
        assert!(content.contains(r#"href="chapter1.xhtml""#));
    }

    #[test]
    fn set_spine_orders_linear_first() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let mut c = BaseContainer::from_directory(root, opf).unwrap();
        c.add_file("b.xhtml", b"<html/>", Some("application/xhtml+xml")).unwrap();
        c.add_file("c.xhtml", b"<html/>", Some("application/xhtml+xml")).unwrap();
        c.set_spine(&[
            ("OEBPS/text/chapter1.xhtml".to_string(), true),
            ("b.xhtml".to_string(), false),
            ("c.xhtml".to_string(), true),
        ])
        .unwrap();
        let order: Vec<String> = c.spine_iter().unwrap().into_iter().map(|(_, n, _)| n).collect();
        assert_eq!(order, vec!["OEBPS/text/chapter1.xhtml", "c.xhtml", "b.xhtml"]);
    }

    #[test]
    fn clone_then_compare_to_reports_no_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let (root, opf) = make_book(tmp.path());
        let mut c = BaseContainer::from_directory(root, opf.clone()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let state = c.clone_data(dest.path()).unwrap();
        let clone = BaseContainer::from_cloned_state(state);
        assert!(c.compare_to(&clone).is_empty());
    }
}
