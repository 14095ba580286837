//! Thin layer over `lopdf` for the two things the extractors need from a PDF:
//! the AcroForm field tree and per-page text.

use lopdf::{Dictionary, Document, Object, ObjectId};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// `/Ff` bit 16: button field is a radio group.
pub const FLAG_RADIO: i64 = 1 << 15;
/// `/Ff` bit 17: button field is a push button (carries no value).
pub const FLAG_PUSHBUTTON: i64 = 1 << 16;

const MAX_FIELD_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error reading PDF: {0}")]
    Parse(#[from] lopdf::Error),

    #[error("PDF has no AcroForm")]
    NoAcroForm,

    #[error("PDF text extraction panicked")]
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Button,
    Choice,
    Signature,
    Unknown,
}

impl FieldKind {
    fn from_name(name: &[u8]) -> Self {
        match name {
            b"Tx" => FieldKind::Text,
            b"Btn" => FieldKind::Button,
            b"Ch" => FieldKind::Choice,
            b"Sig" => FieldKind::Signature,
            _ => FieldKind::Unknown,
        }
    }
}

/// A terminal form field with inherited attributes resolved.
///
/// Name objects are rendered with their leading slash (`/Yes`), strings are
/// decoded, arrays are joined with ", ".
#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub name: String,
    pub kind: FieldKind,
    pub value: Option<String>,
    pub appearance_state: Option<String>,
    pub flags: i64,
}

impl RawField {
    pub fn is_radio(&self) -> bool {
        self.kind == FieldKind::Button && self.flags & FLAG_RADIO != 0
    }

    pub fn is_pushbutton(&self) -> bool {
        self.kind == FieldKind::Button && self.flags & FLAG_PUSHBUTTON != 0
    }
}

#[derive(Default, Clone)]
struct Inherited {
    kind: Option<FieldKind>,
    value: Option<String>,
    flags: Option<i64>,
}

pub struct PdfDocument {
    doc: Document,
}

impl PdfDocument {
    pub fn load(path: &Path) -> Result<Self, PdfError> {
        if !path.exists() {
            return Err(PdfError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        Self::load_mem(&bytes)
    }

    pub fn load_mem(bytes: &[u8]) -> Result<Self, PdfError> {
        let doc = Document::load_mem(bytes)?;
        Ok(Self { doc })
    }

    pub fn page_count(&self) -> usize {
        self.doc.get_pages().len()
    }

    /// Walks `/AcroForm /Fields` and returns every terminal field.
    ///
    /// Fields that cannot be resolved are logged and skipped; only a missing
    /// or malformed AcroForm is an error.
    pub fn form_fields(&self) -> Result<Vec<RawField>, PdfError> {
        let catalog = self.doc.catalog()?;
        let acroform = match catalog.get(b"AcroForm") {
            Ok(obj) => self.resolve(obj).and_then(|o| o.as_dict().ok()),
            Err(_) => None,
        }
        .ok_or(PdfError::NoAcroForm)?;

        let fields = acroform
            .get(b"Fields")
            .ok()
            .and_then(|obj| self.resolve(obj))
            .and_then(|obj| obj.as_array().ok())
            .ok_or(PdfError::NoAcroForm)?;

        let mut out = Vec::new();
        for field in fields {
            match field {
                Object::Reference(id) => {
                    self.collect_field(*id, "", &Inherited::default(), &mut out, 0)
                }
                other => tracing::warn!("Skipping non-reference AcroForm entry: {:?}", other),
            }
        }
        Ok(out)
    }

    fn resolve<'a>(&'a self, obj: &'a Object) -> Option<&'a Object> {
        match obj {
            Object::Reference(id) => self.doc.get_object(*id).ok(),
            other => Some(other),
        }
    }

    fn collect_field(
        &self,
        id: ObjectId,
        parent_name: &str,
        inherited: &Inherited,
        out: &mut Vec<RawField>,
        depth: usize,
    ) {
        if depth > MAX_FIELD_DEPTH {
            tracing::warn!("Field tree deeper than {} levels, stopping at {:?}", MAX_FIELD_DEPTH, id);
            return;
        }
        let dict = match self.doc.get_object(id).and_then(|o| o.as_dict()) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Skipping unreadable field {:?}: {}", id, e);
                return;
            }
        };

        let partial = dict_text(dict, b"T");
        let name = match (&partial, parent_name.is_empty()) {
            (Some(t), true) => t.clone(),
            (Some(t), false) => format!("{}.{}", parent_name, t),
            (None, _) => parent_name.to_string(),
        };

        let here = Inherited {
            kind: dict
                .get(b"FT")
                .ok()
                .and_then(|o| match o {
                    Object::Name(n) => Some(FieldKind::from_name(n)),
                    _ => None,
                })
                .or(inherited.kind),
            value: dict.get(b"V").ok().and_then(|o| self.render_value(o)).or_else(|| inherited.value.clone()),
            flags: dict.get(b"Ff").ok().and_then(|o| o.as_i64().ok()).or(inherited.flags),
        };

        // Kids carrying /T are child fields; kids without it are widget annotations.
        let kids: Vec<ObjectId> = dict
            .get(b"Kids")
            .ok()
            .and_then(|o| self.resolve(o))
            .and_then(|o| o.as_array().ok())
            .map(|arr| {
                arr.iter()
                    .filter_map(|k| match k {
                        Object::Reference(kid) => Some(*kid),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (child_fields, widgets): (Vec<ObjectId>, Vec<ObjectId>) = kids.into_iter().partition(|kid| {
            self.doc
                .get_object(*kid)
                .and_then(|o| o.as_dict())
                .map(|d| d.has(b"T"))
                .unwrap_or(false)
        });

        if !child_fields.is_empty() {
            for kid in child_fields {
                self.collect_field(kid, &name, &here, out, depth + 1);
            }
            return;
        }

        if name.is_empty() {
            tracing::debug!("Skipping unnamed terminal field {:?}", id);
            return;
        }

        let appearance_state = dict_name(dict, b"AS").or_else(|| {
            widgets.iter().find_map(|w| {
                self.doc
                    .get_object(*w)
                    .and_then(|o| o.as_dict())
                    .ok()
                    .and_then(|d| dict_name(d, b"AS"))
                    .filter(|state| state != "/Off")
            })
        });

        out.push(RawField {
            name,
            kind: here.kind.unwrap_or(FieldKind::Unknown),
            value: here.value,
            appearance_state,
            flags: here.flags.unwrap_or(0),
        });
    }

    fn render_value(&self, obj: &Object) -> Option<String> {
        match obj {
            Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
            Object::Name(bytes) => Some(format!("/{}", String::from_utf8_lossy(bytes))),
            Object::Integer(i) => Some(i.to_string()),
            Object::Real(r) => Some(r.to_string()),
            Object::Boolean(b) => Some(b.to_string()),
            Object::Array(items) => {
                let parts: Vec<String> = items.iter().filter_map(|i| self.render_value(i)).collect();
                Some(parts.join(", "))
            }
            Object::Reference(id) => self.doc.get_object(*id).ok().and_then(|o| self.render_value(o)),
            _ => None,
        }
    }

    /// Text of each page (1-based order), at most `max_pages` pages.
    pub fn page_texts(&self, max_pages: usize) -> Vec<String> {
        self.doc
            .get_pages()
            .keys()
            .take(max_pages)
            .map(|page| match self.doc.extract_text(&[*page]) {
                Ok(text) => normalize_text(&text),
                Err(e) => {
                    tracing::debug!("No text on page {}: {}", page, e);
                    String::new()
                }
            })
            .collect()
    }
}

fn dict_text(dict: &Dictionary, key: &[u8]) -> Option<String> {
    match dict.get(key).ok()? {
        Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
        Object::Name(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

fn dict_name(dict: &Dictionary, key: &[u8]) -> Option<String> {
    match dict.get(key).ok()? {
        Object::Name(bytes) => Some(format!("/{}", String::from_utf8_lossy(bytes))),
        _ => None,
    }
}

/// Decodes a PDF text string: UTF-16 with BOM, UTF-8, else PDFDocEncoding (Latin-1 subset).
pub fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Whole-document text via `pdf-extract`, guarded against its panics.
pub fn extract_text_fallback(bytes: &[u8]) -> Result<String, PdfError> {
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(normalize_text(&text)),
        Ok(Err(e)) => {
            tracing::debug!("pdf-extract failed: {}", e);
            Ok(String::new())
        }
        Err(_) => Err(PdfError::Panic),
    }
}

/// Replaces ligatures and typographic punctuation, then collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    text
        // Common ligatures
        .replace('\u{FB00}', "ff")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl")
        .replace('\u{FB05}', "st")
        .replace('\u{FB06}', "st")
        // Common symbols
        .replace(['\u{2019}', '\u{2018}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2013}', '\u{2014}'], "-")
        .replace('\u{2026}', "...")
        .replace('\u{00A0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf16_and_latin1() {
        assert_eq!(decode_pdf_string(&[0xFE, 0xFF, 0x00, 0x41, 0x00, 0x42]), "AB");
        assert_eq!(decode_pdf_string(b"Acme"), "Acme");
        assert_eq!(decode_pdf_string(&[0x43, 0x61, 0x66, 0xE9]), "Caf\u{e9}");
    }

    #[test]
    fn normalizes_ligatures_and_spacing() {
        assert_eq!(normalize_text("of\u{FB01}ce  \n\t sta\u{FB00}"), "office staff");
        assert_eq!(normalize_text("\u{201C}Acme\u{201D}\u{2014}Inc"), "\"Acme\"-Inc");
    }

    #[test]
    fn garbage_bytes_are_a_parse_error() {
        assert!(matches!(PdfDocument::load_mem(b"not a pdf"), Err(PdfError::Parse(_))));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = PdfDocument::load(Path::new("/definitely/not/here.pdf")).err().unwrap();
        assert!(matches!(err, PdfError::NotFound(_)));
    }
}
