#![allow(dead_code)]

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use certex::llm::{Completion, CompletionRequest, CompletionService, LlmError};
use certex::universal::{PageText, TextSource, TextSourceError};

pub enum Field<'a> {
    Text(&'a str),
    Checkbox(bool),
}

/// Field names in the shape ACORD 25 templates use, enough for a high
/// confidence detection.
pub fn acord_fields() -> Vec<(&'static str, Field<'static>)> {
    vec![
        ("F[0].P1[0].NamedInsured_FullName_A[0]", Field::Text("Acme Foods LLC")),
        ("F[0].P1[0].Producer_FullName_A[0]", Field::Text("Shield Brokers")),
        ("F[0].P1[0].CertificateHolder_FullName_A[0]", Field::Text("Big Retail Inc")),
        ("F[0].P1[0].Insurer_FullName_A[0]", Field::Text("Mutual Casualty Co")),
        ("F[0].P1[0].Insurer_NAICCode_A[0]", Field::Text("12345")),
        ("F[0].P1[0].Policy_GeneralLiability_InsurerLetterCode_A[0]", Field::Text("A")),
        ("F[0].P1[0].Policy_AutomobileLiability_InsurerLetterCode_A[0]", Field::Text("A")),
        ("F[0].P1[0].Vehicle_AnyAutoSymbolIndicator_A[0]", Field::Checkbox(false)),
        ("F[0].P1[0].GeneralLiability_EachOccurrence_LimitAmount_A[0]", Field::Text("$1,000,000")),
        ("F[0].P1[0].GeneralLiability_OccurrenceIndicator_A[0]", Field::Checkbox(true)),
        ("F[0].P1[0].Custom_Loss_Payee_Note[0]", Field::Text("Loss payee: First Bank")),
    ]
}

/// A one-page PDF with `text` drawn on the page and an AcroForm holding `fields`.
/// An empty `fields` slice produces a plain PDF without an AcroForm.
pub fn build_pdf(fields: &[(&str, Field<'_>)], text: &str) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );

    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    };

    if !fields.is_empty() {
        let mut field_refs: Vec<Object> = Vec::new();
        for (i, (name, field)) in fields.iter().enumerate() {
            let y = 700 - (i as i64) * 20;
            let mut dict = dictionary! {
                "Type" => "Annot",
                "Subtype" => "Widget",
                "T" => Object::string_literal(*name),
                "P" => page_id,
                "Rect" => vec![72.into(), y.into(), 300.into(), (y + 14).into()],
            };
            match field {
                Field::Text(value) => {
                    dict.set("FT", "Tx");
                    dict.set("V", Object::string_literal(*value));
                }
                Field::Checkbox(on) => {
                    let state = if *on { "Yes" } else { "Off" };
                    dict.set("FT", "Btn");
                    dict.set("V", Object::Name(state.as_bytes().to_vec()));
                    dict.set("AS", Object::Name(state.as_bytes().to_vec()));
                }
            }
            field_refs.push(doc.add_object(dict).into());
        }
        let acroform_id = doc.add_object(dictionary! { "Fields" => field_refs });
        catalog.set("AcroForm", acroform_id);
    }

    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

pub fn write_pdf(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Replies with queued answers in order; errors once the queue is empty.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Self {
        Self { replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()) }
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(content) => Ok(Completion { content, usage: None, model: "scripted".into() }),
            None => Err(LlmError::EmptyResponse),
        }
    }

    fn model_name(&self) -> String {
        "scripted".into()
    }
}

/// Text source returning the same text for every document.
pub struct FixedText(pub &'static str);

#[async_trait]
impl TextSource for FixedText {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn extract(&self, _path: &Path, _dpi: u32, _max_pages: usize) -> Result<PageText, TextSourceError> {
        Ok(PageText { text: self.0.to_string(), page_count: 1 })
    }
}
