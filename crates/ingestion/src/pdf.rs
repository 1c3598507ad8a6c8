//! PDF text extraction module
//!
//! Extracts per-page text from PDF bytes using lopdf. Text-showing
//! operators inside the page content streams are decoded in order and
//! positioning operators become line breaks.

use crate::errors::IngestionError;
use bytes::Bytes;
use cevra_common::errors::Result;
use lopdf::content::Content;
use lopdf::{Document, Object};
use tracing::{debug, warn};

/// Horizontal TJ adjustment (thousandths of an em) treated as a word gap
const WORD_GAP: f32 = -200.0;

/// Text of one page; page numbers are 1-based and in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub page_number: u32,
    pub text: String,
}

/// Cheap header check so obviously wrong uploads fail before parsing
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(5).any(|w| w == b"%PDF-")
}

/// Extract the text of every page
pub fn extract_pages(bytes: &[u8]) -> std::result::Result<Vec<PageText>, IngestionError> {
    if !looks_like_pdf(bytes) {
        return Err(IngestionError::NotPdf);
    }

    let doc = Document::load_mem(bytes).map_err(|e| IngestionError::PdfParse {
        message: format!("Failed to load PDF: {}", e),
    })?;

    let pages = doc.get_pages();
    debug!(page_count = pages.len(), "Extracting text from PDF");

    Ok(pages
        .into_iter()
        .map(|(page_number, page_id)| {
            let text = match doc.get_page_content(page_id) {
                Ok(content) => extract_text_from_content(&content),
                Err(e) => {
                    warn!(page = page_number, error = %e, "Failed to read page content, skipping");
                    String::new()
                }
            };
            PageText { page_number, text }
        })
        .collect())
}

/// Run extraction on the blocking pool; the bytes are dropped when it returns
pub async fn extract_pages_blocking(bytes: Bytes) -> Result<Vec<PageText>> {
    let pages = tokio::task::spawn_blocking(move || extract_pages(&bytes))
        .await
        .map_err(|e| IngestionError::Task(e.to_string()))??;
    Ok(pages)
}

fn extract_text_from_content(content: &[u8]) -> String {
    let operations = match Content::decode(content) {
        Ok(content) => content.operations,
        Err(e) => {
            warn!(error = %e, "Failed to decode content stream");
            return String::new();
        }
    };

    let mut raw = String::new();
    for op in operations {
        match op.operator.as_str() {
            "ET" | "Td" | "TD" | "T*" => raw.push('\n'),
            "Tj" => push_operand_text(&mut raw, op.operands.last()),
            "'" | "\"" => {
                raw.push('\n');
                push_operand_text(&mut raw, op.operands.last());
            }
            "TJ" => {
                if let Some(Object::Array(parts)) = op.operands.first() {
                    for part in parts {
                        match part {
                            Object::String(bytes, _) => raw.push_str(&decode_pdf_string(bytes)),
                            Object::Integer(n) if (*n as f32) <= WORD_GAP => raw.push(' '),
                            Object::Real(n) if *n <= WORD_GAP => raw.push(' '),
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
    }

    clean_text(&raw)
}

fn push_operand_text(out: &mut String, operand: Option<&Object>) {
    if let Some(Object::String(bytes, _)) = operand {
        out.push_str(&decode_pdf_string(bytes));
    }
}

/// UTF-16BE when marked with a BOM, Latin-1 otherwise
fn decode_pdf_string(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
            char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect()
        }
        _ => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Collapse whitespace inside lines and drop empty lines
fn clean_text(text: &str) -> String {
    text.lines()
        .map(|line| {
            line.replace('\u{FEFF}', "")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builders for small PDFs used by tests across the workspace
#[cfg(any(test, feature = "testing"))]
pub mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    /// One page per entry; `\n` inside an entry starts a new text line
    pub fn sample_pdf(pages: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
        for page in pages {
            let mut operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
            ];
            for (i, line) in page.lines().enumerate() {
                if i > 0 {
                    operations.push(Operation::new("Td", vec![0.into(), (-14).into()]));
                }
                operations.push(Operation::new("Tj", vec![Object::string_literal(line)]));
            }
            operations.push(Operation::new("ET", vec![]));

            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(
                dictionary! {},
                content.encode().expect("encode content stream"),
            ));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("serialize fixture PDF");
        bytes
    }
}
