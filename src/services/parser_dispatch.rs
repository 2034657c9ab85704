//! Parser dispatch: routes classified files to a text extractor.
//!
//! Format parsers are external collaborators seen only through the
//! `TextExtractor` trait: bytes in, plain text plus page count and an
//! encrypted flag out. HWP/DOC go through a subprocess converter
//! (LibreOffice / antiword style); the binary formats we can read natively
//! get lightweight built-in extractors.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::router_service::FileType;

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub text: String,
    pub page_count: u32,
    pub encrypted: bool,
    pub method: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("parser not registered for {0}")]
    NoParser(&'static str),
    #[error("document is encrypted")]
    Encrypted,
    #[error("parse failed: {0}")]
    Failed(String),
    #[error("converter subprocess failed: {0}")]
    Subprocess(String),
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn method(&self) -> &'static str;
    async fn parse(&self, file_bytes: &[u8]) -> Result<ParseOutcome, ParseError>;
}

/// Routes a file type to its registered extractor.
pub struct ParserDispatch {
    extractors: HashMap<FileType, Box<dyn TextExtractor>>,
}

impl ParserDispatch {
    pub fn new() -> Self {
        let mut dispatch = Self { extractors: HashMap::new() };
        dispatch.register(FileType::Docx, Box::new(DocxExtractor));
        dispatch.register(FileType::Hwpx, Box::new(HwpxExtractor));
        dispatch.register(FileType::Pdf, Box::new(PdfTextExtractor));
        dispatch.register(
            FileType::Hwp,
            Box::new(SubprocessExtractor::libreoffice_txt("hwp")),
        );
        dispatch.register(FileType::Doc, Box::new(SubprocessExtractor::antiword()));
        dispatch
    }

    pub fn register(&mut self, file_type: FileType, extractor: Box<dyn TextExtractor>) {
        self.extractors.insert(file_type, extractor);
    }

    pub async fn parse(
        &self,
        file_type: FileType,
        file_bytes: &[u8],
    ) -> Result<ParseOutcome, ParseError> {
        let extractor = self
            .extractors
            .get(&file_type)
            .ok_or(ParseError::NoParser(file_type.as_str()))?;

        let outcome = extractor.parse(file_bytes).await?;
        if outcome.encrypted {
            return Err(ParseError::Encrypted);
        }
        tracing::info!(
            "[parser] {} via {}: {} chars, {} pages",
            file_type.as_str(),
            outcome.method,
            outcome.text.chars().count(),
            outcome.page_count
        );
        Ok(outcome)
    }
}

impl Default for ParserDispatch {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Built-in extractors
// ============================================================================

/// DOCX: concatenate `<w:t>` runs out of word/document.xml.
struct DocxExtractor;

#[async_trait]
impl TextExtractor for DocxExtractor {
    fn method(&self) -> &'static str {
        "docx_xml"
    }

    async fn parse(&self, file_bytes: &[u8]) -> Result<ParseOutcome, ParseError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(file_bytes))
            .map_err(|e| ParseError::Failed(e.to_string()))?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|_| ParseError::Encrypted)?
            .read_to_string(&mut xml)
            .map_err(|e| ParseError::Failed(e.to_string()))?;

        let text = extract_xml_text(&xml, "w:t", Some("w:p"));
        let page_count = ((file_bytes.len() / (10 * 1024)) as u32).max(1);
        Ok(ParseOutcome { text, page_count, encrypted: false, method: "docx_xml".to_string() })
    }
}

/// HWPX: concatenate text runs out of the Contents/section*.xml files.
struct HwpxExtractor;

#[async_trait]
impl TextExtractor for HwpxExtractor {
    fn method(&self) -> &'static str {
        "hwpx_xml"
    }

    async fn parse(&self, file_bytes: &[u8]) -> Result<ParseOutcome, ParseError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(file_bytes))
            .map_err(|e| ParseError::Failed(e.to_string()))?;

        let section_names: Vec<String> = archive
            .file_names()
            .filter(|n| n.starts_with("Contents/section") && n.ends_with(".xml"))
            .map(str::to_string)
            .collect();
        if section_names.is_empty() {
            return Err(ParseError::Encrypted);
        }

        let mut text = String::new();
        for name in &section_names {
            let mut xml = String::new();
            archive
                .by_name(name)
                .map_err(|e| ParseError::Failed(e.to_string()))?
                .read_to_string(&mut xml)
                .map_err(|e| ParseError::Failed(e.to_string()))?;
            text.push_str(&extract_xml_text(&xml, "hp:t", Some("hp:p")));
            text.push('\n');
        }

        Ok(ParseOutcome {
            text,
            page_count: section_names.len() as u32,
            encrypted: false,
            method: "hwpx_xml".to_string(),
        })
    }
}

/// PDF: best-effort text-run extraction from uncompressed content streams.
/// Scanned or fully compressed PDFs yield little or no text; the
/// orchestrator classifies that as SCANNED_IMAGE via the length check.
struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    fn method(&self) -> &'static str {
        "pdf_text"
    }

    async fn parse(&self, file_bytes: &[u8]) -> Result<ParseOutcome, ParseError> {
        let body = String::from_utf8_lossy(file_bytes);
        let mut text = String::new();

        // Literal strings followed by the Tj / TJ show operators
        for (idx, c) in body.char_indices() {
            if c != '(' {
                continue;
            }
            let mut literal = String::new();
            let mut escaped = false;
            let mut closed_at = None;
            for (j, d) in body[idx + 1..].char_indices() {
                if escaped {
                    literal.push(d);
                    escaped = false;
                    continue;
                }
                match d {
                    '\\' => escaped = true,
                    ')' => {
                        closed_at = Some(idx + 1 + j + 1);
                        break;
                    },
                    _ => literal.push(d),
                }
            }
            if let Some(end) = closed_at {
                let tail: String = body[end..].chars().take(8).collect();
                if tail.contains("Tj") || tail.contains("TJ") {
                    text.push_str(&literal);
                    text.push(' ');
                }
            }
        }

        let pages = body.matches("/Type /Page").count() - body.matches("/Type /Pages").count();
        let page_count = pages as u32;
        Ok(ParseOutcome {
            text,
            page_count: page_count.max(1),
            encrypted: false,
            method: "pdf_text".to_string(),
        })
    }
}

// ============================================================================
// Subprocess converters
// ============================================================================

/// Pipes the document into an external converter and reads stdout.
struct SubprocessExtractor {
    program: &'static str,
    args: Vec<&'static str>,
    method: &'static str,
}

impl SubprocessExtractor {
    fn libreoffice_txt(_format: &'static str) -> Self {
        Self {
            program: "soffice",
            args: vec!["--headless", "--cat", "/dev/stdin"],
            method: "libreoffice",
        }
    }

    fn antiword() -> Self {
        Self { program: "antiword", args: vec!["-"], method: "antiword" }
    }
}

#[async_trait]
impl TextExtractor for SubprocessExtractor {
    fn method(&self) -> &'static str {
        self.method
    }

    async fn parse(&self, file_bytes: &[u8]) -> Result<ParseOutcome, ParseError> {
        let mut child = Command::new(self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ParseError::Subprocess(format!("{}: {}", self.program, e)))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(file_bytes)
                .await
                .map_err(|e| ParseError::Subprocess(e.to_string()))?;
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ParseError::Subprocess(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ParseError::Subprocess(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.chars().take(200).collect::<String>()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let page_count = ((file_bytes.len() / (10 * 1024)) as u32).max(1);
        Ok(ParseOutcome { text, page_count, encrypted: false, method: self.method.to_string() })
    }
}

/// Pull character data for `tag` elements; `paragraph_tag` close adds a
/// newline. Keeps the extractor free of a full XML dependency.
fn extract_xml_text(xml: &str, tag: &str, paragraph_tag: Option<&str>) -> String {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let paragraph_close = paragraph_tag.map(|p| format!("</{}>", p));

    let mut out = String::new();
    let mut rest = xml;

    loop {
        let Some(start) = rest.find(&open) else { break };

        if let Some(paragraph_close) = &paragraph_close {
            let skipped = &rest[..start];
            for _ in 0..skipped.matches(paragraph_close.as_str()).count() {
                out.push('\n');
            }
        }

        let after_open = &rest[start + open.len()..];
        let Some(gt) = after_open.find('>') else { break };
        // Self-closing tag carries no text
        if after_open[..gt].ends_with('/') {
            rest = &after_open[gt + 1..];
            continue;
        }
        let content_start = gt + 1;
        let Some(end) = after_open[content_start..].find(&close) else { break };
        out.push_str(&unescape_xml(&after_open[content_start..content_start + end]));
        rest = &after_open[content_start + end + close.len()..];
    }

    out
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn make_docx(document_xml: &str) -> Vec<u8> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer.start_file("word/document.xml", FileOptions::default()).unwrap();
            writer.write_all(document_xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[tokio::test]
    async fn test_docx_text_extraction() {
        let xml = r#"<w:document><w:body>
            <w:p><w:r><w:t>김철수</w:t></w:r></w:p>
            <w:p><w:r><w:t>백엔드 개발자 &amp; 아키텍트</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = make_docx(xml);

        let dispatch = ParserDispatch::new();
        let outcome = dispatch.parse(FileType::Docx, &bytes).await.unwrap();
        assert!(outcome.text.contains("김철수"));
        assert!(outcome.text.contains("백엔드 개발자 & 아키텍트"));
        assert_eq!(outcome.method, "docx_xml");
    }

    #[tokio::test]
    async fn test_docx_without_document_xml_is_encrypted() {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer.start_file("word/styles.xml", FileOptions::default()).unwrap();
            writer.write_all(b"<w:styles/>").unwrap();
            writer.finish().unwrap();
        }
        let dispatch = ParserDispatch::new();
        let err = dispatch.parse(FileType::Docx, &buffer.into_inner()).await.unwrap_err();
        assert!(matches!(err, ParseError::Encrypted));
    }

    #[tokio::test]
    async fn test_pdf_literal_string_extraction() {
        let pdf = b"%PDF-1.4\n1 0 obj << /Type /Page >>\nBT (Hello Resume) Tj ET\n%%EOF";
        let dispatch = ParserDispatch::new();
        let outcome = dispatch.parse(FileType::Pdf, pdf).await.unwrap();
        assert!(outcome.text.contains("Hello Resume"));
        assert_eq!(outcome.page_count, 1);
    }

    #[test]
    fn test_extract_xml_text_paragraph_breaks() {
        let xml = "<w:p><w:t>one</w:t></w:p><w:p><w:t>two</w:t></w:p>";
        let text = extract_xml_text(xml, "w:t", Some("w:p"));
        assert!(text.contains("one"));
        assert!(text.contains("two"));
        assert!(text.contains('\n'));
    }

    #[test]
    fn test_self_closing_tags_skipped() {
        let xml = "<w:t/><w:t>kept</w:t>";
        assert_eq!(extract_xml_text(xml, "w:t", None), "kept");
    }
}
