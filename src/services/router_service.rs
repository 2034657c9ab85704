//! File classification: type detection, encryption probe, page bound.
//!
//! Rule based, zero LLM cost. Detection precedence is magic bytes first
//! (`%PDF`, ZIP, OLE compound), with the filename extension only as a tie
//! breaker inside a container family. Any failure while probing for
//! encryption is treated as encrypted.

use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Doc,
    Docx,
    Hwp,
    Hwpx,
    Unknown,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Doc => "doc",
            Self::Docx => "docx",
            Self::Hwp => "hwp",
            Self::Hwpx => "hwpx",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "doc" => Self::Doc,
            "docx" => Self::Docx,
            "hwp" => Self::Hwp,
            "hwpx" => Self::Hwpx,
            _ => Self::Unknown,
        }
    }

    /// HWP family requires external conversion and runs on the slow queue.
    pub fn is_slow(&self) -> bool {
        matches!(self, Self::Hwp | Self::Hwpx)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouterResult {
    pub file_type: FileType,
    pub rejected: bool,
    pub reject_reason: Option<String>,
    pub encrypted: bool,
    pub page_count: u32,
    pub file_size_mb: f64,
    pub warnings: Vec<String>,
}

impl RouterResult {
    pub fn is_valid(&self) -> bool {
        !self.rejected && self.file_type != FileType::Unknown
    }

    fn rejected(file_type: FileType, reason: String, size_mb: f64, encrypted: bool) -> Self {
        Self {
            file_type,
            rejected: true,
            reject_reason: Some(reason),
            encrypted,
            page_count: 0,
            file_size_mb: size_mb,
            warnings: Vec::new(),
        }
    }
}

pub struct RouterService;

impl RouterService {
    pub const MAX_FILE_SIZE_MB: f64 = 50.0;
    pub const MAX_PAGE_COUNT: u32 = 50;

    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, file_bytes: &[u8], filename: &str) -> RouterResult {
        let size_mb = file_bytes.len() as f64 / (1024.0 * 1024.0);
        if size_mb > Self::MAX_FILE_SIZE_MB {
            return RouterResult::rejected(
                FileType::Unknown,
                format!(
                    "FILE_TOO_LARGE: 파일 크기가 {}MB를 초과합니다. ({:.1}MB)",
                    Self::MAX_FILE_SIZE_MB,
                    size_mb
                ),
                size_mb,
                false,
            );
        }

        let file_type = detect_file_type(file_bytes, filename);
        if file_type == FileType::Unknown {
            return RouterResult::rejected(
                FileType::Unknown,
                "UNSUPPORTED_FORMAT: 지원하지 않는 파일 형식입니다. (HWP, HWPX, DOC, DOCX, PDF만 지원)"
                    .to_string(),
                size_mb,
                false,
            );
        }

        if check_encryption(file_bytes, file_type) {
            return RouterResult::rejected(
                file_type,
                "DRM_PROTECTED: 암호화된 파일입니다. 암호를 해제한 후 다시 업로드해주세요."
                    .to_string(),
                size_mb,
                true,
            );
        }

        let page_count = estimate_page_count(file_bytes, file_type);
        if page_count > Self::MAX_PAGE_COUNT {
            return RouterResult::rejected(
                file_type,
                format!(
                    "TOO_MANY_PAGES: 페이지 수가 {}페이지를 초과합니다. ({}페이지)",
                    Self::MAX_PAGE_COUNT,
                    page_count
                ),
                size_mb,
                false,
            );
        }

        let mut warnings = Vec::new();
        if page_count > 30 {
            warnings.push(format!("페이지 수가 많습니다 ({}페이지)", page_count));
        }
        if size_mb > 10.0 {
            warnings.push(format!("파일 크기가 큽니다 ({:.1}MB)", size_mb));
        }

        RouterResult {
            file_type,
            rejected: false,
            reject_reason: None,
            encrypted: false,
            page_count,
            file_size_mb: size_mb,
            warnings,
        }
    }
}

impl Default for RouterService {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Type detection
// ============================================================================

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

fn detect_file_type(file_bytes: &[u8], filename: &str) -> FileType {
    let ext = filename.rsplit_once('.').map(|(_, e)| e.to_lowercase()).unwrap_or_default();

    if file_bytes.starts_with(PDF_MAGIC) {
        return FileType::Pdf;
    }

    if file_bytes.starts_with(ZIP_MAGIC) {
        return match detect_zip_type(file_bytes) {
            FileType::Unknown => match ext.as_str() {
                "hwpx" => FileType::Hwpx,
                "docx" => FileType::Docx,
                _ => FileType::Unknown,
            },
            detected => detected,
        };
    }

    if file_bytes.starts_with(OLE_MAGIC) {
        return match detect_ole_type(file_bytes) {
            FileType::Unknown => match ext.as_str() {
                "hwp" => FileType::Hwp,
                "doc" => FileType::Doc,
                _ => FileType::Unknown,
            },
            detected => detected,
        };
    }

    // No recognizable magic: extension only
    FileType::from_extension(&ext)
}

/// ZIP family: DOCX carries `word/`, HWPX carries `Contents/`.
fn detect_zip_type(file_bytes: &[u8]) -> FileType {
    let Ok(archive) = zip::ZipArchive::new(Cursor::new(file_bytes)) else {
        return FileType::Unknown;
    };

    let mut has_word = false;
    let mut has_contents = false;
    for name in archive.file_names() {
        if name.starts_with("word/") {
            has_word = true;
        }
        if name.starts_with("Contents/") {
            has_contents = true;
        }
    }

    if has_contents {
        FileType::Hwpx
    } else if has_word {
        FileType::Docx
    } else {
        FileType::Unknown
    }
}

/// OLE compound: HWP carries a `FileHeader` stream, DOC a `WordDocument`.
fn detect_ole_type(file_bytes: &[u8]) -> FileType {
    let Ok(compound) = CompoundFile::parse(file_bytes) else {
        return FileType::Unknown;
    };

    if compound.has_stream("FileHeader") {
        FileType::Hwp
    } else if compound.has_stream("WordDocument") {
        FileType::Doc
    } else {
        FileType::Unknown
    }
}

// ============================================================================
// Encryption probes (type specific; probe errors are conservative)
// ============================================================================

fn check_encryption(file_bytes: &[u8], file_type: FileType) -> bool {
    match file_type {
        FileType::Hwp => check_hwp_encryption(file_bytes),
        FileType::Hwpx => check_hwpx_encryption(file_bytes),
        FileType::Pdf => check_pdf_encryption(file_bytes),
        FileType::Doc => check_doc_encryption(file_bytes),
        FileType::Docx => check_docx_encryption(file_bytes),
        FileType::Unknown => false,
    }
}

/// Bit 1 of the flags dword at offset 36 of the FileHeader stream.
fn check_hwp_encryption(file_bytes: &[u8]) -> bool {
    let Ok(compound) = CompoundFile::parse(file_bytes) else {
        return true;
    };
    let Some(header) = compound.read_stream("FileHeader") else {
        return true;
    };
    if header.len() < 40 {
        return true;
    }
    let flags = u32::from_le_bytes([header[36], header[37], header[38], header[39]]);
    flags & 0x02 != 0
}

fn check_hwpx_encryption(file_bytes: &[u8]) -> bool {
    let Ok(archive) = zip::ZipArchive::new(Cursor::new(file_bytes)) else {
        return true;
    };
    // A readable HWPX always exposes the Contents/ tree
    let has_contents = archive.file_names().any(|n| n.starts_with("Contents/"));
    !has_contents
}

fn check_pdf_encryption(file_bytes: &[u8]) -> bool {
    // An /Encrypt entry in the trailer means the document requires keys.
    // Scan the tail first (trailer lives there), then the whole body.
    let tail_start = file_bytes.len().saturating_sub(4096);
    contains(&file_bytes[tail_start..], b"/Encrypt") || contains(file_bytes, b"/Encrypt ")
}

fn check_doc_encryption(file_bytes: &[u8]) -> bool {
    let Ok(compound) = CompoundFile::parse(file_bytes) else {
        return true;
    };
    compound.has_stream("EncryptedPackage")
}

fn check_docx_encryption(file_bytes: &[u8]) -> bool {
    let Ok(mut archive) = zip::ZipArchive::new(Cursor::new(file_bytes)) else {
        return true;
    };
    let missing_document = archive.by_name("word/document.xml").is_err();
    missing_document
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ============================================================================
// Page estimation
// ============================================================================

fn estimate_page_count(file_bytes: &[u8], file_type: FileType) -> u32 {
    match file_type {
        FileType::Pdf => count_pdf_pages(file_bytes),
        FileType::Hwpx => count_hwpx_sections(file_bytes),
        // Size-based estimate, roughly 10KB per page
        FileType::Hwp | FileType::Doc | FileType::Docx => {
            ((file_bytes.len() / (10 * 1024)) as u32).max(1)
        },
        FileType::Unknown => 1,
    }
}

fn count_pdf_pages(file_bytes: &[u8]) -> u32 {
    let mut count = 0u32;
    let mut i = 0usize;
    while i + 5 <= file_bytes.len() {
        if &file_bytes[i..i + 5] != b"/Type" {
            i += 1;
            continue;
        }
        let mut j = i + 5;
        while j < file_bytes.len() && file_bytes[j] == b' ' {
            j += 1;
        }
        let rest = &file_bytes[j..];
        if rest.starts_with(b"/Page") && !rest.starts_with(b"/Pages") {
            count += 1;
        }
        i = j.max(i + 1);
    }
    count.max(1)
}

fn count_hwpx_sections(file_bytes: &[u8]) -> u32 {
    let Ok(archive) = zip::ZipArchive::new(Cursor::new(file_bytes)) else {
        return 1;
    };
    let sections = archive
        .file_names()
        .filter(|n| n.starts_with("Contents/section") && n.ends_with(".xml"))
        .count() as u32;
    sections.max(1)
}

// ============================================================================
// Minimal OLE compound file reader
// ============================================================================

const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
const FREESECT: u32 = 0xFFFF_FFFF;

struct DirEntry {
    name: String,
    object_type: u8,
    start_sector: u32,
    size: u64,
}

/// Just enough of the compound-file binary format to list directory
/// entries and read one stream: header, DIFAT/FAT, directory chain,
/// miniFAT and the root mini stream.
struct CompoundFile<'a> {
    data: &'a [u8],
    sector_size: usize,
    mini_sector_size: usize,
    mini_cutoff: u64,
    fat: Vec<u32>,
    mini_fat: Vec<u32>,
    entries: Vec<DirEntry>,
    mini_stream: Vec<u8>,
}

impl<'a> CompoundFile<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < 512 || !data.starts_with(OLE_MAGIC) {
            return Err("not a compound file");
        }

        let sector_shift = read_u16(data, 30)?;
        if !(7..=12).contains(&sector_shift) {
            return Err("implausible sector size");
        }
        let sector_size = 1usize << sector_shift;
        let mini_sector_size = 1usize << read_u16(data, 32)?.min(15);
        let mini_cutoff = read_u32(data, 56)? as u64;

        // DIFAT: 109 inline entries, then an optional chain
        let mut difat: Vec<u32> = Vec::new();
        for i in 0..109 {
            let entry = read_u32(data, 76 + i * 4)?;
            if entry != FREESECT {
                difat.push(entry);
            }
        }
        let mut difat_sector = read_u32(data, 68)?;
        let difat_count = read_u32(data, 72)? as usize;
        let mut walked = 0usize;
        while difat_sector != ENDOFCHAIN && difat_sector != FREESECT && walked <= difat_count {
            let base = sector_offset(difat_sector, sector_size);
            let per_sector = sector_size / 4 - 1;
            for i in 0..per_sector {
                let entry = read_u32(data, base + i * 4)?;
                if entry != FREESECT {
                    difat.push(entry);
                }
            }
            difat_sector = read_u32(data, base + per_sector * 4)?;
            walked += 1;
        }

        // FAT
        let mut fat: Vec<u32> = Vec::new();
        for &fat_sector in &difat {
            let base = sector_offset(fat_sector, sector_size);
            for i in 0..sector_size / 4 {
                fat.push(read_u32(data, base + i * 4)?);
            }
        }

        // Directory chain
        let mut entries = Vec::new();
        let mut dir_sector = read_u32(data, 48)?;
        let max_sectors = data.len() / sector_size + 1;
        let mut visited = 0usize;
        while dir_sector != ENDOFCHAIN && dir_sector != FREESECT {
            if visited > max_sectors {
                return Err("directory chain loop");
            }
            visited += 1;
            let base = sector_offset(dir_sector, sector_size);
            for i in 0..sector_size / 128 {
                let entry_base = base + i * 128;
                if entry_base + 128 > data.len() {
                    break;
                }
                let name_len = read_u16(data, entry_base + 64)? as usize;
                if name_len < 2 || name_len > 64 {
                    continue;
                }
                let name = decode_utf16le(&data[entry_base..entry_base + name_len - 2]);
                let object_type = data[entry_base + 66];
                let start_sector = read_u32(data, entry_base + 116)?;
                let size = read_u32(data, entry_base + 120)? as u64;
                entries.push(DirEntry { name, object_type, start_sector, size });
            }
            dir_sector = *fat.get(dir_sector as usize).ok_or("directory sector out of FAT")?;
        }
        if entries.is_empty() {
            return Err("empty directory");
        }

        // MiniFAT
        let mut mini_fat = Vec::new();
        let mut mini_fat_sector = read_u32(data, 60)?;
        let mut visited = 0usize;
        while mini_fat_sector != ENDOFCHAIN && mini_fat_sector != FREESECT {
            if visited > max_sectors {
                return Err("miniFAT chain loop");
            }
            visited += 1;
            let base = sector_offset(mini_fat_sector, sector_size);
            for i in 0..sector_size / 4 {
                mini_fat.push(read_u32(data, base + i * 4)?);
            }
            mini_fat_sector =
                *fat.get(mini_fat_sector as usize).ok_or("miniFAT sector out of FAT")?;
        }

        let mut compound = Self {
            data,
            sector_size,
            mini_sector_size,
            mini_cutoff,
            fat,
            mini_fat,
            entries,
            mini_stream: Vec::new(),
        };

        // Root entry (object type 5) backs the mini stream
        let root = compound
            .entries
            .iter()
            .find(|e| e.object_type == 5)
            .map(|e| (e.start_sector, e.size));
        if let Some((start, size)) = root {
            compound.mini_stream = compound.read_chain(start, size, data.len())?;
        }

        Ok(compound)
    }

    fn has_stream(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.object_type == 2 && e.name == name)
    }

    fn read_stream(&self, name: &str) -> Option<Vec<u8>> {
        let entry = self.entries.iter().find(|e| e.object_type == 2 && e.name == name)?;

        if entry.size < self.mini_cutoff {
            self.read_mini_chain(entry.start_sector, entry.size)
        } else {
            self.read_chain(entry.start_sector, entry.size, self.data.len()).ok()
        }
    }

    fn read_chain(&self, start: u32, size: u64, bound: usize) -> Result<Vec<u8>, &'static str> {
        let mut out = Vec::with_capacity(size as usize);
        let mut sector = start;
        let max_iters = bound / self.sector_size + 2;
        let mut iters = 0usize;

        while sector != ENDOFCHAIN && sector != FREESECT && (out.len() as u64) < size {
            if iters > max_iters {
                return Err("sector chain loop");
            }
            iters += 1;
            let base = sector_offset(sector, self.sector_size);
            let end = (base + self.sector_size).min(self.data.len());
            if base >= self.data.len() {
                return Err("sector out of bounds");
            }
            out.extend_from_slice(&self.data[base..end]);
            sector = *self.fat.get(sector as usize).ok_or("sector out of FAT")?;
        }

        out.truncate(size as usize);
        Ok(out)
    }

    fn read_mini_chain(&self, start: u32, size: u64) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(size as usize);
        let mut sector = start;
        let max_iters = self.mini_stream.len() / self.mini_sector_size + 2;
        let mut iters = 0usize;

        while sector != ENDOFCHAIN && sector != FREESECT && (out.len() as u64) < size {
            if iters > max_iters {
                return None;
            }
            iters += 1;
            let base = sector as usize * self.mini_sector_size;
            let end = (base + self.mini_sector_size).min(self.mini_stream.len());
            if base >= self.mini_stream.len() {
                return None;
            }
            out.extend_from_slice(&self.mini_stream[base..end]);
            sector = *self.mini_fat.get(sector as usize)?;
        }

        out.truncate(size as usize);
        Some(out)
    }
}

fn sector_offset(sector: u32, sector_size: usize) -> usize {
    512 + sector as usize * sector_size
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, &'static str> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or("short read")
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, &'static str> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or("short read")
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> =
        bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn make_zip(entry_names: &[&str]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for name in entry_names {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(b"<xml/>").unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn test_pdf_detection() {
        let result = RouterService::new().analyze(b"%PDF-1.7\nsome content", "resume.bin");
        assert_eq!(result.file_type, FileType::Pdf);
        assert!(!result.rejected);
    }

    #[test]
    fn test_docx_detection_by_zip_entries() {
        let bytes = make_zip(&["word/document.xml", "[Content_Types].xml"]);
        // Wrong extension on purpose: magic + entries win
        let result = RouterService::new().analyze(&bytes, "resume.zip");
        assert_eq!(result.file_type, FileType::Docx);
    }

    #[test]
    fn test_hwpx_detection_by_zip_entries() {
        let bytes = make_zip(&["Contents/section0.xml", "Contents/header.xml"]);
        let result = RouterService::new().analyze(&bytes, "resume.hwpx");
        assert_eq!(result.file_type, FileType::Hwpx);
        assert_eq!(result.page_count, 1);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = RouterService::new().analyze(b"plain text content", "notes.txt");
        assert!(result.rejected);
        assert!(result.reject_reason.as_deref().unwrap().starts_with("UNSUPPORTED_FORMAT"));
    }

    #[test]
    fn test_oversized_file_rejected() {
        let bytes = vec![0u8; 51 * 1024 * 1024];
        let result = RouterService::new().analyze(&bytes, "big.pdf");
        assert!(result.rejected);
        assert!(result.reject_reason.as_deref().unwrap().starts_with("FILE_TOO_LARGE"));
    }

    #[test]
    fn test_docx_missing_document_xml_treated_encrypted() {
        let bytes = make_zip(&["word/styles.xml"]);
        let result = RouterService::new().analyze(&bytes, "resume.docx");
        assert!(result.rejected);
        assert!(result.encrypted);
    }

    #[test]
    fn test_encrypted_pdf_detected() {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.extend_from_slice(b"trailer << /Encrypt 5 0 R >>\n%%EOF");
        let result = RouterService::new().analyze(&bytes, "locked.pdf");
        assert!(result.rejected);
        assert!(result.encrypted);
    }

    #[test]
    fn test_pdf_page_count() {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        for _ in 0..3 {
            bytes.extend_from_slice(b"<< /Type /Page /Parent 2 0 R >>\n");
        }
        bytes.extend_from_slice(b"<< /Type /Pages /Count 3 >>\n%%EOF");
        assert_eq!(count_pdf_pages(&bytes), 3);
    }

    #[test]
    fn test_truncated_ole_is_conservative() {
        // Valid magic, garbage body: probes must fail closed
        let mut bytes = OLE_MAGIC.to_vec();
        bytes.resize(600, 0);
        assert!(check_hwp_encryption(&bytes) || detect_ole_type(&bytes) == FileType::Unknown);
    }

    #[test]
    fn test_fast_slow_split() {
        assert!(!FileType::Pdf.is_slow());
        assert!(!FileType::Docx.is_slow());
        assert!(FileType::Hwp.is_slow());
        assert!(FileType::Hwpx.is_slow());
    }
}
