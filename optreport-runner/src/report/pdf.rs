//! Minimal text-only PDF writer.
//!
//! Produces PDF 1.4 with the standard Type 1 fonts (no embedding), one content
//! stream per page, and a byte-exact cross-reference table. Text outside
//! Latin-1 is replaced with `?`.

use std::fmt::Write as _;

/// A4 landscape, in points.
pub const PAGE_WIDTH: f32 = 842.0;
pub const PAGE_HEIGHT: f32 = 595.0;
const MARGIN: f32 = 40.0;
const FOOTER_Y: f32 = 20.0;

// Fixed object numbers; pages follow from FIRST_PAGE_OBJ, two objects each.
const CATALOG_OBJ: usize = 1;
const PAGES_OBJ: usize = 2;
const FONT_REGULAR_OBJ: usize = 3;
const FONT_BOLD_OBJ: usize = 4;
const FONT_MONO_OBJ: usize = 5;
const INFO_OBJ: usize = 6;
const FIRST_PAGE_OBJ: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextStyle {
    Title,
    Heading,
    Body,
    /// Courier, for aligned tables.
    Mono,
}

impl TextStyle {
    fn font(&self) -> &'static str {
        match self {
            TextStyle::Title | TextStyle::Heading => "F2",
            TextStyle::Body => "F1",
            TextStyle::Mono => "F3",
        }
    }

    fn size(&self) -> f32 {
        match self {
            TextStyle::Title => 16.0,
            TextStyle::Heading => 12.0,
            TextStyle::Body => 10.0,
            TextStyle::Mono => 8.0,
        }
    }

    fn leading(&self) -> f32 {
        self.size() * 1.45
    }
}

#[derive(Debug, Clone)]
struct PlacedLine {
    style: TextStyle,
    y: f32,
    text: String,
}

/// Paginating line-oriented document.
#[derive(Debug, Clone)]
pub struct PdfDocument {
    title: String,
    pages: Vec<Vec<PlacedLine>>,
    cursor: f32,
}

impl PdfDocument {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            pages: vec![Vec::new()],
            cursor: PAGE_HEIGHT - MARGIN,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Append a line, starting a new page when it would cross the bottom margin.
    pub fn line(&mut self, style: TextStyle, text: impl Into<String>) -> &mut Self {
        let leading = style.leading();
        if self.cursor - leading < MARGIN {
            self.page_break();
        }
        self.cursor -= leading;
        let y = self.cursor;
        if let Some(page) = self.pages.last_mut() {
            page.push(PlacedLine {
                style,
                y,
                text: text.into(),
            });
        }
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.cursor -= TextStyle::Body.leading();
        self
    }

    pub fn page_break(&mut self) -> &mut Self {
        self.pages.push(Vec::new());
        self.cursor = PAGE_HEIGHT - MARGIN;
        self
    }

    /// Serialize to PDF bytes. `creation_date` is `YYYYMMDDHHmmSS`.
    pub fn render(&self, creation_date: &str) -> Vec<u8> {
        let mut out = PdfWriter::default();
        out.raw(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");

        let page_count = self.pages.len();
        let page_obj = |i: usize| FIRST_PAGE_OBJ + 2 * i;

        out.object(CATALOG_OBJ, &format!("<< /Type /Catalog /Pages {PAGES_OBJ} 0 R >>"));

        let kids: Vec<String> = (0..page_count).map(|i| format!("{} 0 R", page_obj(i))).collect();
        out.object(
            PAGES_OBJ,
            &format!(
                "<< /Type /Pages /Kids [{}] /Count {page_count} >>",
                kids.join(" ")
            ),
        );

        for (obj, base) in [
            (FONT_REGULAR_OBJ, "Helvetica"),
            (FONT_BOLD_OBJ, "Helvetica-Bold"),
            (FONT_MONO_OBJ, "Courier"),
        ] {
            out.object(
                obj,
                &format!(
                    "<< /Type /Font /Subtype /Type1 /BaseFont /{base} /Encoding /WinAnsiEncoding >>"
                ),
            );
        }

        out.object(
            INFO_OBJ,
            &format!(
                "<< /Title ({}) /Producer (optreport) /CreationDate (D:{}) >>",
                escape_text(&self.title),
                escape_text(creation_date)
            ),
        );

        for (i, lines) in self.pages.iter().enumerate() {
            let content = page_content(lines, i + 1, page_count);
            out.object(
                page_obj(i),
                &format!(
                    "<< /Type /Page /Parent {PAGES_OBJ} 0 R \
                     /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
                     /Resources << /Font << /F1 {FONT_REGULAR_OBJ} 0 R \
                     /F2 {FONT_BOLD_OBJ} 0 R /F3 {FONT_MONO_OBJ} 0 R >> >> \
                     /Contents {} 0 R >>",
                    page_obj(i) + 1
                ),
            );
            out.stream(page_obj(i) + 1, content.as_bytes());
        }

        out.finish(CATALOG_OBJ, INFO_OBJ)
    }
}

fn page_content(lines: &[PlacedLine], page: usize, total: usize) -> String {
    let mut s = String::new();
    for line in lines {
        let _ = writeln!(
            s,
            "BT /{} {} Tf {MARGIN} {:.2} Td ({}) Tj ET",
            line.style.font(),
            line.style.size(),
            line.y,
            escape_text(&line.text)
        );
    }
    let _ = writeln!(
        s,
        "BT /F1 8 Tf {} {FOOTER_Y} Td (Pagina {page} de {total}) Tj ET",
        PAGE_WIDTH - MARGIN - 60.0
    );
    s
}

/// Escape a string for a PDF literal, encoding Latin-1 as octal escapes.
fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            '\u{a0}'..='\u{ff}' => {
                let _ = write!(out, "\\{:03o}", c as u32);
            }
            _ => out.push('?'),
        }
    }
    out
}

/// Tracks byte offsets while objects are appended.
#[derive(Default)]
struct PdfWriter {
    buf: Vec<u8>,
    offsets: Vec<(usize, usize)>,
}

impl PdfWriter {
    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn object(&mut self, num: usize, body: &str) {
        self.offsets.push((num, self.buf.len()));
        self.raw(format!("{num} 0 obj\n{body}\nendobj\n").as_bytes());
    }

    fn stream(&mut self, num: usize, data: &[u8]) {
        self.offsets.push((num, self.buf.len()));
        self.raw(format!("{num} 0 obj\n<< /Length {} >>\nstream\n", data.len()).as_bytes());
        self.raw(data);
        self.raw(b"\nendstream\nendobj\n");
    }

    fn finish(mut self, root: usize, info: usize) -> Vec<u8> {
        self.offsets.sort_unstable();
        let size = self.offsets.last().map_or(0, |(n, _)| *n) + 1;
        let xref_at = self.buf.len();

        let mut xref = format!("xref\n0 {size}\n0000000000 65535 f \n");
        let mut next = 1;
        for (num, offset) in &self.offsets {
            // Unused numbers are written as free entries.
            while next < *num {
                xref.push_str("0000000000 65535 f \n");
                next += 1;
            }
            let _ = write!(xref, "{offset:010} 00000 n \n");
            next = num + 1;
        }
        let _ = write!(
            xref,
            "trailer\n<< /Size {size} /Root {root} 0 R /Info {info} 0 R >>\n\
             startxref\n{xref_at}\n%%EOF\n"
        );
        self.raw(xref.as_bytes());
        self.buf
    }
}
