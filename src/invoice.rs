//! Monthly billing statement rendered as a plain text PDF.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, Stream, StringFormat};

use crate::billing::{status_label, BillingReport};

// A4 in points.
const PAGE_WIDTH: f64 = 595.0;
const PAGE_HEIGHT: f64 = 842.0;
const MARGIN: f64 = 50.0;
const LINE: f64 = 16.0;

const REGULAR: &[u8] = b"F1";
const BOLD: &[u8] = b"F2";

struct Column {
    title: &'static str,
    x: f64,
    max_chars: usize,
}

const DOCUMENT_COLUMNS: [Column; 5] = [
    Column { title: "Document Name", x: 50.0, max_chars: 30 },
    Column { title: "Size (KB)", x: 235.0, max_chars: 10 },
    Column { title: "Pages", x: 300.0, max_chars: 6 },
    Column { title: "Date Processed", x: 345.0, max_chars: 19 },
    Column { title: "Charges (Rs.)", x: 475.0, max_chars: 12 },
];

const API_COLUMNS: [Column; 4] = [
    Column { title: "API Endpoint", x: 50.0, max_chars: 24 },
    Column { title: "Date", x: 210.0, max_chars: 19 },
    Column { title: "Status", x: 360.0, max_chars: 8 },
    Column { title: "Charges (Rs.)", x: 475.0, max_chars: 12 },
];

/// Accumulates content-stream operations page by page.
struct PageWriter {
    finished: Vec<Vec<Operation>>,
    current: Vec<Operation>,
    y: f64,
}

impl PageWriter {
    fn new() -> Self {
        Self {
            finished: Vec::new(),
            current: Vec::new(),
            y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn ops(&mut self) -> &mut Vec<Operation> {
        &mut self.current
    }

    fn new_page(&mut self) {
        self.finished.push(std::mem::take(&mut self.current));
        self.y = PAGE_HEIGHT - MARGIN;
    }

    /// Every page written so far, the current one last.
    fn into_pages(mut self) -> Vec<Vec<Operation>> {
        self.finished.push(self.current);
        self.finished
    }

    /// Start a new page unless `height` more points fit above the bottom margin.
    fn ensure_space(&mut self, height: f64) -> bool {
        if self.y - height < MARGIN + LINE {
            self.new_page();
            return true;
        }
        false
    }

    fn text_at(&mut self, x: f64, font: &[u8], size: i64, text: &str) {
        let y = self.y;
        self.ops().extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(font.to_vec()), Object::Integer(size)]),
            Operation::new("Td", vec![real(x), real(y)]),
            Operation::new(
                "Tj",
                vec![Object::String(latin(text).into_bytes(), StringFormat::Literal)],
            ),
            Operation::new("ET", vec![]),
        ]);
    }

    fn line(&mut self, font: &[u8], size: i64, text: &str) {
        self.ensure_space(LINE);
        self.text_at(MARGIN, font, size, text);
        self.y -= LINE;
    }

    fn gap(&mut self) {
        self.y -= LINE / 2.0;
    }

    fn rule(&mut self) {
        let y = self.y + LINE / 2.0 - 2.0;
        self.ops().extend([
            Operation::new("w", vec![real(0.5)]),
            Operation::new("m", vec![real(MARGIN), real(y)]),
            Operation::new("l", vec![real(PAGE_WIDTH - MARGIN), real(y)]),
            Operation::new("S", vec![]),
        ]);
    }

    fn header_row(&mut self, columns: &[Column]) {
        for column in columns {
            self.text_at(column.x, BOLD, 10, column.title);
        }
        self.y -= LINE;
        self.rule();
    }

    /// Table rows; the header repeats on every page the table spans.
    fn table(&mut self, columns: &[Column], rows: &[Vec<String>]) {
        self.ensure_space(LINE * 2.0);
        self.header_row(columns);
        for row in rows {
            if self.ensure_space(LINE) {
                self.header_row(columns);
            }
            for (column, cell) in columns.iter().zip(row) {
                self.text_at(column.x, REGULAR, 9, &truncate(cell, column.max_chars));
            }
            self.y -= LINE;
        }
    }
}

fn real(v: f64) -> Object {
    Object::Real(v as f32)
}

/// Helvetica's standard encoding covers ASCII; other characters become '?'.
fn latin(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn money(amount: f64) -> String {
    format!("Rs. {:.2}", amount)
}

/// Render the statement for `email` dated `today`.
pub fn render(report: &BillingReport, email: &str, today: NaiveDate) -> Result<Vec<u8>> {
    let mut w = PageWriter::new();

    w.text_at(MARGIN, BOLD, 18, "Monthly Billing Statement");
    w.y -= LINE * 2.0;

    w.line(BOLD, 11, &format!("User: {}", email));
    w.line(REGULAR, 11, &format!("Billing Date: {}", today.format("%Y-%m-%d")));
    w.line(
        REGULAR,
        11,
        &format!(
            "Billing Period: {} - {}",
            report.billing_period_start.format("%Y-%m-%d"),
            report.billing_period_end.format("%Y-%m-%d")
        ),
    );
    w.line(
        REGULAR,
        11,
        &format!("Total Documents Processed: {}", report.total_documents_processed),
    );
    w.line(REGULAR, 11, &format!("Total API Calls: {}", report.total_api_calls));
    w.line(BOLD, 11, &format!("Total Charges: {}", money(report.total_charges)));
    w.gap();

    w.line(BOLD, 13, "Document Summary");
    let document_rows: Vec<Vec<String>> = report
        .documents
        .iter()
        .map(|d| {
            vec![
                d.document_name.clone(),
                format!("{:.2}", d.size as f64 / 1024.0),
                d.number_of_pages.to_string(),
                d.processing_timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                money(d.charges),
            ]
        })
        .collect();
    w.table(&DOCUMENT_COLUMNS, &document_rows);
    w.gap();

    w.line(BOLD, 13, "API Call Summary");
    let api_rows: Vec<Vec<String>> = report
        .api_calls
        .iter()
        .map(|c| {
            vec![
                c.api_endpoint.clone(),
                c.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                status_label(c.status).to_string(),
                money(c.charges),
            ]
        })
        .collect();
    w.table(&API_COLUMNS, &api_rows);
    w.gap();

    w.ensure_space(LINE * 4.0);
    w.line(BOLD, 13, "Billing Summary");
    w.line(
        REGULAR,
        11,
        &format!("Total Documents Processed: {}", report.total_documents_processed),
    );
    w.line(REGULAR, 11, &format!("Total API Calls: {}", report.total_api_calls));
    w.line(BOLD, 11, &format!("Total Charges: {}", money(report.total_charges)));

    assemble(w.into_pages())
}

fn font(base: &str) -> Dictionary {
    Dictionary::from_iter(vec![
        ("Type", Object::Name(b"Font".to_vec())),
        ("Subtype", Object::Name(b"Type1".to_vec())),
        ("BaseFont", Object::Name(base.as_bytes().to_vec())),
    ])
}

/// Build the document from per-page operations, adding page numbers.
fn assemble(pages: Vec<Vec<Operation>>) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let regular_id = doc.add_object(font("Helvetica"));
    let bold_id = doc.add_object(font("Helvetica-Bold"));
    let resources_id = doc.add_object(Dictionary::from_iter(vec![(
        "Font",
        Object::Dictionary(Dictionary::from_iter(vec![
            ("F1", Object::Reference(regular_id)),
            ("F2", Object::Reference(bold_id)),
        ])),
    )]));

    let total = pages.len();
    let mut kids = Vec::with_capacity(total);
    for (index, mut operations) in pages.into_iter().enumerate() {
        let footer = format!("Page {} of {}", index + 1, total);
        operations.extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(REGULAR.to_vec()), Object::Integer(8)]),
            Operation::new("Td", vec![real(PAGE_WIDTH - MARGIN - 50.0), real(MARGIN / 2.0)]),
            Operation::new("Tj", vec![Object::String(footer.into_bytes(), StringFormat::Literal)]),
            Operation::new("ET", vec![]),
        ]);

        let content = Content { operations }
            .encode()
            .context("Failed to encode invoice page")?;
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content));

        let page = Dictionary::from_iter(vec![
            ("Type", Object::Name(b"Page".to_vec())),
            ("Parent", Object::Reference(pages_id)),
            ("Contents", Object::Reference(content_id)),
        ]);
        kids.push(Object::Reference(doc.add_object(page)));
    }

    let pages_dict = Dictionary::from_iter(vec![
        ("Type", Object::Name(b"Pages".to_vec())),
        ("Count", Object::Integer(total as i64)),
        ("Kids", Object::Array(kids)),
        ("Resources", Object::Reference(resources_id)),
        (
            "MediaBox",
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(0),
                real(PAGE_WIDTH),
                real(PAGE_HEIGHT),
            ]),
        ),
    ]);
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let catalog_id = doc.add_object(Dictionary::from_iter(vec![
        ("Type", Object::Name(b"Catalog".to_vec())),
        ("Pages", Object::Reference(pages_id)),
    ]));
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .context("Failed to write invoice PDF")?;
    Ok(buffer)
}
