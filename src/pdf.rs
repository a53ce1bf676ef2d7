//! PDF page inspection and the signature crop transform.

use lopdf::{Document, Object, ObjectId};
use std::collections::HashSet;
use std::io::Write;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::signature::Point;

#[derive(Debug, Error)]
pub enum CropError {
    /// The detected region did not yield four corners.
    #[error("Signature region needs 4 corner points, got {got} (index out of range)")]
    InsufficientCoordinates { got: usize },

    #[error("Failed to load PDF: {0}")]
    Load(#[source] lopdf::Error),

    #[error("PDF has no pages")]
    NoPages,

    #[error("Invalid page box: {0}")]
    PageBox(String),

    #[error("Failed to write cropped PDF: {0}")]
    Save(#[source] std::io::Error),

    #[error("Failed to create temporary file: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether the upload looks like a PDF (by magic bytes).
pub fn is_pdf(data: &[u8]) -> bool {
    data.starts_with(b"%PDF")
}

/// Number of pages; non-PDF uploads (scanned images) count as one page.
pub fn page_count(data: &[u8]) -> anyhow::Result<u32> {
    if !is_pdf(data) {
        return Ok(1);
    }
    let doc = Document::load_mem(data).map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;
    Ok(doc.get_pages().len() as u32)
}

/// A PDF rectangle `[llx lly urx ury]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageBox {
    pub llx: f64,
    pub lly: f64,
    pub urx: f64,
    pub ury: f64,
}

impl PageBox {
    pub fn from_array(array: &[Object]) -> Result<Self, CropError> {
        if array.len() != 4 {
            return Err(CropError::PageBox(format!(
                "expected 4-element array for box, got {}",
                array.len()
            )));
        }
        Ok(Self {
            llx: object_to_f64(&array[0])?,
            lly: object_to_f64(&array[1])?,
            urx: object_to_f64(&array[2])?,
            ury: object_to_f64(&array[3])?,
        })
    }

    pub fn to_array(self) -> Object {
        Object::Array(vec![
            Object::Real(self.llx as f32),
            Object::Real(self.lly as f32),
            Object::Real(self.urx as f32),
            Object::Real(self.ury as f32),
        ])
    }

    /// Top edge: the page height in a box anchored at the origin.
    pub fn height(&self) -> f64 {
        self.ury
    }

    pub fn set_upper_left(&mut self, (x, y): (f64, f64)) {
        self.llx = x;
        self.ury = y;
    }

    pub fn set_upper_right(&mut self, (x, y): (f64, f64)) {
        self.urx = x;
        self.ury = y;
    }

    pub fn set_lower_right(&mut self, (x, y): (f64, f64)) {
        self.urx = x;
        self.lly = y;
    }

    pub fn set_lower_left(&mut self, (x, y): (f64, f64)) {
        self.llx = x;
        self.lly = y;
    }

    #[cfg(test)]
    pub fn upper_left(&self) -> (f64, f64) {
        (self.llx, self.ury)
    }

    #[cfg(test)]
    pub fn upper_right(&self) -> (f64, f64) {
        (self.urx, self.ury)
    }

    #[cfg(test)]
    pub fn lower_right(&self) -> (f64, f64) {
        (self.urx, self.lly)
    }

    #[cfg(test)]
    pub fn lower_left(&self) -> (f64, f64) {
        (self.llx, self.lly)
    }
}

/// Top-down detection space to bottom-up PDF space. Its own inverse.
pub fn flip_y(point: Point, page_height: f64) -> (f64, f64) {
    (point.x, page_height - point.y)
}

/// Box whose corners are `coordinates[0..4]` (upper-left, upper-right,
/// lower-right, lower-left), flipped against `page_height`.
pub fn signature_box(
    current: PageBox,
    coordinates: &[Point],
    page_height: f64,
) -> Result<PageBox, CropError> {
    if coordinates.len() < 4 {
        return Err(CropError::InsufficientCoordinates {
            got: coordinates.len(),
        });
    }

    let mut media_box = current;
    media_box.set_upper_left(flip_y(coordinates[0], page_height));
    media_box.set_upper_right(flip_y(coordinates[1], page_height));
    media_box.set_lower_right(flip_y(coordinates[2], page_height));
    media_box.set_lower_left(flip_y(coordinates[3], page_height));
    Ok(media_box)
}

/// Crop the first page of `source` to the signature region and write it, as
/// a single-page PDF, to a temp file removed when the handle is dropped.
pub fn crop_to_signature(source: &[u8], coordinates: &[Point]) -> Result<NamedTempFile, CropError> {
    let result = crop_first_page(source, coordinates);
    if let Err(e) = &result {
        error!("Signature crop failed: {}", e);
    }
    result
}

fn crop_first_page(source: &[u8], coordinates: &[Point]) -> Result<NamedTempFile, CropError> {
    let mut doc = Document::load_mem(source).map_err(CropError::Load)?;

    let pages = doc.get_pages();
    let page_count = pages.len() as u32;
    let page_id = *pages.get(&1).ok_or(CropError::NoPages)?;

    let media_box = page_box(&doc, page_id, b"MediaBox")?
        .ok_or_else(|| CropError::PageBox("MediaBox not found on page or ancestors".into()))?;
    let crop_box = page_box(&doc, page_id, b"CropBox")?.unwrap_or(media_box);
    let page_height = crop_box.height();

    let cropped = signature_box(media_box, coordinates, page_height)?;
    debug!(
        "Cropping page 1 (height {}) from {:?} to {:?}",
        page_height, media_box, cropped
    );

    doc.get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| CropError::PageBox(format!("page dictionary: {}", e)))?
        .set("MediaBox", cropped.to_array());

    if page_count > 1 {
        // highest first so remaining page numbers stay valid
        for page_num in (2..=page_count).rev() {
            doc.delete_pages(&[page_num]);
        }
        doc.prune_objects();
    }

    let mut file = tempfile::Builder::new()
        .prefix("signature-")
        .suffix(".pdf")
        .tempfile()?;
    doc.save_to(file.as_file_mut()).map_err(CropError::Save)?;
    file.as_file_mut().flush()?;

    info!(
        "Cropped signature page written to {:?} ({} page(s) dropped)",
        file.path(),
        page_count.saturating_sub(1)
    );
    Ok(file)
}

/// Look up a page box, walking up the page tree via /Parent when the page
/// itself does not carry it.
fn page_box(doc: &Document, page_id: ObjectId, key: &[u8]) -> Result<Option<PageBox>, CropError> {
    let mut visited = HashSet::new();
    let mut current = page_id;
    loop {
        if !visited.insert(current) {
            return Err(CropError::PageBox(format!(
                "cyclic page tree at object {} {}",
                current.0, current.1
            )));
        }

        let dict = doc
            .get_object(current)
            .and_then(Object::as_dict)
            .map_err(|e| CropError::PageBox(format!("page tree node: {}", e)))?;

        if let Ok(obj) = dict.get(key) {
            let obj = resolve(doc, obj)?;
            let array = obj
                .as_array()
                .map_err(|e| CropError::PageBox(format!("box is not an array: {}", e)))?;
            return PageBox::from_array(array).map(Some);
        }

        match dict.get(b"Parent").and_then(Object::as_reference) {
            Ok(parent) => current = parent,
            Err(_) => return Ok(None),
        }
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object, CropError> {
    match obj {
        Object::Reference(id) => doc
            .get_object(*id)
            .map_err(|e| CropError::PageBox(format!("dangling reference: {}", e))),
        other => Ok(other),
    }
}

fn object_to_f64(obj: &Object) -> Result<f64, CropError> {
    match obj {
        Object::Integer(i) => Ok(*i as f64),
        Object::Real(f) => Ok(*f as f64),
        _ => Err(CropError::PageBox(format!("expected number, got {:?}", obj))),
    }
}
