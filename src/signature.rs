//! Signature locator: find signature fields and convert their polygons to PDF points.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::analysis::{AnalyzeResult, DocumentAnalyzer};
use crate::routing::ModelRoute;

/// Service polygons are in inches; PDF user space is 72 points per inch.
pub const POINTS_PER_UNIT: f64 = 72.0;

/// A polygon vertex in PDF points, origin top-left (not yet flipped).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Analyse with the form's template model and collect signature vertices.
pub async fn locate_signature(
    analyzer: &dyn DocumentAnalyzer,
    route: &ModelRoute,
    filename: &str,
    data: &[u8],
) -> Result<Vec<Point>> {
    let result = analyzer.analyze(route, filename, data).await?;
    let points = signature_points(&result);
    info!(
        "Signature locator: {} point(s) from model {}",
        points.len(),
        route.model_id
    );
    Ok(points)
}

/// Vertices of every field whose name contains "signature" (any case), first
/// bounding region only, scaled by 72, in field order then polygon order.
pub fn signature_points(result: &AnalyzeResult) -> Vec<Point> {
    let mut points = Vec::new();

    for document in &result.documents {
        for (name, field) in &document.fields {
            if !name.to_lowercase().contains("signature") {
                continue;
            }

            let Some(region) = field.bounding_regions.first() else {
                warn!("Signature field {} has no bounding region; skipping", name);
                continue;
            };

            debug!(
                "Signature field {} on page {}: {} vertices",
                name,
                region.page_number,
                region.polygon.len() / 2
            );
            points.extend(
                region
                    .points()
                    .into_iter()
                    .map(|(x, y)| Point::new(x * POINTS_PER_UNIT, y * POINTS_PER_UNIT)),
            );
        }
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalyzedDocument, BoundingRegion, DocumentField};

    fn region_field(polygon: Vec<f64>) -> DocumentField {
        DocumentField {
            bounding_regions: vec![BoundingRegion {
                page_number: 1,
                polygon,
            }],
            ..Default::default()
        }
    }

    fn doc(fields: Vec<(&str, DocumentField)>) -> AnalyzedDocument {
        AnalyzedDocument {
            fields: fields.into_iter().map(|(n, f)| (n.to_string(), f)).collect(),
        }
    }

    #[test]
    fn test_points_scaled_by_72() {
        let polygon = vec![1.25, 9.5, 3.0, 9.5, 3.0, 10.125, 1.25, 10.125];
        let result = AnalyzeResult {
            documents: vec![doc(vec![("Customer_Signature", region_field(polygon.clone()))])],
        };

        let points = signature_points(&result);
        assert_eq!(points.len(), 4);
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.x, polygon[2 * i] * 72.0);
            assert_eq!(p.y, polygon[2 * i + 1] * 72.0);
        }
        assert_eq!(points[0], Point::new(90.0, 684.0));
    }

    #[test]
    fn test_matching_is_case_insensitive_and_concatenates() {
        let result = AnalyzeResult {
            documents: vec![doc(vec![
                ("SIGNATURE_1", region_field(vec![0.0, 0.0, 1.0, 0.0])),
                ("Name", region_field(vec![5.0, 5.0, 6.0, 6.0])),
                ("spouse_signature", region_field(vec![2.0, 2.0])),
            ])],
        };

        let points = signature_points(&result);
        assert_eq!(
            points,
            vec![
                Point::new(0.0, 0.0),
                Point::new(72.0, 0.0),
                Point::new(144.0, 144.0),
            ]
        );
    }

    #[test]
    fn test_no_signature_field_gives_empty() {
        let result = AnalyzeResult {
            documents: vec![doc(vec![("Name", region_field(vec![1.0, 1.0]))])],
        };
        assert!(signature_points(&result).is_empty());
    }

    #[test]
    fn test_field_without_region_is_skipped() {
        let result = AnalyzeResult {
            documents: vec![doc(vec![
                ("Signature", DocumentField::default()),
                ("Signature_Date", region_field(vec![1.0, 2.0])),
            ])],
        };
        assert_eq!(signature_points(&result), vec![Point::new(72.0, 144.0)]);
    }

    #[test]
    fn test_only_first_region_used() {
        let mut field = region_field(vec![1.0, 1.0]);
        field.bounding_regions.push(BoundingRegion {
            page_number: 2,
            polygon: vec![9.0, 9.0],
        });
        let result = AnalyzeResult {
            documents: vec![doc(vec![("Signature", field)])],
        };
        assert_eq!(signature_points(&result), vec![Point::new(72.0, 72.0)]);
    }
}
