//! Geometry decoding for COCO segmentations
//!
//! Polygon segmentations become polygons with holes; a ring is a hole of
//! another ring when all of its vertices lie strictly inside the traced
//! contour of that ring. RLE segmentations become a bitmap or, when bitmaps are
//! not wanted, one polygon per traced outer contour.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::draw_line_segment_mut;

use crate::coco::Segmentation;
use crate::error::GeometryError;
use crate::rle;
use crate::types::{BitMask, DecodedShape};

const FOREGROUND: Luma<u8> = Luma([255u8]);

/// Where a point lies relative to a closed contour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Inside,
    OnBoundary,
    Outside,
}

/// Decode a segmentation into shapes.
///
/// `image_size` is `(height, width)` and bounds the scratch canvas used for
/// hole detection. RLE masks must have exactly the image size. With `rle_to_bitmap` set, RLE masks are kept as bitmaps.
pub fn decode_segmentation(
    segmentation: &Segmentation,
    image_size: (u32, u32),
    rle_to_bitmap: bool,
) -> Result<Vec<DecodedShape>, GeometryError> {
    match segmentation {
        Segmentation::Polygons(rings) => Ok(convert_polygon_vertices(rings, image_size)),
        Segmentation::Rle(mask) => {
            let expected = (image_size.0 as usize, image_size.1 as usize);
            if (mask.height, mask.width) != expected {
                return Err(GeometryError::RleSizeMismatch {
                    expected,
                    actual: (mask.height, mask.width),
                });
            }
            let mask = rle::decode(mask)?;
            Ok(convert_mask(mask, rle_to_bitmap))
        }
        Segmentation::Malformed => Ok(Vec::new()),
    }
}

/// Convert flat coordinate rings into polygons, moving enclosed rings into holes.
pub fn convert_polygon_vertices(rings: &[Vec<f64>], image_size: (u32, u32)) -> Vec<DecodedShape> {
    let exteriors: Vec<Vec<(f64, f64)>> = rings
        .iter()
        .map(|ring| ring.chunks_exact(2).map(|xy| (xy[0], xy[1])).collect::<Vec<_>>())
        .filter(|ring: &Vec<(f64, f64)>| !ring.is_empty())
        .collect();

    let mut holes: Vec<Vec<usize>> = vec![Vec::new(); exteriors.len()];
    let mut is_hole = vec![false; exteriors.len()];

    for (idx, exterior) in exteriors.iter().enumerate() {
        if is_hole[idx] {
            continue;
        }
        let Some(contour) = trace_ring_contour(exterior, image_size) else {
            continue;
        };
        for (idy, candidate) in exteriors.iter().enumerate() {
            if idx == idy || is_hole[idy] {
                continue;
            }
            let all_inside = candidate
                .iter()
                .all(|&point| point_in_contour(&contour, point) == Containment::Inside);
            if all_inside {
                holes[idx].push(idy);
                is_hole[idy] = true;
            }
        }
    }

    exteriors
        .iter()
        .enumerate()
        .filter(|(idx, _)| !is_hole[*idx])
        .map(|(idx, exterior)| DecodedShape::Polygon {
            exterior: exterior.clone(),
            holes: holes[idx].iter().map(|&h| exteriors[h].clone()).collect(),
        })
        .collect()
}

/// Rasterize a ring outline on an image-sized canvas and trace its first contour.
fn trace_ring_contour(ring: &[(f64, f64)], image_size: (u32, u32)) -> Option<Vec<(f64, f64)>> {
    let (height, width) = image_size;
    if height == 0 || width == 0 {
        return None;
    }
    let mut canvas = GrayImage::new(width, height);
    for (i, &start) in ring.iter().enumerate() {
        let end = ring[(i + 1) % ring.len()];
        draw_line_segment_mut(
            &mut canvas,
            (start.0 as f32, start.1 as f32),
            (end.0 as f32, end.1 as f32),
            FOREGROUND,
        );
    }
    find_contours::<i32>(&canvas)
        .into_iter()
        .next()
        .map(|contour| {
            contour
                .points
                .iter()
                .map(|p| (p.x as f64, p.y as f64))
                .collect()
        })
}

/// Strict point-in-contour test. Points on an edge are reported as `OnBoundary`.
pub fn point_in_contour(contour: &[(f64, f64)], point: (f64, f64)) -> Containment {
    if contour.is_empty() {
        return Containment::Outside;
    }
    let (px, py) = point;
    let mut inside = false;
    let n = contour.len();
    for i in 0..n {
        let (x1, y1) = contour[i];
        let (x2, y2) = contour[(i + 1) % n];
        if on_segment((x1, y1), (x2, y2), point) {
            return Containment::OnBoundary;
        }
        if (y1 > py) != (y2 > py) {
            let x_cross = x1 + (py - y1) * (x2 - x1) / (y2 - y1);
            if px < x_cross {
                inside = !inside;
            }
        }
    }
    if inside {
        Containment::Inside
    } else {
        Containment::Outside
    }
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > f64::EPSILON {
        return false;
    }
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

/// Turn a decoded mask into shapes. Empty masks yield nothing.
pub fn convert_mask(mask: BitMask, keep_bitmap: bool) -> Vec<DecodedShape> {
    if mask.is_empty() {
        return Vec::new();
    }
    if keep_bitmap {
        return vec![DecodedShape::Bitmap(mask)];
    }
    mask_to_polygons(&mask)
}

/// Trace the boundary of a mask into polygons; hole borders attach to their parent.
pub fn mask_to_polygons(mask: &BitMask) -> Vec<DecodedShape> {
    let mut canvas = GrayImage::new(mask.width as u32, mask.height as u32);
    for row in 0..mask.height {
        for col in 0..mask.width {
            if mask.get(row, col) {
                canvas.put_pixel(col as u32, row as u32, FOREGROUND);
            }
        }
    }

    let contours = find_contours::<i32>(&canvas);
    let to_points = |points: &[imageproc::point::Point<i32>]| -> Vec<(f64, f64)> {
        points.iter().map(|p| (p.x as f64, p.y as f64)).collect()
    };

    // Contour index -> polygon index for outer borders
    let mut polygon_of = vec![None; contours.len()];
    let mut polygons: Vec<(Vec<(f64, f64)>, Vec<Vec<(f64, f64)>>)> = Vec::new();
    for (i, contour) in contours.iter().enumerate() {
        if contour.border_type == BorderType::Outer && !contour.points.is_empty() {
            polygon_of[i] = Some(polygons.len());
            polygons.push((to_points(&contour.points), Vec::new()));
        }
    }
    for contour in &contours {
        if contour.border_type != BorderType::Hole || contour.points.is_empty() {
            continue;
        }
        if let Some(owner) = contour.parent.and_then(|parent| polygon_of[parent]) {
            polygons[owner].1.push(to_points(&contour.points));
        }
    }

    polygons
        .into_iter()
        .map(|(exterior, holes)| DecodedShape::Polygon { exterior, holes })
        .collect()
}
