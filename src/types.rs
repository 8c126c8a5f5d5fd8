use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

// Supported image formats
pub const IMG_FORMATS: &[&str] = &[
    "bmp", "jpeg", "jpg", "jpe", "mpo", "png", "tif", "tiff", "webp",
];

// Precomputed HashSet of image extensions for fast lookup
pub static IMAGE_EXTENSIONS_SET: OnceLock<HashSet<String>> = OnceLock::new();

/// Get the image extensions set
pub fn get_image_extensions_set() -> &'static HashSet<String> {
    IMAGE_EXTENSIONS_SET.get_or_init(|| IMG_FORMATS.iter().map(|ext| ext.to_lowercase()).collect())
}

/// Whether the path carries one of the supported image extensions
pub fn has_valid_image_ext(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            get_image_extensions_set().contains(&ext.to_string_lossy().to_lowercase())
        })
        .unwrap_or(false)
}

/// Geometry type bound to an object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    #[serde(rename = "polygon")]
    Polygon,
    #[serde(rename = "rectangle")]
    Rectangle,
    #[serde(rename = "bitmap")]
    Bitmap,
    #[serde(rename = "any_shape")]
    Any,
}

impl ShapeKind {
    /// `Any` accepts every geometry; otherwise kinds must match exactly.
    pub fn accepts(self, other: ShapeKind) -> bool {
        self == ShapeKind::Any || other == ShapeKind::Any || self == other
    }

    pub fn name(self) -> &'static str {
        match self {
            ShapeKind::Polygon => "polygon",
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Bitmap => "bitmap",
            ShapeKind::Any => "any_shape",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An RGB color, serialized as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        Some(Rgb([channel(0)?, channel(2)?, channel(4)?]))
    }

    /// Squared euclidean distance in RGB space
    pub fn distance_sq(self, other: Rgb) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(&a, &b)| {
                let d = a as i32 - b as i32;
                (d * d) as u32
            })
            .sum()
    }
}

impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Rgb::from_hex(&s).ok_or_else(|| de::Error::custom(format!("invalid color '{}'", s)))
    }
}

/// A class of the target label schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectClass {
    #[serde(rename = "title")]
    pub name: String,
    #[serde(rename = "shape")]
    pub shape_kind: ShapeKind,
    pub color: Rgb,
}

impl ObjectClass {
    pub fn new(name: impl Into<String>, shape_kind: ShapeKind, color: Rgb) -> Self {
        Self {
            name: name.into(),
            shape_kind,
            color,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagValueType {
    #[serde(rename = "any_string")]
    AnyString,
    #[serde(rename = "any_number")]
    AnyNumber,
}

/// An image-level tag definition of the target schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub name: String,
    pub value_type: TagValueType,
}

/// Axis-aligned rectangle in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectangle {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}

impl Rectangle {
    /// Build from a COCO `[x, y, w, h]` box
    pub fn from_xywh(bbox: [f64; 4]) -> Self {
        let [x, y, w, h] = bbox;
        Self {
            top: y,
            left: x,
            bottom: y + h,
            right: x + w,
        }
    }
}

/// Row-major boolean pixel grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMask {
    pub height: usize,
    pub width: usize,
    pub data: Vec<bool>,
}

impl BitMask {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: vec![false; height * width],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.data[row * self.width + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: bool) {
        self.data[row * self.width + col] = value;
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&v| v)
    }

    /// Inclusive pixel extent of the foreground as (top, left, bottom, right)
    pub fn extent(&self) -> Option<(usize, usize, usize, usize)> {
        let mut extent: Option<(usize, usize, usize, usize)> = None;
        for row in 0..self.height {
            for col in 0..self.width {
                if !self.get(row, col) {
                    continue;
                }
                extent = Some(match extent {
                    None => (row, col, row, col),
                    Some((t, l, b, r)) => (t.min(row), l.min(col), b.max(row), r.max(col)),
                });
            }
        }
        extent
    }
}

/// A shape decoded from one COCO segmentation.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedShape {
    Polygon {
        exterior: Vec<(f64, f64)>,
        holes: Vec<Vec<(f64, f64)>>,
    },
    Bitmap(BitMask),
}

/// Geometry carried by a target label.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Shape(DecodedShape),
    Rectangle(Rectangle),
}

impl Geometry {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Geometry::Shape(DecodedShape::Polygon { .. }) => ShapeKind::Polygon,
            Geometry::Shape(DecodedShape::Bitmap(_)) => ShapeKind::Bitmap,
            Geometry::Rectangle(_) => ShapeKind::Rectangle,
        }
    }

    /// Bounding rectangle of the geometry. Bitmaps use inclusive pixel indices.
    pub fn bounding_rect(&self) -> Option<Rectangle> {
        match self {
            Geometry::Rectangle(rect) => Some(*rect),
            Geometry::Shape(DecodedShape::Polygon { exterior, .. }) => {
                if exterior.is_empty() {
                    return None;
                }
                let (min_x, min_y, max_x, max_y) = exterior.iter().fold(
                    (f64::MAX, f64::MAX, f64::MIN, f64::MIN),
                    |(x_min, y_min, x_max, y_max), &(x, y)| {
                        (x_min.min(x), y_min.min(y), x_max.max(x), y_max.max(y))
                    },
                );
                Some(Rectangle {
                    top: min_y,
                    left: min_x,
                    bottom: max_y,
                    right: max_x,
                })
            }
            Geometry::Shape(DecodedShape::Bitmap(mask)) => {
                mask.extent().map(|(t, l, b, r)| Rectangle {
                    top: t as f64,
                    left: l as f64,
                    bottom: b as f64,
                    right: r as f64,
                })
            }
        }
    }
}

/// One object of a target annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub geometry: Geometry,
    pub object_class: ObjectClass,
    pub group_key: Option<String>,
}

impl Label {
    pub fn new(geometry: Geometry, object_class: &ObjectClass, group_key: Option<&str>) -> Self {
        Self {
            geometry,
            object_class: object_class.clone(),
            group_key: group_key.map(str::to_string),
        }
    }
}

/// Image-level tag value.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTag {
    pub definition: TagDefinition,
    pub value: String,
}

/// Annotation of a single image in the target format.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAnnotation {
    /// (height, width)
    pub image_size: (u32, u32),
    pub labels: Vec<Label>,
    pub image_tags: Vec<ImageTag>,
}

impl TargetAnnotation {
    pub fn empty(image_size: (u32, u32)) -> Self {
        Self {
            image_size,
            labels: Vec::new(),
            image_tags: Vec::new(),
        }
    }
}

// Struct to hold per-dataset processing statistics
#[derive(Debug, Default, Clone)]
pub struct ProcessingStats {
    pub total_images: usize,
    pub converted_images: usize,
    pub skipped_missing_image: usize,
    pub skipped_unreadable_image: usize,
    pub failed_images: usize,
    pub skipped_records: usize,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_total(&mut self) {
        self.total_images += 1;
    }

    pub fn increment_converted(&mut self) {
        self.converted_images += 1;
    }

    pub fn increment_skipped_missing_image(&mut self) {
        self.skipped_missing_image += 1;
    }

    pub fn increment_skipped_unreadable_image(&mut self) {
        self.skipped_unreadable_image += 1;
    }

    pub fn increment_failed(&mut self) {
        self.failed_images += 1;
    }

    pub fn add_skipped_records(&mut self, count: usize) {
        self.skipped_records += count;
    }

    pub fn print_summary(&self, dataset: &str) {
        log::info!("=== Dataset '{}' summary ===", dataset);
        log::info!("Total images: {}", self.total_images);
        log::info!("Converted images: {}", self.converted_images);
        log::info!(
            "Skipped (missing image file): {}",
            self.skipped_missing_image
        );
        log::info!(
            "Skipped (unreadable image file): {}",
            self.skipped_unreadable_image
        );

        let total_skipped = self.skipped_missing_image + self.skipped_unreadable_image;
        if total_skipped > 0 {
            log::warn!(
                "Total skipped images: {} (missing: {}, unreadable: {})",
                total_skipped,
                self.skipped_missing_image,
                self.skipped_unreadable_image
            );
        }
        if self.failed_images > 0 {
            log::error!("Failed to export images: {}", self.failed_images);
        }
        if self.skipped_records > 0 {
            log::warn!("Skipped annotation records: {}", self.skipped_records);
        }
    }
}
