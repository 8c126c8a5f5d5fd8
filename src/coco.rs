//! COCO input data structures
//!
//! Only the subset of the COCO document consumed by the converter is modelled.
//! Segmentations are classified once while parsing into polygon rings or RLE
//! masks so later stages never inspect raw JSON.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConvertError;
use crate::utils::read_json_value;

/// Top-level keys that must be present as lists
pub const REQUIRED_KEYS: &[&str] = &["annotations", "images", "categories"];
/// Captions files carry no categories
pub const CAPTION_REQUIRED_KEYS: &[&str] = &["annotations", "images"];

/// COCO category information
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub supercategory: String,
}

/// COCO image information
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Image {
    pub id: i64,
    pub file_name: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

/// Run-length counts as found in COCO files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RleCounts {
    /// Uncompressed run lengths
    Runs(Vec<u32>),
    /// Compressed textual counts
    Compressed(String),
}

/// An RLE mask with its `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RleMask {
    pub height: usize,
    pub width: usize,
    pub counts: RleCounts,
}

/// Segmentation field of an annotation.
#[derive(Debug, Clone, PartialEq)]
pub enum Segmentation {
    /// One or more polygon rings, each a flat `[x, y, x, y, ...]` list
    Polygons(Vec<Vec<f64>>),
    Rle(RleMask),
    /// Present but not decodable, e.g. non-numeric coordinates
    Malformed,
}

impl Segmentation {
    /// Classify a raw JSON segmentation value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Array(items) => Some(Self::polygons_from_items(items)),
            Value::Object(map) => Some(Self::rle_from_map(map)),
            _ => Some(Segmentation::Malformed),
        }
    }

    fn polygons_from_items(items: &[Value]) -> Self {
        // A flat coordinate list is a single ring
        if !items.is_empty() && items.iter().all(Value::is_number) {
            return match numbers(items) {
                Some(ring) => Segmentation::Polygons(vec![ring]),
                None => Segmentation::Malformed,
            };
        }
        let mut rings = Vec::with_capacity(items.len());
        for item in items {
            match item.as_array().and_then(|ring| numbers(ring)) {
                Some(ring) => rings.push(ring),
                None => return Segmentation::Malformed,
            }
        }
        Segmentation::Polygons(rings)
    }

    fn rle_from_map(map: &serde_json::Map<String, Value>) -> Self {
        let size = map.get("size").and_then(Value::as_array).and_then(|size| {
            match (
                size.first().and_then(Value::as_u64),
                size.get(1).and_then(Value::as_u64),
            ) {
                (Some(h), Some(w)) if size.len() == 2 => {
                    Some((usize::try_from(h).ok()?, usize::try_from(w).ok()?))
                }
                _ => None,
            }
        });
        let counts = match map.get("counts") {
            Some(Value::String(s)) => Some(RleCounts::Compressed(s.clone())),
            Some(Value::Array(runs)) => runs
                .iter()
                .map(|run| run.as_u64().and_then(|v| u32::try_from(v).ok()))
                .collect::<Option<Vec<u32>>>()
                .map(RleCounts::Runs),
            _ => None,
        };
        match (size, counts) {
            (Some((height, width)), Some(counts)) => Segmentation::Rle(RleMask {
                height,
                width,
                counts,
            }),
            _ => Segmentation::Malformed,
        }
    }

    /// Empty polygon lists count as "no segmentation"
    pub fn is_empty(&self) -> bool {
        matches!(self, Segmentation::Polygons(rings) if rings.is_empty())
    }
}

fn numbers(items: &[Value]) -> Option<Vec<f64>> {
    items.iter().map(Value::as_f64).collect()
}

fn deserialize_segmentation<'de, D>(deserializer: D) -> Result<Option<Segmentation>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(Segmentation::from_value(&value))
}

fn deserialize_bbox<'de, D>(deserializer: D) -> Result<Option<[f64; 4]>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let bbox = value.as_array().and_then(|items| {
        if items.len() != 4 {
            return None;
        }
        let nums = numbers(items)?;
        Some([nums[0], nums[1], nums[2], nums[3]])
    });
    Ok(bbox)
}

/// COCO annotation record (instances or captions)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Annotation {
    pub image_id: i64,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_segmentation")]
    pub segmentation: Option<Segmentation>,
    /// `[x, y, w, h]`; anything other than four numbers is ignored
    #[serde(default, deserialize_with = "deserialize_bbox")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// The parts of a COCO annotation file the converter uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CocoDocument {
    pub images: Vec<Image>,
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl CocoDocument {
    /// Read an annotation file, failing before any conversion if required lists are missing.
    pub fn read(path: &Path) -> Result<Self, ConvertError> {
        let value = read_json_value(path)?;
        check_high_level_structure(&value, path)?;
        Self::from_checked_value(value, path)
    }

    /// Read a captions file; `categories` may be absent.
    pub fn read_captions(path: &Path) -> Result<Self, ConvertError> {
        let value = read_json_value(path)?;
        check_required_keys(&value, path, CAPTION_REQUIRED_KEYS)?;
        Self::from_checked_value(value, path)
    }

    fn from_checked_value(value: Value, path: &Path) -> Result<Self, ConvertError> {
        serde_json::from_value(value).map_err(|source| ConvertError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Append the records of another document (e.g. captions).
    /// Images and categories already present by id are kept.
    pub fn merge(&mut self, other: CocoDocument) {
        for image in other.images {
            if !self.images.iter().any(|i| i.id == image.id) {
                self.images.push(image);
            }
        }
        for category in other.categories {
            if !self.categories.iter().any(|c| c.id == category.id) {
                self.categories.push(category);
            }
        }
        self.annotations.extend(other.annotations);
    }

    /// Group annotation records by image id, preserving file order
    pub fn annotations_by_image(&self) -> HashMap<i64, Vec<&Annotation>> {
        let mut grouped: HashMap<i64, Vec<&Annotation>> = HashMap::new();
        for annotation in &self.annotations {
            grouped.entry(annotation.image_id).or_default().push(annotation);
        }
        grouped
    }

    /// Which annotation kinds occur anywhere in the document
    pub fn annotation_kinds(&self) -> AnnotationKinds {
        AnnotationKinds {
            segmentation: self.annotations.iter().any(|a| a.segmentation.is_some()),
            bbox: self.annotations.iter().any(|a| a.bbox.is_some()),
            caption: self.annotations.iter().any(|a| a.caption.is_some()),
        }
    }
}

/// Kinds of annotation data seen in a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationKinds {
    pub segmentation: bool,
    pub bbox: bool,
    pub caption: bool,
}

/// Check that `annotations`, `images` and `categories` are present lists.
pub fn check_high_level_structure(value: &Value, path: &Path) -> Result<(), ConvertError> {
    check_required_keys(value, path, REQUIRED_KEYS)
}

fn check_required_keys(value: &Value, path: &Path, keys: &[&str]) -> Result<(), ConvertError> {
    let object = value
        .as_object()
        .ok_or_else(|| ConvertError::structure(path, "top-level value must be an object"))?;
    for key in keys {
        match object.get(*key) {
            None => {
                return Err(ConvertError::structure(
                    path,
                    format!("[{}] field is missing", key),
                ))
            }
            Some(Value::Array(_)) => {}
            Some(_) => {
                return Err(ConvertError::structure(
                    path,
                    format!("[{}] field value must be a list of dicts", key),
                ))
            }
        }
    }
    Ok(())
}

/// Map category id to category name
pub fn category_names(categories: &[Category]) -> HashMap<i64, String> {
    categories
        .iter()
        .map(|category| (category.id, category.name.clone()))
        .collect()
}
