//! Label schema shared by every dataset of a conversion job
//!
//! The schema is append-only: classes and tags are added, never replaced.
//! Each mutating call persists the whole schema to `meta.json` when the
//! schema is bound to a file.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::coco::{AnnotationKinds, Category};
use crate::error::ConvertError;
use crate::types::{ObjectClass, Rgb, ShapeKind, TagDefinition, TagValueType};
use crate::utils::{read_json_value, write_json_pretty};

pub const META_FILE_NAME: &str = "meta.json";
pub const CAPTION_TAG: &str = "caption";
pub const BBOX_TAIL: &str = "bbox";
pub const RLE_TAIL: &str = "rle";

/// Official COCO splits whose schema never changes between runs
pub const KNOWN_COCO_SPLITS: &[&str] = &["train2014", "val2014", "train2017", "val2017"];

const COLOR_CANDIDATES: usize = 10;

/// Append a shape-kind tail to a class name: `"a b" -> "a b bbox"`, `"ab" -> "ab_bbox"`.
pub fn add_tail(body: &str, tail: &str) -> String {
    if body.contains(' ') {
        format!("{} {}", body, tail)
    } else {
        format!("{}_{}", body, tail)
    }
}

/// Like [`add_tail`], but names already ending with the tail are kept.
pub fn with_tail(body: &str, tail: &str) -> String {
    if body.ends_with(tail) {
        body.to_string()
    } else {
        add_tail(body, tail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    classes: Vec<ObjectClass>,
    #[serde(default)]
    tags: Vec<TagDefinition>,
}

/// Object classes and tag definitions of the target project.
#[derive(Debug, Clone)]
pub struct Schema {
    doc: SchemaDocument,
    path: Option<PathBuf>,
    seed: u64,
    loaded_from_disk: bool,
    warned_classes: HashSet<String>,
}

impl Schema {
    /// An in-memory schema that is never persisted
    pub fn new(seed: u64) -> Self {
        Self {
            doc: SchemaDocument::default(),
            path: None,
            seed,
            loaded_from_disk: false,
            warned_classes: HashSet::new(),
        }
    }

    /// Bind the schema to `<output_dir>/meta.json`, loading it if present.
    pub fn open(output_dir: &Path, seed: u64) -> Result<Self, ConvertError> {
        let path = output_dir.join(META_FILE_NAME);
        let mut schema = Self::new(seed);
        if path.is_file() {
            let value = read_json_value(&path)?;
            schema.doc = serde_json::from_value(value).map_err(|source| ConvertError::Json {
                path: path.clone(),
                source,
            })?;
            schema.loaded_from_disk = true;
            info!(
                "Loaded schema with {} classes from {}",
                schema.doc.classes.len(),
                path.display()
            );
        }
        schema.path = Some(path);
        Ok(schema)
    }

    pub fn classes(&self) -> &[ObjectClass] {
        &self.doc.classes
    }

    pub fn tags(&self) -> &[TagDefinition] {
        &self.doc.tags
    }

    pub fn get_class(&self, name: &str) -> Option<&ObjectClass> {
        self.doc.classes.iter().find(|class| class.name == name)
    }

    pub fn get_tag(&self, name: &str) -> Option<&TagDefinition> {
        self.doc.tags.iter().find(|tag| tag.name == name)
    }

    /// Prepare the schema for one dataset.
    ///
    /// A schema loaded from disk is reused as-is for the official COCO splits;
    /// everything else goes through [`Schema::ensure_classes_for`].
    pub fn prepare_for_dataset(
        &mut self,
        dataset_name: &str,
        categories: &[Category],
        kinds: AnnotationKinds,
    ) -> Result<bool, ConvertError> {
        if self.loaded_from_disk && KNOWN_COCO_SPLITS.contains(&dataset_name) {
            info!(
                "Reusing existing schema for known dataset '{}'",
                dataset_name
            );
            return Ok(false);
        }
        let mut changed = self.ensure_classes_for(categories, kinds)?;
        if kinds.caption {
            changed |= self.ensure_caption_tag()?;
        }
        Ok(changed)
    }

    /// Create missing classes for the categories. Returns whether anything was added.
    pub fn ensure_classes_for(
        &mut self,
        categories: &[Category],
        kinds: AnnotationKinds,
    ) -> Result<bool, ConvertError> {
        let mut added = 0;
        for category in categories {
            let mut wanted = Vec::new();
            if kinds.segmentation {
                wanted.push((category.name.clone(), ShapeKind::Polygon));
            }
            if kinds.bbox {
                wanted.push((with_tail(&category.name, BBOX_TAIL), ShapeKind::Rectangle));
            }
            let missing: Vec<_> = wanted
                .into_iter()
                .filter(|(name, _)| self.get_class(name).is_none())
                .collect();
            if missing.is_empty() {
                continue;
            }

            let color = match self.category_color(&category.name) {
                Some(color) => color,
                None => self.next_color(),
            };
            for (name, kind) in missing {
                self.doc.classes.push(ObjectClass::new(name, kind, color));
                added += 1;
            }
        }

        if added > 0 {
            info!("Added {} object classes to the schema", added);
            self.persist()?;
        }
        Ok(added > 0)
    }

    /// Add the `caption` string tag once.
    pub fn ensure_caption_tag(&mut self) -> Result<bool, ConvertError> {
        if self.get_tag(CAPTION_TAG).is_some() {
            return Ok(false);
        }
        self.doc.tags.push(TagDefinition {
            name: CAPTION_TAG.to_string(),
            value_type: TagValueType::AnyString,
        });
        self.persist()?;
        Ok(true)
    }

    /// Fetch or lazily create the bitmap class paired with a polygon class.
    ///
    /// Returns `None` (after a one-time warning) when the name is taken by a
    /// class of another shape kind.
    pub fn ensure_bitmap_class(
        &mut self,
        polygon_class: &ObjectClass,
    ) -> Result<Option<ObjectClass>, ConvertError> {
        let name = with_tail(&polygon_class.name, RLE_TAIL);
        if let Some(existing) = self.get_class(&name).cloned() {
            if !existing.shape_kind.accepts(ShapeKind::Bitmap) {
                self.warn_conflict(&existing, ShapeKind::Bitmap);
                return Ok(None);
            }
            return Ok(Some(existing));
        }
        let class = ObjectClass::new(name, ShapeKind::Bitmap, polygon_class.color);
        self.doc.classes.push(class.clone());
        self.persist()?;
        Ok(Some(class))
    }

    /// Look up a class expected to carry `expected` geometry.
    ///
    /// Missing classes and kind conflicts are warned about once per name.
    pub fn class_for(&mut self, name: &str, expected: ShapeKind) -> Option<ObjectClass> {
        match self.get_class(name).cloned() {
            Some(class) if class.shape_kind.accepts(expected) => Some(class),
            Some(class) => {
                self.warn_conflict(&class, expected);
                None
            }
            None => {
                if self.warned_classes.insert(name.to_string()) {
                    warn!(
                        "Object class '{}' of type '{}' not found in the schema",
                        name, expected
                    );
                }
                None
            }
        }
    }

    fn warn_conflict(&mut self, class: &ObjectClass, expected: ShapeKind) {
        if self.warned_classes.insert(class.name.clone()) {
            warn!(
                "Object class '{}' has type '{}', but expected type is '{}'.",
                class.name, class.shape_kind, expected
            );
        }
    }

    /// Write the schema to its file, if bound to one.
    pub fn persist(&self) -> Result<(), ConvertError> {
        match &self.path {
            Some(path) => write_json_pretty(path, &self.doc),
            None => Ok(()),
        }
    }

    fn category_color(&self, category_name: &str) -> Option<Rgb> {
        let bbox_name = with_tail(category_name, BBOX_TAIL);
        self.doc
            .classes
            .iter()
            .find(|class| class.name == category_name || class.name == bbox_name)
            .map(|class| class.color)
    }

    fn next_color(&self) -> Rgb {
        let existing: Vec<Rgb> = self.doc.classes.iter().map(|class| class.color).collect();
        generate_color(&existing, self.seed.wrapping_add(existing.len() as u64))
    }
}

/// Pick the candidate color farthest from all existing colors.
pub fn generate_color(existing: &[Rgb], seed: u64) -> Rgb {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut best = random_color(&mut rng);
    let mut best_distance = min_distance(existing, best);
    for _ in 1..COLOR_CANDIDATES {
        let candidate = random_color(&mut rng);
        let distance = min_distance(existing, candidate);
        if distance > best_distance {
            best = candidate;
            best_distance = distance;
        }
    }
    best
}

fn min_distance(existing: &[Rgb], color: Rgb) -> u32 {
    existing
        .iter()
        .map(|other| other.distance_sq(color))
        .min()
        .unwrap_or(u32::MAX)
}

// Bright, saturated colors from a random hue
fn random_color(rng: &mut StdRng) -> Rgb {
    let hue: f64 = rng.gen_range(0.0..1.0);
    let saturation: f64 = rng.gen_range(0.7..1.0);
    let value: f64 = rng.gen_range(0.7..1.0);
    hsv_to_rgb(hue, saturation, value)
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> Rgb {
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    let (r, g, b) = match sector as i64 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    let channel = |c: f64| (c * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([channel(r), channel(g), channel(b)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> Vec<Category> {
        vec![
            Category {
                id: 1,
                name: "person".to_string(),
                supercategory: "human".to_string(),
            },
            Category {
                id: 2,
                name: "traffic light".to_string(),
                supercategory: "outdoor".to_string(),
            },
        ]
    }

    fn all_kinds() -> AnnotationKinds {
        AnnotationKinds {
            segmentation: true,
            bbox: true,
            caption: true,
        }
    }

    #[test]
    fn test_add_tail() {
        assert_eq!(add_tail("person", "bbox"), "person_bbox");
        assert_eq!(add_tail("traffic light", "bbox"), "traffic light bbox");
        assert_eq!(with_tail("person_bbox", "bbox"), "person_bbox");
    }

    #[test]
    fn test_ensure_classes_creates_polygon_and_rectangle() {
        let mut schema = Schema::new(42);
        assert!(schema.ensure_classes_for(&categories(), all_kinds()).unwrap());

        let names: Vec<&str> = schema.classes().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["person", "person_bbox", "traffic light", "traffic light bbox"]
        );
        assert_eq!(schema.get_class("person").unwrap().shape_kind, ShapeKind::Polygon);
        assert_eq!(
            schema.get_class("person_bbox").unwrap().shape_kind,
            ShapeKind::Rectangle
        );
        assert_eq!(
            schema.get_class("person").unwrap().color,
            schema.get_class("person_bbox").unwrap().color
        );
        assert_ne!(
            schema.get_class("person").unwrap().color,
            schema.get_class("traffic light").unwrap().color
        );
    }

    #[test]
    fn test_ensure_classes_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = Schema::open(dir.path(), 7).unwrap();
        schema.ensure_classes_for(&categories(), all_kinds()).unwrap();
        let first = std::fs::read_to_string(dir.path().join(META_FILE_NAME)).unwrap();

        assert!(!schema.ensure_classes_for(&categories(), all_kinds()).unwrap());
        assert_eq!(schema.classes().len(), 4);
        let second = std::fs::read_to_string(dir.path().join(META_FILE_NAME)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_only_bbox_kind() {
        let mut schema = Schema::new(1);
        let kinds = AnnotationKinds {
            bbox: true,
            ..Default::default()
        };
        schema.ensure_classes_for(&categories()[..1], kinds).unwrap();
        assert!(schema.get_class("person").is_none());
        assert!(schema.get_class("person_bbox").is_some());
    }

    #[test]
    fn test_caption_tag_added_once() {
        let mut schema = Schema::new(1);
        assert!(schema.ensure_caption_tag().unwrap());
        assert!(!schema.ensure_caption_tag().unwrap());
        assert_eq!(schema.tags().len(), 1);
        assert_eq!(schema.tags()[0].value_type, TagValueType::AnyString);
    }

    #[test]
    fn test_bitmap_class_reuses_polygon_color() {
        let mut schema = Schema::new(3);
        schema.ensure_classes_for(&categories()[..1], all_kinds()).unwrap();
        let polygon = schema.get_class("person").unwrap().clone();
        let bitmap = schema.ensure_bitmap_class(&polygon).unwrap().unwrap();
        assert_eq!(bitmap.name, "person_rle");
        assert_eq!(bitmap.shape_kind, ShapeKind::Bitmap);
        assert_eq!(bitmap.color, polygon.color);
        // second call returns the existing class
        assert_eq!(schema.ensure_bitmap_class(&polygon).unwrap(), Some(bitmap));
        assert_eq!(schema.classes().len(), 3);
    }

    #[test]
    fn test_class_for_conflicting_kind() {
        let mut schema = Schema::new(3);
        schema.ensure_classes_for(&categories()[..1], all_kinds()).unwrap();
        assert!(schema.class_for("person", ShapeKind::Polygon).is_some());
        assert!(schema.class_for("person_bbox", ShapeKind::Polygon).is_none());
        assert!(schema.class_for("missing", ShapeKind::Polygon).is_none());
    }

    #[test]
    fn test_known_split_reuses_loaded_schema() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut schema = Schema::open(dir.path(), 1).unwrap();
            schema
                .prepare_for_dataset("val2017", &categories()[..1], all_kinds())
                .unwrap();
        }
        let mut reopened = Schema::open(dir.path(), 1).unwrap();
        assert_eq!(reopened.classes().len(), 2);
        let changed = reopened
            .prepare_for_dataset("val2017", &categories(), all_kinds())
            .unwrap();
        assert!(!changed);
        assert_eq!(reopened.classes().len(), 2);

        let changed = reopened
            .prepare_for_dataset("custom", &categories(), all_kinds())
            .unwrap();
        assert!(changed);
        assert_eq!(reopened.classes().len(), 4);
    }

    #[test]
    fn test_generate_color_is_deterministic() {
        let existing = vec![Rgb([255, 0, 0])];
        assert_eq!(generate_color(&existing, 5), generate_color(&existing, 5));
    }
}
