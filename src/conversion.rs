use log::warn;
use std::collections::HashMap;
use uuid::Uuid;

use crate::coco::Annotation;
use crate::config::ConvertOptions;
use crate::error::ConvertError;
use crate::geometry::decode_segmentation;
use crate::schema::{with_tail, Schema, BBOX_TAIL, CAPTION_TAG};
use crate::types::{
    DecodedShape, Geometry, ImageTag, Label, Rectangle, ShapeKind, TargetAnnotation,
};

/// Result of converting the records of one image
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub annotation: TargetAnnotation,
    /// Records that contributed nothing because of a warning
    pub skipped_records: usize,
}

fn new_group_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Convert the COCO records of one image into a target annotation.
///
/// Every record is handled in isolation: an unresolved category, a class
/// conflict or a geometry that fails to decode is logged and skipped, and the
/// remaining records are still converted. Only schema persistence failures
/// are returned as errors.
pub fn synthesize(
    schema: &mut Schema,
    category_names: &HashMap<i64, String>,
    records: &[&Annotation],
    image_size: (u32, u32),
    options: &ConvertOptions,
) -> Result<Synthesis, ConvertError> {
    let mut annotation = TargetAnnotation::empty(image_size);
    let mut skipped_records = 0;

    for record in records {
        let contributed = convert_record(schema, category_names, record, &mut annotation, options)?;
        if !contributed {
            skipped_records += 1;
        }
    }

    Ok(Synthesis {
        annotation,
        skipped_records,
    })
}

/// Append the labels and tags of one record. Returns whether anything was added.
///
/// A record without `category_id` is skipped with a warning, except when it
/// carries a caption: COCO caption records never have a category, so those
/// are deliberately kept and contribute only their caption tag.
fn convert_record(
    schema: &mut Schema,
    category_names: &HashMap<i64, String>,
    record: &Annotation,
    annotation: &mut TargetAnnotation,
    options: &ConvertOptions,
) -> Result<bool, ConvertError> {
    let before = (annotation.labels.len(), annotation.image_tags.len());

    let class_name = match record.category_id {
        Some(category_id) => match category_names.get(&category_id) {
            Some(name) => Some(name.as_str()),
            None => {
                warn!(
                    "Category with id {} not found in categories list (image {})",
                    category_id, record.image_id
                );
                return Ok(false);
            }
        },
        // caption records carry no category
        None if record.caption.is_some() => None,
        None => {
            warn!(
                "Annotation for image {} has no category_id, skipping",
                record.image_id
            );
            return Ok(false);
        }
    };

    if let Some(class_name) = class_name {
        let (shape_labels, group_key) =
            convert_segmentation(schema, class_name, record, annotation.image_size, options)?;

        if let Some(bbox) = record.bbox {
            let rect_class_name = with_tail(class_name, BBOX_TAIL);
            if let Some(rect_class) = schema.class_for(&rect_class_name, ShapeKind::Rectangle) {
                if shape_labels.len() > 1 {
                    for label in &shape_labels {
                        if let Some(rect) = label.geometry.bounding_rect() {
                            annotation.labels.push(Label::new(
                                Geometry::Rectangle(rect),
                                &rect_class,
                                label.group_key.as_deref(),
                            ));
                        }
                    }
                } else {
                    annotation.labels.push(Label::new(
                        Geometry::Rectangle(Rectangle::from_xywh(bbox)),
                        &rect_class,
                        group_key.as_deref(),
                    ));
                }
            }
        }
        annotation.labels.extend(shape_labels);
    }

    if let Some(caption) = &record.caption {
        match schema.get_tag(CAPTION_TAG) {
            Some(definition) => annotation.image_tags.push(ImageTag {
                definition: definition.clone(),
                value: caption.clone(),
            }),
            None => warn!(
                "Caption found for image {} but the schema has no '{}' tag",
                record.image_id, CAPTION_TAG
            ),
        }
    }

    Ok((annotation.labels.len(), annotation.image_tags.len()) != before)
}

/// Decode the record's segmentation into labels sharing one group key.
fn convert_segmentation(
    schema: &mut Schema,
    class_name: &str,
    record: &Annotation,
    image_size: (u32, u32),
    options: &ConvertOptions,
) -> Result<(Vec<Label>, Option<String>), ConvertError> {
    let segmentation = match &record.segmentation {
        Some(segmentation) if !segmentation.is_empty() => segmentation,
        _ => return Ok((Vec::new(), None)),
    };

    let Some(polygon_class) = schema.class_for(class_name, ShapeKind::Polygon) else {
        return Ok((Vec::new(), None));
    };

    let shapes = match decode_segmentation(segmentation, image_size, options.rle_to_bitmap) {
        Ok(shapes) => shapes,
        Err(e) => {
            warn!(
                "Failed to decode segmentation of '{}' on image {}: {}",
                class_name, record.image_id, e
            );
            return Ok((Vec::new(), None));
        }
    };
    if shapes.is_empty() {
        return Ok((Vec::new(), None));
    }

    let group_key = new_group_key();
    let mut labels = Vec::with_capacity(shapes.len());
    for shape in shapes {
        let object_class = match &shape {
            DecodedShape::Bitmap(_) => match schema.ensure_bitmap_class(&polygon_class)? {
                Some(class) => class,
                None => continue,
            },
            DecodedShape::Polygon { .. } => polygon_class.clone(),
        };
        labels.push(Label::new(
            Geometry::Shape(shape),
            &object_class,
            Some(&group_key),
        ));
    }
    if labels.is_empty() {
        return Ok((labels, None));
    }
    Ok((labels, Some(group_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coco::{AnnotationKinds, Category, RleCounts, RleMask, Segmentation};
    use crate::rle;
    use crate::types::BitMask;

    fn setup() -> (Schema, HashMap<i64, String>) {
        let categories = vec![Category {
            id: 1,
            name: "cat".to_string(),
            supercategory: "animal".to_string(),
        }];
        let mut schema = Schema::new(42);
        schema
            .prepare_for_dataset(
                "test",
                &categories,
                AnnotationKinds {
                    segmentation: true,
                    bbox: true,
                    caption: true,
                },
            )
            .unwrap();
        (schema, crate::coco::category_names(&categories))
    }

    fn record(segmentation: Option<Segmentation>, bbox: Option<[f64; 4]>) -> Annotation {
        Annotation {
            image_id: 1,
            category_id: Some(1),
            segmentation,
            bbox,
            caption: None,
        }
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<f64> {
        vec![x0, y0, x1, y0, x1, y1, x0, y1]
    }

    #[test]
    fn test_square_with_bbox() {
        let (mut schema, names) = setup();
        let ann = record(
            Some(Segmentation::Polygons(vec![square(10.0, 10.0, 50.0, 50.0)])),
            Some([10.0, 10.0, 40.0, 40.0]),
        );
        let result = synthesize(&mut schema, &names, &[&ann], (100, 100), &ConvertOptions::default())
            .unwrap();
        let labels = &result.annotation.labels;
        assert_eq!(labels.len(), 2);

        assert_eq!(labels[0].object_class.name, "cat_bbox");
        assert_eq!(
            labels[0].geometry,
            Geometry::Rectangle(Rectangle {
                top: 10.0,
                left: 10.0,
                bottom: 50.0,
                right: 50.0,
            })
        );
        assert_eq!(labels[1].object_class.name, "cat");
        assert_eq!(
            labels[1].geometry,
            Geometry::Shape(DecodedShape::Polygon {
                exterior: vec![(10.0, 10.0), (50.0, 10.0), (50.0, 50.0), (10.0, 50.0)],
                holes: vec![],
            })
        );
        assert!(labels[0].group_key.is_some());
        assert_eq!(labels[0].group_key, labels[1].group_key);
    }

    #[test]
    fn test_two_parts_yield_two_rectangles() {
        let (mut schema, names) = setup();
        let ann = record(
            Some(Segmentation::Polygons(vec![
                square(5.0, 5.0, 20.0, 20.0),
                square(40.0, 40.0, 70.0, 60.0),
            ])),
            Some([5.0, 5.0, 65.0, 55.0]),
        );
        let result = synthesize(&mut schema, &names, &[&ann], (100, 100), &ConvertOptions::default())
            .unwrap();
        let rects: Vec<&Label> = result
            .annotation
            .labels
            .iter()
            .filter(|l| l.geometry.kind() == ShapeKind::Rectangle)
            .collect();
        assert_eq!(rects.len(), 2);
        assert_eq!(
            rects[1].geometry,
            Geometry::Rectangle(Rectangle {
                top: 40.0,
                left: 40.0,
                bottom: 60.0,
                right: 70.0,
            })
        );
        let polygons: Vec<&Label> = result
            .annotation
            .labels
            .iter()
            .filter(|l| l.geometry.kind() == ShapeKind::Polygon)
            .collect();
        assert_eq!(polygons.len(), 2);
        for (rect, polygon) in rects.iter().zip(polygons.iter()) {
            assert_eq!(rect.group_key, polygon.group_key);
        }
    }

    #[test]
    fn test_bbox_only_record() {
        let (mut schema, names) = setup();
        let ann = record(None, Some([1.0, 2.0, 3.0, 4.0]));
        let result = synthesize(&mut schema, &names, &[&ann], (10, 10), &ConvertOptions::default())
            .unwrap();
        assert_eq!(result.annotation.labels.len(), 1);
        assert_eq!(
            result.annotation.labels[0].geometry,
            Geometry::Rectangle(Rectangle {
                top: 2.0,
                left: 1.0,
                bottom: 6.0,
                right: 4.0,
            })
        );
        assert_eq!(result.annotation.labels[0].group_key, None);
    }

    #[test]
    fn test_unknown_category_skipped() {
        let (mut schema, names) = setup();
        let mut ann = record(None, Some([1.0, 2.0, 3.0, 4.0]));
        ann.category_id = Some(99);
        let result = synthesize(&mut schema, &names, &[&ann], (10, 10), &ConvertOptions::default())
            .unwrap();
        assert!(result.annotation.labels.is_empty());
        assert_eq!(result.skipped_records, 1);
    }

    #[test]
    fn test_no_records_gives_empty_annotation() {
        let (mut schema, names) = setup();
        let result = synthesize(&mut schema, &names, &[], (480, 640), &ConvertOptions::default())
            .unwrap();
        assert_eq!(result.annotation, TargetAnnotation::empty((480, 640)));
    }

    #[test]
    fn test_rle_bitmap_mode_creates_bitmap_class() {
        let (mut schema, names) = setup();
        let mut mask = BitMask::new(4, 4);
        mask.set(1, 1, true);
        mask.set(2, 2, true);
        let ann = record(
            Some(Segmentation::Rle(RleMask {
                height: 4,
                width: 4,
                counts: RleCounts::Runs(rle::encode(&mask)),
            })),
            None,
        );
        let options = ConvertOptions {
            rle_to_bitmap: true,
            ..ConvertOptions::default()
        };
        let result = synthesize(&mut schema, &names, &[&ann], (4, 4), &options).unwrap();
        assert_eq!(result.annotation.labels.len(), 1);
        let label = &result.annotation.labels[0];
        assert_eq!(label.object_class.name, "cat_rle");
        assert_eq!(label.geometry, Geometry::Shape(DecodedShape::Bitmap(mask)));
        assert!(schema.get_class("cat_rle").is_some());
    }

    #[test]
    fn test_malformed_rle_does_not_abort_image() {
        let (mut schema, names) = setup();
        let broken = record(
            Some(Segmentation::Rle(RleMask {
                height: 4,
                width: 4,
                counts: RleCounts::Runs(vec![1, 2]),
            })),
            None,
        );
        let good = record(None, Some([0.0, 0.0, 1.0, 1.0]));
        let result = synthesize(
            &mut schema,
            &names,
            &[&broken, &good],
            (4, 4),
            &ConvertOptions::default(),
        )
        .unwrap();
        assert_eq!(result.annotation.labels.len(), 1);
        assert_eq!(result.skipped_records, 1);
    }

    #[test]
    fn test_caption_record_without_category() {
        let (mut schema, names) = setup();
        let ann = Annotation {
            image_id: 1,
            category_id: None,
            segmentation: None,
            bbox: None,
            caption: Some("a cat on a mat".to_string()),
        };
        let result = synthesize(&mut schema, &names, &[&ann], (10, 10), &ConvertOptions::default())
            .unwrap();
        assert_eq!(result.annotation.image_tags.len(), 1);
        assert_eq!(result.annotation.image_tags[0].definition.name, "caption");
        assert_eq!(result.annotation.image_tags[0].value, "a cat on a mat");
    }

    #[test]
    fn test_traced_rle_parts_yield_rectangle_each() {
        let (mut schema, names) = setup();
        let mut mask = BitMask::new(10, 10);
        for row in 1..3 {
            for col in 1..3 {
                mask.set(row, col, true);
            }
        }
        for row in 6..9 {
            for col in 5..8 {
                mask.set(row, col, true);
            }
        }
        let ann = record(
            Some(Segmentation::Rle(RleMask {
                height: 10,
                width: 10,
                counts: RleCounts::Compressed(rle::counts_to_string(&rle::encode(&mask))),
            })),
            Some([1.0, 1.0, 7.0, 8.0]),
        );
        let result = synthesize(&mut schema, &names, &[&ann], (10, 10), &ConvertOptions::default())
            .unwrap();

        let rects: Vec<&Label> = result
            .annotation
            .labels
            .iter()
            .filter(|l| l.geometry.kind() == ShapeKind::Rectangle)
            .collect();
        let polygons: Vec<&Label> = result
            .annotation
            .labels
            .iter()
            .filter(|l| l.geometry.kind() == ShapeKind::Polygon)
            .collect();
        assert_eq!(rects.len(), 2);
        assert_eq!(polygons.len(), 2);
        for (rect, polygon) in rects.iter().zip(polygons.iter()) {
            assert!(rect.group_key.is_some());
            assert_eq!(rect.group_key, polygon.group_key);
            assert_eq!(rect.geometry, Geometry::Rectangle(polygon.geometry.bounding_rect().unwrap()));
        }
        assert_ne!(rects[0].geometry, rects[1].geometry);
    }

    #[test]
    fn test_bitmap_name_taken_by_other_kind_skips_geometry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::schema::META_FILE_NAME),
            r##"{"classes": [
                {"title": "cat", "shape": "polygon", "color": "#00FF00"},
                {"title": "cat_rle", "shape": "polygon", "color": "#00FF00"}
            ], "tags": []}"##,
        )
        .unwrap();
        let mut schema = Schema::open(dir.path(), 1).unwrap();
        let names: HashMap<i64, String> = [(1, "cat".to_string())].into_iter().collect();
        let mut mask = BitMask::new(4, 4);
        mask.set(1, 1, true);
        let ann = record(
            Some(Segmentation::Rle(RleMask {
                height: 4,
                width: 4,
                counts: RleCounts::Runs(rle::encode(&mask)),
            })),
            None,
        );
        let options = ConvertOptions {
            rle_to_bitmap: true,
            ..ConvertOptions::default()
        };
        let result = synthesize(&mut schema, &names, &[&ann, &ann], (4, 4), &options).unwrap();
        assert!(result.annotation.labels.is_empty());
        assert_eq!(result.skipped_records, 2);
        assert_eq!(schema.classes().len(), 2);
        assert_eq!(
            schema.get_class("cat_rle").unwrap().shape_kind,
            ShapeKind::Polygon
        );
    }

    #[test]
    fn test_conflicting_class_kind_skips_geometry_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::schema::META_FILE_NAME),
            r##"{"classes": [
                {"title": "cat", "shape": "rectangle", "color": "#FF0000"},
                {"title": "cat_bbox", "shape": "rectangle", "color": "#FF0000"}
            ], "tags": []}"##,
        )
        .unwrap();
        let mut schema = Schema::open(dir.path(), 1).unwrap();
        let names: HashMap<i64, String> = [(1, "cat".to_string())].into_iter().collect();
        let ann = record(
            Some(Segmentation::Polygons(vec![square(1.0, 1.0, 5.0, 5.0)])),
            Some([1.0, 1.0, 4.0, 4.0]),
        );
        let result = synthesize(&mut schema, &names, &[&ann], (10, 10), &ConvertOptions::default())
            .unwrap();
        assert_eq!(result.annotation.labels.len(), 1);
        assert_eq!(result.annotation.labels[0].object_class.name, "cat_bbox");
        assert_eq!(result.annotation.labels[0].group_key, None);
    }
}
