use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use jwalk::WalkDir;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConvertError;
use crate::types::{
    has_valid_image_ext, BitMask, DecodedShape, Geometry, Label, TargetAnnotation,
};
use crate::utils::{create_output_directory, write_json_pretty};

/// Paths of one dataset inside the output project
#[derive(Debug, Clone)]
pub struct DatasetOutputDirs {
    pub dataset_dir: PathBuf,
    pub img_dir: PathBuf,
    pub ann_dir: PathBuf,
}

/// Set up `<output>/<dataset>/img` and `<output>/<dataset>/ann`
pub fn setup_dataset_output(output_dir: &Path, dataset: &str) -> std::io::Result<DatasetOutputDirs> {
    let dataset_dir = create_output_directory(&output_dir.join(dataset))?;
    let img_dir = create_output_directory(&dataset_dir.join("img"))?;
    let ann_dir = create_output_directory(&dataset_dir.join("ann"))?;
    Ok(DatasetOutputDirs {
        dataset_dir,
        img_dir,
        ann_dir,
    })
}

/// Remove a dataset output directory that received no images
pub fn remove_dataset_output(dirs: &DatasetOutputDirs) -> std::io::Result<()> {
    if dirs.dataset_dir.is_dir() {
        fs::remove_dir_all(&dirs.dataset_dir)?;
    }
    Ok(())
}

/// List image files with supported extensions directly inside `dir`, sorted by name
pub fn list_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .skip_hidden(true)
        .sort(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path())
        .filter(|path| has_valid_image_ext(path))
        .collect();
    images.sort();
    images
}

/// Read `(height, width)` from an image header
pub fn read_image_size(path: &Path) -> Result<(u32, u32), ConvertError> {
    let size = imagesize::size(path).map_err(|e| ConvertError::ImageSize {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok((size.height as u32, size.width as u32))
}

/// Move or copy an image into the output directory
pub fn transfer_image(src: &Path, dst: &Path, copy: bool) -> std::io::Result<()> {
    if copy {
        fs::copy(src, dst)?;
        return Ok(());
    }
    // rename fails across file systems; fall back to copy and delete
    if fs::rename(src, dst).is_err() {
        fs::copy(src, dst)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

/// Output annotation file name for an image
pub fn annotation_file_name(image_name: &str) -> String {
    format!("{}.json", sanitize_filename::sanitize(image_name))
}

/// Serialize a target annotation to `<ann_dir>/<image_name>.json`
pub fn write_annotation(
    ann_dir: &Path,
    image_name: &str,
    annotation: &TargetAnnotation,
) -> Result<PathBuf, ConvertError> {
    let path = ann_dir.join(annotation_file_name(image_name));
    let json = AnnotationJson::from_annotation(annotation)?;
    write_json_pretty(&path, &json)?;
    Ok(path)
}

#[derive(Debug, Serialize)]
pub struct SizeJson {
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Serialize)]
pub struct TagJson {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct PointsJson {
    pub exterior: Vec<[f64; 2]>,
    pub interior: Vec<Vec<[f64; 2]>>,
}

#[derive(Debug, Serialize)]
pub struct BitmapJson {
    /// `[x, y]` of the cropped mask's top-left pixel
    pub origin: [usize; 2],
    /// base64 PNG of the cropped mask
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectJson {
    pub class_title: String,
    pub geometry_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_key: Option<String>,
    pub tags: Vec<TagJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<PointsJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmap: Option<BitmapJson>,
}

/// On-disk form of a target annotation
#[derive(Debug, Serialize)]
pub struct AnnotationJson {
    pub description: String,
    pub size: SizeJson,
    pub tags: Vec<TagJson>,
    pub objects: Vec<ObjectJson>,
}

impl AnnotationJson {
    pub fn from_annotation(annotation: &TargetAnnotation) -> Result<Self, ConvertError> {
        let (height, width) = annotation.image_size;
        let objects = annotation
            .labels
            .iter()
            .map(ObjectJson::from_label)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            description: String::new(),
            size: SizeJson { height, width },
            tags: annotation
                .image_tags
                .iter()
                .map(|tag| TagJson {
                    name: tag.definition.name.clone(),
                    value: tag.value.clone(),
                })
                .collect(),
            objects,
        })
    }
}

impl ObjectJson {
    pub fn from_label(label: &Label) -> Result<Self, ConvertError> {
        let mut object = ObjectJson {
            class_title: label.object_class.name.clone(),
            geometry_type: label.geometry.kind().name().to_string(),
            binding_key: label.group_key.clone(),
            tags: Vec::new(),
            points: None,
            bitmap: None,
        };
        match &label.geometry {
            Geometry::Rectangle(rect) => {
                object.points = Some(PointsJson {
                    exterior: vec![[rect.left, rect.top], [rect.right, rect.bottom]],
                    interior: Vec::new(),
                });
            }
            Geometry::Shape(DecodedShape::Polygon { exterior, holes }) => {
                object.points = Some(PointsJson {
                    exterior: to_pairs(exterior),
                    interior: holes.iter().map(|hole| to_pairs(hole)).collect(),
                });
            }
            Geometry::Shape(DecodedShape::Bitmap(mask)) => {
                object.bitmap = Some(encode_bitmap(mask)?);
            }
        }
        Ok(object)
    }
}

fn to_pairs(points: &[(f64, f64)]) -> Vec<[f64; 2]> {
    points.iter().map(|&(x, y)| [x, y]).collect()
}

/// Crop a mask to its foreground and encode it as base64 PNG
pub fn encode_bitmap(mask: &BitMask) -> Result<BitmapJson, ConvertError> {
    let (top, left, bottom, right) = mask.extent().unwrap_or((0, 0, 0, 0));
    let crop_h = bottom - top + 1;
    let crop_w = right - left + 1;
    let mut pixels = Vec::with_capacity(crop_h * crop_w);
    for row in top..=bottom {
        for col in left..=right {
            let on = row < mask.height && col < mask.width && mask.get(row, col);
            pixels.push(if on { 255u8 } else { 0u8 });
        }
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png).write_image(
        &pixels,
        crop_w as u32,
        crop_h as u32,
        ColorType::L8,
    )?;
    Ok(BitmapJson {
        origin: [left, top],
        data: base64::encode(&png),
    })
}
