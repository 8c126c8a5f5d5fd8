use glob::glob;
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::coco::{category_names, CocoDocument};
use crate::config::{ConvertOptions, DatasetMode};
use crate::conversion::synthesize;
use crate::error::ConvertError;
use crate::io::{
    list_images, read_image_size, remove_dataset_output, setup_dataset_output, transfer_image,
    write_annotation, DatasetOutputDirs,
};
use crate::schema::Schema;
use crate::types::{ProcessingStats, TargetAnnotation};
use crate::utils::create_progress_bar;

pub const IMAGES_DIR_NAME: &str = "images";
pub const ANNOTATIONS_DIR_NAME: &str = "annotations";

/// Annotation files chosen for a dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationFiles {
    pub instances: Option<PathBuf>,
    pub captions: Option<PathBuf>,
}

/// Outcome of converting one dataset
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub name: String,
    pub images: usize,
    pub stats: ProcessingStats,
}

/// Outcome of a whole conversion job
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub datasets: Vec<DatasetReport>,
    pub total_images: usize,
}

impl JobSummary {
    /// A job that produced no images finished, but without a usable project
    pub fn is_soft_failure(&self) -> bool {
        self.total_images == 0
    }
}

/// Find `(name, directory)` of every dataset under the input root, sorted by name.
///
/// A root that directly holds `images/` is a single dataset named after the root.
pub fn discover_datasets(
    input_dir: &Path,
    output_dir: &Path,
    only: &[String],
) -> Result<Vec<(String, PathBuf)>, ConvertError> {
    let mut datasets = Vec::new();
    if input_dir.join(IMAGES_DIR_NAME).is_dir() {
        let name = input_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string());
        datasets.push((name, input_dir.to_path_buf()));
    } else {
        // relative and absolute spellings of the output root must compare equal
        let output_canonical = fs::canonicalize(output_dir).ok();
        let entries = fs::read_dir(input_dir).map_err(|e| ConvertError::io(input_dir, e))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() || path == output_dir {
                continue;
            }
            if output_canonical.is_some() && fs::canonicalize(&path).ok() == output_canonical {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            datasets.push((name, path));
        }
        datasets.sort();
    }

    if !only.is_empty() {
        datasets.retain(|(name, _)| only.contains(name));
    }
    Ok(datasets)
}

/// Pick the instances and captions files of a dataset
pub fn find_annotation_files(
    ann_dir: &Path,
    dataset_name: &str,
    mode: DatasetMode,
    include_captions: bool,
) -> AnnotationFiles {
    let files = match mode {
        DatasetMode::Original => original_annotation_files(ann_dir, dataset_name, include_captions),
        DatasetMode::Custom => custom_annotation_files(ann_dir, include_captions),
    };
    info!("instances_ann: {:?}", files.instances);
    if include_captions {
        info!("captions_ann: {:?}", files.captions);
    }
    files
}

fn original_annotation_files(
    ann_dir: &Path,
    dataset_name: &str,
    include_captions: bool,
) -> AnnotationFiles {
    let existing = |name: String| {
        let path = ann_dir.join(name);
        path.is_file().then_some(path)
    };
    AnnotationFiles {
        instances: existing(format!("instances_{}.json", dataset_name)),
        captions: if include_captions {
            existing(format!("captions_{}.json", dataset_name))
        } else {
            None
        },
    }
}

fn custom_annotation_files(ann_dir: &Path, include_captions: bool) -> AnnotationFiles {
    let pattern = ann_dir.join("*.json");
    let mut ann_files: Vec<PathBuf> = match glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(|entry| entry.ok()).collect(),
        Err(e) => {
            warn!("Invalid annotation glob pattern {}: {}", pattern.display(), e);
            Vec::new()
        }
    };
    ann_files.sort();

    match ann_files.len() {
        0 => AnnotationFiles::default(),
        1 => {
            if include_captions {
                warn!(
                    "Import captions is enabled, but only one .json annotation file found. \
                     It will be used for instances. \
                     If you want to import captions, please, add captions annotation file."
                );
            }
            AnnotationFiles {
                instances: Some(ann_files.remove(0)),
                captions: None,
            }
        }
        _ => {
            let matching = |needle: &str| -> Vec<PathBuf> {
                ann_files
                    .iter()
                    .filter(|path| {
                        path.file_name()
                            .map(|name| name.to_string_lossy().contains(needle))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            };
            let instances = matching("instance");
            if include_captions {
                let captions = matching("caption");
                if instances.len() == 1 && captions.len() == 1 && instances[0] != captions[0] {
                    return AnnotationFiles {
                        instances: Some(instances[0].clone()),
                        captions: Some(captions[0].clone()),
                    };
                }
                warn!(
                    "Found more than one .json annotation file, but instances and captions \
                     files cannot be told apart. {} will be used for instances.",
                    ann_files[0].display()
                );
                return AnnotationFiles {
                    instances: Some(ann_files[0].clone()),
                    captions: None,
                };
            }

            warn!("Import captions is disabled, but more than one .json annotation file found.");
            if instances.len() == 1 {
                info!("Instances annotation file found: {}", instances[0].display());
                AnnotationFiles {
                    instances: Some(instances[0].clone()),
                    captions: None,
                }
            } else {
                warn!(
                    "Cannot find a single instances annotation file; using {}",
                    ann_files[0].display()
                );
                AnnotationFiles {
                    instances: Some(ann_files[0].clone()),
                    captions: None,
                }
            }
        }
    }
}

/// Convert one dataset into `<output>/<name>/{img,ann}`.
///
/// Per-image problems are counted and skipped. A dataset that ends with no
/// images has its output directory removed.
pub fn process_dataset(
    name: &str,
    dataset_dir: &Path,
    schema: &mut Schema,
    options: &ConvertOptions,
) -> Result<DatasetReport, ConvertError> {
    let mut stats = ProcessingStats::new();
    let images_dir = dataset_dir.join(IMAGES_DIR_NAME);
    if !images_dir.is_dir() {
        warn!(
            "Incorrect input data for dataset '{}': folder with images must be named '{}'",
            name, IMAGES_DIR_NAME
        );
        return Ok(DatasetReport {
            name: name.to_string(),
            images: 0,
            stats,
        });
    }

    let ann_files = find_annotation_files(
        &dataset_dir.join(ANNOTATIONS_DIR_NAME),
        name,
        options.mode,
        options.include_captions,
    );

    let dirs = setup_dataset_output(&options.output_dir, name)
        .map_err(|e| ConvertError::io(options.output_dir.join(name), e))?;

    match &ann_files.instances {
        Some(instances) => convert_annotated_dataset(
            name,
            &images_dir,
            instances,
            ann_files.captions.as_deref(),
            &dirs,
            schema,
            options,
            &mut stats,
        )?,
        None => {
            info!(
                "No annotation file found for dataset '{}', importing images only",
                name
            );
            convert_unannotated_dataset(name, &images_dir, &dirs, options, &mut stats)?
        }
    }

    stats.print_summary(name);
    if stats.converted_images == 0 {
        warn!("Dataset '{}' has no images, removing its output", name);
        remove_dataset_output(&dirs).map_err(|e| ConvertError::io(&dirs.dataset_dir, e))?;
    }

    Ok(DatasetReport {
        name: name.to_string(),
        images: stats.converted_images,
        stats,
    })
}

#[allow(clippy::too_many_arguments)]
fn convert_annotated_dataset(
    name: &str,
    images_dir: &Path,
    instances_path: &Path,
    captions_path: Option<&Path>,
    dirs: &DatasetOutputDirs,
    schema: &mut Schema,
    options: &ConvertOptions,
    stats: &mut ProcessingStats,
) -> Result<(), ConvertError> {
    let mut document = CocoDocument::read(instances_path)?;
    if let Some(captions_path) = captions_path {
        document.merge(CocoDocument::read_captions(captions_path)?);
    }

    schema.prepare_for_dataset(name, &document.categories, document.annotation_kinds())?;
    let names = category_names(&document.categories);
    let by_image = document.annotations_by_image();

    let pb = create_progress_bar(document.images.len() as u64, name);
    for image in &document.images {
        stats.increment_total();
        pb.inc(1);

        let image_size = match (image.height, image.width) {
            (Some(height), Some(width)) => (height, width),
            _ => {
                pb.finish_and_clear();
                return Err(ConvertError::structure(
                    instances_path,
                    format!(
                        "image info (ID:{}) does not contain 'height' and 'width' keys",
                        image.id
                    ),
                ));
            }
        };

        let Some(image_name) = Path::new(&image.file_name).file_name() else {
            warn!("Image {} has an invalid file name '{}'", image.id, image.file_name);
            stats.increment_skipped_missing_image();
            continue;
        };
        let image_name = image_name.to_string_lossy().to_string();
        let src_path = images_dir.join(&image_name);
        if !src_path.is_file() {
            stats.increment_skipped_missing_image();
            continue;
        }

        let records = by_image.get(&image.id).map(Vec::as_slice).unwrap_or(&[]);
        let synthesis = synthesize(schema, &names, records, image_size, options)?;
        stats.add_skipped_records(synthesis.skipped_records);

        export_image(&src_path, &image_name, &synthesis.annotation, dirs, options, stats);
    }
    pb.finish_with_message(format!("Dataset {} converted", name));
    Ok(())
}

fn convert_unannotated_dataset(
    name: &str,
    images_dir: &Path,
    dirs: &DatasetOutputDirs,
    options: &ConvertOptions,
    stats: &mut ProcessingStats,
) -> Result<(), ConvertError> {
    let images = list_images(images_dir);
    let pb = create_progress_bar(images.len() as u64, name);
    for src_path in images {
        stats.increment_total();
        pb.inc(1);

        let image_size = match read_image_size(&src_path) {
            Ok(size) => size,
            Err(e) => {
                warn!("{}", e);
                stats.increment_skipped_unreadable_image();
                continue;
            }
        };
        let image_name = match src_path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        let annotation = TargetAnnotation::empty(image_size);
        export_image(&src_path, &image_name, &annotation, dirs, options, stats);
    }
    pb.finish_with_message(format!("Dataset {} converted", name));
    Ok(())
}

/// Write the annotation and transfer the image; failures only affect this image
fn export_image(
    src_path: &Path,
    image_name: &str,
    annotation: &TargetAnnotation,
    dirs: &DatasetOutputDirs,
    options: &ConvertOptions,
    stats: &mut ProcessingStats,
) {
    if let Err(e) = write_annotation(&dirs.ann_dir, image_name, annotation) {
        error!("Failed to write annotation for {}: {}", image_name, e);
        stats.increment_failed();
        return;
    }
    let dst_path = dirs
        .img_dir
        .join(sanitize_filename::sanitize(image_name));
    if let Err(e) = transfer_image(src_path, &dst_path, options.copy_images) {
        error!("Failed to transfer image {}: {}", src_path.display(), e);
        let ann_path = dirs.ann_dir.join(crate::io::annotation_file_name(image_name));
        let _ = fs::remove_file(ann_path);
        stats.increment_failed();
        return;
    }
    stats.increment_converted();
}

/// Convert every dataset under the input root into one output project.
pub fn run_conversion(options: &ConvertOptions) -> Result<JobSummary, ConvertError> {
    fs::create_dir_all(&options.output_dir)
        .map_err(|e| ConvertError::io(&options.output_dir, e))?;
    let mut schema = Schema::open(&options.output_dir, options.seed)?;

    let datasets = discover_datasets(&options.input_dir, &options.output_dir, &options.datasets)?;
    if datasets.is_empty() {
        warn!("No datasets found in {}", options.input_dir.display());
    }

    let mut summary = JobSummary::default();
    for (name, dataset_dir) in datasets {
        info!("Converting dataset '{}'...", name);
        let report = process_dataset(&name, &dataset_dir, &mut schema, options)?;
        summary.total_images += report.images;
        summary.datasets.push(report);
    }

    schema.persist()?;
    info!(
        "Converted {} images from {} datasets",
        summary.total_images,
        summary.datasets.iter().filter(|d| d.images > 0).count()
    );
    Ok(summary)
}
