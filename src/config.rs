use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Command-line arguments for converting COCO datasets to a Supervisely project.
#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
pub struct Args {
    /// Directory containing the COCO datasets (`<dataset>/images`, `<dataset>/annotations`)
    #[arg(short = 'i', long = "input_dir")]
    pub input_dir: String,

    /// Directory where the converted project is written
    #[arg(short = 'o', long = "output_dir")]
    pub output_dir: String,

    /// How annotation files are named: 'original' COCO splits or 'custom' datasets
    #[arg(long = "mode", value_enum, default_value = "custom")]
    pub mode: DatasetMode,

    /// Import captions as image tags
    #[arg(long = "include_captions", visible_alias = "captions")]
    pub include_captions: bool,

    /// Keep RLE masks as bitmaps instead of tracing them into polygons
    #[arg(long = "rle_to_bitmap")]
    pub rle_to_bitmap: bool,

    /// Copy images instead of moving them
    #[arg(long = "copy_images", visible_alias = "copy")]
    pub copy_images: bool,

    /// Seed for class color generation
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,

    /// Only convert these datasets (all datasets found when empty)
    #[arg(use_value_delimiter = true)]
    pub datasets: Vec<String>,
}

// Naming convention of the annotation files
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum DatasetMode {
    /// `instances_<dataset>.json` / `captions_<dataset>.json`
    Original,
    /// Any `*.json` inside `annotations/`
    #[default]
    Custom,
}

/// Options of a conversion job, independent of the command line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConvertOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mode: DatasetMode,
    pub include_captions: bool,
    pub rle_to_bitmap: bool,
    pub copy_images: bool,
    pub seed: u64,
    pub datasets: Vec<String>,
}

impl Args {
    /// Validate the arguments and build the conversion options
    pub fn to_convert_options(&self) -> Result<ConvertOptions, String> {
        let input_dir = PathBuf::from(&self.input_dir);
        let output_dir = PathBuf::from(&self.output_dir);
        if !input_dir.is_dir() {
            return Err(format!(
                "The specified input_dir does not exist: {}",
                self.input_dir
            ));
        }
        if input_dir == output_dir {
            return Err("output_dir must differ from input_dir".to_string());
        }
        Ok(ConvertOptions {
            input_dir,
            output_dir,
            mode: self.mode,
            include_captions: self.include_captions,
            rle_to_bitmap: self.rle_to_bitmap,
            copy_images: self.copy_images,
            seed: self.seed,
            datasets: self.datasets.clone(),
        })
    }
}
