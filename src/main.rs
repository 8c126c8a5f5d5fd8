use clap::Parser;
use log::{error, info, warn};

use coco2sly::{run_conversion, Args};

/// Job finished, but produced no images
const EXIT_SOFT_FAILURE: i32 = 1;
/// Job aborted
const EXIT_FATAL: i32 = 2;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let options = match args.to_convert_options() {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_FATAL);
        }
    };

    info!(
        "Converting {} into {}",
        options.input_dir.display(),
        options.output_dir.display()
    );

    match run_conversion(&options) {
        Ok(summary) if summary.is_soft_failure() => {
            warn!("No images were converted. Check the input folder structure.");
            std::process::exit(EXIT_SOFT_FAILURE);
        }
        Ok(summary) => {
            info!(
                "Conversion complete: {} images in {}",
                summary.total_images,
                options.output_dir.display()
            );
        }
        Err(e) => {
            error!("Conversion failed: {}", e);
            std::process::exit(EXIT_FATAL);
        }
    }
}
