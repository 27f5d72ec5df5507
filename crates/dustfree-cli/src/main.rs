//! dustfree: remove dust shadows from astronomical image files.
//!
//! Loads an image and a dust mask, runs the reconstruction pipeline and
//! writes the corrected image with 16-bit samples. Per-stage diagnostics
//! are printed after each run, which makes the tool double as a parameter
//! tuning bench:
//!
//! - Comparing smoothness and downsampling trade-offs
//! - Tuning star detection sensitivity against the sky detection preview
//! - Measuring per-stage durations across `--threads` settings
//!
//! # Usage
//!
//! ```text
//! dustfree [OPTIONS] --dust-mask <MASK> --output <OUT> <IMAGE>
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `info`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use dustfree_pipeline::diagnostics::{Clock, ReconstructDiagnostics, duration_ms};
use dustfree_pipeline::{DustFreeConfig, Image, Monitor, ReconstructResult};
use tracing_subscriber::EnvFilter;

/// Remove dust motes from an astronomical image.
///
/// Estimates the sky background with and without the regions marked in
/// the dust mask, and replaces the former with the latter.
#[derive(Parser)]
#[command(name = "dustfree", version)]
struct Cli {
    /// Path to the image to correct (PNG, TIFF, BMP, JPEG).
    image_path: PathBuf,

    /// Dust mask image; white (>= 0.5) marks dust.
    #[arg(long)]
    dust_mask: PathBuf,

    /// Output path. Written with 16-bit samples; use PNG or TIFF.
    #[arg(short, long)]
    output: PathBuf,

    /// Star detection sensitivity (0-6).
    #[arg(long, default_value_t = DustFreeConfig::DEFAULT_STAR_DETECTION_SENSITIVITY)]
    sensitivity: f32,

    /// Star protection radius in pixels (0-10).
    #[arg(long, default_value_t = DustFreeConfig::DEFAULT_STAR_DIFFUSION_DISTANCE)]
    diffusion: u8,

    /// Background smoothness (0-10).
    #[arg(long, default_value_t = DustFreeConfig::DEFAULT_SMOOTHNESS)]
    smoothness: f32,

    /// Integer downsampling factor before background estimation (1-16).
    #[arg(long, default_value_t = DustFreeConfig::DEFAULT_DOWNSAMPLE, value_parser = clap::value_parser!(u32).range(1..=16))]
    downsample: u32,

    /// Write the star-masked background instead of the corrected image.
    #[arg(long)]
    test_sky_detection: bool,

    /// Jitter inpainting ray positions.
    #[arg(long)]
    ray_jitter: bool,

    /// Maximum inpainting workers (default: all processors).
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    threads: Option<usize>,

    /// Number of runs for averaging. The output is written after the first.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// Missing fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Build a [`DustFreeConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<DustFreeConfig, String> {
    let config = if let Some(ref json) = cli.config_json {
        serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"))?
    } else {
        DustFreeConfig {
            star_detection_sensitivity: cli.sensitivity,
            star_diffusion_distance: cli.diffusion,
            smoothness: cli.smoothness,
            downsample: cli.downsample,
            test_sky_detection: cli.test_sky_detection,
            ray_jitter: cli.ray_jitter,
            max_workers: cli.threads,
        }
    };
    config
        .validate()
        .map_err(|e| format!("Invalid parameters: {e}"))?;
    Ok(config)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path, what: &str) -> Result<Image<f32>, String> {
    let decoded =
        image::open(path).map_err(|e| format!("Error reading {what} {}: {e}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        width = decoded.width(),
        height = decoded.height(),
        color = ?decoded.color(),
        "loaded {what}"
    );
    Ok(dustfree_pipeline::float_image_from_dynamic(&decoded))
}

/// Write `image` with 16-bit samples, keeping grayscale single-channel.
fn save(image: Image<f32>, path: &Path) -> Result<(), String> {
    let channels = image.channels();
    let dynamic = image
        .into_dynamic()
        .map_err(|e| format!("Error converting output: {e}"))?;
    let encoded = match channels {
        1 => image::DynamicImage::ImageLuma16(dynamic.to_luma16()),
        4 => image::DynamicImage::ImageRgba16(dynamic.to_rgba16()),
        _ => image::DynamicImage::ImageRgb16(dynamic.to_rgb16()),
    };
    encoded
        .save(path)
        .map_err(|e| format!("Error writing {}: {e}", path.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let (original, dust) = match (
        load(&cli.image_path, "image"),
        load(&cli.dust_mask, "dust mask"),
    ) {
        (Ok(image), Ok(dust)) => (image, dust),
        (Err(msg), _) | (_, Err(msg)) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        let mut image = original.clone();
        let monitor = Monitor::new();
        match dustfree_pipeline::reconstruct_with_diagnostics(
            &mut image,
            Some(&dust),
            &config,
            &monitor,
            &StdClock,
        ) {
            Ok((result, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                }

                // Write the output on the first run only.
                if run == 0 {
                    let output = match result {
                        ReconstructResult::Restored => image,
                        ReconstructResult::SkyDetection(background) => background,
                    };
                    if let Err(msg) = save(output, &cli.output) {
                        eprintln!("{msg}");
                        return ExitCode::FAILURE;
                    }
                    eprintln!("Output written to {}", cli.output.display());
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[ReconstructDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| duration_ms(d.total_duration))
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    // Every run uses the same config, so the stage list is the same.
    let names: Vec<&str> = all_diagnostics[0]
        .stages()
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    for name in names {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(|d| {
                d.stages()
                    .into_iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, s)| duration_ms(s.duration))
            })
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["dustfree", "in.tif", "--dust-mask", "mask.png", "-o", "out.tif"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn defaults_match_pipeline_defaults() {
        let config = config_from_cli(&parse(&[])).unwrap();
        assert_eq!(config, DustFreeConfig::default());
    }

    #[test]
    fn flags_populate_config() {
        let cli = parse(&[
            "--sensitivity",
            "5.5",
            "--diffusion",
            "3",
            "--smoothness",
            "4",
            "--downsample",
            "4",
            "--test-sky-detection",
            "--ray-jitter",
            "--threads",
            "2",
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert!((config.star_detection_sensitivity - 5.5).abs() < f32::EPSILON);
        assert_eq!(config.star_diffusion_distance, 3);
        assert_eq!(config.downsample, 4);
        assert!(config.test_sky_detection);
        assert!(config.ray_jitter);
        assert_eq!(config.max_workers, Some(2));
    }

    #[test]
    fn config_json_overrides_flags() {
        let cli = parse(&["--sensitivity", "1", "--config-json", r#"{"downsample": 3}"#]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.downsample, 3);
        assert!(
            (config.star_detection_sensitivity
                - DustFreeConfig::DEFAULT_STAR_DETECTION_SENSITIVITY)
                .abs()
                < f32::EPSILON
        );
    }

    #[test]
    fn out_of_range_parameters_are_reported() {
        let cli = parse(&["--sensitivity", "7"]);
        let err = config_from_cli(&cli).unwrap_err();
        assert!(err.contains("star_detection_sensitivity"), "{err}");
    }

    #[test]
    fn malformed_config_json_is_reported() {
        let cli = parse(&["--config-json", "{not json"]);
        let err = config_from_cli(&cli).unwrap_err();
        assert!(err.starts_with("Error parsing --config-json"), "{err}");
    }

    #[test]
    fn downsample_range_is_enforced_by_parser() {
        let result = Cli::try_parse_from([
            "dustfree",
            "in.tif",
            "--dust-mask",
            "m.png",
            "-o",
            "o.png",
            "--downsample",
            "0",
        ]);
        assert!(result.is_err());
    }
}
