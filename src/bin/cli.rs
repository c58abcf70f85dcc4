use anyhow::{bail, Context, Result};
use camfusion::histogram::{analyze, compute_histogram, histogram_stats, HistogramMode};
use camfusion::panorama::stitch;
use camfusion::{
    Accumulator, CaptureMetadata, FrameBuffer, FusionConfig, FusionDiagnostics, HistogramStats,
    OrientationSample,
};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

const USAGE: &str = "Usage: camfusion-cli <command> [args]

Commands:
  hdr <out> <in>...          Fuse an exposure bracket (2+ frames)
  dro <out> <in>             Single-frame dynamic range optimisation
  avg <out> <in>...          Average a burst for noise reduction
  panorama <out> <in>...     Stitch a panned sequence
  histogram <in>             Print min/median/max levels

Options:
  --config <toml>            Settings file (default: camfusion.toml)
  --iso <n>                  Capture ISO (-1 = unknown)
  --exposure-ns <n>          Exposure time in nanoseconds
  --yaw <deg,deg,...>        Per-frame yaw for panorama
  --mode <average|maximum|luminance>
  --json                     Print diagnostics as JSON";

/// Parsed command line
struct Args {
    command: String,
    paths: Vec<PathBuf>,
    config: Option<PathBuf>,
    iso: Option<i32>,
    exposure_ns: Option<i64>,
    yaw: Option<Vec<f32>>,
    mode: HistogramMode,
    json: bool,
}

fn next_value<'a>(rest: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<&'a String> {
    rest.next()
        .with_context(|| format!("{} needs a value", flag))
}

fn parse_args(args: &[String]) -> Result<Args> {
    let Some(command) = args.get(1) else {
        bail!("{}", USAGE);
    };

    let mut parsed = Args {
        command: command.clone(),
        paths: Vec::new(),
        config: None,
        iso: None,
        exposure_ns: None,
        yaw: None,
        mode: HistogramMode::default(),
        json: false,
    };

    let mut rest = args.iter().skip(2);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(next_value(&mut rest, arg)?)),
            "--iso" => parsed.iso = Some(next_value(&mut rest, arg)?.parse().context("invalid --iso")?),
            "--exposure-ns" => {
                parsed.exposure_ns = Some(
                    next_value(&mut rest, arg)?
                        .parse()
                        .context("invalid --exposure-ns")?,
                )
            }
            "--yaw" => {
                let samples = next_value(&mut rest, arg)?
                    .split(',')
                    .map(|s| s.trim().parse::<f32>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context("invalid --yaw list")?;
                parsed.yaw = Some(samples);
            }
            "--mode" => {
                parsed.mode = match next_value(&mut rest, arg)?.as_str() {
                    "average" => HistogramMode::Average,
                    "maximum" => HistogramMode::Maximum,
                    "luminance" => HistogramMode::Luminance,
                    other => bail!("unknown histogram mode '{}'", other),
                }
            }
            "--json" => parsed.json = true,
            other if other.starts_with("--") => bail!("unknown option {}", other),
            other => parsed.paths.push(PathBuf::from(other)),
        }
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    camfusion::init_logging();

    let args: Vec<String> = env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let config = match &args.config {
        Some(path) => FusionConfig::load_from_file(path)
            .with_context(|| format!("loading config {:?}", path))?,
        None => FusionConfig::load_or_default(),
    };
    config.validate().context("invalid configuration")?;

    match args.command.as_str() {
        "hdr" => cmd_hdr(&args, &config),
        "dro" => cmd_dro(&args, &config),
        "avg" => cmd_avg(&args, &config),
        "panorama" => cmd_panorama(&args, &config),
        "histogram" => cmd_histogram(&args),
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(1);
        }
    }
}

fn metadata(args: &Args) -> CaptureMetadata {
    let mut metadata = CaptureMetadata::default();
    if let Some(iso) = args.iso {
        metadata.iso = iso;
    }
    if let Some(exposure) = args.exposure_ns {
        metadata.exposure_time_ns = exposure;
    }
    metadata
}

/// Split `<out> <in>...` and require at least `min_inputs` inputs
fn output_and_inputs(args: &Args, min_inputs: usize) -> Result<(&Path, &[PathBuf])> {
    match args.paths.split_first() {
        Some((out, inputs)) if inputs.len() >= min_inputs => Ok((out.as_path(), inputs)),
        _ => bail!(
            "{} needs an output path and at least {} input(s)",
            args.command,
            min_inputs
        ),
    }
}

fn load_frame(path: &Path) -> Result<FrameBuffer> {
    let img = image::open(path).with_context(|| format!("decoding {:?}", path))?;
    let frame = if img.color().has_alpha() {
        FrameBuffer::from_rgba_image(img.to_rgba8())
    } else {
        FrameBuffer::from_rgb_image(img.to_rgb8())
    };
    Ok(frame)
}

fn load_frames(paths: &[PathBuf]) -> Result<Vec<FrameBuffer>> {
    paths.iter().map(|p| load_frame(p)).collect()
}

fn save_frame(frame: FrameBuffer, path: &Path) -> Result<()> {
    let (width, height) = frame.dimensions();
    let img = frame
        .into_dynamic_image()
        .with_context(|| format!("output buffer does not hold {}x{} pixels", width, height))?;
    img.save(path)
        .with_context(|| format!("writing {:?}", path))?;
    Ok(())
}

#[derive(Serialize)]
struct Report<'a, D: Serialize> {
    command: &'a str,
    output: Option<&'a Path>,
    width: u32,
    height: u32,
    histogram: Option<HistogramStats>,
    diagnostics: D,
}

fn report<D: Serialize + std::fmt::Debug>(
    args: &Args,
    output: Option<&Path>,
    frame: &FrameBuffer,
    histogram: Option<HistogramStats>,
    diagnostics: D,
) -> Result<()> {
    if args.json {
        let report = Report {
            command: &args.command,
            output,
            width: frame.width,
            height: frame.height,
            histogram,
            diagnostics,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}x{}", frame.width, frame.height);
        if let Some(h) = histogram {
            println!(
                "min {} median {} max {}",
                h.min_value, h.median_value, h.max_value
            );
        }
        println!("{:?}", diagnostics);
    }
    Ok(())
}

fn cmd_hdr(args: &Args, config: &FusionConfig) -> Result<()> {
    let (out, inputs) = output_and_inputs(args, 2)?;
    let frames = load_frames(inputs)?;
    let metadata = metadata(args);
    let options = config.hdr.options_for(&metadata, frames.len());

    let engine = config.fusion_engine()?;
    let output = engine.process(frames, &metadata, &options)?;
    report(args, Some(out), &output.frame, output.histogram, &output.diagnostics)?;
    save_frame(output.frame, out)
}

fn cmd_dro(args: &Args, config: &FusionConfig) -> Result<()> {
    let (out, inputs) = output_and_inputs(args, 1)?;
    if inputs.len() != 1 {
        bail!("dro takes exactly one input");
    }
    let frame = load_frame(&inputs[0])?;

    let engine = config.fusion_engine()?;
    let output = engine.process_dro(frame, &config.hdr.options)?;
    report(args, Some(out), &output.frame, output.histogram, &output.diagnostics)?;
    save_frame(output.frame, out)
}

fn cmd_avg(args: &Args, config: &FusionConfig) -> Result<()> {
    let (out, inputs) = output_and_inputs(args, 2)?;
    let metadata = metadata(args);

    let first = load_frame(&inputs[0])?;
    let second = load_frame(&inputs[1])?;
    let mut accumulator = Accumulator::init(
        first,
        second,
        1.0,
        &metadata,
        config.accumulator_settings(),
    )?;

    let mut per_frame: Vec<FusionDiagnostics> = accumulator.diagnostics().cloned().into_iter().collect();
    for (k, path) in inputs.iter().enumerate().skip(2) {
        let frame = load_frame(path)?;
        accumulator
            .update(frame, k as f32, &metadata)
            .with_context(|| format!("averaging {:?}", path))?;
        per_frame.extend(accumulator.diagnostics().cloned());
    }

    let output = accumulator.brighten(&metadata)?;
    per_frame.push(output.diagnostics.clone());
    report(args, Some(out), &output.frame, output.histogram, &per_frame)?;
    save_frame(output.frame, out)
}

fn cmd_panorama(args: &Args, config: &FusionConfig) -> Result<()> {
    let (out, inputs) = output_and_inputs(args, 1)?;
    let frames = load_frames(inputs)?;

    let orientations: Option<Vec<OrientationSample>> = args.yaw.as_ref().map(|yaw| {
        yaw.iter()
            .map(|&yaw_degrees| OrientationSample {
                yaw_degrees,
                ..Default::default()
            })
            .collect()
    });

    let output = stitch(
        frames,
        orientations.as_deref(),
        &config.panorama,
        &config.align,
    )?;
    report(args, Some(out), &output.frame, output.histogram, &output.placements)?;
    save_frame(output.frame, out)
}

fn cmd_histogram(args: &Args) -> Result<()> {
    let [path] = args.paths.as_slice() else {
        bail!("histogram takes exactly one input");
    };
    let frame = load_frame(path)?;
    let stats = if args.mode == HistogramMode::Average {
        analyze(&frame)
    } else {
        histogram_stats(&compute_histogram(&frame, args.mode))
    };
    report(args, None, &frame, stats, args.mode)
}
