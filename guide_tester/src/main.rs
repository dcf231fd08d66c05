// This binary runs the `assembly_guide` engine over a recording or a live camera
// and writes the annotated video, in the manner of a visual regression harness.

mod collaborators;
mod hud;

use anyhow::{Context, Result, bail};
use assembly_guide::ui::drain;
use assembly_guide::{Capabilities, Frame, GuideConfig, WorkflowController, ui_channel};
use clap::Parser;
use collaborators::{DeviceControls, LoggingAnalyzer, QrDecoder, TableCompute};
use hud::Hud;
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Runs the assembly guide over a recording or a live camera and writes the
/// annotated result.
#[derive(Parser, Debug)]
#[command(name = "guide_tester", version)]
struct Args {
    /// Video file path or camera device index.
    #[arg(long)]
    input: String,

    /// Where the annotated video is written.
    #[arg(long)]
    output: PathBuf,

    /// Guide configuration JSON. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Calibration table JSON; overrides `config_path` from the configuration.
    #[arg(long)]
    checklist: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- 1. Argument Parsing & Setup ---
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => GuideConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => GuideConfig::default(),
    };
    if let Some(checklist) = &args.checklist {
        config.config_path = checklist.clone();
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let _runtime_guard = runtime.enter();

    // --- 2. Video I/O Initialization ---
    let mut cap = open_capture(&args.input)?;
    let frame_width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
    let frame_height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
    let fps = match cap.get(videoio::CAP_PROP_FPS)? {
        fps if fps > 0.0 => fps,
        _ => 30.0,
    };

    let output_path = args
        .output
        .to_str()
        .context("output path must be valid UTF-8")?;
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let mut writer = VideoWriter::new(
        output_path,
        fourcc,
        fps,
        Size::new(frame_width, frame_height),
        true,
    )?;
    if !writer.is_opened()? {
        bail!("failed to open {output_path} for writing");
    }

    // --- 3. Guide Initialization ---
    let camera = Arc::new(DeviceControls::default());
    let capabilities = Capabilities {
        decoder: Arc::new(QrDecoder::new().context("failed to create QR detector")?),
        calibration: Arc::new(TableCompute),
        analyzer: Arc::new(LoggingAnalyzer),
        camera: camera.clone(),
    };
    let (ui, mut intents) = ui_channel();
    let mut hud = Hud::new(config.scan_region);
    let mut controller = WorkflowController::new(config, capabilities, ui)?;
    info!(
        input = %args.input,
        width = frame_width,
        height = frame_height,
        fps,
        "guide session ready"
    );

    // --- 4. Main Processing Loop ---
    let mut bgr = Mat::default();
    let mut rgba = Mat::default();
    let mut frame_id = 0u64;
    loop {
        camera.apply(&mut cap);
        match cap.read(&mut bgr) {
            Ok(true) if !bgr.empty() => {}
            Ok(_) => break,
            Err(err) => {
                warn!(%err, "error reading frame");
                break;
            }
        }

        imgproc::cvt_color(&bgr, &mut rgba, imgproc::COLOR_BGR2RGBA, 0)?;
        let frame = Frame::new(
            frame_id,
            bgr.cols() as u32,
            bgr.rows() as u32,
            rgba.data_bytes()?.to_vec(),
        );
        frame_id += 1;

        if let Err(err) = controller.on_frame(frame) {
            error!(%err, "workflow stopped, remaining frames pass through");
        }

        for intent in drain(&mut intents) {
            hud.apply(intent);
        }
        hud.draw(&mut bgr)?;
        writer.write(&bgr)?;
    }

    let faulted = controller.is_faulted();
    runtime.block_on(controller.shutdown());
    info!(
        frames = frame_id,
        faulted,
        output = %args.output.display(),
        "processing complete"
    );
    Ok(())
}

/// Opens `input` as a device index when it parses as one, otherwise as a file.
fn open_capture(input: &str) -> Result<VideoCapture> {
    let cap = match input.parse::<i32>() {
        Ok(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
        Err(_) => VideoCapture::from_file(input, videoio::CAP_ANY)?,
    };
    if !cap.is_opened()? {
        bail!("failed to open video source {input}");
    }
    Ok(cap)
}
