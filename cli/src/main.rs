//! Rig capture CLI (spec §6.4): the one concrete, in-process consumer of
//! `CaptureApi`, invoking operations directly rather than over HTTP.

use clap::Parser;
use rigcam_core::config::RigConfig;
use rigcam_core::devices::hardware::camera::DeviceHandle;
use rigcam_core::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "rigcam", about = "Multi-camera acquisition rig controller")]
struct Args {
    /// Override configuration path.
    #[arg(long, default_value = "rig_config.json")]
    config: String,

    /// Emit a JSON camera list and exit.
    #[arg(long)]
    list_cameras: bool,

    /// Emit JSON for commands that would otherwise print plain text.
    #[arg(long)]
    json: bool,

    /// Trigger a one-shot all-camera capture and emit a JSON summary.
    #[arg(long)]
    capture_all: bool,

    /// Output directory for --capture-all / --capture.
    #[arg(long, default_value = ".")]
    output: String,

    /// Emit the JSON parameter block for --camera.
    #[arg(long)]
    get_params: bool,

    /// Trigger a single-camera capture; emit JSON.
    #[arg(long)]
    capture: bool,

    /// Camera serial targeted by --get-params / --capture.
    #[arg(long)]
    camera: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match RigConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let discovered = discover_cameras();
    let controller = RigController::new(&config, discovered);

    let result = run_command(&args, &controller);
    controller.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Open every device the vendor SDK enumerates, skipping (and logging) any
/// that fails to open rather than aborting the whole run.
fn discover_cameras() -> Vec<(DeviceHandle, String, String)> {
    let mut discovered = Vec::new();
    let mut index = 0u32;
    loop {
        match DeviceHandle::discover(index) {
            Ok((handle, identity)) => {
                discovered.push((handle, identity.serial, identity.model));
                index += 1;
            }
            Err(_) => break,
        }
    }
    discovered
}

fn run_command(args: &Args, controller: &RigController) -> Result<(), String> {
    if args.list_cameras {
        let cameras = controller.list_cameras();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&cameras).map_err(|e| e.to_string())?);
        } else {
            for camera in &cameras {
                println!(
                    "{:>2}  {:<12} {:<10} {}",
                    camera.position,
                    camera.serial,
                    if camera.connected { "connected" } else { "disconnected" },
                    camera.model
                );
            }
        }
        return Ok(());
    }

    if args.get_params {
        let serial = args.camera.as_deref().ok_or("--get-params requires --camera")?;
        let params = controller.get_parameters(serial).ok_or_else(|| format!("unknown camera {serial}"))?;
        println!("{}", serde_json::to_string_pretty(&params).map_err(|e| e.to_string())?);
        return Ok(());
    }

    if args.capture {
        let serial = args.camera.as_deref().ok_or("--capture requires --camera")?;
        let result = controller
            .capture_one(serial, &PathBuf::from(&args.output), OutputFormat::Tiff)
            .map_err(|e| e.to_string())?;
        println!("{}", serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?);
        return Ok(());
    }

    if args.capture_all {
        let summary = controller
            .capture_all(1, &PathBuf::from(&args.output), OutputFormat::Tiff)
            .map_err(|e| e.to_string())?;
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session_dir": summary.session_dir,
                "shots": summary.shots,
                "per_camera_failures": summary.per_camera_failures,
                "total_retries": summary.total_retries,
                "average_sub_batch_ms": summary.average_sub_batch_ms,
            }))
            .map_err(|e| e.to_string())?
        );
        return Ok(());
    }

    Err("no command given; see --help".to_string())
}
