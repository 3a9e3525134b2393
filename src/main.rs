use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::info;

use marker_slam::io::{write_model_csv, write_trajectory_csv, Recording};
use marker_slam::system::OfflineRun;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(recording_dir) = args.next().map(PathBuf::from) else {
        bail!("usage: marker-slam <recording_dir> [output.csv]");
    };
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| recording_dir.join("model.csv"));

    let recording = Recording::load(&recording_dir)?;
    let mut run = OfflineRun::new(
        recording.config.clone(),
        recording.camera.clone(),
        recording.frames,
    )?;

    for step in run.by_ref() {
        info!(
            "{:5.1}% | frame {:6} | {} markers | {} key markers | {} optimizations",
            step.progress * 100.0,
            step.frames_processed,
            step.snapshot.markers.len(),
            step.snapshot.key_markers,
            step.snapshot.optimizations
        );
    }

    let mapper = run.mapper();
    let model = mapper.model();
    if model.origin().is_none() {
        bail!("not enough key markers to choose an origin marker");
    }
    write_model_csv(&output, &model.to_plain())?;
    info!("wrote {} markers to {}", model.len(), output.display());

    let trajectory_path = output.with_file_name("trajectory.csv");
    write_trajectory_csv(&trajectory_path, run.trajectory())?;
    info!(
        "wrote {} camera poses to {}",
        run.trajectory().len(),
        trajectory_path.display()
    );
    Ok(())
}
