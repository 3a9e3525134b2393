//! Recorded marker sequences on disk.
//!
//! A recording directory contains:
//!
//! ```text
//! camera.yaml      intrinsics, resolution and optional distortion
//! detections.csv   frame_id, timestamp, marker_id, x0, y0, x1, y1, x2, y2, x3, y3
//! config.yaml      optional MapperConfig overrides
//! ```
//!
//! Corners are pixels in the detector's corner order. Lines starting with `#`
//! are comments.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use nalgebra::Vector2;
use serde::Deserialize;
use tracing::{info, warn};

use crate::camera::CameraModel;
use crate::markers::{Detection, FrameId, MarkerId};
use crate::system::{MapperConfig, RecordedFrame, TrajectoryPoint};

#[derive(Debug, Clone)]
pub struct Recording {
    pub camera: CameraModel,
    pub config: MapperConfig,
    pub frames: Vec<RecordedFrame>,
}

impl Recording {
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let camera = load_camera(&root.join("camera.yaml"))?;
        let frames = load_detections(&root.join("detections.csv"), &camera)?;

        let config_path = root.join("config.yaml");
        let config = if config_path.exists() {
            MapperConfig::from_yaml_file(&config_path)?
        } else {
            MapperConfig::default()
        };

        info!(
            "loaded {} frames with {} detections from {}",
            frames.len(),
            frames.iter().map(|f| f.detections.len()).sum::<usize>(),
            root.display()
        );
        Ok(Self {
            camera,
            config,
            frames,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// `camera.yaml` layout.
#[derive(Debug, Deserialize)]
struct CameraYaml {
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
    /// [width, height]
    resolution: Vec<u32>,
    /// [k1, k2, p1, p2, k3], trailing entries may be omitted.
    #[serde(default)]
    distortion_coefficients: Vec<f64>,
}

pub fn load_camera(path: &Path) -> Result<CameraModel> {
    let yaml: CameraYaml = serde_yaml::from_reader(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    )
    .with_context(|| format!("Failed to parse camera file {:?}", path))?;

    if yaml.intrinsics.len() != 4 {
        bail!("Expected 4 intrinsics [fx, fy, cx, cy], got {}", yaml.intrinsics.len());
    }
    if yaml.resolution.len() != 2 {
        bail!("Expected resolution [width, height], got {} values", yaml.resolution.len());
    }
    if yaml.distortion_coefficients.len() > 5 {
        bail!(
            "Expected at most 5 distortion coefficients, got {}",
            yaml.distortion_coefficients.len()
        );
    }
    let [fx, fy, cx, cy] = [
        yaml.intrinsics[0],
        yaml.intrinsics[1],
        yaml.intrinsics[2],
        yaml.intrinsics[3],
    ];
    if !(fx > 0.0 && fy > 0.0) {
        bail!("Focal lengths must be positive, got fx={} fy={}", fx, fy);
    }

    let mut distortion = [0.0; 5];
    distortion[..yaml.distortion_coefficients.len()].copy_from_slice(&yaml.distortion_coefficients);
    let (width, height) = (yaml.resolution[0], yaml.resolution[1]);
    Ok(CameraModel::new(fx, fy, cx, cy, width, height).with_distortion(distortion))
}

/// Reads detections grouped into frames, ordered by frame id.
///
/// A marker listed twice in one frame keeps its first detection.
pub fn load_detections(csv_path: &Path, camera: &CameraModel) -> Result<Vec<RecordedFrame>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut frames: BTreeMap<FrameId, RecordedFrame> = BTreeMap::new();
    let mut seen: BTreeSet<(FrameId, MarkerId)> = BTreeSet::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.len() < 11 {
            warn!("{}: skipping row {} with {} fields", csv_path.display(), line + 1, rec.len());
            continue;
        }
        let parse = |i: usize| -> Result<f64> {
            rec[i]
                .parse::<f64>()
                .with_context(|| format!("Row {}: invalid number {:?}", line + 1, &rec[i]))
        };
        let frame_id = FrameId(
            rec[0]
                .parse()
                .with_context(|| format!("Row {}: invalid frame id {:?}", line + 1, &rec[0]))?,
        );
        let timestamp = parse(1)?;
        let marker_id = MarkerId(
            rec[2]
                .parse()
                .with_context(|| format!("Row {}: invalid marker id {:?}", line + 1, &rec[2]))?,
        );
        let mut verts = [Vector2::zeros(); 4];
        for (c, v) in verts.iter_mut().enumerate() {
            *v = Vector2::new(parse(3 + 2 * c)?, parse(4 + 2 * c)?);
        }
        if verts.iter().any(|v| !v.iter().all(|x| x.is_finite())) {
            bail!("Row {}: non-finite corner coordinates", line + 1);
        }

        if !seen.insert((frame_id, marker_id)) {
            warn!("{}: duplicate detection of {}, keeping the first", frame_id, marker_id);
            continue;
        }
        frames
            .entry(frame_id)
            .or_insert_with(|| RecordedFrame {
                frame_id,
                timestamp,
                detections: Vec::new(),
            })
            .detections
            .push(Detection::new(
                frame_id,
                marker_id,
                timestamp,
                verts,
                (camera.width, camera.height),
            ));
    }

    if frames.is_empty() {
        bail!("No detections found in {}", csv_path.display());
    }
    Ok(frames.into_values().collect())
}

/// Writes `marker_id, rx, ry, rz, tx, ty, tz` rows.
pub fn write_model_csv(path: &Path, model: &BTreeMap<u32, [f64; 6]>) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    wtr.write_record(["marker_id", "rx", "ry", "rz", "tx", "ty", "tz"])?;
    for (id, ext) in model {
        let mut row = vec![id.to_string()];
        row.extend(ext.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `frame_id, timestamp, rx, ry, rz, tx, ty, tz` rows of world→camera poses.
pub fn write_trajectory_csv(path: &Path, trajectory: &[TrajectoryPoint]) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    wtr.write_record(["frame_id", "timestamp", "rx", "ry", "rz", "tx", "ty", "tz"])?;
    for point in trajectory {
        let mut row = vec![point.frame_id.0.to_string(), point.timestamp.to_string()];
        row.extend(point.extrinsics.to_array().iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}
