//! JSON exporter for offline inspection of a run.
//!
//! One frame per published cycle: true entity positions with their cluster
//! labels, viewer cameras and per-cluster decisions.

use crate::oracle::Oracle;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use volstream_core::{ClusterSnapshot, LodLevel};
use volstream_env::EntityId;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Snapshot version shown in this frame
    pub version: u64,

    pub epsilon: f64,
    pub entities: Vec<EntityFrame>,
    pub viewers: Vec<ViewerFrame>,
    pub clusters: Vec<ClusterFrame>,

    /// Scripted events applied since the previous frame
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

impl SimFrame {
    /// Captures the oracle's ground truth labelled with a snapshot.
    pub fn capture(oracle: &Oracle, snapshot: &ClusterSnapshot, events: Vec<SimEvent>) -> Self {
        Self {
            time_sec: oracle.time(),
            version: snapshot.version,
            epsilon: snapshot.epsilon,
            entities: oracle
                .active_entities()
                .map(|e| EntityFrame::new(e.id, e.position, snapshot.label_of(&EntityId::from_seed(e.id)).as_raw()))
                .collect(),
            viewers: oracle
                .active_viewers()
                .map(|v| ViewerFrame {
                    id: v.id,
                    x: v.position.x,
                    y: v.position.y,
                    z: v.position.z,
                    bandwidth_mbps: v.bandwidth_mbps,
                })
                .collect(),
            clusters: snapshot
                .clusters
                .iter()
                .map(|c| ClusterFrame {
                    id: c.id,
                    size: c.len(),
                    main_entity: c.main_entity.to_string(),
                    quality: c.quality,
                    resolution: (c.tier.width, c.tier.height),
                    fps: c.tier.fps,
                    lod: c.lod,
                    viewers: c.visible_viewers.len(),
                })
                .collect(),
            events,
        }
    }
}

/// Position and label of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityFrame {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,

    /// 0 unclassified, -1 noise, k cluster
    pub label: i64,
}

impl EntityFrame {
    pub fn new(id: u64, pos: Point3<f64>, label: i64) -> Self {
        Self {
            id,
            x: pos.x,
            y: pos.y,
            z: pos.z,
            label,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerFrame {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub bandwidth_mbps: f64,
}

/// Decision summary for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterFrame {
    pub id: u32,
    pub size: usize,
    pub main_entity: String,
    pub quality: f64,
    pub resolution: (u32, u32),
    pub fps: u32,
    pub lod: LodLevel,
    pub viewers: usize,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    pub strategy: String,
    pub duration_sec: f64,
    pub frames: Vec<SimFrame>,
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64, strategy: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            strategy: strategy.to_string(),
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Motion;
    use nalgebra::Vector3;

    #[test]
    fn test_capture_labels_unclassified_before_first_cycle() {
        let mut oracle = Oracle::new(1);
        oracle.spawn_entity(Point3::new(1.0, 2.0, 3.0), Vector3::new(0.2, 0.2, 0.2), Motion::Static);
        oracle.spawn_viewer(Point3::new(0.0, 0.0, 5.0), Point3::origin(), 4.0);

        let frame = SimFrame::capture(&oracle, &ClusterSnapshot::empty(), vec![SimEvent::info("start")]);
        assert_eq!(frame.version, 0);
        assert_eq!(frame.entities.len(), 1);
        assert_eq!(frame.entities[0].x, 1.0);
        assert_eq!(frame.viewers[0].bandwidth_mbps, 4.0);
        assert!(frame.clusters.is_empty());
        assert_eq!(frame.events.len(), 1);
    }

    #[test]
    fn test_export_writes_json() {
        let mut export = SimExport::new("huddle", 42, "graph");
        let oracle = Oracle::new(1);
        export.add_frame(SimFrame::capture(&oracle, &ClusterSnapshot::empty(), Vec::new()));
        export.finalize(true, None);

        let path = std::env::temp_dir().join("volstream_export_test.json");
        let path = path.to_str().unwrap();
        export.write_to_file(path).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["scenario"], "huddle");
        assert_eq!(parsed["frames"].as_array().unwrap().len(), 1);
        assert!(parsed.get("failure_reason").is_none());
        // Empty event lists are omitted
        assert!(parsed["frames"][0].get("events").is_none());
    }
}
