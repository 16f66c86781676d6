//! Stage scenarios for the simulation harness.
//!
//! Each scenario populates the [`Oracle`] and returns a script of events
//! placed at fractions of the run duration, so shorter runs still play
//! every event.

use crate::oracle::{Motion, Oracle};
use nalgebra::{Point3, Vector3};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenarioId {
    /// VS-001: static group under fixed cameras
    Huddle,

    /// VS-002: two groups travelling in parallel
    Convoy,

    /// VS-003: entities orbiting a common center
    Carousel,

    /// VS-004: bouncing projectiles and oscillators
    Bounce,

    /// VS-005: large random-walk crowd, many viewers
    Crowd,

    /// VS-006: every viewer's bandwidth drops to zero
    BandwidthCollapse,

    /// VS-007: viewers leave, entities come and go
    ViewerChurn,

    /// VS-008: decision transport down for a window
    Blackout,

    /// VS-009: viewers but nothing to stream
    EmptyStage,
}

/// Something that happens to the stage mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StageEvent {
    SpawnEntity {
        position: Point3<f64>,
        half_extents: Vector3<f64>,
        motion: Motion,
    },
    RemoveEntity(u64),
    RemoveViewer(u64),
    SetBandwidth { viewer: u64, mbps: f64 },

    /// Sink starts (true) or stops (false) rejecting publishes
    SinkOutage(bool),
}

impl StageEvent {
    pub fn describe(&self) -> String {
        match self {
            StageEvent::SpawnEntity { position, .. } => {
                format!("entity spawned at ({:.1}, {:.1}, {:.1})", position.x, position.y, position.z)
            }
            StageEvent::RemoveEntity(id) => format!("entity {} removed", id),
            StageEvent::RemoveViewer(id) => format!("viewer {} left", id),
            StageEvent::SetBandwidth { viewer, mbps } => format!("viewer {} bandwidth → {:.2} Mbps", viewer, mbps),
            StageEvent::SinkOutage(true) => "decision transport down".to_string(),
            StageEvent::SinkOutage(false) => "decision transport restored".to_string(),
        }
    }
}

/// An event and when it fires, as a fraction of the run duration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScriptedEvent {
    pub at: f64,
    pub event: StageEvent,
}

impl ScriptedEvent {
    pub fn new(at: f64, event: StageEvent) -> Self {
        Self { at, event }
    }
}

/// Default entity half size.
const HALF: f64 = 0.2;

/// Default available bandwidth per viewer (Mbps).
const BANDWIDTH: f64 = 4.0;

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Huddle,
            ScenarioId::Convoy,
            ScenarioId::Carousel,
            ScenarioId::Bounce,
            ScenarioId::Crowd,
            ScenarioId::BandwidthCollapse,
            ScenarioId::ViewerChurn,
            ScenarioId::Blackout,
            ScenarioId::EmptyStage,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Huddle => "huddle",
            ScenarioId::Convoy => "convoy",
            ScenarioId::Carousel => "carousel",
            ScenarioId::Bounce => "bounce",
            ScenarioId::Crowd => "crowd",
            ScenarioId::BandwidthCollapse => "bandwidth_collapse",
            ScenarioId::ViewerChurn => "viewer_churn",
            ScenarioId::Blackout => "blackout",
            ScenarioId::EmptyStage => "empty_stage",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Huddle => "6 static entities watched by 2 fixed viewers",
            ScenarioId::Convoy => "Two groups moving in parallel past an orbiting viewer",
            ScenarioId::Carousel => "8 entities orbiting one center at different speeds",
            ScenarioId::Bounce => "Bouncing projectiles and harmonic oscillators",
            ScenarioId::Crowd => "200 random walkers, 6 orbiting viewers",
            ScenarioId::BandwidthCollapse => "All viewers drop to 0 Mbps halfway, one recovers",
            ScenarioId::ViewerChurn => "Viewers leave one by one while entities come and go",
            ScenarioId::Blackout => "Decision sink rejects publishes for 30% of the run",
            ScenarioId::EmptyStage => "Viewers connected, no entities",
        }
    }

    /// Populates the oracle and returns the event script, sorted by time.
    pub fn stage(&self, oracle: &mut Oracle, rng: &mut ChaCha8Rng) -> Vec<ScriptedEvent> {
        let half = Vector3::new(HALF, HALF, HALF);
        let mut script = Vec::new();

        match self {
            ScenarioId::Huddle | ScenarioId::Blackout | ScenarioId::BandwidthCollapse => {
                // Static stage under perfect tracking
                oracle.set_position_noise(0.0);
                let viewers = huddle(oracle);
                match self {
                    ScenarioId::Blackout => {
                        script.push(ScriptedEvent::new(0.3, StageEvent::SinkOutage(true)));
                        script.push(ScriptedEvent::new(0.6, StageEvent::SinkOutage(false)));
                    }
                    ScenarioId::BandwidthCollapse => {
                        for &viewer in &viewers {
                            script.push(ScriptedEvent::new(0.5, StageEvent::SetBandwidth { viewer, mbps: 0.0 }));
                        }
                        script.push(ScriptedEvent::new(
                            0.75,
                            StageEvent::SetBandwidth {
                                viewer: viewers[0],
                                mbps: 0.5,
                            },
                        ));
                    }
                    _ => {}
                }
            }
            ScenarioId::Convoy => {
                for (lane, speed) in [(0.0, 1.0), (2.0, 0.8)] {
                    for k in 0..4 {
                        oracle.spawn_entity(
                            Point3::new(-6.0 + k as f64 * 0.5, 0.0, lane),
                            half,
                            Motion::Linear {
                                velocity: Vector3::new(speed, 0.0, 0.0),
                            },
                        );
                    }
                }
                let viewer = oracle.spawn_viewer(Point3::new(0.0, 2.0, 6.0), Point3::new(0.0, 0.0, 1.0), BANDWIDTH);
                oracle.set_viewer_orbit(viewer, 0.2);
            }
            ScenarioId::Carousel => {
                for k in 0..8 {
                    let kf = k as f64;
                    let radius = 1.5 + (k % 4) as f64 * 0.5;
                    oracle.spawn_entity(
                        Point3::new(radius, 0.0, 0.0),
                        half,
                        Motion::Orbit {
                            center: Point3::origin(),
                            radius,
                            angular_speed: 0.5 + kf * 0.1,
                            phase: kf * std::f64::consts::FRAC_PI_4,
                        },
                    );
                }
                oracle.spawn_viewer(Point3::new(0.0, 3.0, 7.0), Point3::origin(), BANDWIDTH);
            }
            ScenarioId::Bounce => {
                for k in 0..3 {
                    let kf = k as f64;
                    oracle.spawn_entity(
                        Point3::new(-2.0 + kf, 0.0, 0.0),
                        half,
                        Motion::Projectile {
                            velocity: Vector3::new(0.3, 4.0 + kf, 0.0),
                            floor: 0.0,
                            restitution: 0.6,
                        },
                    );
                    let anchor = Point3::new(kf, 1.0, 2.0);
                    oracle.spawn_entity(
                        anchor,
                        half,
                        Motion::Harmonic {
                            anchor,
                            direction: Vector3::x(),
                            amplitude: 0.5,
                            frequency: 0.5,
                        },
                    );
                }
                oracle.spawn_viewer(Point3::new(0.0, 2.0, 8.0), Point3::new(0.0, 1.0, 1.0), BANDWIDTH);
            }
            ScenarioId::Crowd => {
                for _ in 0..200 {
                    let position = Point3::new(rng.gen_range(-10.0..10.0), 0.0, rng.gen_range(-10.0..10.0));
                    oracle.spawn_entity(
                        position,
                        half,
                        Motion::RandomWalk {
                            speed: 1.0,
                            randomness: 0.5,
                        },
                    );
                }
                for k in 0..6 {
                    let angle = k as f64 * std::f64::consts::PI / 3.0;
                    let viewer = oracle.spawn_viewer(
                        Point3::new(8.0 * angle.cos(), 2.0, 8.0 * angle.sin()),
                        Point3::origin(),
                        rng.gen_range(1.0..8.0),
                    );
                    oracle.set_viewer_orbit(viewer, 0.1);
                }
            }
            ScenarioId::ViewerChurn => {
                oracle.set_position_noise(0.0);
                let entities = huddle_entities(oracle);
                let viewers = [
                    oracle.spawn_viewer(Point3::new(0.4, 1.0, 5.0), Point3::new(0.4, 0.0, 0.2), BANDWIDTH),
                    oracle.spawn_viewer(Point3::new(-4.0, 1.0, 0.2), Point3::new(0.4, 0.0, 0.2), BANDWIDTH),
                    oracle.spawn_viewer(Point3::new(4.0, 1.0, -3.0), Point3::new(0.4, 0.0, 0.2), 2.0),
                ];
                script.push(ScriptedEvent::new(0.2, StageEvent::RemoveEntity(entities[0])));
                script.push(ScriptedEvent::new(0.3, StageEvent::RemoveViewer(viewers[0])));
                script.push(ScriptedEvent::new(0.4, StageEvent::RemoveViewer(viewers[1])));
                script.push(ScriptedEvent::new(
                    0.5,
                    StageEvent::SpawnEntity {
                        position: Point3::new(1.0, 0.0, 1.0),
                        half_extents: half,
                        motion: Motion::Static,
                    },
                ));
                script.push(ScriptedEvent::new(0.6, StageEvent::RemoveViewer(viewers[2])));
            }
            ScenarioId::EmptyStage => {
                oracle.spawn_viewer(Point3::new(0.0, 1.0, 5.0), Point3::origin(), BANDWIDTH);
                oracle.spawn_viewer(Point3::new(5.0, 1.0, 0.0), Point3::origin(), BANDWIDTH);
            }
        }

        script.sort_by(|a, b| a.at.total_cmp(&b.at));
        script
    }
}

/// 2×3 grid of static entities 0.4 apart.
fn huddle_entities(oracle: &mut Oracle) -> Vec<u64> {
    let half = Vector3::new(HALF, HALF, HALF);
    (0..6)
        .map(|i| {
            let position = Point3::new((i % 3) as f64 * 0.4, 0.0, (i / 3) as f64 * 0.4);
            oracle.spawn_entity(position, half, Motion::Static)
        })
        .collect()
}

/// Huddle grid plus two fixed viewers; returns the viewer ids.
fn huddle(oracle: &mut Oracle) -> Vec<u64> {
    huddle_entities(oracle);
    let target = Point3::new(0.4, 0.0, 0.2);
    vec![
        oracle.spawn_viewer(Point3::new(0.4, 1.0, 5.0), target, BANDWIDTH),
        oracle.spawn_viewer(Point3::new(-4.0, 1.0, 0.2), target, BANDWIDTH),
    ]
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "huddle" | "vs-001" => Ok(ScenarioId::Huddle),
            "convoy" | "vs-002" => Ok(ScenarioId::Convoy),
            "carousel" | "vs-003" => Ok(ScenarioId::Carousel),
            "bounce" | "vs-004" => Ok(ScenarioId::Bounce),
            "crowd" | "vs-005" => Ok(ScenarioId::Crowd),
            "bandwidth_collapse" | "bandwidthcollapse" | "vs-006" => Ok(ScenarioId::BandwidthCollapse),
            "viewer_churn" | "viewerchurn" | "vs-007" => Ok(ScenarioId::ViewerChurn),
            "blackout" | "vs-008" => Ok(ScenarioId::Blackout),
            "empty_stage" | "emptystage" | "vs-009" => Ok(ScenarioId::EmptyStage),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("VS-005".parse::<ScenarioId>().unwrap(), ScenarioId::Crowd);
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_stage_population() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut oracle = Oracle::new(1);
        assert!(ScenarioId::Huddle.stage(&mut oracle, &mut rng).is_empty());
        assert_eq!(oracle.active_entity_count(), 6);
        assert_eq!(oracle.active_viewers().count(), 2);

        let mut oracle = Oracle::new(1);
        ScenarioId::Crowd.stage(&mut oracle, &mut rng);
        assert_eq!(oracle.active_entity_count(), 200);
        assert_eq!(oracle.active_viewers().count(), 6);

        let mut oracle = Oracle::new(1);
        ScenarioId::EmptyStage.stage(&mut oracle, &mut rng);
        assert_eq!(oracle.active_entity_count(), 0);
    }

    #[test]
    fn test_scripts_are_sorted_and_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for scenario in ScenarioId::all() {
            let script = scenario.stage(&mut Oracle::new(1), &mut rng);
            assert!(script.windows(2).all(|w| w[0].at <= w[1].at));
            assert!(script.iter().all(|e| (0.0..1.0).contains(&e.at)));
        }
    }
}
