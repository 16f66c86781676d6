//! Ground truth oracle for simulation.
//!
//! The Oracle owns the true state of the simulated stage:
//! - Entity kinematics driven by per-entity motion models
//! - Viewer cameras, optionally orbiting a point of interest
//! - Per-viewer available bandwidth with seeded jitter
//! - Tracking updates generated from all of the above with Gaussian noise

use nalgebra::{Point3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use volstream_env::{
    BandwidthUpdate, EntityId, EntityUpdate, ProjectionParams, TrackingUpdate, ViewerId, ViewerUpdate,
};

/// Gravity along -y (units/s²).
const GRAVITY: f64 = -9.81;

/// How an entity moves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Motion {
    Static,

    /// Constant velocity
    Linear { velocity: Vector3<f64> },

    /// Circle in the horizontal plane around `center`
    Orbit {
        center: Point3<f64>,
        radius: f64,
        /// rad/s
        angular_speed: f64,
        phase: f64,
    },

    /// Oscillation about `anchor` along `direction`
    Harmonic {
        anchor: Point3<f64>,
        direction: Vector3<f64>,
        amplitude: f64,
        /// Hz
        frequency: f64,
    },

    /// Horizontal jitter of up to `randomness` per step, scaled by `speed`
    RandomWalk { speed: f64, randomness: f64 },

    /// Ballistic flight bouncing on the launch height
    Projectile {
        velocity: Vector3<f64>,
        floor: f64,
        /// Fraction of vertical speed kept per bounce
        restitution: f64,
    },
}

/// A ground truth entity in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEntity {
    pub id: u64,
    pub position: Point3<f64>,

    /// Finite-difference velocity over the last step
    pub velocity: Vector3<f64>,

    pub half_extents: Vector3<f64>,
    pub motion: Motion,
    pub active: bool,
}

impl SimEntity {
    fn advance(&mut self, t: f64, dt: f64, rng: &mut ChaCha8Rng) {
        let previous = self.position;

        match &mut self.motion {
            Motion::Static => {}
            Motion::Linear { velocity } => self.position += *velocity * dt,
            Motion::Orbit {
                center,
                radius,
                angular_speed,
                phase,
            } => {
                let angle = *phase + *angular_speed * t;
                self.position = Point3::new(
                    center.x + angle.cos() * *radius,
                    self.position.y,
                    center.z + angle.sin() * *radius,
                );
            }
            Motion::Harmonic {
                anchor,
                direction,
                amplitude,
                frequency,
            } => {
                let offset = (2.0 * std::f64::consts::PI * *frequency * t).sin() * *amplitude;
                self.position = *anchor + *direction * offset;
            }
            Motion::RandomWalk { speed, randomness } => {
                let step = random_in_unit_disc(rng) * *randomness * *speed;
                self.position += Vector3::new(step.x, 0.0, step.y) * dt;
            }
            Motion::Projectile {
                velocity,
                floor,
                restitution,
            } => {
                velocity.y += GRAVITY * dt;
                self.position += *velocity * dt;
                if self.position.y < *floor {
                    self.position.y = *floor + (*floor - self.position.y) * *restitution;
                    velocity.y = -velocity.y * *restitution;
                }
            }
        }

        if dt > 0.0 {
            self.velocity = (self.position - previous) / dt;
        }
    }
}

/// A simulated viewer camera and its connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimViewer {
    pub id: u64,
    pub position: Point3<f64>,

    /// Point the camera looks at
    pub target: Point3<f64>,

    /// Orbit radius and angular speed around `target` (None: fixed camera)
    pub orbit: Option<(f64, f64)>,

    /// Mean available bandwidth (Mbps)
    pub bandwidth_mbps: f64,

    /// Relative standard deviation of each bandwidth estimate
    pub bandwidth_jitter: f64,

    pub active: bool,
}

impl SimViewer {
    fn forward(&self) -> Vector3<f64> {
        let dir = self.target - self.position;
        if dir.norm() > 1e-9 {
            dir.normalize()
        } else {
            -Vector3::z()
        }
    }
}

/// The Oracle - maintains ground truth and generates tracking updates.
pub struct Oracle {
    physics_rng: ChaCha8Rng,
    entities: BTreeMap<u64, SimEntity>,
    viewers: BTreeMap<u64, SimViewer>,
    next_entity: u64,
    next_viewer: u64,

    /// Removals not yet reported as updates
    removed_entities: Vec<u64>,
    removed_viewers: Vec<u64>,

    current_time: f64,
    position_noise: Option<Normal<f64>>,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64) -> Self {
        let mut oracle = Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            entities: BTreeMap::new(),
            viewers: BTreeMap::new(),
            next_entity: 1,
            next_viewer: 1,
            removed_entities: Vec::new(),
            removed_viewers: Vec::new(),
            current_time: 0.0,
            position_noise: None,
        };
        oracle.set_position_noise(0.02);
        oracle
    }

    /// Standard deviation of tracking noise; zero disables it.
    pub fn set_position_noise(&mut self, std_dev: f64) {
        self.position_noise = if std_dev > 0.0 {
            Normal::new(0.0, std_dev).ok()
        } else {
            None
        };
    }

    pub fn spawn_entity(&mut self, position: Point3<f64>, half_extents: Vector3<f64>, motion: Motion) -> u64 {
        let id = self.next_entity;
        self.next_entity += 1;
        let velocity = match motion {
            Motion::Linear { velocity } | Motion::Projectile { velocity, .. } => velocity,
            _ => Vector3::zeros(),
        };
        self.entities.insert(
            id,
            SimEntity {
                id,
                position,
                velocity,
                half_extents,
                motion,
                active: true,
            },
        );
        id
    }

    pub fn remove_entity(&mut self, id: u64) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.active {
                entity.active = false;
                self.removed_entities.push(id);
            }
        }
    }

    pub fn spawn_viewer(&mut self, position: Point3<f64>, target: Point3<f64>, bandwidth_mbps: f64) -> u64 {
        let id = self.next_viewer;
        self.next_viewer += 1;
        self.viewers.insert(
            id,
            SimViewer {
                id,
                position,
                target,
                orbit: None,
                bandwidth_mbps,
                bandwidth_jitter: 0.05,
                active: true,
            },
        );
        id
    }

    /// Makes a viewer circle its target at its current distance.
    pub fn set_viewer_orbit(&mut self, id: u64, angular_speed: f64) {
        if let Some(viewer) = self.viewers.get_mut(&id) {
            let offset = viewer.position - viewer.target;
            let radius = Vector3::new(offset.x, 0.0, offset.z).norm();
            viewer.orbit = Some((radius, angular_speed));
        }
    }

    pub fn set_bandwidth(&mut self, id: u64, mbps: f64) {
        if let Some(viewer) = self.viewers.get_mut(&id) {
            viewer.bandwidth_mbps = mbps;
        }
    }

    pub fn remove_viewer(&mut self, id: u64) {
        if let Some(viewer) = self.viewers.get_mut(&id) {
            if viewer.active {
                viewer.active = false;
                self.removed_viewers.push(id);
            }
        }
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        let t = self.current_time;

        for entity in self.entities.values_mut().filter(|e| e.active) {
            entity.advance(t, dt, &mut self.physics_rng);
        }

        for viewer in self.viewers.values_mut().filter(|v| v.active) {
            if let Some((radius, angular_speed)) = viewer.orbit {
                let offset = viewer.position - viewer.target;
                let angle = offset.z.atan2(offset.x) + angular_speed * dt;
                viewer.position = Point3::new(
                    viewer.target.x + angle.cos() * radius,
                    viewer.position.y,
                    viewer.target.z + angle.sin() * radius,
                );
            }
        }
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn entity(&self, id: u64) -> Option<&SimEntity> {
        self.entities.get(&id)
    }

    pub fn viewer(&self, id: u64) -> Option<&SimViewer> {
        self.viewers.get(&id)
    }

    pub fn active_entities(&self) -> impl Iterator<Item = &SimEntity> {
        self.entities.values().filter(|e| e.active)
    }

    pub fn active_viewers(&self) -> impl Iterator<Item = &SimViewer> {
        self.viewers.values().filter(|v| v.active)
    }

    pub fn active_entity_count(&self) -> usize {
        self.active_entities().count()
    }

    /// Tracking updates for this step: removals first, then noisy entity
    /// positions, viewer cameras and bandwidth estimates.
    pub fn updates(&mut self) -> Vec<TrackingUpdate> {
        let mut updates: Vec<TrackingUpdate> = self
            .removed_entities
            .drain(..)
            .map(|id| TrackingUpdate::EntityRemoved(EntityId::from_seed(id)))
            .chain(
                self.removed_viewers
                    .drain(..)
                    .map(|id| TrackingUpdate::ViewerRemoved(ViewerId::from_seed(id))),
            )
            .collect();

        for entity in self.entities.values().filter(|e| e.active) {
            let noise = match &self.position_noise {
                Some(normal) => Vector3::new(
                    normal.sample(&mut self.physics_rng),
                    normal.sample(&mut self.physics_rng),
                    normal.sample(&mut self.physics_rng),
                ),
                None => Vector3::zeros(),
            };
            let position = entity.position + noise;
            updates.push(TrackingUpdate::Entity(EntityUpdate {
                id: EntityId::from_seed(entity.id),
                position: [position.x, position.y, position.z],
                velocity: [entity.velocity.x, entity.velocity.y, entity.velocity.z],
                half_extents: [entity.half_extents.x, entity.half_extents.y, entity.half_extents.z],
            }));
        }

        for viewer in self.viewers.values().filter(|v| v.active) {
            let forward = viewer.forward();
            updates.push(TrackingUpdate::Viewer(ViewerUpdate {
                id: ViewerId::from_seed(viewer.id),
                position: [viewer.position.x, viewer.position.y, viewer.position.z],
                forward: [forward.x, forward.y, forward.z],
                up: [0.0, 1.0, 0.0],
                projection: ProjectionParams::default(),
            }));

            let factor = match Normal::new(1.0, viewer.bandwidth_jitter) {
                Ok(normal) if viewer.bandwidth_jitter > 0.0 => normal.sample(&mut self.physics_rng),
                _ => 1.0,
            };
            updates.push(TrackingUpdate::Bandwidth(BandwidthUpdate {
                viewer: ViewerId::from_seed(viewer.id),
                available_mbps: (viewer.bandwidth_mbps * factor).max(0.0),
            }));
        }

        updates
    }

    /// True positions for error and export.
    pub fn ground_truth_positions(&self) -> Vec<(u64, Point3<f64>)> {
        self.active_entities().map(|e| (e.id, e.position)).collect()
    }
}

/// Uniform sample in the unit disc.
fn random_in_unit_disc(rng: &mut ChaCha8Rng) -> nalgebra::Vector2<f64> {
    loop {
        let v = nalgebra::Vector2::new(rng.gen_range(-1.0..=1.0), rng.gen_range(-1.0..=1.0));
        if v.norm_squared() <= 1.0 {
            return v;
        }
    }
}
