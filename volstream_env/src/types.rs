//! Common types exchanged between the engine and its collaborators.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a uuid newtype identifier with deterministic seeding support.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from a UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Creates a deterministic id from a seed (for simulation and tests).
            pub fn from_seed(seed: u64) -> Self {
                let mut bytes = [0u8; 16];
                bytes[0..8].copy_from_slice(&seed.to_be_bytes());
                bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
                Self(Uuid::from_bytes(bytes))
            }

            /// Returns the inner UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // First 8 chars are enough to tell ids apart in logs
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of a streamable volumetric object.
    EntityId
);

uuid_id!(
    /// Unique identifier of a connected viewer.
    ViewerId
);

/// Perspective projection parameters reported by the rendering/camera layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionParams {
    /// Vertical field of view in degrees
    pub fov_y_deg: f64,

    /// Viewport aspect ratio (width / height)
    pub aspect: f64,

    /// Near clip distance
    pub near: f64,

    /// Far clip distance
    pub far: f64,

    /// Viewport width in pixels
    pub viewport_width: u32,

    /// Viewport height in pixels
    pub viewport_height: u32,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            fov_y_deg: 60.0,
            aspect: 16.0 / 9.0,
            near: 0.3,
            far: 1000.0,
            viewport_width: 1920,
            viewport_height: 1080,
        }
    }
}

/// Motion update for one object from the tracking/physics layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub id: EntityId,

    /// Center position [x, y, z]
    pub position: [f64; 3],

    /// Velocity [vx, vy, vz] in units/s
    pub velocity: [f64; 3],

    /// Half size of the axis-aligned bounding box along each axis
    pub half_extents: [f64; 3],
}

/// Camera update for one viewer from the rendering/camera layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerUpdate {
    pub id: ViewerId,
    pub position: [f64; 3],
    pub forward: [f64; 3],
    pub up: [f64; 3],
    pub projection: ProjectionParams,
}

/// Available-bandwidth estimate for one viewer from the transport layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandwidthUpdate {
    pub viewer: ViewerId,

    /// Estimated available bandwidth (Mbps)
    pub available_mbps: f64,
}

/// Everything the engine consumes from its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrackingUpdate {
    Entity(EntityUpdate),
    EntityRemoved(EntityId),
    Viewer(ViewerUpdate),
    ViewerRemoved(ViewerId),
    Bandwidth(BandwidthUpdate),
}

/// Envelope carrying one serialized decision batch to the encoder/transport.
///
/// The payload is opaque to this crate; the engine decides the encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    /// Serialized decision batch
    pub payload: Vec<u8>,

    /// Wall-clock timestamp of publication (ms since UNIX epoch)
    pub timestamp_ms: u64,

    /// Snapshot version the batch was derived from
    pub version: u64,
}

impl DecisionEnvelope {
    /// Creates a new envelope from payload bytes.
    pub fn new(payload: Vec<u8>, timestamp_ms: u64, version: u64) -> Self {
        Self {
            payload,
            timestamp_ms,
            version,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
