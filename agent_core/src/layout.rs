//! Seeded population of a [`ResourceField`] from cluster descriptions.

use std::f32::consts::TAU;
use std::{fs, io, path::Path, path::PathBuf};

use bevy::math::Vec2;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource_field::{NodeDrop, NodeMetadata, ResourceField, ResourceFieldError, UpsertNodeOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLayout {
    pub seed: u64,
    pub clusters: Vec<ClusterSpec>,
}

/// Nodes scattered uniformly over a disc.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub center: Vec2,
    pub radius: f32,
    pub count: u32,
    pub quantity: QuantityBand,
    pub hit_points: Option<u32>,
    pub required_tool: Option<String>,
    pub drop: Option<NodeDrop>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            resource_type: String::new(),
            center: Vec2::ZERO,
            radius: 0.0,
            count: 1,
            quantity: QuantityBand::default(),
            hit_points: None,
            required_tool: None,
            drop: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantityBand {
    pub min: f32,
    pub max: f32,
}

impl Default for QuantityBand {
    fn default() -> Self {
        Self { min: 1.0, max: 1.0 }
    }
}

impl QuantityBand {
    fn sample(&self, rng: &mut SmallRng) -> f32 {
        if self.min == self.max {
            self.min
        } else if self.min > self.max {
            rng.gen_range(self.max..=self.min)
        } else {
            rng.gen_range(self.min..=self.max)
        }
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("failed to parse field layout: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read field layout from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cluster {index} is invalid: {reason}")]
    InvalidCluster { index: usize, reason: String },
    #[error("cluster {index} produced an invalid node: {source}")]
    Node {
        index: usize,
        #[source]
        source: ResourceFieldError,
    },
}

impl FieldLayout {
    pub fn from_json_str(json: &str) -> Result<Self, LayoutError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, LayoutError> {
        let contents = fs::read_to_string(path).map_err(|source| LayoutError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Inserts every cluster's nodes into `field`; returns the number inserted.
    ///
    /// The same seed and clusters always produce the same nodes and ids when
    /// applied to an empty field.
    pub fn populate(&self, field: &mut ResourceField) -> Result<usize, LayoutError> {
        for (index, cluster) in self.clusters.iter().enumerate() {
            cluster.validate(index)?;
        }

        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut inserted = 0;
        for (index, cluster) in self.clusters.iter().enumerate() {
            for _ in 0..cluster.count {
                let angle = rng.gen_range(0.0..TAU);
                let distance = cluster.radius * rng.gen::<f32>().sqrt();
                let position = cluster.center + Vec2::from_angle(angle) * distance;
                let metadata = cluster.metadata();
                let quantity = match cluster.hit_points {
                    Some(hit_points) => hit_points as f32,
                    None => cluster.quantity.sample(&mut rng),
                };

                let mut options = UpsertNodeOptions::new(cluster.resource_type.clone(), position, quantity);
                if let Some(metadata) = metadata {
                    options = options.with_metadata(metadata);
                }
                field
                    .upsert_node(options)
                    .map_err(|source| LayoutError::Node { index, source })?;
                inserted += 1;
            }
        }
        tracing::debug!(target: "rover::field", seed = self.seed, inserted, "layout.populated");
        Ok(inserted)
    }
}

impl ClusterSpec {
    fn validate(&self, index: usize) -> Result<(), LayoutError> {
        let invalid = |reason: &str| LayoutError::InvalidCluster {
            index,
            reason: reason.to_string(),
        };
        if self.resource_type.trim().is_empty() {
            return Err(invalid("type is empty"));
        }
        if !self.center.is_finite() || !self.radius.is_finite() || self.radius < 0.0 {
            return Err(invalid("center and radius must be finite with radius >= 0"));
        }
        if self.hit_points == Some(0) {
            return Err(invalid("hit_points must be positive"));
        }
        let band = &self.quantity;
        if self.hit_points.is_none() && !(band.min.is_finite() && band.max.is_finite() && band.min > 0.0 && band.max > 0.0) {
            return Err(invalid("quantity band must be positive"));
        }
        Ok(())
    }

    fn metadata(&self) -> Option<NodeMetadata> {
        let hit_points = self.hit_points?;
        let mut metadata = NodeMetadata::hit_gated(hit_points);
        metadata.required_tool = self.required_tool.clone();
        metadata.drop = self.drop.clone();
        Some(metadata)
    }
}
