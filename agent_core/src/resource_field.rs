//! Spatial registry of harvestable resource nodes.
//!
//! Query and mutation outcomes that are ordinary simulation events (out of
//! range, wrong tool, already depleted) are reported through result statuses.
//! Only malformed input to [`ResourceField::upsert_node`] is an error.

use std::collections::BTreeMap;
use std::fmt;

use bevy::math::Vec2;
use bevy::prelude::Resource;
use crossbeam_channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::navigator::wrap_angle;

pub const DEFAULT_SCAN_FOV_DEGREES: f32 = 90.0;
pub const MIN_SCAN_FOV_DEGREES: f32 = 15.0;
pub const MAX_SCAN_FOV_DEGREES: f32 = 180.0;
pub const DEFAULT_SCAN_MAX_RESULTS: usize = 6;
pub const DEFAULT_HARVEST_DISTANCE: f32 = 200.0;
/// Radius within which a spawned drop merges into an existing pile.
pub const DROP_MERGE_RADIUS: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDrop {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub quantity: f32,
}

/// Optional per-node metadata; the hit fields make a node hit-gated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_points: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hits_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop: Option<NodeDrop>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeMetadata {
    pub fn hit_gated(hit_points: u32) -> Self {
        Self {
            hit_points: Some(hit_points),
            hits_remaining: Some(hit_points),
            ..Self::default()
        }
    }

    pub fn with_required_tool(mut self, tool: impl Into<String>) -> Self {
        self.required_tool = Some(tool.into());
        self
    }

    pub fn with_drop(mut self, resource_type: impl Into<String>, quantity: f32) -> Self {
        self.drop = Some(NodeDrop {
            resource_type: resource_type.into(),
            quantity,
        });
        self
    }

    pub fn is_hit_gated(&self) -> bool {
        self.hit_points.is_some() || self.hits_remaining.is_some()
    }

    /// Shallow merge where incoming keys win. Incoming `hit_points` without
    /// `hits_remaining` resets the remaining hits to the new hit points.
    fn merge(&mut self, incoming: NodeMetadata) {
        let reset_hits = incoming.hit_points.is_some() && incoming.hits_remaining.is_none();
        if incoming.hit_points.is_some() {
            self.hit_points = incoming.hit_points;
        }
        if incoming.hits_remaining.is_some() {
            self.hits_remaining = incoming.hits_remaining;
        }
        if reset_hits {
            self.hits_remaining = self.hit_points;
        }
        if incoming.required_tool.is_some() {
            self.required_tool = incoming.required_tool;
        }
        if incoming.drop.is_some() {
            self.drop = incoming.drop;
        }
        self.extra.extend(incoming.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub position: Vec2,
    /// For hit-gated nodes this mirrors `hits_remaining`.
    pub quantity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeMetadata>,
}

impl ResourceNode {
    pub fn is_hit_gated(&self) -> bool {
        self.metadata.as_ref().is_some_and(NodeMetadata::is_hit_gated)
    }

    pub fn hits_remaining(&self) -> Option<u32> {
        let metadata = self.metadata.as_ref()?;
        metadata.hits_remaining.or(metadata.hit_points)
    }

    /// Settles `hits_remaining` and copies it into `quantity` on hit-gated nodes.
    fn sync_hit_quantity(&mut self) {
        let Some(metadata) = self.metadata.as_mut().filter(|metadata| metadata.is_hit_gated()) else {
            return;
        };
        let hits = metadata.hits_remaining.or(metadata.hit_points).unwrap_or(0);
        metadata.hits_remaining = Some(hits);
        self.quantity = hits as f32;
    }

    fn matches_type(&self, resource_type: &str) -> bool {
        self.resource_type.eq_ignore_ascii_case(resource_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertNodeOptions {
    pub id: Option<String>,
    pub resource_type: String,
    pub position: Vec2,
    pub quantity: f32,
    pub metadata: Option<NodeMetadata>,
    /// Same-type nodes within this radius absorb the insert; `0` disables merging.
    pub merge_radius: f32,
}

impl UpsertNodeOptions {
    pub fn new(resource_type: impl Into<String>, position: Vec2, quantity: f32) -> Self {
        Self {
            id: None,
            resource_type: resource_type.into(),
            position,
            quantity,
            metadata: None,
            merge_radius: 0.0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_merge_radius(mut self, radius: f32) -> Self {
        self.merge_radius = radius;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceFieldError {
    #[error("resource type cannot be empty")]
    EmptyType,
    #[error("node position must be finite, got ({x}, {y})")]
    NonFinitePosition { x: f32, y: f32 },
    #[error("node quantity must be a positive finite number, got {0}")]
    InvalidQuantity(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldEventKind {
    Added,
    Updated,
    Depleted,
    Restored,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceFieldEvent {
    pub kind: FieldEventKind,
    pub node: ResourceNode,
}

pub type FieldListener = Box<dyn FnMut(&ResourceFieldEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub origin: Vec2,
    /// Facing in radians.
    pub orientation: f32,
    pub range: f32,
    pub fov_degrees: Option<f32>,
    pub max_results: Option<usize>,
    pub resource_type: Option<String>,
}

impl ScanOptions {
    pub fn new(origin: Vec2, orientation: f32, range: f32) -> Self {
        Self {
            origin,
            orientation,
            range,
            fov_degrees: None,
            max_results: None,
            resource_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanHit {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub quantity: f32,
    pub distance: f32,
    pub position: Vec2,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub hits: Vec<ScanHit>,
    /// Number of matches before truncation to the result cap.
    #[serde(default)]
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarvestOptions {
    pub node_id: String,
    pub amount: f32,
    pub origin: Option<Vec2>,
    pub max_distance: Option<f32>,
}

impl HarvestOptions {
    pub fn new(node_id: impl Into<String>, amount: f32) -> Self {
        Self {
            node_id: node_id.into(),
            amount,
            origin: None,
            max_distance: None,
        }
    }

    pub fn from_origin(mut self, origin: Vec2) -> Self {
        self.origin = Some(origin);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HarvestStatus {
    Ok,
    Depleted,
    OutOfRange,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestResult {
    pub status: HarvestStatus,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    pub harvested: f32,
    pub remaining: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HitOptions {
    pub node_id: String,
    pub tool: Option<String>,
    pub origin: Option<Vec2>,
    pub max_distance: Option<f32>,
}

impl HitOptions {
    pub fn new(node_id: impl Into<String>, tool: Option<String>) -> Self {
        Self {
            node_id: node_id.into(),
            tool,
            origin: None,
            max_distance: None,
        }
    }

    pub fn from_origin(mut self, origin: Vec2) -> Self {
        self.origin = Some(origin);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitStatus {
    Ok,
    Depleted,
    InvalidTool,
    OutOfRange,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitResult {
    pub status: HitStatus,
    pub node_id: String,
    pub remaining: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop: Option<ResourceNode>,
}

/// Registry of resource nodes keyed by id; iteration order is id order.
#[derive(Resource, Default)]
pub struct ResourceField {
    nodes: BTreeMap<String, ResourceNode>,
    listeners: Vec<(ListenerId, FieldListener)>,
    next_listener: u64,
    next_serial: u64,
}

impl fmt::Debug for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceField")
            .field("nodes", &self.nodes)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ResourceField {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every node in id order.
    pub fn list(&self) -> Vec<ResourceNode> {
        self.nodes.values().cloned().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registers a change listener. Listeners run synchronously inside the
    /// mutating call.
    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&ResourceFieldEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(candidate, _)| *candidate != id);
        self.listeners.len() != before
    }

    /// Subscribes a listener that forwards every event into a channel.
    pub fn event_channel(&mut self) -> (ListenerId, Receiver<ResourceFieldEvent>) {
        let (sender, receiver) = unbounded();
        let id = self.subscribe(move |event| {
            let _ = sender.send(event.clone());
        });
        (id, receiver)
    }

    /// Nearest node with positive quantity, optionally restricted to a type.
    pub fn nearest_node(&self, point: Vec2, resource_type: Option<&str>) -> Option<&ResourceNode> {
        let mut best: Option<(&ResourceNode, f32)> = None;
        for node in self.nodes.values() {
            if node.quantity <= 0.0 {
                continue;
            }
            if let Some(filter) = resource_type {
                if !node.matches_type(filter) {
                    continue;
                }
            }
            let distance = node.position.distance(point);
            if best.map_or(true, |(_, current)| distance < current) {
                best = Some((node, distance));
            }
        }
        best.map(|(node, _)| node)
    }

    pub fn upsert_node(&mut self, options: UpsertNodeOptions) -> Result<ResourceNode, ResourceFieldError> {
        let resource_type = options.resource_type.trim();
        if resource_type.is_empty() {
            return Err(ResourceFieldError::EmptyType);
        }
        if !options.position.is_finite() {
            return Err(ResourceFieldError::NonFinitePosition {
                x: options.position.x,
                y: options.position.y,
            });
        }
        if !options.quantity.is_finite() || options.quantity <= 0.0 {
            return Err(ResourceFieldError::InvalidQuantity(options.quantity));
        }

        let merge_target = options
            .id
            .as_ref()
            .filter(|id| self.nodes.contains_key(id.as_str()))
            .cloned()
            .or_else(|| {
                if options.merge_radius > 0.0 {
                    self.merge_candidate(resource_type, options.position, options.merge_radius)
                } else {
                    None
                }
            });

        if let Some(id) = merge_target {
            let Some(node) = self.nodes.get_mut(&id) else {
                unreachable!("merge target resolved from existing ids");
            };
            node.quantity += options.quantity;
            if let Some(incoming) = options.metadata {
                node.metadata
                    .get_or_insert_with(NodeMetadata::default)
                    .merge(incoming);
            }
            node.sync_hit_quantity();
            let snapshot = node.clone();
            debug!(target: "rover::field", node = %snapshot.id, quantity = snapshot.quantity, "node.merged");
            self.emit(FieldEventKind::Updated, snapshot.clone());
            return Ok(snapshot);
        }

        let id = match options.id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => self.generate_id(resource_type),
        };
        let metadata = options.metadata.map(|incoming| {
            let mut metadata = NodeMetadata::default();
            metadata.merge(incoming);
            metadata
        });
        let mut node = ResourceNode {
            id: id.clone(),
            resource_type: resource_type.to_string(),
            position: options.position,
            quantity: options.quantity,
            metadata,
        };
        node.sync_hit_quantity();
        self.nodes.insert(id, node.clone());
        debug!(target: "rover::field", node = %node.id, kind = %node.resource_type, "node.added");
        self.emit(FieldEventKind::Added, node.clone());
        Ok(node)
    }

    pub fn remove_node(&mut self, id: &str) -> bool {
        match self.nodes.remove(id) {
            Some(node) => {
                self.emit(FieldEventKind::Removed, node);
                true
            }
            None => false,
        }
    }

    /// Cone query from `origin` along `orientation`.
    pub fn scan(&self, options: &ScanOptions) -> ScanResult {
        let fov = options
            .fov_degrees
            .filter(|fov| fov.is_finite())
            .unwrap_or(DEFAULT_SCAN_FOV_DEGREES)
            .clamp(MIN_SCAN_FOV_DEGREES, MAX_SCAN_FOV_DEGREES);
        let half_fov = fov.to_radians() * 0.5;
        let range = if options.range.is_nan() { 0.0 } else { options.range.max(0.0) };
        let max_results = options.max_results.unwrap_or(DEFAULT_SCAN_MAX_RESULTS).max(1);
        let filter = options
            .resource_type
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let mut hits: Vec<ScanHit> = self
            .nodes
            .values()
            .filter(|node| node.quantity > 0.0)
            .filter(|node| filter.as_deref().map_or(true, |kind| node.matches_type(kind)))
            .filter_map(|node| {
                let offset = node.position - options.origin;
                let distance = offset.length();
                if distance > range {
                    return None;
                }
                if distance > f32::EPSILON {
                    let bearing = offset.y.atan2(offset.x);
                    if wrap_angle(bearing - options.orientation).abs() > half_fov + 1e-6 {
                        return None;
                    }
                }
                Some(ScanHit {
                    id: node.id.clone(),
                    resource_type: node.resource_type.clone(),
                    quantity: node.quantity,
                    distance,
                    position: node.position,
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        let total = hits.len();
        hits.truncate(max_results);

        ScanResult { filter, hits, total }
    }

    /// Continuous depletion.
    pub fn harvest(&mut self, options: HarvestOptions) -> HarvestResult {
        let Some(node) = self.nodes.get_mut(&options.node_id) else {
            return HarvestResult {
                status: HarvestStatus::NotFound,
                node_id: options.node_id,
                resource_type: None,
                harvested: 0.0,
                remaining: 0.0,
            };
        };

        let mut result = HarvestResult {
            status: HarvestStatus::Ok,
            node_id: node.id.clone(),
            resource_type: Some(node.resource_type.clone()),
            harvested: 0.0,
            remaining: node.quantity.max(0.0),
        };

        if let Some(origin) = options.origin {
            let max_distance = options.max_distance.unwrap_or(DEFAULT_HARVEST_DISTANCE);
            if node.position.distance(origin) > max_distance {
                result.status = HarvestStatus::OutOfRange;
                return result;
            }
        }
        if node.quantity <= 0.0 {
            result.status = HarvestStatus::Depleted;
            return result;
        }

        let requested = if options.amount.is_finite() { options.amount.max(0.0) } else { 0.0 };
        let taken = requested.min(node.quantity);
        node.quantity = (node.quantity - taken).max(0.0);
        result.harvested = taken;
        result.remaining = node.quantity;

        let snapshot = node.clone();
        if snapshot.quantity > 0.0 {
            self.emit(FieldEventKind::Updated, snapshot);
        } else {
            result.status = HarvestStatus::Depleted;
            debug!(target: "rover::field", node = %snapshot.id, "node.depleted");
            self.emit(FieldEventKind::Depleted, snapshot);
        }
        result
    }

    /// Discrete depletion for tool-gated nodes; plain nodes lose one unit per hit.
    pub fn register_hit(&mut self, options: HitOptions) -> HitResult {
        let Some(node) = self.nodes.get_mut(&options.node_id) else {
            return HitResult {
                status: HitStatus::NotFound,
                node_id: options.node_id,
                remaining: 0.0,
                drop: None,
            };
        };

        let mut result = HitResult {
            status: HitStatus::Ok,
            node_id: node.id.clone(),
            remaining: node.quantity.max(0.0),
            drop: None,
        };

        if let Some(origin) = options.origin {
            let max_distance = options.max_distance.unwrap_or(DEFAULT_HARVEST_DISTANCE);
            if node.position.distance(origin) > max_distance {
                result.status = HitStatus::OutOfRange;
                return result;
            }
        }

        let pending_drop = match node.metadata.as_mut().filter(|metadata| metadata.is_hit_gated()) {
            None => {
                if node.quantity <= 0.0 {
                    result.status = HitStatus::Depleted;
                    return result;
                }
                node.quantity = (node.quantity - 1.0).max(0.0);
                None
            }
            Some(metadata) => {
                if let Some(required) = metadata.required_tool.as_deref() {
                    let matches = options
                        .tool
                        .as_deref()
                        .is_some_and(|tool| tool.trim().eq_ignore_ascii_case(required.trim()));
                    if !matches {
                        result.status = HitStatus::InvalidTool;
                        return result;
                    }
                }
                let hits = metadata.hits_remaining.or(metadata.hit_points).unwrap_or(0);
                if hits == 0 {
                    result.status = HitStatus::Depleted;
                    return result;
                }
                let hits = hits - 1;
                metadata.hits_remaining = Some(hits);
                node.quantity = hits as f32;
                if hits == 0 {
                    metadata.drop.clone()
                } else {
                    None
                }
            }
        };

        let snapshot = node.clone();
        result.remaining = snapshot.quantity;
        if snapshot.quantity > 0.0 {
            self.emit(FieldEventKind::Updated, snapshot);
            return result;
        }

        result.status = HitStatus::Depleted;
        let position = snapshot.position;
        debug!(target: "rover::field", node = %snapshot.id, "node.depleted");
        self.emit(FieldEventKind::Depleted, snapshot);

        if let Some(drop) = pending_drop {
            let spawn = UpsertNodeOptions::new(drop.resource_type, position, drop.quantity)
                .with_merge_radius(DROP_MERGE_RADIUS);
            match self.upsert_node(spawn) {
                Ok(node) => result.drop = Some(node),
                Err(err) => {
                    tracing::warn!(target: "rover::field", error = %err, "node.drop_skipped");
                }
            }
        }
        result
    }

    /// Adds quantity back to a node; returns the resulting quantity.
    pub fn restore(&mut self, id: &str, amount: f32) -> f32 {
        let Some(node) = self.nodes.get_mut(id) else {
            return 0.0;
        };
        if !amount.is_finite() || amount <= 0.0 {
            return node.quantity;
        }

        let was_empty = node.quantity <= 0.0;
        match node.metadata.as_mut().filter(|metadata| metadata.is_hit_gated()) {
            Some(metadata) => {
                let added = whole_hits(amount);
                let hits = if was_empty {
                    added.max(1)
                } else {
                    metadata
                        .hits_remaining
                        .or(metadata.hit_points)
                        .unwrap_or(0)
                        .saturating_add(added)
                };
                metadata.hits_remaining = Some(hits);
                node.sync_hit_quantity();
            }
            None => node.quantity += amount,
        }
        let snapshot = node.clone();
        let quantity = snapshot.quantity;
        let kind = if was_empty {
            FieldEventKind::Restored
        } else {
            FieldEventKind::Updated
        };
        self.emit(kind, snapshot);
        quantity
    }

    fn merge_candidate(&self, resource_type: &str, position: Vec2, radius: f32) -> Option<String> {
        let mut best: Option<(&ResourceNode, f32)> = None;
        for node in self.nodes.values() {
            if !node.matches_type(resource_type) {
                continue;
            }
            let distance = node.position.distance(position);
            if distance > radius {
                continue;
            }
            if best.map_or(true, |(_, current)| distance < current) {
                best = Some((node, distance));
            }
        }
        best.map(|(node, _)| node.id.clone())
    }

    fn generate_id(&mut self, resource_type: &str) -> String {
        let slug: String = resource_type
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let slug = slug.trim_matches('-');
        let slug = if slug.is_empty() { "node" } else { slug };
        loop {
            self.next_serial += 1;
            let candidate = format!("{slug}-{}", self.next_serial);
            if !self.nodes.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn emit(&mut self, kind: FieldEventKind, node: ResourceNode) {
        if self.listeners.is_empty() {
            return;
        }
        let event = ResourceFieldEvent { kind, node };
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

/// Rounds a restore amount to whole hits, saturating at `u32::MAX`.
fn whole_hits(amount: f32) -> u32 {
    amount.round().clamp(0.0, u32::MAX as f32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn field_with(nodes: &[(&str, &str, Vec2, f32)]) -> ResourceField {
        let mut field = ResourceField::new();
        for (id, kind, position, quantity) in nodes {
            field
                .upsert_node(UpsertNodeOptions::new(*kind, *position, *quantity).with_id(*id))
                .expect("valid node");
        }
        field
    }

    fn recorded(field: &mut ResourceField) -> Arc<Mutex<Vec<FieldEventKind>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        field.subscribe(move |event| sink.lock().unwrap().push(event.kind));
        events
    }

    #[test]
    fn upsert_rejects_malformed_input() {
        let mut field = ResourceField::new();
        assert_eq!(
            field.upsert_node(UpsertNodeOptions::new("  ", Vec2::ZERO, 1.0)),
            Err(ResourceFieldError::EmptyType)
        );
        assert!(matches!(
            field.upsert_node(UpsertNodeOptions::new("ore", Vec2::new(f32::NAN, 0.0), 1.0)),
            Err(ResourceFieldError::NonFinitePosition { .. })
        ));
        assert_eq!(
            field.upsert_node(UpsertNodeOptions::new("ore", Vec2::ZERO, 0.0)),
            Err(ResourceFieldError::InvalidQuantity(0.0))
        );
        assert!(field.is_empty());
    }

    #[test]
    fn upsert_merges_same_type_within_radius() {
        let mut field = ResourceField::new();
        let events = recorded(&mut field);
        let first = field
            .upsert_node(UpsertNodeOptions::new("Ore", Vec2::new(10.0, 0.0), 2.0))
            .unwrap();
        assert_eq!(first.id, "ore-1");

        let merged = field
            .upsert_node(UpsertNodeOptions::new("ore", Vec2::new(12.0, 0.0), 3.0).with_merge_radius(5.0))
            .unwrap();
        assert_eq!(merged.id, "ore-1");
        assert_eq!(merged.quantity, 5.0);

        let separate = field
            .upsert_node(UpsertNodeOptions::new("wood", Vec2::new(11.0, 0.0), 1.0).with_merge_radius(5.0))
            .unwrap();
        assert_eq!(separate.id, "wood-2");
        assert_eq!(field.len(), 2);
        assert_eq!(
            *events.lock().unwrap(),
            vec![FieldEventKind::Added, FieldEventKind::Updated, FieldEventKind::Added]
        );
    }

    #[test]
    fn explicit_id_merge_resets_hits_from_new_hit_points() {
        let mut field = ResourceField::new();
        field
            .upsert_node(
                UpsertNodeOptions::new("tree", Vec2::ZERO, 3.0)
                    .with_id("tree-a")
                    .with_metadata(NodeMetadata::hit_gated(3).with_required_tool("axe")),
            )
            .unwrap();
        let merged = field
            .upsert_node(
                UpsertNodeOptions::new("tree", Vec2::ZERO, 1.0)
                    .with_id("tree-a")
                    .with_metadata(NodeMetadata {
                        hit_points: Some(5),
                        ..NodeMetadata::default()
                    }),
            )
            .unwrap();
        let metadata = merged.metadata.expect("metadata kept");
        assert_eq!(metadata.hit_points, Some(5));
        assert_eq!(metadata.hits_remaining, Some(5));
        assert_eq!(metadata.required_tool.as_deref(), Some("axe"));
        assert_eq!(merged.quantity, 5.0);
    }

    #[test]
    fn hit_gated_quantity_follows_hits_remaining() {
        let mut field = ResourceField::new();
        let tree = field
            .upsert_node(
                UpsertNodeOptions::new("tree", Vec2::ZERO, 10.0)
                    .with_id("oak")
                    .with_metadata(NodeMetadata::hit_gated(3).with_required_tool("axe")),
            )
            .unwrap();
        assert_eq!(tree.quantity, 3.0);
        assert_eq!(field.scan(&ScanOptions::new(Vec2::new(-5.0, 0.0), 0.0, 50.0)).hits[0].quantity, 3.0);

        let hit = field.register_hit(HitOptions::new("oak", Some("axe".into())));
        assert_eq!(hit.status, HitStatus::Ok);
        assert_eq!(hit.remaining, 2.0);

        let plain = field
            .upsert_node(UpsertNodeOptions::new("rock", Vec2::new(20.0, 0.0), 2.0).with_id("boulder"))
            .unwrap();
        assert_eq!(plain.quantity, 2.0);
        let gated = field
            .upsert_node(
                UpsertNodeOptions::new("rock", Vec2::new(20.0, 0.0), 1.0)
                    .with_id("boulder")
                    .with_metadata(NodeMetadata::hit_gated(4)),
            )
            .unwrap();
        assert_eq!(gated.quantity, 4.0);
        assert_eq!(gated.hits_remaining(), Some(4));
    }

    #[test]
    fn restore_on_hit_nodes_keeps_whole_hits_and_saturates() {
        let mut field = ResourceField::new();
        field
            .upsert_node(
                UpsertNodeOptions::new("tree", Vec2::ZERO, 3.0)
                    .with_id("oak")
                    .with_metadata(NodeMetadata::hit_gated(3)),
            )
            .unwrap();

        assert_eq!(field.restore("oak", 1e10), u32::MAX as f32);
        assert_eq!(field.get("oak").and_then(ResourceNode::hits_remaining), Some(u32::MAX));
        assert_eq!(field.restore("oak", 5.0), u32::MAX as f32);

        field
            .upsert_node(
                UpsertNodeOptions::new("tree", Vec2::new(50.0, 0.0), 2.0)
                    .with_id("pine")
                    .with_metadata(NodeMetadata::hit_gated(2)),
            )
            .unwrap();
        field.register_hit(HitOptions::new("pine", None));
        field.register_hit(HitOptions::new("pine", None));
        assert_eq!(field.get("pine").map(|node| node.quantity), Some(0.0));

        assert_eq!(field.restore("pine", 0.3), 1.0);
        let pine = field.get("pine").unwrap();
        assert_eq!(pine.hits_remaining(), Some(1));
        assert_eq!(pine.quantity, 1.0);
    }

    #[test]
    fn generated_ids_skip_existing() {
        let mut field = field_with(&[("rock-1", "rock", Vec2::ZERO, 1.0)]);
        let node = field
            .upsert_node(UpsertNodeOptions::new("Rock", Vec2::new(50.0, 0.0), 1.0))
            .unwrap();
        assert_eq!(node.id, "rock-2");
    }

    #[test]
    fn scan_sorts_by_distance_then_id_and_reports_total() {
        let field = field_with(&[
            ("b", "ore", Vec2::new(10.0, 0.0), 1.0),
            ("a", "ore", Vec2::new(10.0, 0.0), 1.0),
            ("c", "ore", Vec2::new(5.0, 1.0), 1.0),
            ("behind", "ore", Vec2::new(-10.0, 0.0), 1.0),
            ("far", "ore", Vec2::new(500.0, 0.0), 1.0),
            ("empty", "ore", Vec2::new(3.0, 0.0), 1.0),
            ("wood", "wood", Vec2::new(4.0, 0.0), 1.0),
        ]);
        let mut field = field;
        field.harvest(HarvestOptions::new("empty", 1.0));

        let mut options = ScanOptions::new(Vec2::ZERO, 0.0, 100.0);
        options.resource_type = Some("ORE".into());
        let result = field.scan(&options);
        let ids: Vec<&str> = result.hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
        assert_eq!(result.total, 3);
        assert_eq!(result.filter.as_deref(), Some("ORE"));

        options.max_results = Some(0);
        let capped = field.scan(&options);
        assert_eq!(capped.hits.len(), 1);
        assert_eq!(capped.total, 3);
        assert!(capped.total >= capped.hits.len());
    }

    #[test]
    fn scan_fov_is_clamped() {
        let field = field_with(&[("side", "ore", Vec2::new(0.0, 10.0), 1.0)]);
        let mut options = ScanOptions::new(Vec2::ZERO, 0.0, 50.0);
        options.fov_degrees = Some(400.0);
        assert_eq!(field.scan(&options).total, 1);
        options.fov_degrees = Some(1.0);
        assert_eq!(field.scan(&options).total, 0);
        options.fov_degrees = None;
        assert_eq!(field.scan(&options).total, 0);
    }

    #[test]
    fn harvest_depletes_without_going_negative() {
        let mut field = field_with(&[("ore", "ore", Vec2::new(5.0, 0.0), 3.0)]);
        let events = recorded(&mut field);

        let first = field.harvest(HarvestOptions::new("ore", 2.0).from_origin(Vec2::ZERO));
        assert_eq!(first.status, HarvestStatus::Ok);
        assert_eq!(first.harvested, 2.0);
        assert_eq!(first.remaining, 1.0);

        let second = field.harvest(HarvestOptions::new("ore", 2.0));
        assert_eq!(second.status, HarvestStatus::Depleted);
        assert_eq!(second.harvested, 1.0);
        assert_eq!(second.remaining, 0.0);

        let third = field.harvest(HarvestOptions::new("ore", 2.0));
        assert_eq!(third.status, HarvestStatus::Depleted);
        assert_eq!(third.harvested, 0.0);
        assert_eq!(field.get("ore").unwrap().quantity, 0.0);
        assert_eq!(
            *events.lock().unwrap(),
            vec![FieldEventKind::Updated, FieldEventKind::Depleted]
        );
    }

    #[test]
    fn harvest_out_of_range_does_not_mutate() {
        let mut field = field_with(&[("ore", "ore", Vec2::new(500.0, 0.0), 3.0)]);
        let result = field.harvest(HarvestOptions::new("ore", 1.0).from_origin(Vec2::ZERO));
        assert_eq!(result.status, HarvestStatus::OutOfRange);
        assert_eq!(field.get("ore").unwrap().quantity, 3.0);
        assert_eq!(
            field.harvest(HarvestOptions::new("missing", 1.0)).status,
            HarvestStatus::NotFound
        );
    }

    #[test]
    fn register_hit_requires_matching_tool() {
        let mut field = ResourceField::new();
        field
            .upsert_node(
                UpsertNodeOptions::new("tree", Vec2::ZERO, 3.0)
                    .with_id("oak")
                    .with_metadata(NodeMetadata::hit_gated(3).with_required_tool("axe")),
            )
            .unwrap();

        let wrong = field.register_hit(HitOptions::new("oak", Some("pickaxe".into())));
        assert_eq!(wrong.status, HitStatus::InvalidTool);
        assert_eq!(field.get("oak").unwrap().hits_remaining(), Some(3));

        let none = field.register_hit(HitOptions::new("oak", None));
        assert_eq!(none.status, HitStatus::InvalidTool);

        let hit = field.register_hit(HitOptions::new("oak", Some("AXE".into())));
        assert_eq!(hit.status, HitStatus::Ok);
        assert_eq!(field.get("oak").unwrap().hits_remaining(), Some(2));
        assert_eq!(field.get("oak").unwrap().quantity, 2.0);
    }

    #[test]
    fn depleting_hit_node_spawns_drop_merged_into_existing_pile() {
        let mut field = ResourceField::new();
        field
            .upsert_node(
                UpsertNodeOptions::new("tree", Vec2::new(20.0, 20.0), 2.0)
                    .with_id("oak")
                    .with_metadata(NodeMetadata::hit_gated(2).with_drop("wood", 4.0)),
            )
            .unwrap();
        field
            .upsert_node(UpsertNodeOptions::new("wood", Vec2::new(20.0, 20.0), 1.0).with_id("pile"))
            .unwrap();
        let events = recorded(&mut field);

        assert_eq!(field.register_hit(HitOptions::new("oak", None)).status, HitStatus::Ok);
        let last = field.register_hit(HitOptions::new("oak", None));
        assert_eq!(last.status, HitStatus::Depleted);
        let drop = last.drop.expect("drop spawned");
        assert_eq!(drop.id, "pile");
        assert_eq!(drop.quantity, 5.0);
        assert_eq!(drop.position, Vec2::new(20.0, 20.0));

        let again = field.register_hit(HitOptions::new("oak", None));
        assert_eq!(again.status, HitStatus::Depleted);
        assert!(again.drop.is_none());
        assert!(field.get("oak").is_some());
        assert_eq!(
            *events.lock().unwrap(),
            vec![FieldEventKind::Updated, FieldEventKind::Depleted, FieldEventKind::Updated]
        );
    }

    #[test]
    fn plain_nodes_lose_one_unit_per_hit() {
        let mut field = field_with(&[("ore", "ore", Vec2::ZERO, 1.5)]);
        assert_eq!(field.register_hit(HitOptions::new("ore", None)).status, HitStatus::Ok);
        assert_eq!(field.register_hit(HitOptions::new("ore", None)).status, HitStatus::Depleted);
        assert_eq!(field.get("ore").unwrap().quantity, 0.0);
    }

    #[test]
    fn restore_ignores_bad_amounts_and_revives_depleted_nodes() {
        let mut field = field_with(&[("ore", "ore", Vec2::ZERO, 1.0)]);
        field.harvest(HarvestOptions::new("ore", 1.0));
        let events = recorded(&mut field);

        assert_eq!(field.restore("ore", -1.0), 0.0);
        assert_eq!(field.restore("ore", f32::INFINITY), 0.0);
        assert_eq!(field.restore("missing", 3.0), 0.0);
        assert_eq!(field.restore("ore", 2.0), 2.0);
        assert_eq!(field.restore("ore", 1.0), 3.0);
        assert_eq!(
            *events.lock().unwrap(),
            vec![FieldEventKind::Restored, FieldEventKind::Updated]
        );
    }

    #[test]
    fn remove_and_channel_delivery() {
        let mut field = field_with(&[("ore", "ore", Vec2::ZERO, 1.0)]);
        let (id, receiver) = field.event_channel();
        assert!(field.remove_node("ore"));
        assert!(!field.remove_node("ore"));
        let event = receiver.try_recv().expect("removed event");
        assert_eq!(event.kind, FieldEventKind::Removed);
        assert_eq!(event.node.id, "ore");
        assert!(field.unsubscribe(id));
        assert!(!field.unsubscribe(id));
    }

    #[test]
    fn nearest_node_skips_depleted_and_filters_type() {
        let mut field = field_with(&[
            ("near", "ore", Vec2::new(1.0, 0.0), 1.0),
            ("mid", "wood", Vec2::new(2.0, 0.0), 1.0),
            ("far", "ore", Vec2::new(9.0, 0.0), 1.0),
        ]);
        field.harvest(HarvestOptions::new("near", 1.0));
        assert_eq!(field.nearest_node(Vec2::ZERO, None).map(|n| n.id.as_str()), Some("mid"));
        assert_eq!(
            field.nearest_node(Vec2::ZERO, Some("ORE")).map(|n| n.id.as_str()),
            Some("far")
        );
    }
}
