//! Configuration.
//!
//! All tuning parameters, behavior bindings, paths, service points, and the
//! NPC population are loaded once from a TOML file at startup and are
//! immutable at runtime. Cross-references (template ids, path ids, service
//! ids) are validated up front so the scheduler loop never has to handle a
//! dangling reference.

use npc_events::{DayTime, FullKey, TimeRange, Vec3};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "npc_sim.toml";

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },
    #[error("npc {npc} references unknown {kind}: {id}")]
    DanglingRef {
        npc: String,
        kind: &'static str,
        id: String,
    },
    #[error("path {0} has no waypoints")]
    EmptyPath(String),
    #[error("near radius {near} must be below far radius {far}")]
    RadiusOrder { near: f32, far: f32 },
    #[error("simulation radius {sim} must cover far radius {far}")]
    SimRadiusTooSmall { sim: f32, far: f32 },
    #[error("no full state mapped for reduced state {0}")]
    MissingReducedMapping(String),
}

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tuning: Tuning,
    pub fallbacks: Fallbacks,
    pub templates: Vec<TemplateConfig>,
    pub paths: Vec<PathConfig>,
    pub services: Vec<ServiceConfig>,
    pub npcs: Vec<NpcConfig>,
}

/// Tuning parameters for the scheduler and both simulation tiers.
///
/// These are sample values, adjustable without recompiling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Grid cell edge length, world units.
    pub cell_size: f32,
    /// Records inside this radius of an observer are activated.
    pub near_radius: f32,
    /// Active records outside this radius are deactivated. Must exceed
    /// `near_radius`; the gap is the hysteresis band.
    pub far_radius: f32,
    /// Inactive records inside this radius are stepped by reduced simulation.
    pub sim_radius: f32,
    /// Seconds between proximity scans.
    pub scan_interval: f32,
    /// Seconds between reduced-simulation batches.
    pub step_interval: f32,
    /// Maximum records stepped per batch.
    pub max_per_tick: usize,
    /// Full-simulation walk speed, units per second.
    pub walk_speed: f32,
    /// Reduced-simulation drift speed, units per second.
    pub reduced_speed: f32,
    /// Distance at which a moving record counts as arrived.
    pub arrive_epsilon: f32,
    /// How far patrol drift targets stray from the current position.
    pub patrol_radius: f32,
    /// Seconds an NPC waits in line before losing patience.
    pub patience: f32,
    /// Seconds a service transaction takes.
    pub service_time: f32,
    /// Simulated minutes that pass per real second.
    pub minutes_per_second: f32,
    /// Clock reading at startup.
    pub start_time: DayTime,
    /// Axis-aligned navigable bounds; warps outside them fail.
    pub navigable_min: [f32; 3],
    pub navigable_max: [f32; 3],
    /// Map exit points used by leaving NPCs.
    pub exits: Vec<[f32; 3]>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            cell_size: 16.0,
            near_radius: 40.0,
            far_radius: 55.0,
            sim_radius: 120.0,
            scan_interval: 0.5,
            step_interval: 1.0,
            max_per_tick: 8,
            walk_speed: 3.0,
            reduced_speed: 2.0,
            arrive_epsilon: 0.5,
            patrol_radius: 6.0,
            patience: 45.0,
            service_time: 10.0,
            minutes_per_second: 1.0,
            start_time: DayTime::new(7, 0),
            navigable_min: [-200.0, -10.0, -200.0],
            navigable_max: [200.0, 50.0, 200.0],
            exits: vec![[190.0, 0.0, 0.0], [-190.0, 0.0, 0.0]],
        }
    }
}

impl Tuning {
    /// Whether a position lies on the navigable surface.
    pub fn is_navigable(&self, pos: Vec3) -> bool {
        pos.x >= self.navigable_min[0]
            && pos.x <= self.navigable_max[0]
            && pos.y >= self.navigable_min[1]
            && pos.y <= self.navigable_max[1]
            && pos.z >= self.navigable_min[2]
            && pos.z <= self.navigable_max[2]
    }

    /// The exit point nearest to `pos`, if any are configured.
    pub fn nearest_exit(&self, pos: Vec3) -> Option<Vec3> {
        self.exits
            .iter()
            .map(|e| Vec3::new(e[0], e[1], e[2]))
            .min_by(|a, b| {
                a.distance_sq(pos)
                    .partial_cmp(&b.distance_sq(pos))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Fallback states for the transition machinery.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Fallbacks {
    /// First fallback when a requested state is not loaded.
    pub returning: FullKey,
    /// Second fallback; if this is missing too, the instance is disabled.
    pub idle: FullKey,
}

impl Default for Fallbacks {
    fn default() -> Self {
        Self {
            returning: FullKey::Returning,
            idle: FullKey::Idle,
        }
    }
}

/// An instance template and its pool capacity.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    pub id: String,
    pub pool_size: usize,
    /// Full states loaded for this template; `None` means all registered.
    #[serde(default)]
    pub states: Option<Vec<FullKey>>,
}

/// A named waypoint path.
#[derive(Debug, Clone, Deserialize)]
pub struct PathConfig {
    pub id: String,
    pub waypoints: Vec<[f32; 3]>,
}

/// A service point: one counter plus a bounded waiting line.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub position: [f32; 3],
    pub queue_slots: usize,
}

/// One NPC of the population.
#[derive(Debug, Clone, Deserialize)]
pub struct NpcConfig {
    pub id: String,
    pub template: String,
    pub home: [f32; 3],
    #[serde(default)]
    pub rotation: f32,
    #[serde(default = "default_schedule_start")]
    pub schedule_start: TimeRange,
    #[serde(default = "default_schedule_end")]
    pub schedule_end: TimeRange,
    #[serde(default = "default_true")]
    pub can_start_day: bool,
    #[serde(default)]
    pub day_start_path: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    /// Per-record decision overrides, keyed by decision point id.
    #[serde(default)]
    pub overrides: HashMap<String, String>,
    /// Opaque assignment payload (e.g. an order id).
    #[serde(default)]
    pub assignment: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_schedule_start() -> TimeRange {
    TimeRange::new(DayTime::new(8, 0), DayTime::new(10, 0))
}

fn default_schedule_end() -> TimeRange {
    TimeRange::new(DayTime::new(20, 0), DayTime::new(22, 0))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tuning: Tuning::default(),
            fallbacks: Fallbacks::default(),
            templates: Vec::new(),
            paths: Vec::new(),
            services: Vec::new(),
            npcs: Vec::new(),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks id uniqueness and every cross-reference.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tuning;
        if t.near_radius >= t.far_radius {
            return Err(ConfigError::RadiusOrder {
                near: t.near_radius,
                far: t.far_radius,
            });
        }
        if t.sim_radius < t.far_radius {
            return Err(ConfigError::SimRadiusTooSmall {
                sim: t.sim_radius,
                far: t.far_radius,
            });
        }

        let mut templates = HashSet::new();
        for tpl in &self.templates {
            if !templates.insert(tpl.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "template",
                    id: tpl.id.clone(),
                });
            }
        }
        let mut paths = HashSet::new();
        for path in &self.paths {
            if !paths.insert(path.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "path",
                    id: path.id.clone(),
                });
            }
            if path.waypoints.is_empty() {
                return Err(ConfigError::EmptyPath(path.id.clone()));
            }
        }
        let mut services = HashSet::new();
        for svc in &self.services {
            if !services.insert(svc.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "service",
                    id: svc.id.clone(),
                });
            }
        }

        let mut npcs = HashSet::new();
        for npc in &self.npcs {
            if !npcs.insert(npc.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "npc",
                    id: npc.id.clone(),
                });
            }
            if !templates.contains(npc.template.as_str()) {
                return Err(ConfigError::DanglingRef {
                    npc: npc.id.clone(),
                    kind: "template",
                    id: npc.template.clone(),
                });
            }
            if let Some(path) = &npc.day_start_path {
                if !paths.contains(path.as_str()) {
                    return Err(ConfigError::DanglingRef {
                        npc: npc.id.clone(),
                        kind: "path",
                        id: path.clone(),
                    });
                }
            }
            if let Some(svc) = &npc.service {
                if !services.contains(svc.as_str()) {
                    return Err(ConfigError::DanglingRef {
                        npc: npc.id.clone(),
                        kind: "service",
                        id: svc.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// A small self-contained population used by the demo binary and tests.
    pub fn demo() -> Self {
        Self {
            tuning: Tuning::default(),
            fallbacks: Fallbacks::default(),
            templates: vec![
                TemplateConfig {
                    id: "villager".to_string(),
                    pool_size: 4,
                    states: None,
                },
                TemplateConfig {
                    id: "customer".to_string(),
                    pool_size: 4,
                    states: None,
                },
            ],
            paths: vec![PathConfig {
                id: "market_walk".to_string(),
                waypoints: vec![
                    [10.0, 0.0, 0.0],
                    [20.0, 0.0, 10.0],
                    [30.0, 0.0, 10.0],
                    [40.0, 0.0, 0.0],
                ],
            }],
            services: vec![ServiceConfig {
                id: "bakery_counter".to_string(),
                position: [40.0, 0.0, 0.0],
                queue_slots: 3,
            }],
            npcs: vec![
                NpcConfig {
                    id: "aiko".to_string(),
                    template: "villager".to_string(),
                    home: [5.0, 0.0, 5.0],
                    rotation: 0.0,
                    schedule_start: default_schedule_start(),
                    schedule_end: default_schedule_end(),
                    can_start_day: true,
                    day_start_path: Some("market_walk".to_string()),
                    service: None,
                    overrides: HashMap::new(),
                    assignment: None,
                },
                NpcConfig {
                    id: "bruno".to_string(),
                    template: "customer".to_string(),
                    home: [-8.0, 0.0, 12.0],
                    rotation: 0.0,
                    schedule_start: default_schedule_start(),
                    schedule_end: default_schedule_end(),
                    can_start_day: true,
                    day_start_path: Some("market_walk".to_string()),
                    service: Some("bakery_counter".to_string()),
                    overrides: HashMap::new(),
                    assignment: Some("order_0042".to_string()),
                },
                NpcConfig {
                    id: "carla".to_string(),
                    template: "customer".to_string(),
                    home: [60.0, 0.0, -20.0],
                    rotation: 0.0,
                    schedule_start: default_schedule_start(),
                    schedule_end: default_schedule_end(),
                    can_start_day: false,
                    day_start_path: None,
                    service: Some("bakery_counter".to_string()),
                    overrides: HashMap::new(),
                    assignment: None,
                },
            ],
        }
    }
}

/// Registry of named waypoint paths, immutable after load.
#[derive(Debug, Default)]
pub struct PathRegistry {
    paths: BTreeMap<String, Vec<Vec3>>,
}

impl PathRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut paths = BTreeMap::new();
        for p in &config.paths {
            let waypoints = p
                .waypoints
                .iter()
                .map(|w| Vec3::new(w[0], w[1], w[2]))
                .collect();
            paths.insert(p.id.clone(), waypoints);
        }
        Self { paths }
    }

    pub fn get(&self, id: &str) -> Option<&[Vec3]> {
        self.paths.get(id).map(Vec::as_slice)
    }

    /// Waypoint at `index`, honoring reverse traversal.
    pub fn waypoint(&self, id: &str, index: usize, reverse: bool) -> Option<Vec3> {
        let path = self.paths.get(id)?;
        if index >= path.len() {
            return None;
        }
        let i = if reverse { path.len() - 1 - index } else { index };
        Some(path[i])
    }

    /// Number of waypoints in a path, zero if unknown.
    pub fn len_of(&self, id: &str) -> usize {
        self.paths.get(id).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_config_validates() {
        Config::demo().validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_npc_ids() {
        let mut config = Config::demo();
        let dup = config.npcs[0].clone();
        config.npcs.push(dup);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateId { kind: "npc", .. })
        ));
    }

    #[test]
    fn rejects_dangling_template_ref() {
        let mut config = Config::demo();
        config.npcs[0].template = "ghost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DanglingRef { kind: "template", .. })
        ));
    }

    #[test]
    fn rejects_inverted_radii() {
        let mut config = Config::demo();
        config.tuning.near_radius = config.tuning.far_radius + 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RadiusOrder { .. })
        ));
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            [tuning]
            near_radius = 30.0
            far_radius = 45.0

            [[templates]]
            id = "villager"
            pool_size = 2

            [[npcs]]
            id = "aiko"
            template = "villager"
            home = [1.0, 0.0, 2.0]
            schedule_start = { start = "09:00", end = "10:00" }
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tuning.near_radius, 30.0);
        assert_eq!(config.npcs[0].schedule_start.start, DayTime::new(9, 0));
        // Unspecified tuning keys keep their defaults.
        assert_eq!(config.tuning.max_per_tick, 8);
    }

    #[test]
    fn path_registry_reverse_lookup() {
        let config = Config::demo();
        let paths = PathRegistry::from_config(&config);
        let first = paths.waypoint("market_walk", 0, false).unwrap();
        let last = paths.waypoint("market_walk", 0, true).unwrap();
        assert_eq!(first, Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(last, Vec3::new(40.0, 0.0, 0.0));
        assert_eq!(paths.len_of("market_walk"), 4);
        assert!(paths.waypoint("market_walk", 4, false).is_none());
    }

    #[test]
    fn nearest_exit_picks_closest() {
        let tuning = Tuning::default();
        let exit = tuning.nearest_exit(Vec3::new(100.0, 0.0, 0.0)).unwrap();
        assert_eq!(exit, Vec3::new(190.0, 0.0, 0.0));
    }
}
