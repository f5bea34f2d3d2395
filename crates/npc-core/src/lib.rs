//! NPC population management: persistent records, two-tier simulation,
//! proximity-driven activation.

pub mod config;
pub mod coordinator;
pub mod grid;
pub mod mapper;
pub mod record;
pub mod reduced;
pub mod runner;
pub mod scanner;
pub mod services;
pub mod stepper;
pub mod world;

pub use config::Config;
pub use coordinator::{ActivationCoordinator, ActivationError};
pub use grid::GridIndex;
pub use mapper::StateMapper;
pub use record::{NpcRecord, RecordId, RecordTable};
pub use runner::StateMachineRunner;
pub use scanner::ProximityScanner;
pub use services::{InstanceId, InstancePool, Navigator};
pub use stepper::SimulationStepper;
pub use world::NpcWorld;
