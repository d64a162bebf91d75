pub mod actuators;
pub mod arbiter;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod indicator;
pub mod remote;
pub mod sensors;
pub mod setpoints;
pub mod telemetry;
pub mod topics;
pub mod types;

pub use actuators::{ActuatorCommand, ActuatorState, DamperPosition, LedRamp, Relay, ThermalMode};
pub use arbiter::{DebugTransition, OverrideArbiter, WriteGate};
pub use config::{ControlConfig, NetworkConfig, RuntimeConfig, Setpoints};
pub use controller::GreenhouseController;
pub use engine::{ControlEngine, CycleOutcome};
pub use error::{RemoteError, StoreError};
pub use indicator::{ConnectivityFlags, IndicatorPattern};
pub use remote::{InMemoryRemote, RemoteInbox, RemoteSync};
pub use sensors::{ClimateReading, GasReading, Sample, SensorChannel, SensorHub, SensorReading};
pub use setpoints::{MemorySetpointPersistence, SetpointPersistence, SetpointStore};
pub use telemetry::TelemetryBacklog;
pub use topics::*;
pub use types::{ActuatorReport, Heartbeat, ManualActuatorStates, SensorReport, SensorSnapshot};
