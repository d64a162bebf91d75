use log::{debug, info, warn};

use crate::{
    actuators::{ActuatorCommand, ActuatorState},
    arbiter::{DebugTransition, OverrideArbiter},
    config::{ControlConfig, Setpoints},
    engine::ControlEngine,
    remote::RemoteSync,
    setpoints::{SetpointPersistence, SetpointStore},
    telemetry::TelemetryBacklog,
    types::{ActuatorReport, Heartbeat, ManualActuatorStates, SensorReport, SensorSnapshot},
};

/// The single long-lived owner of actuator state.
///
/// Every mutation goes through `&mut self`, so callers serialize access by
/// owning the controller in exactly one task. Commands returned from the entry
/// points must be executed in order by that task.
pub struct GreenhouseController<R, P> {
    config: ControlConfig,
    engine: ControlEngine,
    arbiter: OverrideArbiter,
    setpoints: SetpointStore<P>,
    state: ActuatorState,
    remote: R,
    backlog: TelemetryBacklog,
    last_publish_ms: Option<u64>,
    publish_pending: bool,
    /// Set after a failed publish; the pending report then waits for the
    /// periodic interval instead of retrying every cycle.
    publish_backoff: bool,
}

impl<R: RemoteSync, P: SetpointPersistence> GreenhouseController<R, P> {
    pub fn new(config: ControlConfig, remote: R, persistence: P) -> Self {
        Self {
            engine: ControlEngine::new(config.clone()),
            arbiter: OverrideArbiter::new(&config),
            setpoints: SetpointStore::new(persistence),
            state: ActuatorState::default(),
            remote,
            backlog: TelemetryBacklog::new(config.telemetry_backlog_capacity),
            last_publish_ms: None,
            publish_pending: true,
            publish_backoff: false,
            config,
        }
    }

    pub fn actuator_state(&self) -> &ActuatorState {
        &self.state
    }

    pub fn report(&self) -> ActuatorReport {
        self.state.report()
    }

    pub fn setpoints(&self) -> &Setpoints {
        self.setpoints.current()
    }

    pub fn setpoint_store(&self) -> &SetpointStore<P> {
        &self.setpoints
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut R {
        &mut self.remote
    }

    pub fn backlog(&self) -> &TelemetryBacklog {
        &self.backlog
    }

    pub fn is_debug_mode(&self) -> bool {
        self.state.is_debug_mode()
    }

    /// One automatic control cycle followed by the state publish attempt.
    /// In debug mode only the publish half runs.
    pub fn control_cycle(&mut self, snapshot: &SensorSnapshot, now_ms: u64) -> Vec<ActuatorCommand> {
        let outcome = self
            .engine
            .run_cycle(snapshot, self.setpoints.current(), &mut self.state, now_ms);
        if outcome.changed {
            self.mark_changed();
        }
        self.publish_state(now_ms, false);
        outcome.commands
    }

    /// Leaving debug mode pushes hardware truth to the backend right away,
    /// skipping the periodic throttle but not the write gate.
    pub fn set_debug_mode(&mut self, on: bool, now_ms: u64) -> DebugTransition {
        let transition = self.arbiter.set_debug_mode(&mut self.state, on, now_ms);
        if transition == DebugTransition::Exited {
            self.mark_changed();
            self.publish_state(now_ms, true);
        }
        transition
    }

    /// Applied changes are published once write suppression lapses.
    pub fn set_manual_states(
        &mut self,
        manual: &ManualActuatorStates,
        now_ms: u64,
    ) -> Vec<ActuatorCommand> {
        let commands = self.arbiter.set_manual_states(&mut self.state, manual, now_ms);
        if !commands.is_empty() {
            self.mark_changed();
        }
        commands
    }

    /// Stores and persists `setpoints` unless they equal the current record.
    pub fn apply_setpoints(&mut self, setpoints: Setpoints) -> bool {
        if *self.setpoints.current() == setpoints {
            return false;
        }
        self.setpoints.apply(setpoints);
        true
    }

    /// Pulls the debug flag, manual levels (debug only) and setpoints, in
    /// that order. Skipped entirely while the backend is not ready.
    pub fn sync_from_remote(&mut self, now_ms: u64) -> Vec<ActuatorCommand> {
        let mut commands = Vec::new();
        if !self.remote.is_ready() {
            debug!("remote not ready, skipping command sync");
            return commands;
        }

        let debug_mode = self.remote.fetch_debug_mode();
        self.set_debug_mode(debug_mode, now_ms);

        if self.state.is_debug_mode() {
            if let Some(manual) = self.remote.fetch_manual_states() {
                commands.extend(self.set_manual_states(&manual, now_ms));
            }
        }

        if let Some(setpoints) = self.remote.fetch_setpoints() {
            self.apply_setpoints(setpoints);
        }
        commands
    }

    /// Publishes a sensor report, buffering it while the backend is away.
    /// Buffered reports always go out before the fresh one.
    pub fn record_telemetry(
        &mut self,
        snapshot: &SensorSnapshot,
        uptime_ms: u64,
        recorded_at: Option<i64>,
    ) {
        let report = SensorReport {
            snapshot: *snapshot,
            uptime_ms,
            recorded_at,
        };

        if !self.remote.is_ready() {
            if self.backlog.push(report) {
                warn!("telemetry backlog full, dropped oldest report");
            } else {
                debug!("remote not ready, buffered report ({} queued)", self.backlog.len());
            }
            return;
        }

        self.backlog.drain_into(&mut self.remote);
        if !self.backlog.is_empty() {
            self.backlog.push(report);
            return;
        }
        if let Err(err) = self.remote.publish_sensor_report(&report) {
            warn!("sensor report publish failed, buffering: {err}");
            self.backlog.push(report);
        }
    }

    pub fn heartbeat(&mut self, uptime_ms: u64) {
        if !self.remote.is_ready() {
            debug!("remote not ready, skipping heartbeat");
            return;
        }
        let heartbeat = Heartbeat {
            uptime_ms,
            debug_mode: self.state.is_debug_mode(),
            backlog_len: self.backlog.len(),
        };
        if let Err(err) = self.remote.publish_heartbeat(&heartbeat) {
            warn!("heartbeat publish failed: {err}");
        }
    }

    fn mark_changed(&mut self) {
        self.publish_pending = true;
        self.publish_backoff = false;
    }

    /// Publishes the actuator report when a change is pending or the periodic
    /// interval has elapsed. `immediate` skips the interval check only.
    fn publish_state(&mut self, now_ms: u64, immediate: bool) {
        let periodic_due = self
            .last_publish_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.state_publish_interval_ms)
            .unwrap_or(true);
        let change_due = self.publish_pending && !self.publish_backoff;
        if !(immediate || change_due || periodic_due) {
            return;
        }

        if !self.remote.is_ready() {
            debug!("remote not ready, actuator state publish skipped");
            return;
        }
        if !self.arbiter.can_publish(&mut self.state, now_ms) {
            debug!("write suppression active, actuator state publish deferred");
            return;
        }

        let report = self.state.report();
        self.last_publish_ms = Some(now_ms);
        match self.remote.publish_actuator_state(&report) {
            Ok(()) => {
                if self.publish_pending {
                    info!("actuator state published: {report:?}");
                }
                self.publish_pending = false;
                self.publish_backoff = false;
            }
            Err(err) => {
                warn!(
                    "actuator state publish failed, retrying in {} ms: {err}",
                    self.config.state_publish_interval_ms
                );
                self.publish_backoff = true;
            }
        }
    }
}
