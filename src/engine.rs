use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::DeviceProfile;
use crate::device::{DaqBackend, DeviceDescriptor, DeviceSession};
use crate::error::EngineError;
use crate::plan::{ClampNotice, RampConfig, RampPlan, RampRequest, DEFAULT_RATE};
use crate::state::{allowed_actions, Action, DeviceAvailability, EngineState, Event};

const STATUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub profile: DeviceProfile,
    pub channel: u32,
    pub range_code: u32,
    pub default_rate: f64, // V/s
    pub inverse_display_rate: u32, // publish every Nth step
    pub initial_config: RampConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            profile: DeviceProfile::default(),
            channel: 1,
            range_code: 4,
            default_rate: DEFAULT_RATE,
            inverse_display_rate: 4,
            initial_config: RampConfig {
                start_voltage: 0.0,
                target_voltage: 2.0,
                rate: DEFAULT_RATE,
            },
        }
    }
}

/// One entry on the status feed.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub state: EngineState,
    pub label: String,
    pub voltage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// State shared with the stepping loop.
struct Shared {
    settings: EngineSettings,
    current_code: AtomicU32,
    state: StdMutex<StateCell>,
    status_tx: broadcast::Sender<StatusUpdate>,
    epoch: Instant,
}

#[derive(Debug)]
struct StateCell {
    state: EngineState,
    generation: u64,
}

/// Control-side bookkeeping, never touched by the stepping loop.
struct Control {
    config: RampConfig,
    last_request: Option<RampRequest>,
    devices: Vec<DeviceDescriptor>,
    session: Option<Arc<DeviceSession>>,
    active: Option<ActiveLoop>,
}

struct ActiveLoop {
    run_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Shared {
    fn state_cell(&self) -> MutexGuard<'_, StateCell> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn voltage_of(&self, code: u32) -> f64 {
        self.settings.profile.to_voltage(code)
    }

    fn current_voltage(&self) -> f64 {
        self.voltage_of(self.current_code.load(Ordering::Acquire))
    }

    fn publish(&self, state: EngineState, label: String) {
        self.publish_at(state, label, self.current_voltage());
    }

    fn publish_at(&self, state: EngineState, label: String, voltage: f64) {
        let update = StatusUpdate { state, label, voltage };
        debug!("Status: {} ({:.3} V)", update.label, update.voltage);
        // no subscribers is fine
        let _ = self.status_tx.send(update);
    }
}

/// Drives one analog output channel through voltage ramps.
///
/// All operator operations go through `&self`; the stepping loop runs as a
/// separate tokio task, at most one at a time.
pub struct RampEngine {
    backend: Arc<dyn DaqBackend>,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl RampEngine {
    pub fn new(backend: Arc<dyn DaqBackend>, settings: EngineSettings) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let initial_code = settings.profile.ground_code;
        let config = settings.initial_config;
        Self {
            backend,
            shared: Arc::new(Shared {
                settings,
                current_code: AtomicU32::new(initial_code),
                state: StdMutex::new(StateCell {
                    state: EngineState::Idle,
                    generation: 0,
                }),
                status_tx,
                epoch: Instant::now(),
            }),
            control: Mutex::new(Control {
                config,
                last_request: None,
                devices: Vec::new(),
                session: None,
                active: None,
            }),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.shared.settings.profile
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.shared.status_tx.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state_cell().state
    }

    /// Last code written by the stepping loop. May trail the hardware by one step.
    pub fn current_code(&self) -> u32 {
        self.shared.current_code.load(Ordering::Acquire)
    }

    pub fn current_voltage(&self) -> f64 {
        self.shared.current_voltage()
    }

    pub async fn config(&self) -> RampConfig {
        self.control.lock().await.config
    }

    pub async fn available_actions(&self) -> BTreeSet<Action> {
        let control = self.control.lock().await;
        let availability = if control.session.is_some() {
            DeviceAvailability::Bound
        } else if !control.devices.is_empty() {
            DeviceAvailability::Discovered
        } else {
            DeviceAvailability::Missing
        };
        allowed_actions(self.state(), availability)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, EngineError> {
        let mut control = self.control.lock().await;
        self.require_idle(Action::Discover)?;
        let devices = match self.backend.discover() {
            Ok(devices) => devices,
            Err(e) => {
                error!("Device discovery failed: {}", e);
                control.devices.clear();
                return Err(self.reject(EngineError::DeviceUnavailable(e.to_string())));
            }
        };
        if devices.is_empty() {
            warn!("No DAQ devices discovered");
            self.shared.publish(EngineState::Idle, "No devices discovered".to_string());
        } else {
            info!("{} DAQ device(s) discovered", devices.len());
            self.shared
                .publish(EngineState::Idle, format!("{} DAQ device(s) discovered", devices.len()));
        }
        control.devices = devices.clone();
        Ok(devices)
    }

    /// Bind the device at `index` from the last discovery, releasing any
    /// previously bound device first.
    pub async fn select_device(&self, index: usize) -> Result<DeviceDescriptor, EngineError> {
        let mut control = self.control.lock().await;
        self.require_idle(Action::SelectDevice)?;
        Self::retire(&mut control).await;
        // drop the old binding before creating the new one
        control.session = None;

        let descriptor = match control.devices.get(index) {
            Some(descriptor) => descriptor.clone(),
            None => {
                return Err(self.reject(EngineError::DeviceUnavailable(format!(
                    "no discovered device at index {}",
                    index
                ))))
            }
        };
        match DeviceSession::bind(self.backend.clone(), descriptor.clone()) {
            Ok(session) => {
                control.session = Some(Arc::new(session));
                self.shared
                    .publish(EngineState::Idle, format!("Device identifier: {}", descriptor.unique_id));
                Ok(descriptor)
            }
            Err(e) => {
                error!("Failed to bind {}: {}", descriptor, e);
                Err(self.reject(EngineError::DeviceUnavailable(e.to_string())))
            }
        }
    }

    /// Build a config from operator fields, report any corrections, and
    /// initiate with it.
    pub async fn initiate_with_input(
        &self,
        start: Option<f64>,
        target: Option<f64>,
        rate: Option<f64>,
    ) -> Result<Vec<ClampNotice>, EngineError> {
        let settings = &self.shared.settings;
        let (config, notices) = RampConfig::from_input(start, target, rate, &settings.profile, settings.default_rate);
        for notice in &notices {
            warn!("Input corrected: {}", notice);
            self.shared.publish(self.state(), format!("Input corrected: {}", notice));
        }
        self.initiate(config).await?;
        Ok(notices)
    }

    /// Reset the output to ground and position the ramp at the start voltage.
    pub async fn initiate(&self, config: RampConfig) -> Result<(), EngineError> {
        let mut control = self.control.lock().await;
        self.require_idle(Action::Initiate)?;
        let session = self.session(&control)?;
        Self::retire(&mut control).await;

        let settings = &self.shared.settings;
        let ground = settings.profile.ground_code;
        if let Err(e) = write_code(&session, settings, ground) {
            error!("Failed to reset output to ground: {}", e);
            return Err(self.reject(EngineError::HardwareWriteFault(e.to_string())));
        }
        self.shared
            .current_code
            .store(settings.profile.to_code(config.start_voltage), Ordering::Release);
        control.config = config;
        control.last_request = None;

        info!(
            "DAQ initiated: start {} V, target {} V, rate {} V/s",
            config.start_voltage, config.target_voltage, config.rate
        );
        self.shared.publish(
            EngineState::Idle,
            format!(
                "DAQ initiated: starting voltage {} V, final voltage {} V, ramp rate {} V/s",
                config.start_voltage, config.target_voltage, config.rate
            ),
        );
        self.shared.publish_at(
            EngineState::Idle,
            "Analog output at 0V, ready for ramping up".to_string(),
            self.shared.voltage_of(ground),
        );
        Ok(())
    }

    pub async fn start_ramp(&self, request: RampRequest) -> Result<(), EngineError> {
        let mut control = self.control.lock().await;
        self.launch(&mut control, request, Event::Start(request.kind)).await
    }

    pub async fn quick_ramp_to(&self, volts: f64, direction: Direction) -> Result<(), EngineError> {
        let request = match direction {
            Direction::Up => RampRequest::quick_up_to(volts),
            Direction::Down => RampRequest::quick_down_to(volts),
        };
        self.start_ramp(request).await
    }

    /// Stop the running ramp and hold the output where it is. No-op when
    /// nothing is ramping.
    pub async fn pause(&self) -> Result<(), EngineError> {
        let control = self.control.lock().await;
        {
            let mut cell = self.shared.state_cell();
            let next = cell.state.transition(Event::Pause)?;
            if next == cell.state {
                debug!("Pause ignored while {}", cell.state);
                return Ok(());
            }
            info!("Pausing {} at code {}", cell.state, self.current_code());
            cell.state = next;
        }
        if let Some(active) = &control.active {
            // receiver gone means the loop already exited
            let _ = active.run_tx.send(false);
        }
        Ok(())
    }

    /// Continue the paused ramp from the held code toward its original endpoint.
    pub async fn resume(&self) -> Result<(), EngineError> {
        let mut control = self.control.lock().await;
        let request = match control.last_request {
            Some(request) if self.state() == EngineState::Paused => request,
            _ => {
                return Err(self.reject(EngineError::InvalidStateTransition {
                    state: self.state(),
                    action: Action::Resume,
                }))
            }
        };
        self.launch(&mut control, request, Event::Resume(request.kind)).await
    }

    /// Stop any ramp, wait for the loop to exit, and release the device.
    pub async fn shutdown(&self) {
        let mut control = self.control.lock().await;
        if let Some(active) = &control.active {
            let _ = active.run_tx.send(false);
        }
        Self::retire(&mut control).await;
        {
            let mut cell = self.shared.state_cell();
            if let Ok(next) = cell.state.transition(Event::Abort) {
                cell.state = next;
            }
        }
        if control.session.take().is_some() {
            info!("Session closed");
        }
        self.shared.publish(EngineState::Idle, "Shut down".to_string());
    }

    async fn launch(&self, control: &mut Control, request: RampRequest, event: Event) -> Result<(), EngineError> {
        let session = self.session(control)?;
        self.state().transition(event).map_err(|e| self.reject(e))?;
        Self::retire(control).await;

        let plan = RampPlan::new(self.current_code(), &request, &self.shared.settings.profile, &control.config);
        let (run_tx, run_rx) = watch::channel(true);
        let (state, generation) = {
            let mut cell = self.shared.state_cell();
            cell.state = cell.state.transition(event)?;
            cell.generation += 1;
            (cell.state, cell.generation)
        };
        control.last_request = Some(request);

        info!(
            "{} from code {} toward {} (step {}, delay {:?})",
            state,
            self.current_code(),
            plan.target_code,
            plan.step_size,
            plan.step_delay
        );
        self.shared.publish(state, running_label(state, self.current_voltage()));

        let stepper = RampLoop {
            shared: self.shared.clone(),
            session,
            plan,
            state,
            run_rx,
            generation,
        };
        control.active = Some(ActiveLoop {
            run_tx,
            task: tokio::spawn(stepper.run()),
        });
        Ok(())
    }

    /// Join the previous loop, if any. Callers signal it first when it may
    /// still be stepping.
    async fn retire(control: &mut Control) {
        if let Some(active) = control.active.take() {
            if let Err(e) = active.task.await {
                error!("Ramp loop ended abnormally: {}", e);
            }
        }
    }

    fn session(&self, control: &Control) -> Result<Arc<DeviceSession>, EngineError> {
        match &control.session {
            Some(session) => Ok(session.clone()),
            None => Err(self.reject(EngineError::DeviceUnavailable("no device bound".to_string()))),
        }
    }

    fn require_idle(&self, action: Action) -> Result<(), EngineError> {
        let state = self.state();
        if state == EngineState::Idle {
            Ok(())
        } else {
            Err(self.reject(EngineError::InvalidStateTransition { state, action }))
        }
    }

    fn reject(&self, err: EngineError) -> EngineError {
        warn!("Rejected: {}", err);
        self.shared.publish(self.state(), format!("Rejected: {}", err));
        err
    }
}

/// Write one code, refusing codes the 16-bit output cannot represent.
fn write_code(session: &DeviceSession, settings: &EngineSettings, code: u32) -> anyhow::Result<()> {
    let code = u16::try_from(code).map_err(|_| anyhow::anyhow!("code {} is outside the 16-bit output range", code))?;
    session.write(settings.channel, settings.range_code, code)
}

fn running_label(state: EngineState, voltage: f64) -> String {
    match state {
        EngineState::RampingUp | EngineState::QuickRampingUp => format!("Ramping up, {:.3} V", voltage),
        _ => format!("Ramping down, {:.3} V", voltage),
    }
}

/// The stepping loop for a single ramp activation.
struct RampLoop {
    shared: Arc<Shared>,
    session: Arc<DeviceSession>,
    plan: RampPlan,
    state: EngineState,
    run_rx: watch::Receiver<bool>,
    generation: u64,
}

impl RampLoop {
    async fn run(mut self) {
        let display_every = self.shared.settings.inverse_display_rate.max(1) as u64;
        let from = self.shared.current_code.load(Ordering::Acquire);
        let mut steps: u64 = 0;

        for code in self.plan.codes(from) {
            if !*self.run_rx.borrow() {
                let voltage = self.shared.current_voltage();
                info!("Ramp paused at {:.3} V", voltage);
                self.shared
                    .publish(EngineState::Paused, format!("Ramping paused, holding at {:.3} V", voltage));
                return;
            }

            if let Err(e) = write_code(&self.session, &self.shared.settings, code) {
                self.fault(code, e);
                return;
            }
            self.shared.current_code.store(code, Ordering::Release);
            steps += 1;
            if steps % display_every == 0 {
                self.shared
                    .publish(self.state, running_label(self.state, self.shared.voltage_of(code)));
            }

            if !self.wait_for_tick().await {
                debug!("Engine dropped, stopping ramp loop");
                return;
            }
        }
        self.finish();
    }

    /// Sleep to the next multiple of the step delay since the engine epoch,
    /// waking early if the run flag changes. Returns false once the engine
    /// side is gone.
    async fn wait_for_tick(&mut self) -> bool {
        let delay = self.plan.step_delay;
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return true;
        }
        let now = Instant::now();
        let delay_nanos = delay.as_nanos();
        let elapsed_nanos = now.duration_since(self.shared.epoch).as_nanos();
        let remaining = delay_nanos - elapsed_nanos % delay_nanos;
        let deadline = u64::try_from(remaining)
            .ok()
            .and_then(|nanos| now.checked_add(Duration::from_nanos(nanos)));

        let tick = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tick => true,
            changed = self.run_rx.changed() => changed.is_ok(),
        }
    }

    fn finish(&self) {
        let voltage = self.shared.current_voltage();
        let mut cell = self.shared.state_cell();
        if cell.generation != self.generation || !cell.state.is_active() {
            drop(cell);
            // paused while the last step was in flight
            self.shared
                .publish(EngineState::Paused, format!("Ramping paused, holding at {:.3} V", voltage));
            return;
        }
        match cell.state.transition(Event::Finished) {
            Ok(next) => cell.state = next,
            Err(e) => warn!("Completion not applied: {}", e),
        }
        drop(cell);
        let label = match self.state {
            EngineState::RampingUp | EngineState::QuickRampingUp => {
                format!("Ramping up completed, holding at {:.3} V", voltage)
            }
            _ => format!("Ramping down completed, holding at {:.3} V", voltage),
        };
        info!("{}", label);
        self.shared.publish(EngineState::Idle, label);
    }

    fn fault(&self, code: u32, e: anyhow::Error) {
        error!("Hardware write of code {} failed: {}", code, e);
        {
            let mut cell = self.shared.state_cell();
            if cell.generation == self.generation {
                if let Ok(next) = cell.state.transition(Event::Faulted) {
                    cell.state = next;
                }
            }
        }
        let err = EngineError::HardwareWriteFault(e.to_string());
        self.shared.publish(
            EngineState::Idle,
            format!("{}, holding at {:.3} V", err, self.shared.current_voltage()),
        );
    }
}
