mod event_handlers;
mod run;
mod types;

pub use self::run::{CommandLauncher, Launcher, HOST_ENV, PORT_ENV, UNBUFFERED_ENV};
pub use self::types::{ExitInfo, StartOutcome, Status, StopOutcome, SupervisorState};

use self::run::OutputCache;
use self::types::Event;
use crate::configs::ProcessConfig;
use crate::error::{Result, SupervisorError};
use crate::health::HealthMonitor;
use crate::probe::ReadinessProbe;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Owns the backend process and its lifecycle.
///
/// Cloning is cheap and every clone drives the same process. Build one per
/// application and hand clones to whoever needs it. Must be created inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProcessConfig,
    client: reqwest::Client,
    probe: ReadinessProbe,
    launcher: Box<dyn Launcher>,
    output: OutputCache,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Sender<SupervisorState>,
    slot: Mutex<Slot>,
}

/// Everything the supervisor owns exclusively. Only touched under the lock,
/// and the lock is never held across an await.
struct Slot {
    process: Option<ProcessHandle>,
    startup: Option<StartupOperation>,
    health: Option<HealthMonitor>,
    since: DateTime<Utc>,
    next_id: u64,
}

struct ProcessHandle {
    pid: u32,
    generation: u64,
    exit: watch::Sender<Option<ExitInfo>>,
    shutdown: Option<SharedOutcome<StopOutcome>>,
    // Signals go through the exit observer, which owns the child. Dropping
    // every sender without an observed exit makes it kill the child.
    signals: mpsc::UnboundedSender<Signal>,
}

struct Launched {
    generation: u64,
    signals: mpsc::UnboundedSender<Signal>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

struct StartupOperation {
    id: u64,
    outcome: SharedOutcome<StartOutcome>,
}

impl Supervisor {
    pub fn new(config: ProcessConfig) -> Result<Self> {
        Self::with_launcher(config, CommandLauncher)
    }

    /// Fails only if the HTTP client cannot be built.
    pub fn with_launcher(config: ProcessConfig, launcher: impl Launcher) -> Result<Self> {
        // The backend is always local, never route it through a proxy.
        let client = reqwest::Client::builder().no_proxy().build()?;
        let probe = ReadinessProbe::new(client.clone(), &config);
        let output = run::output_cache(config.output_cache_size);
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SupervisorState::Stopped);
        let inner = Arc::new(Inner {
            config,
            client,
            probe,
            launcher: Box::new(launcher),
            output,
            events,
            state,
            slot: Mutex::new(Slot {
                process: None,
                startup: None,
                health: None,
                since: Utc::now(),
                next_id: 0,
            }),
        });
        tokio::spawn(
            run_events(Arc::downgrade(&inner), event_receiver).instrument(info_span!("supervisor")),
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Receives every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> Status {
        let slot = self.inner.slot.lock();
        let state = *self.inner.state.borrow();
        let config = &self.inner.config;
        Status {
            running: state == SupervisorState::Running,
            state,
            host: config.host.clone(),
            port: config.port,
            base_url: config.base_url(),
            pid: slot.process.as_ref().map(|p| p.pid),
            since: slot.since,
        }
    }

    /// Backend output captured so far, oldest first.
    pub fn recent_output(&self) -> String {
        self.inner.output.lock().extract().to_string()
    }

    /// Launches the backend and waits until it answers its health path.
    ///
    /// Calls made while a start is already in flight attach to it and get the
    /// same outcome. A backend that is already up is left alone.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<StartOutcome> {
        let outcome = {
            let mut slot = self.inner.slot.lock();
            let state = *self.inner.state.borrow();
            if state.is_up() {
                debug!("Backend already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            if state == SupervisorState::Stopping {
                return Err(SupervisorError::ShuttingDown);
            }
            if let Some((id, outcome)) = slot
                .startup
                .as_ref()
                .map(|startup| (startup.id, startup.outcome.clone()))
            {
                debug!(id, "Attaching to startup in progress");
                outcome
            } else {
                slot.next_id += 1;
                let id = slot.next_id;
                let task = tokio::spawn(
                    run_startup(self.inner.clone(), id).instrument(info_span!("startup", id)),
                );
                let outcome = async move { task.await? }.boxed().shared();
                slot.startup = Some(StartupOperation {
                    id,
                    outcome: outcome.clone(),
                });
                self.inner.transition(&mut slot, SupervisorState::Starting);
                outcome
            }
        };
        outcome.await
    }

    /// Stops the backend: SIGTERM, then SIGKILL once the grace period runs out.
    ///
    /// Resolves after the exit has been observed and the state is `Stopped`.
    /// A start in flight is allowed to settle first.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<StopOutcome> {
        loop {
            let pending = {
                let slot = self.inner.slot.lock();
                slot.startup.as_ref().map(|startup| startup.outcome.clone())
            };
            let Some(pending) = pending else {
                break;
            };
            debug!("Waiting for startup to settle before stopping");
            let _ = pending.await;
        }

        let shutdown = {
            let mut slot = self.inner.slot.lock();
            let Slot {
                process, health, ..
            } = &mut *slot;
            let Some(process) = process.as_mut() else {
                debug!("No backend process to stop");
                return Ok(StopOutcome::NotRunning);
            };
            if let Some(shutdown) = process.shutdown.clone() {
                debug!("Attaching to shutdown in progress");
                shutdown
            } else {
                // Health checks end before any signal is sent.
                health.take();
                let pid = process.pid;
                let exit = process.exit.subscribe();
                let signals = process.signals.clone();
                let grace = self.inner.config.grace_period;
                let task = tokio::spawn(
                    run_shutdown(signals, exit, grace).instrument(info_span!("shutdown", pid)),
                );
                let shutdown = async move { task.await? }.boxed().shared();
                process.shutdown = Some(shutdown.clone());
                self.inner.transition(&mut slot, SupervisorState::Stopping);
                shutdown
            }
        };
        shutdown.await
    }
}

impl Inner {
    /// Moves to `next` and returns the previous state. Requires the slot lock.
    fn transition(&self, slot: &mut Slot, next: SupervisorState) -> SupervisorState {
        let previous = self.state.send_replace(next);
        if previous != next {
            slot.since = Utc::now();
            info!(from = ?previous, to = ?next, "State transition");
        }
        previous
    }

    /// Spawns the process and registers its handle and exit observer.
    fn launch(&self) -> Result<Launched> {
        let mut child = self
            .launcher
            .launch(&self.config)
            .map_err(|err| SupervisorError::ProcessCreation(err.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::ProcessCreation("Child exited instantly".into()))?;
        run::forward_output(&mut child, pid, &self.output);

        let (exit, exit_receiver) = watch::channel(None);
        let (signals, signal_receiver) = mpsc::unbounded_channel();
        let generation = {
            let mut slot = self.slot.lock();
            slot.next_id += 1;
            let generation = slot.next_id;
            slot.process = Some(ProcessHandle {
                pid,
                generation,
                exit,
                shutdown: None,
                signals: signals.clone(),
            });
            generation
        };
        tokio::spawn(
            event_handlers::observe_exit(child, generation, self.events.clone(), signal_receiver)
                .instrument(info_span!("observe_exit", pid)),
        );
        info!(pid, "Backend launched");
        Ok(Launched {
            generation,
            signals,
            exit: exit_receiver,
        })
    }

    /// Returns the generation and exit receiver of a backend that answered
    /// its health path.
    async fn launch_and_wait_ready(&self) -> Result<(u64, watch::Receiver<Option<ExitInfo>>)> {
        let Launched {
            generation,
            signals,
            mut exit,
        } = self.launch()?;
        let ready = self
            .probe
            .wait_until_ready(self.config.max_startup_wait, self.config.poll_interval);
        let result = select! {
            result = ready => result,
            info = wait_exit(&mut exit) => Err(SupervisorError::ExitedDuringStartup(info)),
        };
        let exited = exit.borrow().is_some();
        if result.is_err() && !exited {
            // Never leave a handle behind a failed start.
            warn!("Killing backend after failed startup");
            request_signal(&signals, Signal::SIGKILL);
            wait_exit(&mut exit).await;
        }
        result.map(|_| (generation, exit))
    }

    /// Finishes startup attempt `id` once its backend is ready. Returns false
    /// if the exit observer already took the process.
    fn promote(&self, id: u64, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        let current = slot.startup.as_ref().map(|s| s.id) == Some(id);
        if current {
            slot.startup = None;
        }
        let alive = slot.process.as_ref().map(|p| p.generation) == Some(generation);
        if !(current && alive) {
            return false;
        }
        slot.health = Some(self.start_health_monitor(generation));
        self.transition(&mut slot, SupervisorState::Running);
        true
    }

    fn abandon_startup(&self, id: u64) {
        let mut slot = self.slot.lock();
        if slot.startup.as_ref().map(|s| s.id) == Some(id) {
            slot.startup = None;
            if slot.process.is_none() {
                self.transition(&mut slot, SupervisorState::Stopped);
            }
        }
    }

    fn start_health_monitor(&self, generation: u64) -> HealthMonitor {
        let events = self.events.clone();
        HealthMonitor::spawn(
            self.probe.clone(),
            self.config.health_interval,
            move |healthy| {
                let _ = events.send(Event::Health {
                    generation,
                    healthy,
                });
            },
        )
    }
}

async fn run_events(inner: Weak<Inner>, mut events: UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Event::Exited { generation, info } => {
                event_handlers::handle_exit_event(&inner, generation, info)
            }
            Event::Health {
                generation,
                healthy,
            } => event_handlers::handle_health_event(&inner, generation, healthy),
        }
    }
    debug!("Event loop finished");
}

async fn run_startup(inner: Arc<Inner>, id: u64) -> Result<StartOutcome> {
    match inner.launch_and_wait_ready().await {
        Ok((generation, mut exit)) => {
            if inner.promote(id, generation) {
                return Ok(StartOutcome::Started);
            }
            // The exit observer got there first.
            let info = wait_exit(&mut exit).await;
            warn!(%info, "Backend exited as it became ready");
            Err(SupervisorError::ExitedDuringStartup(info))
        }
        Err(err) => {
            warn!(%err, "Backend failed to start");
            inner.abandon_startup(id);
            Err(err)
        }
    }
}

async fn run_shutdown(
    signals: mpsc::UnboundedSender<Signal>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
    grace: std::time::Duration,
) -> Result<StopOutcome> {
    info!("Stopping backend");
    request_signal(&signals, Signal::SIGTERM);
    match tokio::time::timeout(grace, wait_exit(&mut exit)).await {
        Ok(_) => Ok(StopOutcome::Graceful),
        Err(_) => {
            warn!(
                "Backend still running after {}, killing",
                humantime::format_duration(grace)
            );
            request_signal(&signals, Signal::SIGKILL);
            wait_exit(&mut exit).await;
            Ok(StopOutcome::Forced)
        }
    }
}

/// Resolves once the exit observer has cleared the handle.
async fn wait_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match exit.wait_for(Option::is_some).await {
        Ok(info) => (*info).unwrap_or_default(),
        // Sender dropped with the supervisor.
        Err(_) => ExitInfo::default(),
    }
}

fn request_signal(signals: &mpsc::UnboundedSender<Signal>, signal: Signal) {
    if signals.send(signal).is_err() {
        debug!(?signal, "Backend already exited");
    }
}
