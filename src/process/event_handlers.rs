use super::types::{Event, ExitInfo, SupervisorState};
use super::Inner;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Waits for the child to exit and reports it as an [`Event::Exited`].
///
/// Signals for the child arrive on `signals` and are delivered here, where the
/// child is known not to be reaped yet. Once every sender is gone without an
/// observed exit the child is killed.
pub(super) async fn observe_exit(
    mut child: Child,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
) {
    let status = loop {
        select! {
            status = child.wait() => break status,
            request = signals.recv() => match request {
                Some(signal) => deliver(&mut child, signal),
                None => {
                    warn!("Process handle released while running, killing backend");
                    deliver(&mut child, Signal::SIGKILL);
                    break child.wait().await;
                }
            },
        }
    };
    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(err) => {
            error!(?err, "Failed to wait for backend");
            ExitInfo::default()
        }
    };
    if events.send(Event::Exited { generation, info }).is_err() {
        debug!("Supervisor gone, exit not reported");
    }
}

fn deliver(child: &mut Child, signal: Signal) {
    if signal == Signal::SIGKILL {
        match child.start_kill() {
            Ok(()) => debug!(?signal, "Signal sent"),
            Err(err) => error!(?err, "Failed to kill backend"),
        }
        return;
    }
    let Some(pid) = child.id() else {
        debug!(?signal, "Process already reaped");
        return;
    };
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!(pid, ?signal, "Signal sent"),
        Err(Errno::ESRCH) => debug!(pid, ?signal, "Process already gone"),
        Err(err) => error!(?err, pid, ?signal, "Failed to send signal"),
    }
}

pub(super) fn handle_exit_event(inner: &Inner, generation: u64, info: ExitInfo) {
    let mut slot = inner.slot.lock();
    if slot.process.as_ref().map(|p| p.generation) != Some(generation) {
        debug!(generation, "Ignoring exit of stale process");
        return;
    }
    let Some(process) = slot.process.take() else {
        return;
    };
    slot.health = None;
    slot.startup = None;
    let previous = inner.transition(&mut slot, SupervisorState::Stopped);
    drop(slot);

    match previous {
        SupervisorState::Stopping => info!(pid = process.pid, %info, "Backend stopped"),
        SupervisorState::Starting => {
            warn!(pid = process.pid, %info, "Backend exited during startup")
        }
        _ if info.code == Some(0) => info!(pid = process.pid, %info, "Backend exited"),
        _ => warn!(pid = process.pid, %info, "Backend exited unexpectedly"),
    }
    process.exit.send_replace(Some(info));
}

pub(super) fn handle_health_event(inner: &Inner, generation: u64, healthy: bool) {
    let mut slot = inner.slot.lock();
    if slot.process.as_ref().map(|p| p.generation) != Some(generation) {
        return;
    }
    let current = *inner.state.borrow();
    let next = match (current, healthy) {
        (SupervisorState::Degraded, true) => SupervisorState::Running,
        (SupervisorState::Running, false) => SupervisorState::Degraded,
        _ => return,
    };
    inner.transition(&mut slot, next);
    if healthy {
        info!("Backend healthy again");
    } else {
        warn!("Backend health check failed");
    }
}
