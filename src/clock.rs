use crossbeam_channel::{Receiver, Sender, at, never, select, unbounded};
use log::trace;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WaitOutcome {
    /// The alarm fired: the clock ran out of time.
    Fired,
    /// The caller cancelled the wait.
    Cancelled,
}

#[derive(Debug)]
struct ClockState {
    initial: Duration,
    increment: Duration,
    // last_known - (now - reference) is the remaining time while running;
    // last_known is authoritative while stopped.
    last_known: Duration,
    reference: Option<Instant>,
    // At most one pending alarm; present exactly while running.
    alarm: Option<Receiver<Instant>>,
}

/// A per-player countdown clock on a monotonic time source.
///
/// The handle is cheaply cloneable and may be shared between the command
/// loop and a waiting player task. `wait_for_timeout` is the suspending
/// operation consumed by the clock player; everything else returns
/// immediately.
#[derive(Clone, Debug)]
pub struct Clock {
    state: Arc<Mutex<ClockState>>,
    // Pulsed on every start/stop/set so an outstanding wait re-reads the alarm.
    control_tx: Sender<()>,
    control_rx: Receiver<()>,
}

impl Clock {
    pub fn new(initial: Duration, increment: Duration) -> Clock {
        let (control_tx, control_rx) = unbounded();
        Clock {
            state: Arc::new(Mutex::new(ClockState {
                initial,
                increment,
                last_known: initial,
                reference: None,
                alarm: None,
            })),
            control_tx,
            control_rx,
        }
    }

    pub fn increment(&self) -> Duration {
        self.state.lock().unwrap().increment
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().reference.is_some()
    }

    /// Projected remaining time, clamped at zero.
    pub fn remaining(&self) -> Duration {
        let state = self.state.lock().unwrap();
        match state.reference {
            Some(reference) => state.last_known.saturating_sub(reference.elapsed()),
            None => state.last_known,
        }
    }

    /// Total time used so far against the initial allotment.
    pub fn time_used(&self) -> Duration {
        let state = self.state.lock().unwrap();
        let remaining = match state.reference {
            Some(reference) => state.last_known.saturating_sub(reference.elapsed()),
            None => state.last_known,
        };
        state.initial.saturating_sub(remaining)
    }

    /// Start the clock and arm the alarm. No-op if already running.
    pub fn start(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.reference.is_some() {
                return;
            }
            let now = Instant::now();
            state.reference = Some(now);
            state.alarm = Some(at(now + state.last_known));
        }
        let _ = self.control_tx.send(());
    }

    /// Stop the clock, folding the projection back into the remaining time
    /// and cancelling the pending alarm. No-op if already stopped.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(reference) = state.reference.take() {
                state.last_known = state.last_known.saturating_sub(reference.elapsed());
            }
            state.alarm = None;
        }
        let _ = self.control_tx.send(());
    }

    /// Add the configured increment; called once per completed move.
    pub fn apply_increment(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let increment = state.increment;
            state.last_known += increment;
            if let Some(reference) = state.reference {
                state.alarm = Some(at(reference + state.last_known));
            }
        }
        let _ = self.control_tx.send(());
    }

    /// Set the remaining time, keeping time-used accounting consistent.
    /// Restarts the clock if it was running.
    pub fn set(&self, remaining: Duration) {
        {
            let mut state = self.state.lock().unwrap();
            let was_running = state.reference.is_some();
            if let Some(reference) = state.reference.take() {
                state.last_known = state.last_known.saturating_sub(reference.elapsed());
            }
            let used = state.initial.saturating_sub(state.last_known);
            state.initial = used + remaining;
            state.last_known = remaining;
            if was_running {
                let now = Instant::now();
                state.reference = Some(now);
                state.alarm = Some(at(now + state.last_known));
            } else {
                state.alarm = None;
            }
        }
        let _ = self.control_tx.send(());
    }

    /// Block until the alarm fires or `cancel` is signalled (a message or a
    /// dropped sender both cancel). A stopped clock waits indefinitely until
    /// cancelled. Safe to call with no alarm pending.
    pub fn wait_for_timeout(&self, cancel: &Receiver<()>) -> WaitOutcome {
        loop {
            // Drop stale control pulses before snapshotting the alarm.
            while self.control_rx.try_recv().is_ok() {}
            let alarm = self
                .state
                .lock()
                .unwrap()
                .alarm
                .clone()
                .unwrap_or_else(never);
            select! {
                recv(alarm) -> _ => {
                    // The alarm may be stale if the clock was adjusted after
                    // the snapshot; only a really exhausted clock fires.
                    if self.remaining().is_zero() {
                        trace!("clock alarm fired");
                        return WaitOutcome::Fired;
                    }
                }
                recv(self.control_rx) -> _ => continue,
                recv(cancel) -> _ => return WaitOutcome::Cancelled,
            }
        }
    }
}

impl fmt::Display for Clock {
    /// Time control display like "5m+3s".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (initial, increment) = {
            let state = self.state.lock().unwrap();
            (state.initial, state.increment)
        };
        write!(f, "{}", show_duration(initial))?;
        if !increment.is_zero() {
            write!(f, "+{}", show_duration(increment))?;
        }
        Ok(())
    }
}

pub fn show_duration(d: Duration) -> String {
    let seconds = d.as_secs_f64();
    let minutes = (seconds / 60.0).floor() as u64;
    let seconds = seconds - minutes as f64 * 60.0;
    match (minutes, seconds) {
        (0, s) => format!("{s}s"),
        (m, s) if s == 0.0 => format!("{m}m"),
        (m, s) => format!("{m}m{s}s"),
    }
}
