//! Two-phase shutdown.
//!
//! ```text
//!   RUNNING --first signal--> stop accepting --Terminate--> TERMINATED
//!                                         \--Interrupt--> DRAINING
//!   DRAINING --in-flight handlers reach 0--> TERMINATED
//!   DRAINING --any further signal---------> TERMINATED
//! ```
//!
//! Request handlers report entry and exit through a channel of +1/-1 deltas;
//! only the coordinator keeps the running total.

use anyhow::{Context, Result};
use std::fmt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting, let in-flight requests finish (SIGINT).
    Interrupt,
    /// Stop accepting and exit at once (SIGTERM, or stdin closed).
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// Hands out [`HandlerGuard`]s. Cloned into every listener's router.
#[derive(Clone)]
pub struct HandlerTracker {
    tx: mpsc::UnboundedSender<isize>,
}

impl HandlerTracker {
    /// Records a handler entry. The matching exit is recorded when the guard
    /// drops, whether the handler returns, bails out early or panics.
    #[must_use]
    pub fn enter(&self) -> HandlerGuard {
        let _ = self.tx.send(1);
        HandlerGuard {
            tx: self.tx.clone(),
        }
    }
}

pub struct HandlerGuard {
    tx: mpsc::UnboundedSender<isize>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(-1);
    }
}

#[must_use]
pub fn handler_channel() -> (HandlerTracker, mpsc::UnboundedReceiver<isize>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HandlerTracker { tx }, rx)
}

pub struct Coordinator {
    phase: Phase,
    in_flight: isize,
    handlers: mpsc::UnboundedReceiver<isize>,
    signals: mpsc::Receiver<Signal>,
    stop_accepting: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        handlers: mpsc::UnboundedReceiver<isize>,
        signals: mpsc::Receiver<Signal>,
        stop_accepting: watch::Sender<bool>,
    ) -> Self {
        Self {
            phase: Phase::Running,
            in_flight: 0,
            handlers,
            signals,
            stop_accepting,
        }
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub const fn in_flight(&self) -> isize {
        self.in_flight
    }

    pub fn on_signal(&mut self, signal: Signal) -> Phase {
        self.phase = match self.phase {
            Phase::Running => {
                info!(%signal, in_flight = self.in_flight, "Got signal, closing listeners");
                self.stop_accepting.send_replace(true);
                match signal {
                    Signal::Terminate => Phase::Terminated,
                    Signal::Interrupt if self.in_flight <= 0 => Phase::Terminated,
                    Signal::Interrupt => Phase::Draining,
                }
            }
            Phase::Draining => {
                warn!(%signal, in_flight = self.in_flight, "Got second signal, exiting without waiting");
                Phase::Terminated
            }
            Phase::Terminated => Phase::Terminated,
        };
        self.phase
    }

    pub fn on_handler_delta(&mut self, delta: isize) -> Phase {
        self.in_flight += delta;
        if self.phase == Phase::Draining && self.in_flight <= 0 {
            info!("All in-flight requests finished");
            self.phase = Phase::Terminated;
        }
        self.phase
    }

    /// Drives the state machine until it terminates. Returns the number of
    /// request handlers that were still running at that point.
    pub async fn run(mut self) -> usize {
        let mut handlers_open = true;
        let mut signals_open = true;

        while self.phase != Phase::Terminated {
            tokio::select! {
                // Count every handler that entered before a signal arrived.
                biased;
                delta = self.handlers.recv(), if handlers_open => match delta {
                    Some(delta) => {
                        self.on_handler_delta(delta);
                    }
                    None => {
                        // Every guard has been dropped, so nothing is in flight.
                        handlers_open = false;
                        self.in_flight = 0;
                        if self.phase == Phase::Draining {
                            self.phase = Phase::Terminated;
                        }
                    }
                },
                signal = self.signals.recv(), if signals_open => match signal {
                    Some(signal) => {
                        self.on_signal(signal);
                    }
                    None => signals_open = false,
                },
                else => break,
            }
        }

        self.in_flight.max(0) as usize
    }
}

/// Forwards SIGINT and SIGTERM into the coordinator's signal channel.
#[cfg(unix)]
pub fn forward_os_signals(tx: mpsc::Sender<Signal>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                Some(()) = interrupt.recv() => Signal::Interrupt,
                Some(()) = terminate.recv() => Signal::Terminate,
                else => break,
            };
            if tx.send(signal).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn forward_os_signals(tx: mpsc::Sender<Signal>) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(Signal::Interrupt).await.is_err() {
                break;
            }
        }
    }))
}

/// Treats end of stdin as [`Signal::Terminate`], for supervisors that signal
/// shutdown by closing our stdin.
pub fn terminate_on_stdin_close(tx: mpsc::Sender<Signal>) -> JoinHandle<()> {
    use tokio::io::AsyncReadExt;

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buffer = [0u8; 256];
        loop {
            match stdin.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        info!("stdin closed");
        let _ = tx.send(Signal::Terminate).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Harness {
        tracker: HandlerTracker,
        signals: mpsc::Sender<Signal>,
        stopped: watch::Receiver<bool>,
        coordinator: Coordinator,
    }

    fn harness() -> Harness {
        let (tracker, handlers) = handler_channel();
        let (signals, signal_rx) = mpsc::channel(4);
        let (stop_tx, stopped) = watch::channel(false);
        Harness {
            tracker,
            signals,
            stopped,
            coordinator: Coordinator::new(handlers, signal_rx, stop_tx),
        }
    }

    mod transitions {
        use super::*;

        #[test]
        fn terminate_skips_draining() {
            let mut h = harness();
            h.coordinator.on_handler_delta(1);
            assert_eq!(h.coordinator.on_signal(Signal::Terminate), Phase::Terminated);
            assert!(*h.stopped.borrow());
        }

        #[test]
        fn interrupt_drains_until_handlers_finish() {
            let mut h = harness();
            h.coordinator.on_handler_delta(1);
            h.coordinator.on_handler_delta(1);
            assert_eq!(h.coordinator.on_signal(Signal::Interrupt), Phase::Draining);
            assert!(*h.stopped.borrow());
            assert_eq!(h.coordinator.on_handler_delta(-1), Phase::Draining);
            assert_eq!(h.coordinator.on_handler_delta(-1), Phase::Terminated);
        }

        #[test]
        fn interrupt_while_idle_terminates() {
            let mut h = harness();
            assert_eq!(h.coordinator.on_signal(Signal::Interrupt), Phase::Terminated);
        }

        #[test]
        fn second_signal_forces_exit() {
            for second in [Signal::Interrupt, Signal::Terminate] {
                let mut h = harness();
                h.coordinator.on_handler_delta(1);
                h.coordinator.on_signal(Signal::Interrupt);
                assert_eq!(h.coordinator.on_signal(second), Phase::Terminated);
                assert_eq!(h.coordinator.in_flight(), 1);
            }
        }

        #[test]
        fn handler_activity_does_not_stop_running_relay() {
            let mut h = harness();
            assert_eq!(h.coordinator.on_handler_delta(1), Phase::Running);
            assert_eq!(h.coordinator.on_handler_delta(-1), Phase::Running);
            assert!(!*h.stopped.borrow());
        }
    }

    mod run {
        use super::*;

        #[tokio::test]
        async fn waits_for_in_flight_handler_after_interrupt() {
            let h = harness();
            let guard = h.tracker.enter();
            let mut stopped = h.stopped.clone();
            let task = tokio::spawn(h.coordinator.run());

            h.signals.send(Signal::Interrupt).await.unwrap();
            stopped.wait_for(|s| *s).await.unwrap();
            sleep(Duration::from_millis(50)).await;
            assert!(!task.is_finished());

            drop(guard);
            let abandoned = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
            assert_eq!(abandoned, 0);
        }

        #[tokio::test]
        async fn second_signal_abandons_handlers() {
            let h = harness();
            let _guard = h.tracker.enter();
            let task = tokio::spawn(h.coordinator.run());

            h.signals.send(Signal::Interrupt).await.unwrap();
            h.signals.send(Signal::Interrupt).await.unwrap();
            let abandoned = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
            assert_eq!(abandoned, 1);
        }

        #[tokio::test]
        async fn terminate_does_not_wait() {
            let h = harness();
            let _guards = [h.tracker.enter(), h.tracker.enter()];
            let task = tokio::spawn(h.coordinator.run());

            h.signals.send(Signal::Terminate).await.unwrap();
            let abandoned = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
            assert_eq!(abandoned, 2);
            assert!(*h.stopped.borrow());
        }

        #[tokio::test]
        async fn guard_reports_exit_on_panic() {
            let h = harness();
            let tracker = h.tracker.clone();
            let task = tokio::spawn(h.coordinator.run());

            let handler = tokio::spawn(async move {
                let _guard = tracker.enter();
                panic!("handler blew up");
            });
            assert!(handler.await.is_err());

            h.signals.send(Signal::Interrupt).await.unwrap();
            let abandoned = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
            assert_eq!(abandoned, 0);
        }
    }
}
