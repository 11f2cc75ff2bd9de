//! Re-armable phase timers and the multi-wait the state machine parks on.
//!
//! Each timer is a pinned `tokio::time::Sleep` reset at phase entry; an
//! unarmed timer simply never fires, so a wait on it falls through to the
//! shutdown signal or the wall-clock deadline.

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, Sleep, sleep_until};

/// Sentinel deadline for an unarmed timer; far enough out that it never
/// fires within a process lifetime.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 10);

pub struct PhaseTimer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl PhaseTimer {
    pub fn unarmed() -> Self {
        Self {
            sleep: Box::pin(sleep_until(Instant::now() + FAR_FUTURE)),
            armed: false,
        }
    }

    pub fn arm(&mut self, after: Duration) {
        self.sleep.as_mut().reset(Instant::now() + after);
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + FAR_FUTURE);
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Resolves when the armed deadline passes. Pends forever while
    /// unarmed.
    pub async fn fired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The phase timer fired.
    TimerFired,
    /// The engine is shutting down.
    Shutdown,
    /// The wall-clock bound passed before the timer fired.
    DeadlinePassed,
}

/// Parks on the earliest of (timer fire, shutdown signal, wall-clock
/// deadline) and reports which won.
pub async fn wait_for_timer(
    timer: &mut PhaseTimer,
    deadline: Instant,
    shutdown: &mut watch::Receiver<bool>,
) -> WaitOutcome {
    tokio::select! {
        _ = timer.fired() => WaitOutcome::TimerFired,
        _ = wait_for_shutdown(shutdown) => WaitOutcome::Shutdown,
        _ = sleep_until(deadline) => WaitOutcome::DeadlinePassed,
    }
}

/// Resolves once the shutdown flag is raised; a dropped sender counts as
/// shutdown too.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
