//! One-shot timers backing the hello and handshake deadlines.
//!
//! Each timer is armed by the connection worker and, on expiry, enqueues a
//! [`Event::Timeout`] so the worker observes it through the same queue as
//! every other event. Expiry does not say which timer fired; the states that
//! care inspect the timer phases at the point of receipt.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerPhase {
    Idle,
    Running,
    Expired,
}

#[derive(Debug)]
struct TimerCore {
    phase: TimerPhase,
    /// Deadline of the most recent start; kept across a stop so that
    /// remaining time can still be read when extending a wait.
    deadline: Option<Instant>,
    generation: u64,
}

#[derive(Debug)]
pub(crate) struct OneShotTimer {
    core: Arc<Mutex<TimerCore>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OneShotTimer {
    pub(crate) fn new() -> Self {
        Self {
            core: Arc::new(Mutex::new(TimerCore {
                phase: TimerPhase::Idle,
                deadline: None,
                generation: 0,
            })),
            task: Mutex::new(None),
        }
    }

    /// Arms the timer; a running or expired timer is rescheduled.
    pub(crate) fn start(&self, duration: Duration, tx: mpsc::Sender<Event>) {
        let deadline = Instant::now() + duration;
        let generation = {
            let mut core = self.core.lock();
            core.generation += 1;
            core.phase = TimerPhase::Running;
            core.deadline = Some(deadline);
            core.generation
        };

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fired = {
                let mut core = core.lock();
                if core.generation == generation && core.phase == TimerPhase::Running {
                    core.phase = TimerPhase::Expired;
                    true
                } else {
                    false
                }
            };
            if fired {
                let _ = tx.try_send(Event::Timeout);
            }
        });

        if let Some(stale) = self.task.lock().replace(handle) {
            stale.abort();
        }
    }

    /// Stops a running timer. An expired timer keeps reporting expired until
    /// the next start, so a state that was woken by the expiry can still
    /// attribute it.
    pub(crate) fn stop(&self) {
        {
            let mut core = self.core.lock();
            core.generation += 1;
            if core.phase == TimerPhase::Running {
                core.phase = TimerPhase::Idle;
            }
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn phase(&self) -> TimerPhase {
        self.core.lock().phase
    }

    /// Time left until the most recently armed deadline; zero once passed or
    /// never armed.
    pub(crate) fn remaining(&self) -> Duration {
        self.core
            .lock()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

/// The three deadlines of the SHIP handshake (SHIP 13.4.4.1).
#[derive(Debug)]
pub(crate) struct TimerSet {
    pub(crate) wait_for_ready: OneShotTimer,
    pub(crate) send_prolongation_request: OneShotTimer,
    pub(crate) prolongation_request_reply: OneShotTimer,
}

impl TimerSet {
    pub(crate) fn new() -> Self {
        Self {
            wait_for_ready: OneShotTimer::new(),
            send_prolongation_request: OneShotTimer::new(),
            prolongation_request_reply: OneShotTimer::new(),
        }
    }

    pub(crate) fn stop_all(&self) {
        self.wait_for_ready.stop();
        self.prolongation_request_reply.stop();
        self.send_prolongation_request.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn expiry_flips_phase_and_enqueues_one_timeout() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = OneShotTimer::new();
        assert_eq!(timer.phase(), TimerPhase::Idle);

        timer.start(Duration::from_secs(5), tx);
        assert_eq!(timer.phase(), TimerPhase::Running);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(timer.phase(), TimerPhase::Expired);
        assert!(matches!(rx.recv().await, Some(Event::Timeout)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resets_a_running_timer_but_not_an_expired_one() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = OneShotTimer::new();

        timer.start(Duration::from_secs(5), tx.clone());
        timer.stop();
        assert_eq!(timer.phase(), TimerPhase::Idle);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(timer.phase(), TimerPhase::Idle);
        assert!(rx.try_recv().is_err());

        timer.start(Duration::from_secs(2), tx);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(timer.phase(), TimerPhase::Expired);
        timer.stop();
        assert_eq!(timer.phase(), TimerPhase::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_the_previous_schedule() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = OneShotTimer::new();

        timer.start(Duration::from_secs(2), tx.clone());
        timer.start(Duration::from_secs(10), tx);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(timer.phase(), TimerPhase::Running);
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(timer.phase(), TimerPhase::Expired);
        assert!(matches!(rx.recv().await, Some(Event::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_reports_against_the_last_deadline_even_after_stop() {
        let (tx, _rx) = mpsc::channel(4);
        let timer = OneShotTimer::new();
        assert_eq!(timer.remaining(), Duration::ZERO);

        timer.start(Duration::from_secs(60), tx);
        tokio::time::sleep(Duration::from_secs(10)).await;
        timer.stop();

        let remaining = timer.remaining();
        assert!(remaining <= Duration::from_secs(50));
        assert!(remaining >= Duration::from_secs(49));
    }
}
