//! Two-level simulation-step watchdog
//!
//! Armed before each synchronous step handler and reset on return. A soft
//! expiry invokes the warn handler; a hard expiry invokes the error handler,
//! which escalates the participant to Error. Without configured timeouts the
//! watchdog is inert.

use crate::config::HealthCheck;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

enum WatchdogCmd {
    Start,
    Reset,
}

pub type TimeoutHandler = Arc<dyn Fn(Duration) + Send + Sync>;

pub struct Watchdog {
    tx: Option<mpsc::UnboundedSender<WatchdogCmd>>,
}

impl Watchdog {
    /// Spawns the timer task when at least one timeout is configured.
    pub fn new(config: &HealthCheck, warn: TimeoutHandler, error: TimeoutHandler) -> Self {
        let soft = config.soft_response_timeout.map(Duration::from_millis);
        let hard = config.hard_response_timeout.map(Duration::from_millis);
        if soft.is_none() && hard.is_none() {
            return Self { tx: None };
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(watchdog_loop(rx, soft, hard, warn, error));
        Self { tx: Some(tx) }
    }

    pub fn inert() -> Self {
        Self { tx: None }
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    pub fn start(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WatchdogCmd::Start);
        }
    }

    pub fn reset(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WatchdogCmd::Reset);
        }
    }
}

async fn watchdog_loop(
    mut rx: mpsc::UnboundedReceiver<WatchdogCmd>,
    soft: Option<Duration>,
    hard: Option<Duration>,
    warn: TimeoutHandler,
    error: TimeoutHandler,
) {
    'idle: while let Some(cmd) = rx.recv().await {
        if !matches!(cmd, WatchdogCmd::Start) {
            continue;
        }
        let started = std::time::Instant::now();

        if let Some(soft) = soft {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(WatchdogCmd::Reset) => continue 'idle,
                    Some(WatchdogCmd::Start) => continue 'idle,
                    None => return,
                },
                _ = tokio::time::sleep(soft) => warn(soft),
            }
        }
        if let Some(hard) = hard {
            let remaining = hard.saturating_sub(started.elapsed());
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(WatchdogCmd::Reset) => continue 'idle,
                    Some(WatchdogCmd::Start) => continue 'idle,
                    None => return,
                },
                _ = tokio::time::sleep(remaining) => error(hard),
            }
        }
        // Hard expiry fired (or only a soft level is configured): swallow
        // commands until the step's reset arrives.
        loop {
            match rx.recv().await {
                Some(WatchdogCmd::Reset) => continue 'idle,
                Some(WatchdogCmd::Start) => continue 'idle,
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn health(soft: Option<u64>, hard: Option<u64>) -> HealthCheck {
        HealthCheck { soft_response_timeout: soft, hard_response_timeout: hard }
    }

    #[tokio::test]
    async fn unconfigured_watchdog_is_inert() {
        let wd = Watchdog::new(&health(None, None), Arc::new(|_| {}), Arc::new(|_| {}));
        assert!(!wd.is_active());
        wd.start();
        wd.reset();
    }

    #[tokio::test]
    async fn fast_step_triggers_nothing() {
        let warned = Arc::new(AtomicUsize::new(0));
        let warned2 = warned.clone();
        let wd = Watchdog::new(
            &health(Some(50), Some(100)),
            Arc::new(move |_| {
                warned2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| panic!("hard timeout must not fire")),
        );
        wd.start();
        tokio::time::sleep(Duration::from_millis(5)).await;
        wd.reset();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(warned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_step_escalates_soft_then_hard() {
        let warned = Arc::new(AtomicUsize::new(0));
        let errored = Arc::new(AtomicUsize::new(0));
        let warned2 = warned.clone();
        let errored2 = errored.clone();
        let wd = Watchdog::new(
            &health(Some(20), Some(60)),
            Arc::new(move |_| {
                warned2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |_| {
                errored2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wd.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(warned.load(Ordering::SeqCst), 1);
        assert_eq!(errored.load(Ordering::SeqCst), 1);
        wd.reset();

        // The next step arms a fresh cycle.
        wd.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(warned.load(Ordering::SeqCst), 2);
        assert_eq!(errored.load(Ordering::SeqCst), 2);
    }
}
