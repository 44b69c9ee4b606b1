//! Background loops that make sleeping tasks runnable again.

use std::sync::Arc;
use std::time::Duration;

use fso_events::SignalSource;
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::Shared;
use super::task::millis;

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Release due retrying tasks every retry interval.
pub(super) async fn sweep_retries(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = ticker(shared.settings.retry_interval());
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let released = shared.sweep();
        if released > 0 {
            trace!(released, "Retry sweep released tasks");
        }
    }
}

/// Polling discipline: re-queue every sleeping task each poll interval.
pub(super) async fn poll(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = ticker(shared.settings.poll_interval());
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let queued = shared.signal_all();
        trace!(queued, "Poll sweep re-queued tasks");
    }
}

/// Signal discipline: forward broadcast signals to the task table.
///
/// Every (re)connect re-signals all tasks, since signals sent while
/// disconnected are lost; the same happens every resignal interval as a
/// fallback. Without a source only the periodic re-signal runs.
pub(super) async fn watch_signals(
    shared: Arc<Shared>,
    source: Option<Arc<dyn SignalSource>>,
    cancel: CancellationToken,
) {
    let reconnect = shared.settings.signal_reconnect();
    let mut resignal = ticker(shared.settings.resignal_interval());

    let Some(source) = source else {
        warn!("No signal source configured; relying on periodic re-signal");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                _ = resignal.tick() => {
                    shared.signal_all();
                }
            }
        }
    };

    loop {
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            opened = source.signals() => opened,
        };

        match opened {
            Ok(mut signals) => {
                let queued = shared.signal_all();
                info!(queued, "Signal stream connected");
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        _ = resignal.tick() => {
                            let queued = shared.signal_all();
                            debug!(queued, "Periodic re-signal");
                        }
                        next = signals.next() => match next {
                            Some(Ok(entity)) => {
                                shared.signal(entity);
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Signal stream failed");
                                break;
                            }
                            None => {
                                debug!("Signal stream closed");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, retry_in_ms = millis(reconnect), "Opening signal stream failed");
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(reconnect) => {}
        }
    }
}
