// ─────────────────────────────────────────────────────────────────────────────
// clock.rs — Market clock task
//
// Tracks the wall clock of the most recent quote diff so the controller can
// reconstruct "now" for the trading-session gate, and pings a latest-only
// signal the controller parks on while a session is closed.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::NaiveDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::Api;
use crate::chan::{latest_channel, LatestReceiver};
use crate::model::Quote;
use crate::trace::TaskTrace;

/// Assumed feed latency: the quote was on the wire slightly before we stamped
/// it locally.
const QUOTE_CLOCK_SKEW: Duration = Duration::from_millis(5);

pub(crate) struct MarketClockTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Spawns the clock task for `symbol`. Returns the task handle, the shared
/// wall-clock record of the last quote update, and the update signal.
pub(crate) fn spawn(
    api: Api,
    symbol: String,
) -> (MarketClockTask, Arc<Mutex<SystemTime>>, LatestReceiver<()>) {
    let cancel = CancellationToken::new();
    let time_record = Arc::new(Mutex::new(SystemTime::now() - QUOTE_CLOCK_SKEW));
    let (update_tx, update_rx) = latest_channel();
    let handle = {
        let cancel = cancel.clone();
        let time_record = time_record.clone();
        tokio::spawn(async move {
            let trace = TaskTrace::new("MarketClockTask", symbol.clone());
            let mut rx = api.subscribe();
            // The signal is meaningless until the contract is actually
            // quoted.
            trace.awaiting("get_quote", &[]);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = api.get_quote(&symbol) => {
                    trace.resumed("get_quote");
                    loop {
                        trace.awaiting("update_chan.recv", &[]);
                        let alive = tokio::select! {
                            _ = cancel.cancelled() => false,
                            changed = rx.changed() => changed.is_ok(),
                        };
                        trace.resumed("update_chan.recv");
                        if !alive {
                            break;
                        }
                        *time_record.lock().unwrap() = SystemTime::now() - QUOTE_CLOCK_SKEW;
                        update_tx.send(());
                    }
                }
            }
            update_tx.close();
            trace.complete("run");
        })
    };
    (MarketClockTask { handle, cancel }, time_record, update_rx)
}

impl MarketClockTask {
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn join(self) {
        let _ = self.handle.await;
    }
}

pub(crate) fn nanos_to_datetime(nanos: i64) -> NaiveDateTime {
    chrono::DateTime::from_timestamp_nanos(nanos).naive_utc()
}

/// The controller's notion of "now": the simulated clock in backtest mode,
/// otherwise the quote's exchange timestamp advanced by the wall-clock time
/// since the quote arrived.
pub(crate) fn effective_now(
    api: &Api,
    quote: &Quote,
    time_record: &Mutex<SystemTime>,
) -> NaiveDateTime {
    if let Some(nanos) = api.backtest_time() {
        return nanos_to_datetime(nanos);
    }
    let recorded = *time_record.lock().unwrap();
    let elapsed = SystemTime::now().duration_since(recorded).unwrap_or_default();
    let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
    quote.datetime + elapsed
}
