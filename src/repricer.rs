// ─────────────────────────────────────────────────────────────────────────────
// repricer.rs — Repricing order task + price monitor
//
// Keeps a limit order pinned to the policy price until the requested volume
// has traded: each round submits one order, watches the market, cancels on
// adverse drift and re-enters with the residual. Cancelling the task never
// abandons a live broker order; the cleanup path cancels it and drains the
// insert task to FINISHED under a timeout.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{Account, Api};
use crate::errors::TargetPosError;
use crate::insert_order::InsertOrderTask;
use crate::model::{Direction, Offset, OrderStatus, TradeRecord};
use crate::price::PricePolicy;
use crate::trace::TaskTrace;

/// How long a shutdown waits for a silent broker feed before giving up on an
/// order.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Price monitor ───────────────────────────────────────────────────────────

/// Watches the policy price and cancels the resting order once the market
/// moves against it.
pub(crate) struct PriceMonitorTask {
    handle: JoinHandle<()>,
    close: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl PriceMonitorTask {
    pub(crate) fn spawn(
        api: Api,
        symbol: String,
        direction: Direction,
        price: PricePolicy,
        order_price: f64,
        order_id: String,
    ) -> Self {
        let close = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let handle = {
            let close = close.clone();
            let fired = fired.clone();
            tokio::spawn(async move {
                let trace = TaskTrace::new("PriceMonitorTask", symbol.clone());
                let mut update_rx = api.subscribe();
                loop {
                    trace.awaiting("update_chan.recv", &[]);
                    let open = tokio::select! {
                        _ = close.cancelled() => false,
                        changed = update_rx.changed() => changed.is_ok(),
                    };
                    trace.resumed("update_chan.recv");
                    if !open {
                        break;
                    }
                    let Some(quote) = api.quote(&symbol) else {
                        continue;
                    };
                    let Some(new_price) = price.resolve(&quote, direction) else {
                        continue;
                    };
                    let adverse = match direction {
                        Direction::Buy => new_price > order_price,
                        Direction::Sell => new_price < order_price,
                    };
                    if adverse {
                        log::info!(
                            "[REPRICE] {symbol} moved against resting {direction} @ {order_price} (now {new_price}), cancelling {order_id}"
                        );
                        fired.store(true, Ordering::SeqCst);
                        api.cancel_order(&order_id);
                        break;
                    }
                }
                trace.complete("run");
            })
        };
        Self {
            handle,
            close,
            fired,
        }
    }

    /// True once the monitor has requested a price-drift cancel.
    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Closes the monitor's update channel; it exits at the next poll.
    pub(crate) fn close(&self) {
        self.close.cancel();
    }

    pub(crate) async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }
}

// ─── Repricing task ──────────────────────────────────────────────────────────

pub(crate) struct RepriceRequest {
    pub api: Api,
    pub account: Account,
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i64,
    pub min_volume: Option<i64>,
    pub max_volume: Option<i64>,
    pub price: PricePolicy,
    pub trade_tx: Option<mpsc::UnboundedSender<i64>>,
    pub trade_objs_tx: Option<mpsc::UnboundedSender<TradeRecord>>,
}

pub(crate) struct RepricingOrderTask {
    handle: JoinHandle<Result<(), TargetPosError>>,
    cancel: CancellationToken,
    trace_id: u64,
}

enum StepOutcome {
    Continue,
    Cancelled,
}

impl RepricingOrderTask {
    pub(crate) fn spawn(request: RepriceRequest, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let trace = TaskTrace::new("RepricingOrderTask", request.symbol.clone());
        let trace_id = trace.task_id();
        let handle = tokio::spawn(Self::run(request, cancel.clone(), trace));
        Self {
            handle,
            cancel,
            trace_id,
        }
    }

    pub(crate) fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the task; a panic inside it is resumed here.
    pub(crate) async fn join(self) -> Result<(), TargetPosError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(()),
        }
    }

    async fn run(
        request: RepriceRequest,
        cancel: CancellationToken,
        trace: TaskTrace,
    ) -> Result<(), TargetPosError> {
        trace.awaiting("get_quote", &[]);
        let got_quote = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = request.api.get_quote(&request.symbol) => true,
        };
        trace.resumed("get_quote");
        if !got_quote {
            return Ok(());
        }

        let mut remaining = request.volume;
        while remaining != 0 {
            match Self::step(&request, &cancel, &trace, &mut remaining).await? {
                StepOutcome::Continue => {}
                StepOutcome::Cancelled => return Ok(()),
            }
        }
        trace.complete("run");
        Ok(())
    }

    /// One submit-observe-cancel round. The cleanup section always runs once
    /// the order exists, even when the task is cancelled mid-round.
    async fn step(
        request: &RepriceRequest,
        cancel: &CancellationToken,
        trace: &TaskTrace,
        remaining: &mut i64,
    ) -> Result<StepOutcome, TargetPosError> {
        let quote = request
            .api
            .quote(&request.symbol)
            .ok_or_else(|| TargetPosError::BadPrice {
                symbol: request.symbol.clone(),
                direction: request.direction,
            })?;
        let limit_price = request
            .price
            .resolve(&quote, request.direction)
            .ok_or_else(|| TargetPosError::BadPrice {
                symbol: request.symbol.clone(),
                direction: request.direction,
            })?;

        let this_volume = match (request.min_volume, request.max_volume) {
            (Some(min), Some(max)) if *remaining >= max => rand::thread_rng().gen_range(min..=max),
            _ => *remaining,
        };
        log::debug!(
            "[REPRICE] {} {} {} {} lots @ {} ({} remaining)",
            request.symbol,
            request.direction,
            request.offset,
            this_volume,
            limit_price,
            remaining
        );

        let mut insert = InsertOrderTask::spawn(
            request.api.clone(),
            request.account.clone(),
            request.symbol.clone(),
            request.direction,
            request.offset,
            this_volume,
            limit_price,
            request.trade_tx.clone(),
            request.trade_objs_tx.clone(),
        );
        let mut monitor: Option<PriceMonitorTask> = None;
        let mut interrupted = false;
        let mut outcome: Result<StepOutcome, TargetPosError> = Ok(StepOutcome::Continue);

        trace.awaiting("order_chan.recv", &[insert.trace_id()]);
        let first = tokio::select! {
            _ = cancel.cancelled() => None,
            order = insert.recv_order() => order,
        };
        trace.resumed("order_chan.recv");

        match first {
            None => interrupted = true,
            Some(first) => {
                let mon = PriceMonitorTask::spawn(
                    request.api.clone(),
                    request.symbol.clone(),
                    request.direction,
                    request.price.clone(),
                    limit_price,
                    insert.order_id().to_string(),
                );
                // The insert task must drain to FINISHED no matter what, so
                // cancellation only interrupts this wait, never the task.
                trace.awaiting("shield(insert_order_task)", &[insert.trace_id()]);
                tokio::select! {
                    _ = cancel.cancelled() => interrupted = true,
                    _ = insert.join() => {}
                }
                trace.resumed("shield(insert_order_task)");
                if !interrupted {
                    let last = insert.latest_order(first);
                    *remaining -= this_volume - last.volume_left;
                    if last.volume_left != 0 && !mon.fired() {
                        outcome = Err(TargetPosError::BrokerRejected {
                            symbol: request.symbol.clone(),
                            direction: request.direction,
                            offset: request.offset,
                            volume: this_volume,
                            limit_price,
                            last_msg: last.last_msg,
                        });
                    }
                }
                monitor = Some(mon);
            }
        }

        // ─── Cleanup (always runs) ───────────────────────────────────────────
        if let Some(order) = request.api.get_order(insert.order_id()) {
            if order.status == OrderStatus::Alive {
                request.api.cancel_order(insert.order_id());
            }
        }
        if let Some(mon) = monitor {
            mon.close();
            mon.join().await;
        }
        trace.awaiting("drain(insert_order_task)", &[insert.trace_id()]);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, insert.join()).await;
        trace.resumed("drain(insert_order_task)");
        if drained.is_err() {
            return Err(TargetPosError::HangingOrder {
                order_id: insert.order_id().to_string(),
                timeout_secs: DRAIN_TIMEOUT.as_secs(),
            });
        }

        let outcome = outcome?;
        if interrupted {
            return Ok(StepOutcome::Cancelled);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tokio::time::{timeout, Duration};

    use crate::model::Quote;

    fn quote(ask: f64, bid: f64) -> Quote {
        let mut q = Quote::new(
            "DCE.m2405",
            NaiveDate::from_ymd_opt(2024, 3, 14)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        );
        q.ask_price1 = Some(ask);
        q.bid_price1 = Some(bid);
        q
    }

    fn request(api: &Api, volume: i64) -> RepriceRequest {
        RepriceRequest {
            api: api.clone(),
            account: api.check_valid(None).unwrap(),
            symbol: "DCE.m2405".to_string(),
            direction: Direction::Buy,
            offset: Offset::Open,
            volume,
            min_volume: None,
            max_volume: None,
            price: PricePolicy::Active,
            trade_tx: None,
            trade_objs_tx: None,
        }
    }

    async fn wait_for_alive_order(api: &Api) -> crate::model::Order {
        let mut rx = api.subscribe();
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(order) = api
                    .active_orders("sim", "DCE.m2405")
                    .into_iter()
                    .next()
                {
                    return order;
                }
                let _ = rx.changed().await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_fill_completes_task() {
        let api = Api::simulated();
        api.feed_quote(quote(3001.0, 3000.0));
        let root = CancellationToken::new();
        let task = RepricingOrderTask::spawn(request(&api, 5), &root);

        let order = wait_for_alive_order(&api).await;
        assert_eq!(order.limit_price, 3001.0);
        api.feed_fill(&order.order_id, 5, 3001.0);

        timeout(Duration::from_secs(2), task.join())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_fires_and_task_reprices() {
        let api = Api::simulated();
        api.feed_quote(quote(100.0, 99.0));
        let root = CancellationToken::new();
        let task = RepricingOrderTask::spawn(request(&api, 5), &root);

        let order = wait_for_alive_order(&api).await;
        assert_eq!(order.limit_price, 100.0);

        // market runs away: monitor cancels, task re-submits at the new ask
        api.feed_quote(quote(101.0, 100.0));
        let reorder = timeout(Duration::from_secs(2), async {
            let mut rx = api.subscribe();
            loop {
                if let Some(o) = api
                    .active_orders("sim", "DCE.m2405")
                    .into_iter()
                    .find(|o| o.limit_price == 101.0)
                {
                    return o;
                }
                let _ = rx.changed().await;
            }
        })
        .await
        .unwrap();

        api.feed_fill(&reorder.order_id, 5, 101.0);
        timeout(Duration::from_secs(2), task.join())
            .await
            .unwrap()
            .unwrap();

        // the drifted order was cancelled, the replacement filled
        let first = api.get_order(&order.order_id).unwrap();
        assert_eq!(first.status, OrderStatus::Finished);
        assert_eq!(first.last_msg, "cancelled");
    }

    #[tokio::test]
    async fn test_rejected_order_surfaces_broker_error() {
        let api = Api::simulated();
        api.feed_quote(quote(100.0, 99.0));
        let root = CancellationToken::new();
        let task = RepricingOrderTask::spawn(request(&api, 5), &root);

        let order = wait_for_alive_order(&api).await;
        api.feed_finish_order(&order.order_id, "insufficient margin");

        let err = timeout(Duration::from_secs(2), task.join())
            .await
            .unwrap()
            .unwrap_err();
        match err {
            TargetPosError::BrokerRejected { last_msg, .. } => {
                assert_eq!(last_msg, "insufficient margin");
            }
            other => panic!("expected BrokerRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_drains_live_order() {
        let api = Api::simulated();
        api.feed_quote(quote(100.0, 99.0));
        let root = CancellationToken::new();
        let task = RepricingOrderTask::spawn(request(&api, 5), &root);

        let order = wait_for_alive_order(&api).await;
        task.cancel();
        timeout(Duration::from_secs(2), task.join())
            .await
            .unwrap()
            .unwrap();

        // the live order was cancelled during cleanup, not abandoned
        let order = api.get_order(&order.order_id).unwrap();
        assert_eq!(order.status, OrderStatus::Finished);
        assert_eq!(order.volume_left, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_feed_hangs_then_errors() {
        let api = Api::simulated();
        api.feed_quote(quote(100.0, 99.0));
        api.set_cancel_responsive(false);
        let root = CancellationToken::new();
        let task = RepricingOrderTask::spawn(request(&api, 5), &root);

        wait_for_alive_order(&api).await;
        task.cancel();

        let err = task.join().await.unwrap_err();
        assert!(matches!(err, TargetPosError::HangingOrder { .. }));
    }

    #[tokio::test]
    async fn test_split_mode_draws_within_bounds() {
        let api = Api::simulated();
        api.feed_quote(quote(100.0, 99.0));
        let root = CancellationToken::new();
        let mut req = request(&api, 50);
        req.min_volume = Some(2);
        req.max_volume = Some(10);
        let task = RepricingOrderTask::spawn(req, &root);

        let mut total = 0i64;
        let mut rx = api.subscribe();
        while total < 50 {
            let order = timeout(Duration::from_secs(2), async {
                loop {
                    if let Some(o) = api.active_orders("sim", "DCE.m2405").into_iter().next() {
                        return o;
                    }
                    let _ = rx.changed().await;
                }
            })
            .await
            .unwrap();
            let lots = order.volume_origin;
            assert!((2..=10).contains(&lots) || (total + lots) == 50);
            assert!(lots <= 50 - total);
            api.feed_fill(&order.order_id, lots, 100.0);
            total += lots;
        }
        assert_eq!(total, 50);
        timeout(Duration::from_secs(2), task.join())
            .await
            .unwrap()
            .unwrap();
    }
}
