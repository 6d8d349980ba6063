// ─────────────────────────────────────────────────────────────────────────────
// insert_order.rs — Single-order lifecycle task
//
// Submits one limit order and follows it through the diff feed until the
// broker reports FINISHED *and* the trade-record accounting has caught up,
// publishing order snapshots and incremental trade notifications on the way.
// The task is deliberately un-cancellable: parents wait for it (or cancel the
// broker order and then wait).
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{Account, Api};
use crate::model::{Direction, Offset, Order, OrderStatus, TradeRecord};
use crate::trace::TaskTrace;

const ORDER_ID_PREFIX: &str = "PYSDK_target";

/// Freshly generated broker order id.
fn generate_order_id() -> String {
    format!("{ORDER_ID_PREFIX}_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) struct InsertOrderTask {
    order_id: String,
    handle: Option<JoinHandle<()>>,
    order_rx: mpsc::UnboundedReceiver<Order>,
    trace_id: u64,
}

impl InsertOrderTask {
    /// Submits the order (synchronously, so the broker id exists from this
    /// point on) and spawns the observation loop.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        api: Api,
        account: Account,
        symbol: String,
        direction: Direction,
        offset: Offset,
        volume: i64,
        limit_price: f64,
        trade_tx: Option<mpsc::UnboundedSender<i64>>,
        trade_objs_tx: Option<mpsc::UnboundedSender<TradeRecord>>,
    ) -> Self {
        let order_id = generate_order_id();
        let trace = TaskTrace::new("InsertOrderTask", symbol.clone());
        let trace_id = trace.task_id();
        // Subscribe before submitting so no diff between submission and the
        // observation loop can be missed.
        let update_rx = api.subscribe();
        let order = api.insert_order(
            &account,
            &symbol,
            direction,
            offset,
            volume,
            limit_price,
            &order_id,
        );
        let (order_tx, order_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(
            api,
            order,
            update_rx,
            order_tx,
            trade_tx,
            trade_objs_tx,
            trace,
        ));
        Self {
            order_id,
            handle: Some(handle),
            order_rx,
            trace_id,
        }
    }

    pub(crate) fn order_id(&self) -> &str {
        &self.order_id
    }

    pub(crate) fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// Next published order record (the first call yields the submission
    /// snapshot).
    pub(crate) async fn recv_order(&mut self) -> Option<Order> {
        self.order_rx.recv().await
    }

    /// Drains any queued records and returns the newest, or `fallback` when
    /// none are pending.
    pub(crate) fn latest_order(&mut self, fallback: Order) -> Order {
        let mut latest = fallback;
        while let Ok(order) = self.order_rx.try_recv() {
            latest = order;
        }
        latest
    }

    /// Waits for the observation loop to finish. Idempotent; panics inside
    /// the task are resumed here.
    pub(crate) async fn join(&mut self) {
        if let Some(handle) = &mut self.handle {
            let result = handle.await;
            self.handle = None;
            if let Err(e) = result {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
    }

    async fn run(
        api: Api,
        order: Order,
        mut update_rx: tokio::sync::watch::Receiver<u64>,
        order_tx: mpsc::UnboundedSender<Order>,
        trade_tx: Option<mpsc::UnboundedSender<i64>>,
        trade_objs_tx: Option<mpsc::UnboundedSender<TradeRecord>>,
        trace: TaskTrace,
    ) {
        let order_id = order.order_id.clone();
        let direction = order.direction;
        let mut last_left = order.volume_left;
        let mut last_order = order;
        let mut seen_trades: HashSet<String> = HashSet::new();
        let _ = order_tx.send(last_order.clone());

        loop {
            let current = api.get_order(&order_id).unwrap_or_else(|| last_order.clone());
            if current.volume_left != last_left {
                let traded = last_left - current.volume_left;
                last_left = current.volume_left;
                if let Some(tx) = &trade_tx {
                    let _ = tx.send(traded * direction.sign());
                }
            }
            if let Some(tx) = &trade_objs_tx {
                for (trade_id, record) in &current.trade_records {
                    if seen_trades.insert(trade_id.clone()) {
                        let _ = tx.send(record.clone());
                    }
                }
            }
            if current != last_order {
                last_order = current.clone();
                let _ = order_tx.send(current.clone());
            }
            if current.status == OrderStatus::Finished
                && current.volume_origin - current.volume_left == current.recorded_trade_volume()
            {
                break;
            }
            trace.awaiting("update_chan.recv", &[]);
            if update_rx.changed().await.is_err() {
                // The runtime was torn down under us; no more diffs can
                // arrive, so park until the parent's drain timeout fires.
                futures_util::future::pending::<()>().await;
            }
            trace.resumed("update_chan.recv");
        }
        log::debug!("[INSERT] {} drained to FINISHED", order_id);
        trace.complete("run");
    }
}
