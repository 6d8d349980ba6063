// ─────────────────────────────────────────────────────────────────────────────
// api.rs — Runtime facade
//
// The engine consumes the account/quote runtime through this handle: quote
// and position snapshots, order submission and cancellation, and a revision
// counter that bumps on every diff. The feed-side methods are the ingress
// surface an adapter (or a test) drives; by default they behave like a
// responsive paper broker, so the engine can run end-to-end in-process.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::errors::TargetPosError;
use crate::model::{Direction, Offset, Order, OrderStatus, Position, Quote, TradeRecord};
use crate::target_pos::TargetPosTask;

// ─── Accounts ────────────────────────────────────────────────────────────────

/// A trading account; the key is what singleton registration and order
/// routing are scoped by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Account {
    key: String,
}

impl Account {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

// ─── Shared state ────────────────────────────────────────────────────────────

struct MarketState {
    quotes: HashMap<String, Quote>,
    /// Keyed `account_key#symbol`.
    positions: HashMap<String, Position>,
    orders: HashMap<String, Order>,
    /// Order ids the engine asked to cancel, in request order.
    cancel_requests: Vec<String>,
    /// When true (default) a cancel finishes the order immediately, like a
    /// responsive broker. Tests freeze this to exercise drain timeouts.
    cancel_responsive: bool,
    next_trade_seq: u64,
}

struct ApiCore {
    state: Mutex<MarketState>,
    update_tx: watch::Sender<u64>,
    accounts: Vec<Account>,
    /// Simulated clock in epoch nanoseconds; present iff backtest mode.
    backtest_dt: Option<AtomicI64>,
    /// Live target tasks, keyed `account_key#symbol`.
    registry: Mutex<HashMap<String, TargetPosTask>>,
}

/// Cloneable handle to the runtime. All clones share state; dropping the last
/// one tears everything down.
#[derive(Clone)]
pub struct Api {
    core: Arc<ApiCore>,
}

pub fn pos_key(account_key: &str, symbol: &str) -> String {
    format!("{account_key}#{symbol}")
}

impl Api {
    pub fn builder() -> ApiBuilder {
        ApiBuilder::default()
    }

    /// Single-account runtime with paper-broker defaults.
    pub fn simulated() -> Self {
        Self::builder().build()
    }

    // ─── Account selection ───────────────────────────────────────────────────

    pub fn accounts(&self) -> &[Account] {
        &self.core.accounts
    }

    /// Resolves the account a task should trade with. `None` picks the sole
    /// configured account and is an error when several exist.
    pub fn check_valid(&self, account: Option<&Account>) -> Result<Account, TargetPosError> {
        match account {
            Some(a) => {
                if self.core.accounts.contains(a) {
                    Ok(a.clone())
                } else {
                    Err(TargetPosError::InvalidArgument(format!(
                        "account {:?} is not configured on this runtime",
                        a.key()
                    )))
                }
            }
            None => match self.core.accounts.as_slice() {
                [only] => Ok(only.clone()),
                _ => Err(TargetPosError::AccountRequired),
            },
        }
    }

    // ─── Diff notification ───────────────────────────────────────────────────

    /// Subscribes to the runtime's diff notification. The receiver observes a
    /// monotone revision; `changed()` coalesces bursts (latest-only).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.core.update_tx.subscribe()
    }

    fn notify(&self) {
        self.core.update_tx.send_modify(|rev| *rev += 1);
    }

    // ─── Quotes ──────────────────────────────────────────────────────────────

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.core.state.lock().unwrap().quotes.get(symbol).cloned()
    }

    /// Resolves once the first quote for `symbol` has arrived.
    pub async fn get_quote(&self, symbol: &str) -> Quote {
        let mut rx = self.subscribe();
        loop {
            if let Some(q) = self.quote(symbol) {
                return q;
            }
            if rx.changed().await.is_err() {
                // The runtime owns the sender, so this only happens during
                // teardown; park until the task is dropped with it.
                futures_util::future::pending::<()>().await;
            }
        }
    }

    // ─── Positions and orders ────────────────────────────────────────────────

    pub fn position(&self, account_key: &str, symbol: &str) -> Position {
        self.core
            .state
            .lock()
            .unwrap()
            .positions
            .get(&pos_key(account_key, symbol))
            .copied()
            .unwrap_or_default()
    }

    /// ALIVE orders for one account and symbol; the slice frozen-volume
    /// accounting walks.
    pub fn active_orders(&self, account_key: &str, symbol: &str) -> Vec<Order> {
        self.core
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Alive
                    && o.account_key == account_key
                    && o.symbol == symbol
            })
            .cloned()
            .collect()
    }

    /// Every order ever submitted for one account and symbol, in no
    /// particular order.
    pub fn orders(&self, account_key: &str, symbol: &str) -> Vec<Order> {
        self.core
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.account_key == account_key && o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.core.state.lock().unwrap().orders.get(order_id).cloned()
    }

    /// Submits a limit order. The order becomes ALIVE immediately; fills and
    /// terminal transitions arrive through the feed surface.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_order(
        &self,
        account: &Account,
        symbol: &str,
        direction: Direction,
        offset: Offset,
        volume: i64,
        limit_price: f64,
        order_id: &str,
    ) -> Order {
        let order = Order {
            order_id: order_id.to_string(),
            account_key: account.key().to_string(),
            symbol: symbol.to_string(),
            direction,
            offset,
            volume_origin: volume,
            volume_left: volume,
            limit_price,
            status: OrderStatus::Alive,
            last_msg: String::new(),
            trade_records: Default::default(),
        };
        self.core
            .state
            .lock()
            .unwrap()
            .orders
            .insert(order_id.to_string(), order.clone());
        log::debug!(
            "[API] insert_order {} {} {} {} {} lots @ {}",
            order_id,
            symbol,
            direction,
            offset,
            volume,
            limit_price
        );
        self.notify();
        order
    }

    /// Requests cancellation of an order. With a responsive broker the order
    /// finishes right away with its leftover volume cancelled; otherwise the
    /// request is only recorded and the order stays ALIVE until the feed
    /// reacts.
    pub fn cancel_order(&self, order_id: &str) {
        {
            let mut st = self.core.state.lock().unwrap();
            st.cancel_requests.push(order_id.to_string());
            if st.cancel_responsive {
                if let Some(order) = st.orders.get_mut(order_id) {
                    if order.status == OrderStatus::Alive {
                        order.status = OrderStatus::Finished;
                        order.last_msg = "cancelled".to_string();
                    }
                }
            }
        }
        log::debug!("[API] cancel_order {order_id}");
        self.notify();
    }

    // ─── Backtest clock ──────────────────────────────────────────────────────

    pub fn is_backtest(&self) -> bool {
        self.core.backtest_dt.is_some()
    }

    /// Simulated wall clock in epoch nanoseconds, when running a backtest.
    pub fn backtest_time(&self) -> Option<i64> {
        self.core
            .backtest_dt
            .as_ref()
            .map(|dt| dt.load(Ordering::Relaxed))
    }

    // ─── Feed surface ────────────────────────────────────────────────────────

    pub fn feed_quote(&self, quote: Quote) {
        self.core
            .state
            .lock()
            .unwrap()
            .quotes
            .insert(quote.symbol.clone(), quote);
        self.notify();
    }

    pub fn feed_position(&self, account_key: &str, symbol: &str, position: Position) {
        self.core
            .state
            .lock()
            .unwrap()
            .positions
            .insert(pos_key(account_key, symbol), position);
        self.notify();
    }

    /// Applies a fill of `volume` lots at `price`, appending a trade record.
    /// A full fill finishes the order.
    pub fn feed_fill(&self, order_id: &str, volume: i64, price: f64) {
        let now = self
            .backtest_time()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
        {
            let mut st = self.core.state.lock().unwrap();
            let seq = st.next_trade_seq;
            let Some(order) = st.orders.get_mut(order_id) else {
                log::warn!("[API] fill for unknown order {order_id}");
                return;
            };
            if order.status == OrderStatus::Finished || volume <= 0 || volume > order.volume_left {
                log::warn!(
                    "[API] dropping bad fill for {order_id}: {volume} lots, {} left",
                    order.volume_left
                );
                return;
            }
            order.volume_left -= volume;
            let trade_id = format!("{order_id}|{seq}");
            order.trade_records.insert(
                trade_id.clone(),
                TradeRecord {
                    trade_id,
                    order_id: order_id.to_string(),
                    symbol: order.symbol.clone(),
                    direction: order.direction,
                    offset: order.offset,
                    price,
                    volume,
                    trade_date_time: now,
                },
            );
            if order.volume_left == 0 {
                order.status = OrderStatus::Finished;
                order.last_msg = "all traded".to_string();
            }
            st.next_trade_seq = seq + 1;
        }
        self.notify();
    }

    /// Forces an order to FINISHED with `last_msg`, leaving `volume_left`
    /// untouched (broker rejection, exchange-side cancel, ...).
    pub fn feed_finish_order(&self, order_id: &str, last_msg: &str) {
        {
            let mut st = self.core.state.lock().unwrap();
            let Some(order) = st.orders.get_mut(order_id) else {
                return;
            };
            order.status = OrderStatus::Finished;
            order.last_msg = last_msg.to_string();
        }
        self.notify();
    }

    /// Advances the simulated clock. Ignored outside backtest mode.
    pub fn set_backtest_time(&self, nanos: i64) {
        match &self.core.backtest_dt {
            Some(dt) => {
                dt.store(nanos, Ordering::Relaxed);
                self.notify();
            }
            None => log::warn!("[API] set_backtest_time on a live runtime ignored"),
        }
    }

    /// Whether cancels are acknowledged instantly. See `cancel_order`.
    pub fn set_cancel_responsive(&self, responsive: bool) {
        self.core.state.lock().unwrap().cancel_responsive = responsive;
    }

    /// Drains the recorded cancel requests (feed adapters replay these to the
    /// broker when `cancel_responsive` is off).
    pub fn drain_cancel_requests(&self) -> Vec<String> {
        std::mem::take(&mut self.core.state.lock().unwrap().cancel_requests)
    }

    // ─── Target-task registry ────────────────────────────────────────────────

    /// Runs `build` under the registry lock: returns the existing task for
    /// `key` (after `validate` approves it) or inserts the newly built one.
    pub(crate) fn register_or_get_target_task(
        &self,
        key: &str,
        validate: impl FnOnce(&TargetPosTask) -> Result<(), TargetPosError>,
        build: impl FnOnce() -> TargetPosTask,
    ) -> Result<TargetPosTask, TargetPosError> {
        let mut registry = self.core.registry.lock().unwrap();
        if let Some(existing) = registry.get(key) {
            validate(existing)?;
            return Ok(existing.clone());
        }
        let task = build();
        registry.insert(key.to_string(), task.clone());
        Ok(task)
    }

    pub(crate) fn remove_target_task(&self, key: &str) {
        self.core.registry.lock().unwrap().remove(key);
    }

    #[cfg(test)]
    pub(crate) fn registered_target_tasks(&self) -> usize {
        self.core.registry.lock().unwrap().len()
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ApiBuilder {
    accounts: Vec<Account>,
    backtest_start: Option<i64>,
    quotes: Vec<Quote>,
    positions: Vec<(String, String, Position)>,
}

impl ApiBuilder {
    pub fn account(mut self, key: impl Into<String>) -> Self {
        self.accounts.push(Account::new(key));
        self
    }

    /// Switches the runtime into backtest mode with the given start time
    /// (epoch nanoseconds).
    pub fn backtest(mut self, start_nanos: i64) -> Self {
        self.backtest_start = Some(start_nanos);
        self
    }

    pub fn quote(mut self, quote: Quote) -> Self {
        self.quotes.push(quote);
        self
    }

    pub fn position(
        mut self,
        account_key: impl Into<String>,
        symbol: impl Into<String>,
        position: Position,
    ) -> Self {
        self.positions
            .push((account_key.into(), symbol.into(), position));
        self
    }

    pub fn build(self) -> Api {
        let accounts = if self.accounts.is_empty() {
            vec![Account::new("sim")]
        } else {
            self.accounts
        };
        let (update_tx, _) = watch::channel(0u64);
        let mut quotes = HashMap::new();
        for q in self.quotes {
            quotes.insert(q.symbol.clone(), q);
        }
        let mut positions = HashMap::new();
        for (acct, sym, p) in self.positions {
            positions.insert(pos_key(&acct, &sym), p);
        }
        Api {
            core: Arc::new(ApiCore {
                state: Mutex::new(MarketState {
                    quotes,
                    positions,
                    orders: HashMap::new(),
                    cancel_requests: Vec::new(),
                    cancel_responsive: true,
                    next_trade_seq: 1,
                }),
                update_tx,
                accounts,
                backtest_dt: self.backtest_start.map(AtomicI64::new),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn quote(symbol: &str) -> Quote {
        Quote::new(
            symbol,
            NaiveDate::from_ymd_opt(2024, 3, 14)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn test_check_valid_single_account_default() {
        let api = Api::simulated();
        let acct = api.check_valid(None).unwrap();
        assert_eq!(acct.key(), "sim");
    }

    #[test]
    fn test_check_valid_requires_explicit_account_when_ambiguous() {
        let api = Api::builder().account("a").account("b").build();
        assert!(matches!(
            api.check_valid(None),
            Err(TargetPosError::AccountRequired)
        ));
        let picked = api.check_valid(Some(&Account::new("b"))).unwrap();
        assert_eq!(picked.key(), "b");
        assert!(api.check_valid(Some(&Account::new("c"))).is_err());
    }

    #[test]
    fn test_fill_accounting_and_finish() {
        let api = Api::simulated();
        let acct = api.check_valid(None).unwrap();
        let order = api.insert_order(
            &acct,
            "DCE.m2405",
            Direction::Buy,
            Offset::Open,
            5,
            3000.0,
            "oid-1",
        );
        assert_eq!(order.status, OrderStatus::Alive);

        api.feed_fill("oid-1", 2, 3000.0);
        let order = api.get_order("oid-1").unwrap();
        assert_eq!(order.volume_left, 3);
        assert_eq!(order.status, OrderStatus::Alive);
        assert_eq!(order.recorded_trade_volume(), 2);

        api.feed_fill("oid-1", 3, 3000.0);
        let order = api.get_order("oid-1").unwrap();
        assert_eq!(order.volume_left, 0);
        assert_eq!(order.status, OrderStatus::Finished);
        assert_eq!(order.recorded_trade_volume(), 5);

        // overfill is rejected
        api.feed_fill("oid-1", 1, 3000.0);
        assert_eq!(api.get_order("oid-1").unwrap().recorded_trade_volume(), 5);
    }

    #[test]
    fn test_cancel_respects_responsiveness() {
        let api = Api::simulated();
        let acct = api.check_valid(None).unwrap();
        api.insert_order(
            &acct,
            "DCE.m2405",
            Direction::Sell,
            Offset::Close,
            4,
            3000.0,
            "oid-2",
        );
        api.set_cancel_responsive(false);
        api.cancel_order("oid-2");
        assert_eq!(api.get_order("oid-2").unwrap().status, OrderStatus::Alive);
        assert_eq!(api.drain_cancel_requests(), vec!["oid-2".to_string()]);

        api.set_cancel_responsive(true);
        api.cancel_order("oid-2");
        let order = api.get_order("oid-2").unwrap();
        assert_eq!(order.status, OrderStatus::Finished);
        assert_eq!(order.volume_left, 4);
        assert_eq!(order.last_msg, "cancelled");
    }

    #[test]
    fn test_active_orders_filters_dead_and_foreign() {
        let api = Api::builder().account("a").account("b").build();
        let a = Account::new("a");
        let b = Account::new("b");
        api.insert_order(&a, "SHFE.cu2405", Direction::Buy, Offset::Open, 1, 1.0, "o1");
        api.insert_order(&a, "SHFE.cu2405", Direction::Buy, Offset::Open, 1, 1.0, "o2");
        api.insert_order(&b, "SHFE.cu2405", Direction::Buy, Offset::Open, 1, 1.0, "o3");
        api.insert_order(&a, "SHFE.au2406", Direction::Buy, Offset::Open, 1, 1.0, "o4");
        api.feed_finish_order("o2", "rejected");
        let alive = api.active_orders("a", "SHFE.cu2405");
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].order_id, "o1");
    }

    #[tokio::test]
    async fn test_get_quote_waits_for_first_quote() {
        let api = Api::simulated();
        let waiter = {
            let api = api.clone();
            tokio::spawn(async move { api.get_quote("DCE.m2405").await })
        };
        tokio::task::yield_now().await;
        api.feed_quote(quote("DCE.m2405"));
        let q = waiter.await.unwrap();
        assert_eq!(q.symbol, "DCE.m2405");
    }

    #[test]
    fn test_backtest_clock() {
        let api = Api::builder().backtest(1_000).build();
        assert!(api.is_backtest());
        assert_eq!(api.backtest_time(), Some(1_000));
        api.set_backtest_time(2_000);
        assert_eq!(api.backtest_time(), Some(2_000));

        let live = Api::simulated();
        assert_eq!(live.backtest_time(), None);
    }
}
