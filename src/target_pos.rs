// ─────────────────────────────────────────────────────────────────────────────
// target_pos.rs — Target-position controller
//
// One task per (account, symbol): reads targets from a latest-only channel,
// gates on the trading session, decomposes the delta against the live
// position into offset-ordered order waves and drives repricing tasks until
// the position matches. Construction is singleton per key; a second
// construction with identical parameters returns the existing instance.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{pos_key, Account, Api};
use crate::chan::{latest_channel, LatestReceiver, LatestSender};
use crate::clock;
use crate::errors::TargetPosError;
use crate::model::{Direction, Offset, Order, Position, TradeRecord};
use crate::price::PricePolicy;
use crate::repricer::{RepriceRequest, RepricingOrderTask};
use crate::trace::TaskTrace;

// ─── Instrument restrictions ─────────────────────────────────────────────────

/// Products whose exchange enforces a minimum opening volume above one lot;
/// this engine does not model that rule, so it refuses the symbols outright.
const RESTRICTED_SYMBOL_PREFIXES: &[(&str, i64)] = &[
    ("CZCE.CJ", 4),
    ("CZCE.ZC", 4),
    ("CZCE.WH", 10),
    ("CZCE.PM", 10),
    ("CZCE.RI", 10),
    ("CZCE.JR", 10),
    ("CZCE.LR", 10),
];

fn check_symbol_allowed(symbol: &str) -> Result<(), TargetPosError> {
    for (prefix, min_lots) in RESTRICTED_SYMBOL_PREFIXES {
        if symbol.starts_with(prefix) {
            return Err(TargetPosError::UnsupportedInstrument {
                symbol: symbol.to_string(),
                reason: format!(
                    "the exchange requires a minimum opening volume of {min_lots} lots for this product"
                ),
            });
        }
    }
    Ok(())
}

/// Venues that accept distinct close-today / close-history instructions and
/// account for the two slices separately.
fn splits_today_position(exchange: &str) -> bool {
    matches!(exchange, "SHFE" | "INE")
}

// ─── Offset priority ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OffsetToken {
    CloseToday,
    CloseHistory,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PriorityStep {
    Token(OffsetToken),
    /// Wait for every order dispatched so far before continuing.
    Barrier,
}

/// Parses an offset-priority string over {今, 昨, 开, ','}. A comma is a
/// barrier; an offset may not repeat within one comma segment.
pub(crate) fn parse_offset_priority(text: &str) -> Result<Vec<PriorityStep>, TargetPosError> {
    if text.is_empty() {
        return Err(TargetPosError::InvalidArgument(
            "offset priority must not be empty".to_string(),
        ));
    }
    let mut steps = Vec::new();
    let mut segment: Vec<OffsetToken> = Vec::new();
    for c in text.chars() {
        let token = match c {
            '今' => OffsetToken::CloseToday,
            '昨' => OffsetToken::CloseHistory,
            '开' => OffsetToken::Open,
            ',' => {
                steps.push(PriorityStep::Barrier);
                segment.clear();
                continue;
            }
            other => {
                return Err(TargetPosError::InvalidArgument(format!(
                    "offset priority may only contain 今/昨/开 and ',', got {other:?}"
                )))
            }
        };
        if segment.contains(&token) {
            return Err(TargetPosError::InvalidArgument(format!(
                "offset {c:?} repeats within one priority segment"
            )));
        }
        segment.push(token);
        steps.push(PriorityStep::Token(token));
    }
    Ok(steps)
}

// ─── Offset decomposition ────────────────────────────────────────────────────

/// Translates one priority token into a broker order: offset keyword,
/// direction, and the volume the current inventory and frozen accounting
/// allow. Zero volume means "nothing to do for this token".
pub(crate) fn decompose(
    exchange: &str,
    token: OffsetToken,
    delta: i64,
    pending_frozen: i64,
    position: &Position,
    alive_orders: &[Order],
) -> (Offset, Direction, i64) {
    let direction = if delta > 0 {
        Direction::Buy
    } else {
        Direction::Sell
    };
    // Closing a short requires buying; the reducible pool is on the opposite
    // side of the order.
    let mut pool = if delta > 0 {
        position.pos_short()
    } else {
        position.pos_long()
    };
    let alive_volume = |pred: &dyn Fn(&Order) -> bool| -> i64 {
        alive_orders
            .iter()
            .filter(|o| o.direction == direction && pred(o))
            .map(|o| o.volume_left)
            .sum()
    };

    match token {
        OffsetToken::CloseHistory => {
            let frozen;
            if splits_today_position(exchange) {
                pool = if delta > 0 {
                    position.pos_short_his
                } else {
                    position.pos_long_his
                };
                frozen = alive_volume(&|o| o.offset == Offset::Close);
            } else {
                frozen = pending_frozen + alive_volume(&|o| o.offset != Offset::Open);
                // Single-pool venues close today's lots first; if unfrozen
                // today-volume remains, the history slice is already spoken
                // for and this token is skipped.
                let today = if delta > 0 {
                    position.pos_short_today
                } else {
                    position.pos_long_today
                };
                if today - frozen > 0 {
                    pool = frozen;
                }
            }
            (
                Offset::Close,
                direction,
                delta.abs().min((pool - frozen).max(0)),
            )
        }
        OffsetToken::CloseToday => {
            let offset;
            let frozen;
            pool = if delta > 0 {
                position.pos_short_today
            } else {
                position.pos_long_today
            };
            if splits_today_position(exchange) {
                offset = Offset::CloseToday;
                frozen = alive_volume(&|o| o.offset == Offset::CloseToday);
            } else {
                offset = Offset::Close;
                frozen = pending_frozen + alive_volume(&|o| o.offset != Offset::Open);
            }
            (offset, direction, delta.abs().min((pool - frozen).max(0)))
        }
        OffsetToken::Open => (Offset::Open, direction, delta.abs()),
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Construction parameters. Defaults: ACTIVE pricing, close today's lots,
/// then history, wait, then open (`"今昨,开"`), no split mode.
#[derive(Clone)]
pub struct TargetPosConfig {
    pub price: PricePolicy,
    pub offset_priority: String,
    pub min_volume: Option<i64>,
    pub max_volume: Option<i64>,
    /// Signed traded-volume notifications (+BUY / -SELL); borrowed, never
    /// closed by the engine.
    pub trade_chan: Option<mpsc::UnboundedSender<i64>>,
    /// Full trade records; borrowed, never closed by the engine.
    pub trade_objs_chan: Option<mpsc::UnboundedSender<TradeRecord>>,
    /// Required when the runtime has several accounts.
    pub account: Option<Account>,
}

impl Default for TargetPosConfig {
    fn default() -> Self {
        Self {
            price: PricePolicy::Active,
            offset_priority: "今昨,开".to_string(),
            min_volume: None,
            max_volume: None,
            trade_chan: None,
            trade_objs_chan: None,
            account: None,
        }
    }
}

fn check_volume_limit(
    min_volume: Option<i64>,
    max_volume: Option<i64>,
) -> Result<(), TargetPosError> {
    match (min_volume, max_volume) {
        (None, None) => Ok(()),
        (Some(min), Some(max)) if 0 < min && min <= max => Ok(()),
        (Some(min), Some(max)) => Err(TargetPosError::InvalidArgument(format!(
            "split volumes must satisfy 0 < min <= max, got min={min} max={max}"
        ))),
        _ => Err(TargetPosError::InvalidArgument(
            "min_volume and max_volume must be set together".to_string(),
        )),
    }
}

fn volume_text(volume: Option<i64>) -> String {
    match volume {
        Some(v) => v.to_string(),
        None => "unset".to_string(),
    }
}

// ─── The controller ──────────────────────────────────────────────────────────

struct Inner {
    api: Api,
    account: Account,
    symbol: String,
    exchange: String,
    offset_priority: String,
    steps: Vec<PriorityStep>,
    price: PricePolicy,
    min_volume: Option<i64>,
    max_volume: Option<i64>,
    trade_tx: Option<mpsc::UnboundedSender<i64>>,
    trade_objs_tx: Option<mpsc::UnboundedSender<TradeRecord>>,
    target_tx: LatestSender<i64>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    failure: Mutex<Option<TargetPosError>>,
}

/// Adjusts one contract's net position to whatever target was set last.
/// Cloneable handle; all clones drive the same task.
#[derive(Clone)]
pub struct TargetPosTask {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TargetPosTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetPosTask")
            .field("symbol", &self.inner.symbol)
            .finish()
    }
}

impl TargetPosTask {
    /// Creates (or returns) the controller for `(account, symbol)`.
    ///
    /// Idempotent per key: a repeat construction must carry identical
    /// `offset_priority`, `price`, `min_volume` and `max_volume`, otherwise
    /// it fails with `ConfigurationConflict`.
    pub fn new(api: &Api, symbol: &str, config: TargetPosConfig) -> Result<Self, TargetPosError> {
        check_symbol_allowed(symbol)?;
        let steps = parse_offset_priority(&config.offset_priority)?;
        check_volume_limit(config.min_volume, config.max_volume)?;
        let account = api.check_valid(config.account.as_ref())?;
        let key = pos_key(account.key(), symbol);
        api.register_or_get_target_task(
            &key,
            |existing| existing.validate_same_config(&config),
            || Self::spawn(api.clone(), account.clone(), symbol.to_string(), steps, &config),
        )
    }

    fn spawn(
        api: Api,
        account: Account,
        symbol: String,
        steps: Vec<PriorityStep>,
        config: &TargetPosConfig,
    ) -> Self {
        let (target_tx, target_rx) = latest_channel();
        let exchange = symbol.split('.').next().unwrap_or("").to_string();
        let inner = Arc::new(Inner {
            api,
            account,
            symbol,
            exchange,
            offset_priority: config.offset_priority.clone(),
            steps,
            price: config.price.clone(),
            min_volume: config.min_volume,
            max_volume: config.max_volume,
            trade_tx: config.trade_chan.clone(),
            trade_objs_tx: config.trade_objs_chan.clone(),
            target_tx,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            failure: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::run(inner.clone(), target_rx));
        *inner.handle.lock().unwrap() = Some(handle);
        log::info!(
            "[TARGETPOS] created for {} ({}, priority {:?})",
            inner.symbol,
            inner.price,
            inner.offset_priority
        );
        Self { inner }
    }

    fn validate_same_config(&self, config: &TargetPosConfig) -> Result<(), TargetPosError> {
        let conflict = |param: &'static str, old: String, new: String| {
            Err(TargetPosError::ConfigurationConflict {
                symbol: self.inner.symbol.clone(),
                param,
                old,
                new,
            })
        };
        if self.inner.offset_priority != config.offset_priority {
            return conflict(
                "offset_priority",
                self.inner.offset_priority.clone(),
                config.offset_priority.clone(),
            );
        }
        if !self.inner.price.same_as(&config.price) {
            return conflict("price", self.inner.price.to_string(), config.price.to_string());
        }
        if self.inner.min_volume != config.min_volume {
            return conflict(
                "min_volume",
                volume_text(self.inner.min_volume),
                volume_text(config.min_volume),
            );
        }
        if self.inner.max_volume != config.max_volume {
            return conflict(
                "max_volume",
                volume_text(self.inner.max_volume),
                volume_text(config.max_volume),
            );
        }
        Ok(())
    }

    /// Sets the desired net position (positive long, negative short, zero
    /// flat). Returns immediately; the task reconciles asynchronously and
    /// only ever acts on the latest pending target.
    pub fn set_target_volume(&self, volume: i64) -> Result<(), TargetPosError> {
        if self.is_finished() {
            return Err(TargetPosError::Terminated(self.inner.symbol.clone()));
        }
        self.inner.target_tx.send(volume);
        Ok(())
    }

    /// Requests termination: pending orders are cancelled, child tasks are
    /// drained, the registry slot is freed.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether the controller task has fully terminated.
    pub fn is_finished(&self) -> bool {
        self.inner
            .handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(false)
    }

    /// The error that terminated the task, if any.
    pub fn error(&self) -> Option<TargetPosError> {
        self.inner.failure.lock().unwrap().clone()
    }

    // ─── Main loop ───────────────────────────────────────────────────────────

    async fn run(inner: Arc<Inner>, mut target_rx: LatestReceiver<i64>) {
        let trace = TaskTrace::new("TargetPosTask", inner.symbol.clone());
        let (clock_task, time_record, mut clock_rx) =
            clock::spawn(inner.api.clone(), inner.symbol.clone());
        let mut wave: Vec<RepricingOrderTask> = Vec::new();

        let result = tokio::select! {
            _ = inner.cancel.cancelled() => Ok(()),
            r = Self::adjust_loop(
                &inner,
                &trace,
                &mut target_rx,
                &mut clock_rx,
                &time_record,
                &mut wave,
            ) => r,
        };
        if let Err(e) = &result {
            log::error!("[TARGETPOS] {} terminated with error: {e}", inner.symbol);
            *inner.failure.lock().unwrap() = Some(e.clone());
        }

        // Cleanup runs on every exit path: free the registry slot first so a
        // replacement task can be constructed while children drain.
        inner
            .api
            .remove_target_task(&pos_key(inner.account.key(), &inner.symbol));
        target_rx.close();
        clock_task.cancel();
        for task in &wave {
            task.cancel();
        }
        trace.awaiting("gather(children)", &[]);
        for result in join_all(wave.drain(..).map(|t| t.join())).await {
            if let Err(e) = result {
                log::warn!("[TARGETPOS] {} child failed during drain: {e}", inner.symbol);
                let mut failure = inner.failure.lock().unwrap();
                if failure.is_none() {
                    *failure = Some(e);
                }
            }
        }
        clock_task.join().await;
        trace.resumed("gather(children)");
        trace.complete("run");
        log::info!("[TARGETPOS] {} terminated", inner.symbol);
    }

    async fn adjust_loop(
        inner: &Arc<Inner>,
        trace: &TaskTrace,
        target_rx: &mut LatestReceiver<i64>,
        clock_rx: &mut LatestReceiver<()>,
        time_record: &Mutex<SystemTime>,
        wave: &mut Vec<RepricingOrderTask>,
    ) -> Result<(), TargetPosError> {
        trace.awaiting("get_quote", &[]);
        let _ = inner.api.get_quote(&inner.symbol).await;
        trace.resumed("get_quote");

        loop {
            trace.awaiting("target_chan.recv", &[]);
            let Some(received) = target_rx.recv().await else {
                return Ok(());
            };
            trace.resumed("target_chan.recv");

            // Never dispatch while the exchange is closed: park on the clock
            // signal until the session opens (next quote of a new session).
            loop {
                let Some(quote) = inner.api.quote(&inner.symbol) else {
                    break;
                };
                let now = clock::effective_now(&inner.api, &quote, time_record);
                if quote.is_trading_at(now) {
                    break;
                }
                trace.wait("clock_update_chan.recv", &[]);
                if clock_rx.recv().await.is_none() {
                    return Ok(());
                }
            }

            // Only the newest pending target matters.
            let target = target_rx.recv_latest(received);
            // Snapshot inventory once per target; this wave's own submissions
            // are accounted through pending_frozen, not through the order
            // book, so the snapshot must not move mid-wave.
            let mut position = inner.api.position(inner.account.key(), &inner.symbol);
            let mut alive = inner.api.active_orders(inner.account.key(), &inner.symbol);
            let mut delta = target - position.pos();
            let mut pending_frozen: i64 = 0;
            log::info!(
                "[TARGETPOS] {} target {target}, position {}, delta {delta}",
                inner.symbol,
                position.pos()
            );

            // Implicit trailing barrier: the whole wave settles before the
            // next target is read.
            let steps = inner.steps.iter().chain(std::iter::once(&PriorityStep::Barrier));
            for step in steps {
                match step {
                    PriorityStep::Barrier => {
                        let ids: Vec<u64> = wave.iter().map(|t| t.trace_id()).collect();
                        trace.awaiting("gather(wave)", &ids);
                        let results = join_all(wave.drain(..).map(|t| t.join())).await;
                        trace.resumed("gather(wave)");
                        for result in results {
                            result?;
                        }
                        pending_frozen = 0;
                        position = inner.api.position(inner.account.key(), &inner.symbol);
                        alive = inner.api.active_orders(inner.account.key(), &inner.symbol);
                    }
                    PriorityStep::Token(token) => {
                        let (offset, direction, volume) = decompose(
                            &inner.exchange,
                            *token,
                            delta,
                            pending_frozen,
                            &position,
                            &alive,
                        );
                        if volume == 0 {
                            continue;
                        }
                        if offset != Offset::Open {
                            pending_frozen += volume;
                        }
                        log::debug!(
                            "[TARGETPOS] {} dispatch {direction} {offset} {volume} lots",
                            inner.symbol
                        );
                        wave.push(RepricingOrderTask::spawn(
                            RepriceRequest {
                                api: inner.api.clone(),
                                account: inner.account.clone(),
                                symbol: inner.symbol.clone(),
                                direction,
                                offset,
                                volume,
                                min_volume: inner.min_volume,
                                max_volume: inner.max_volume,
                                price: inner.price.clone(),
                                trade_tx: inner.trade_tx.clone(),
                                trade_objs_tx: inner.trade_objs_tx.clone(),
                            },
                            &inner.cancel,
                        ));
                        delta -= direction.sign() * volume;
                    }
                }
            }
        }
    }
}
