// ─────────────────────────────────────────────────────────────────────────────
// model.rs — Shared market/trading records
//
// These are the records the diff feed delivers and the engine observes. They
// are plain snapshots: a component takes a fresh copy from the `Api` after
// every await instead of holding a view across suspension points.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const SECS_PER_DAY: u32 = 86_400;

// ─── Direction / Offset ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1 for BUY, -1 for SELL; used to sign traded volumes.
    pub fn sign(self) -> i64 {
        match self {
            Direction::Buy => 1,
            Direction::Sell => -1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// Inventory effect of an order: open a new position, close the history
/// slice, or close today's slice (the latter only on venues that track the
/// two separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Offset {
    Open,
    Close,
    CloseToday,
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Offset::Open => write!(f, "OPEN"),
            Offset::Close => write!(f, "CLOSE"),
            Offset::CloseToday => write!(f, "CLOSETODAY"),
        }
    }
}

// ─── Orders and trades ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Alive,
    Finished,
}

/// One fill reported by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    pub price: f64,
    pub volume: i64,
    /// Exchange timestamp, epoch nanoseconds.
    pub trade_date_time: i64,
}

/// Broker order record as observed through the diff feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub account_key: String,
    pub symbol: String,
    pub direction: Direction,
    pub offset: Offset,
    /// Volume originally submitted.
    pub volume_origin: i64,
    /// Volume not yet traded (cancelled leftover stays in `last_msg`).
    pub volume_left: i64,
    pub limit_price: f64,
    pub status: OrderStatus,
    /// Last broker message; opaque diagnostic text.
    pub last_msg: String,
    pub trade_records: BTreeMap<String, TradeRecord>,
}

impl Order {
    pub fn is_dead(&self) -> bool {
        self.status == OrderStatus::Finished
    }

    /// Sum of volumes across the trade records received so far. The feed's
    /// accounting has caught up once this equals `volume_origin - volume_left`.
    pub fn recorded_trade_volume(&self) -> i64 {
        self.trade_records.values().map(|t| t.volume).sum()
    }
}

// ─── Position ────────────────────────────────────────────────────────────────

/// Net position split into the four slices exchanges account for. Totals are
/// derived so the slices can never disagree with them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub pos_long_his: i64,
    pub pos_long_today: i64,
    pub pos_short_his: i64,
    pub pos_short_today: i64,
}

impl Position {
    pub fn pos_long(&self) -> i64 {
        self.pos_long_his + self.pos_long_today
    }

    pub fn pos_short(&self) -> i64 {
        self.pos_short_his + self.pos_short_today
    }

    /// Signed net position (long minus short).
    pub fn pos(&self) -> i64 {
        self.pos_long() - self.pos_short()
    }
}

// ─── Quote ───────────────────────────────────────────────────────────────────

/// Level-1 quote snapshot. Prices the feed has not supplied (or that the
/// venue reports as NaN) are `None`; the price policies fall back through the
/// remaining fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    /// Exchange timestamp of the quote.
    pub datetime: NaiveDateTime,
    pub ask_price1: Option<f64>,
    pub bid_price1: Option<f64>,
    pub last_price: Option<f64>,
    pub pre_close: Option<f64>,
    /// Tradable sessions as (start, end) seconds past midnight; `end` may
    /// exceed 86400 for sessions that run over midnight. Empty means no
    /// calendar was supplied and the instrument is treated as always open.
    pub trading_sessions: Vec<(u32, u32)>,
}

impl Quote {
    pub fn new(symbol: impl Into<String>, datetime: NaiveDateTime) -> Self {
        Self {
            symbol: symbol.into(),
            datetime,
            ask_price1: None,
            bid_price1: None,
            last_price: None,
            pre_close: None,
            trading_sessions: Vec::new(),
        }
    }

    /// Whether `dt` falls inside one of the instrument's trading sessions.
    pub fn is_trading_at(&self, dt: NaiveDateTime) -> bool {
        if self.trading_sessions.is_empty() {
            return true;
        }
        use chrono::Timelike;
        let secs = dt.time().num_seconds_from_midnight();
        self.trading_sessions.iter().any(|&(start, end)| {
            (start..end).contains(&secs) || (start..end).contains(&(secs + SECS_PER_DAY))
        })
    }
}

/// Parses "HH:MM:SS" into seconds past midnight, allowing hours >= 24 for
/// overnight session ends (e.g. "25:00:00").
pub fn session_secs(hms: &str) -> Option<u32> {
    let mut parts = hms.split(':');
    let h: u32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let s: u32 = parts.next()?.parse().ok()?;
    if m >= 60 || s >= 60 {
        return None;
    }
    Some(h * 3600 + m * 60 + s)
}
