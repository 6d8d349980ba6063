//! Target-position reconciliation engine for futures trading.
//!
//! Give a [`TargetPosTask`] a desired net position and it issues, cancels and
//! re-prices limit orders until the live position matches, honoring
//! exchange-specific open/close offset rules, frozen-volume accounting and
//! optional large-order splitting. The engine runs as a cooperative task
//! tree on tokio:
//!
//! ```text
//! TargetPosTask (one per account#symbol)
//!  ├── MarketClockTask           tracks the quote wall-clock per contract
//!  └── RepricingOrderTask        one per dispatched (offset, dir, volume)
//!       ├── InsertOrderTask      one live limit order at a time
//!       └── PriceMonitorTask     cancels the order on adverse drift
//! ```
//!
//! The quote/position runtime is consumed through the [`Api`] facade; its
//! feed-side methods double as a paper broker for tests and demos.

pub mod api;
pub mod chan;
mod clock;
pub mod errors;
mod insert_order;
pub mod model;
pub mod price;
mod repricer;
pub mod target_pos;
pub mod trace;

pub use api::{Account, Api, ApiBuilder};
pub use errors::TargetPosError;
pub use model::{Direction, Offset, Order, OrderStatus, Position, Quote, TradeRecord};
pub use price::PricePolicy;
pub use target_pos::{TargetPosConfig, TargetPosTask};
