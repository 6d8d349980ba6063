use thiserror::Error;

use crate::model::{Direction, Offset};

/// Every failure the reconciliation engine surfaces to its caller.
///
/// Trading-time gating, missing price touches and benign cancellations are
/// handled internally and never show up here.
#[derive(Debug, Clone, Error)]
pub enum TargetPosError {
    /// A second construction for the same (account, symbol) supplied a
    /// different parameter value.
    #[error("conflicting `{param}` for an existing {symbol} target task: was {old}, got {new}")]
    ConfigurationConflict {
        symbol: String,
        param: &'static str,
        old: String,
        new: String,
    },

    /// The symbol belongs to a product this engine refuses to trade.
    #[error("unsupported instrument {symbol}: {reason}")]
    UnsupportedInstrument { symbol: String, reason: String },

    /// Bad constructor or call argument (offset priority, price mode,
    /// volume bounds).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `set_target_volume` on a task whose main loop has already exited.
    #[error("target task for {0} has finished and can no longer accept targets")]
    Terminated(String),

    /// The price policy produced no usable price.
    #[error("no usable limit price for {symbol} {direction}")]
    BadPrice { symbol: String, direction: Direction },

    /// An order finished with volume left over and no price-drift cancel,
    /// i.e. the broker refused it. `last_msg` is an opaque diagnostic.
    #[error(
        "order rejected: {symbol} {direction} {offset} {volume} lots @ {limit_price}: {last_msg}"
    )]
    BrokerRejected {
        symbol: String,
        direction: Direction,
        offset: Offset,
        volume: i64,
        limit_price: f64,
        last_msg: String,
    },

    /// An order's diff feed went silent and the 30 second drain timeout
    /// elapsed, typically after the runtime was shut down mid-order.
    #[error("order {order_id} did not reach FINISHED within {timeout_secs}s of shutdown")]
    HangingOrder { order_id: String, timeout_secs: u64 },

    /// The runtime has more than one account and the caller did not pick one.
    #[error("multiple accounts configured, an explicit account is required")]
    AccountRequired,
}
