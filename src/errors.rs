// =============================================================================
// Error taxonomy
// =============================================================================
//
// Each subsystem that talks to the outside world gets its own `thiserror`
// enum modeling the taxonomy in the error-handling design: callers match on
// variants to decide whether to retry, fail over, or abort, rather than
// inspecting exception types or string messages. Code that merely propagates
// upward (orchestration loops, `main`) wraps these in `anyhow::Result`.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the Exchange Client (C1).
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("client error (HTTP {status}): {body}")]
    ClientError { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no reachable endpoint in the configured pool")]
    NoReachableEndpoint,

    #[error("unsignable request: {0}")]
    Unsignable(String),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Errors surfaced while executing a single order or a multi-hop path (C5).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("symbol {0} is not in TRADING status")]
    SymbolNotTrading(String),

    #[error("no symbol metadata for {0}")]
    MissingSymbolInfo(String),

    #[error("LOT_SIZE adjustment produced a non-positive quantity for {0}")]
    QuantityAdjustedToZero(String),

    #[error("no tradable symbol between {from} and {to}")]
    NoSymbolForHop { from: String, to: String },

    #[error("exchange rejected the order: {0}")]
    OrderRejected(String),

    #[error("order has no fills to account for")]
    NoFills,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
