//! Signal platform adapter (signal-cli-rest-api)
//!
//! Send path: REST `POST /v2/send` with a zero-width-space probe body.
//! Receive path: websocket `/v1/receive/<account>` with HTTP-poll fallback
//! when the endpoint is not websocket-enabled. Receipts identify the sent
//! message by timestamp; delivery and read both count as ACK because some
//! Signal installs never emit delivery receipts.

mod adapter;
mod client;
mod service;

pub use adapter::SignalAdapter;
pub use client::SignalRestClient;
pub use service::SignalReceiptService;
