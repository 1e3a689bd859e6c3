//! Platform adapters
//!
//! An adapter is a per-(user, contact) handle for one platform: it sends
//! probes and exposes the session-scoped receipt stream. Platform-wide
//! receive machinery (websocket loops, webhook intake) lives in the
//! per-platform services and is wired up through the registry.

pub mod mock;
pub mod queues;
pub mod register;
pub mod registry;
pub mod signal;
pub mod whatsapp;
pub mod whatsapp_web;

pub use queues::SessionQueues;
pub use register::register_adapters;
pub use registry::{AdapterEntry, AdapterRegistry, PlatformService};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::{ContactId, UserId};

/// Result of one probe send.
#[derive(Debug, Clone)]
pub struct AdapterProbe {
    pub probe_id: String,
    pub sent_at_ms: i64,
    /// Platform message id, when the platform returns one (WhatsApp wamid).
    pub platform_message_id: Option<String>,
    /// Platform message timestamp in ms, when the platform keys receipts
    /// on timestamps (Signal).
    pub platform_message_ts: Option<i64>,
    /// Raw send response for the probe row.
    pub send_response: Option<Value>,
}

/// A receipt surfaced to the session runner. Only delivery-grade receipts
/// reach this type; adapters filter the rest.
#[derive(Debug, Clone)]
pub struct AdapterReceipt {
    pub probe_id: String,
    pub device_id: String,
    pub received_at_ms: i64,
    pub status: String,
    pub platform_message_id: Option<String>,
}

/// Display data from `get_profile`, when the platform supports it.
#[derive(Debug, Clone)]
pub struct ContactProfile {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// What a receipt means, as resolved by a platform receipt service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// A platform-native receipt resolved to a session via the probe index.
#[derive(Debug, Clone)]
pub struct ResolvedReceipt {
    pub user_id: UserId,
    pub contact_id: ContactId,
    pub probe_id: String,
    pub kind: ReceiptKind,
    pub when_ms: i64,
    pub platform_message_id: Option<String>,
}

/// Per-platform, per-(user, contact) adapter contract.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Send one probe. At-least-once safe: every call produces a fresh
    /// probe id regardless of retries at the transport layer.
    async fn send_probe(&self) -> Result<AdapterProbe>;

    /// The session-scoped receipt stream. One-shot: restarting it means
    /// recreating the adapter.
    async fn receipts(&self) -> Result<mpsc::Receiver<AdapterReceipt>>;

    async fn get_profile(&self) -> Option<ContactProfile> {
        None
    }

    async fn get_presence(&self) -> Option<String> {
        None
    }

    /// Idempotent release of per-session resources.
    async fn close(&self);
}
