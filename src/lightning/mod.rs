pub mod invoice;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use tokio::sync::mpsc;

use crate::swap::{Preimage, SwapHash};

/// Progress of a dispatched off-chain payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentUpdate {
    InFlight,
    Succeeded {
        preimage: Preimage,
        routing_fee_sat: u64,
    },
    Failed {
        reason: String,
    },
}

/// State of an invoice held by our own node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    Accepted,
    Settled {
        preimage: Preimage,
        amount_paid_sat: u64,
    },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PayInvoiceRequest {
    pub bolt11: String,
    /// Upper bound on the amount actually dispatched, principal included.
    pub max_amount_sat: u64,
    pub max_routing_fee_sat: u64,
    /// Whether the payment may be split into parts.
    pub allow_multi_part: bool,
    pub outgoing_channel: Option<u64>,
    pub last_hop: Option<PublicKey>,
    pub timeout_secs: u64,
}

/// Lightning node access.
///
/// `pay_invoice` must be idempotent per payment hash: dispatching an invoice
/// whose payment is already known returns a stream over the existing
/// attempt's updates instead of paying twice. That property is what makes
/// crash-retry of payment actions safe.
#[async_trait]
pub trait LightningClient: Send + Sync {
    /// Create a hold invoice for the given hash and return its BOLT11
    /// encoding.
    async fn add_invoice(
        &self,
        amount_sat: u64,
        payment_hash: SwapHash,
        cltv_delta: u32,
    ) -> Result<String>;

    async fn pay_invoice(&self, req: PayInvoiceRequest) -> Result<mpsc::Receiver<PaymentUpdate>>;

    async fn lookup_invoice(&self, payment_hash: SwapHash) -> Result<InvoiceState>;

    async fn settle_invoice(&self, preimage: Preimage) -> Result<()>;

    async fn cancel_invoice(&self, payment_hash: SwapHash) -> Result<()>;
}
