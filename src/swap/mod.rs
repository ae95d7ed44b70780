pub mod executor;
pub mod kernel;
pub mod policy;
pub mod store;
pub mod supervisor;

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Txid};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};

use crate::errors::FailureReason;
use crate::server::ProtocolVersion;

/// Swap identity: SHA-256 of the preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwapHash(pub sha256::Hash);

impl SwapHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(sha256::Hash::from_byte_array(bytes))
    }

    pub fn to_byte_array(self) -> [u8; 32] {
        self.0.to_byte_array()
    }
}

impl fmt::Display for SwapHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SwapHash {
    type Err = <sha256::Hash as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(sha256::Hash::from_str(s)?))
    }
}

/// 32-byte swap secret. The initiating party generates it; every other
/// participant learns it only through settlement or an on-chain reveal.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage([u8; 32]);

impl Preimage {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn hash(&self) -> SwapHash {
        SwapHash(sha256::Hash::hash(&self.0))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// The secret must not leak through logs; show only the hash.
impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage(hash={})", self.hash())
    }
}

impl Serialize for Preimage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Preimage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("preimage must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    /// Off-chain balance out to on-chain coins.
    LoopOut,
    /// On-chain coins in to off-chain balance.
    LoopIn,
}

impl fmt::Display for SwapDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapDirection::LoopOut => write!(f, "loop out"),
            SwapDirection::LoopIn => write!(f, "loop in"),
        }
    }
}

/// Who broadcasts the loop in htlc. With `External` the client's own wallet
/// is not involved; the htlc is awaited as an inbound chain event and the
/// point of no return is its first on-chain observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcBroadcaster {
    Internal,
    External,
}

/// Immutable swap parameters, fixed before the first event is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub direction: SwapDirection,
    pub amount_sat: u64,
    pub swap_hash: SwapHash,
    /// Loop out: the client-generated secret, persisted so a restarted
    /// client can always sweep. Loop in clients never hold it up front.
    pub preimage: Option<Preimage>,
    pub sender_key: PublicKey,
    pub receiver_key: PublicKey,
    pub cltv_expiry: u32,

    /// Server fee accepted at quote time; what `cost_server` will reflect
    /// on success.
    pub swap_fee_sat: u64,

    pub max_miner_fee_sat: u64,
    pub max_swap_fee_sat: u64,
    pub max_swap_routing_fee_sat: Option<u64>,
    pub max_prepay_routing_fee_sat: Option<u64>,
    pub max_prepay_amount_sat: Option<u64>,

    pub initiation_height: u32,
    pub created_at_unix: u64,
    pub publication_deadline_unix: u64,
    pub protocol_version: ProtocolVersion,
    pub htlc_broadcaster: HtlcBroadcaster,

    /// Loop out: server-issued invoices.
    pub swap_invoice: Option<String>,
    pub prepay_invoice: Option<String>,
    /// Loop in: client-issued invoice handed to the server.
    pub loop_in_invoice: Option<String>,

    /// Loop out: sweep destination and fee-estimate target.
    pub sweep_address: Option<String>,
    pub sweep_conf_target: Option<u32>,

    /// Loop out: channel to pay out of, if constrained.
    pub outgoing_channel: Option<u64>,
    /// Loop in: route constraint, also the per-peer griefing-bound key.
    pub last_hop: Option<PublicKey>,
}

/// Monotonic cost accumulators; the kernel only ever adds to these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapCosts {
    pub server_sat: u64,
    pub onchain_sat: u64,
    pub offchain_sat: u64,
}

/// Per-swap phase. Variants carry only data meaningful in that phase;
/// terminal variants have no way back out (the sole exception is a sweep
/// reorg regressing `Succeeded`, see the kernel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    Created,
    PrepayInFlight,
    PrepayPaid,
    HtlcPublished { txid: Txid },
    HtlcConfirmed { txid: Txid, height: u32 },
    PreimageRevealed,
    Sweeping { txid: Txid },
    Refunding { txid: Txid },
    Succeeded,
    Refunded,
    Failed { reason: FailureReason },
}

impl SwapPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapPhase::Succeeded | SwapPhase::Refunded | SwapPhase::Failed { .. }
        )
    }

    /// Cost fields are user-visible only once the swap has left the initial
    /// phases, where they would still be partial.
    pub fn reports_costs(&self) -> bool {
        matches!(
            self,
            SwapPhase::Refunding { .. }
                | SwapPhase::Succeeded
                | SwapPhase::Refunded
                | SwapPhase::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SwapPhase::Created => "created",
            SwapPhase::PrepayInFlight => "prepay_in_flight",
            SwapPhase::PrepayPaid => "prepay_paid",
            SwapPhase::HtlcPublished { .. } => "htlc_published",
            SwapPhase::HtlcConfirmed { .. } => "htlc_confirmed",
            SwapPhase::PreimageRevealed => "preimage_revealed",
            SwapPhase::Sweeping { .. } => "sweeping",
            SwapPhase::Refunding { .. } => "refunding",
            SwapPhase::Succeeded => "succeeded",
            SwapPhase::Refunded => "refunded",
            SwapPhase::Failed { .. } => "failed",
        }
    }
}

/// Evolving swap state. A snapshot of this is persisted with every event;
/// replaying the event log through the kernel reproduces it exactly, so
/// nothing in here may come from a clock or another side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapState {
    pub phase: SwapPhase,
    pub htlc_txid: Option<Txid>,
    pub htlc_vout: Option<u32>,
    pub htlc_conf_height: Option<u32>,
    /// Set when the htlc candidate matched the nested (NP2WSH) address.
    pub htlc_nested: bool,
    pub preimage: Option<Preimage>,
    pub sweep_txid: Option<Txid>,
    pub costs: SwapCosts,
    /// Latched when the kernel authorises the point-of-no-return effect.
    pub no_return: bool,
    /// On-chain fee already attributed to our own spend, so reorg
    /// re-publication never double-counts.
    pub counted_spend_fee_sat: u64,
}

impl SwapState {
    pub fn initial() -> Self {
        Self {
            phase: SwapPhase::Created,
            htlc_txid: None,
            htlc_vout: None,
            htlc_conf_height: None,
            htlc_nested: false,
            preimage: None,
            sweep_txid: None,
            costs: SwapCosts::default(),
            no_return: false,
            counted_spend_fee_sat: 0,
        }
    }
}

/// Inputs to the kernel. Everything that can advance a swap is one of
/// these, including deadlines and reorgs; the executor is responsible for
/// feeding them in per-swap total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapEvent {
    Initiated,
    PrepaySucceeded {
        routing_fee_sat: u64,
    },
    PrepayFailed {
        error: String,
    },
    SwapPaymentSucceeded {
        preimage: Preimage,
        routing_fee_sat: u64,
        swap_fee_sat: u64,
    },
    SwapPaymentFailed {
        error: String,
    },
    /// A transaction paying the htlc address was observed.
    HtlcCandidate {
        txid: Txid,
        vout: u32,
        amount_sat: u64,
        script_pubkey: ScriptBuf,
    },
    /// Loop in, internal broadcaster: our own funding broadcast went out.
    HtlcPublished {
        txid: Txid,
        vout: u32,
    },
    HtlcPublishFailed {
        error: String,
    },
    HtlcConfirmed {
        txid: Txid,
        height: u32,
    },
    InvoiceSettled {
        preimage: Preimage,
        swap_fee_sat: u64,
    },
    SweepPublished {
        txid: Txid,
        fee_sat: u64,
    },
    SweepConfirmed {
        txid: Txid,
        height: u32,
    },
    RefundPublished {
        txid: Txid,
        fee_sat: u64,
    },
    RefundConfirmed {
        txid: Txid,
        height: u32,
    },
    ConfirmationReorged {
        txid: Txid,
    },
    BlockConnected {
        height: u32,
    },
    PublicationDeadlineElapsed,
    CancelRequested,
}

impl SwapEvent {
    pub fn label(&self) -> &'static str {
        match self {
            SwapEvent::Initiated => "initiated",
            SwapEvent::PrepaySucceeded { .. } => "prepay_succeeded",
            SwapEvent::PrepayFailed { .. } => "prepay_failed",
            SwapEvent::SwapPaymentSucceeded { .. } => "swap_payment_succeeded",
            SwapEvent::SwapPaymentFailed { .. } => "swap_payment_failed",
            SwapEvent::HtlcCandidate { .. } => "htlc_candidate",
            SwapEvent::HtlcPublished { .. } => "htlc_published",
            SwapEvent::HtlcPublishFailed { .. } => "htlc_publish_failed",
            SwapEvent::HtlcConfirmed { .. } => "htlc_confirmed",
            SwapEvent::InvoiceSettled { .. } => "invoice_settled",
            SwapEvent::SweepPublished { .. } => "sweep_published",
            SwapEvent::SweepConfirmed { .. } => "sweep_confirmed",
            SwapEvent::RefundPublished { .. } => "refund_published",
            SwapEvent::RefundConfirmed { .. } => "refund_confirmed",
            SwapEvent::ConfirmationReorged { .. } => "confirmation_reorged",
            SwapEvent::BlockConnected { .. } => "block_connected",
            SwapEvent::PublicationDeadlineElapsed => "publication_deadline_elapsed",
            SwapEvent::CancelRequested => "cancel_requested",
        }
    }
}

/// Effects the executor must carry out for the kernel. The kernel never
/// performs them itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapAction {
    PayPrepay,
    PaySwapInvoice,
    BroadcastHtlc,
    PublishSweep,
    PublishRefund,
    WatchHtlc,
    CancelInvoice,
    MarkTerminal { outcome: SwapOutcome },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapOutcome {
    Succeeded,
    Failed,
    Refunded,
}

impl SwapOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapOutcome::Succeeded => "succeeded",
            SwapOutcome::Failed => "failed",
            SwapOutcome::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(SwapOutcome::Succeeded),
            "failed" => Some(SwapOutcome::Failed),
            "refunded" => Some(SwapOutcome::Refunded),
            _ => None,
        }
    }
}

/// Status record emitted on every state change, the shape the outer RPC
/// relays to users.
#[derive(Debug, Clone, Serialize)]
pub struct SwapStatus {
    pub swap_hash: SwapHash,
    pub direction: SwapDirection,
    pub phase: SwapPhase,
    pub amount_sat: u64,
    pub htlc_address_p2wsh: Option<String>,
    pub htlc_address_np2wsh: Option<String>,
    pub last_update_unix: u64,
    /// `None` while the swap is still in the phases where totals are partial.
    pub costs: Option<SwapCosts>,
}
