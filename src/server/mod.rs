use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::swap::SwapHash;

/// Capability set advertised to the swap server. Feature gating is explicit
/// at each call site; never rely on variant ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    /// No optional features.
    Legacy,
    /// The server may split off-chain payments into parts.
    MultiPart,
    /// The client accepts both P2WSH and NP2WSH loop in htlcs.
    NativeSegwitIn,
}

impl ProtocolVersion {
    pub fn supports_multi_part(self) -> bool {
        matches!(
            self,
            ProtocolVersion::MultiPart | ProtocolVersion::NativeSegwitIn
        )
    }

    pub fn supports_native_segwit_in(self) -> bool {
        matches!(self, ProtocolVersion::NativeSegwitIn)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopOutTerms {
    pub min_swap_amount_sat: u64,
    pub max_swap_amount_sat: u64,
    pub min_cltv_delta: u32,
    pub max_cltv_delta: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopOutQuote {
    pub swap_fee_sat: u64,
    pub prepay_amount_sat: u64,
    pub miner_fee_sat: u64,
    pub cltv_delta: u32,
}

#[derive(Debug, Clone)]
pub struct NewLoopOutSwap {
    pub receiver_key: PublicKey,
    pub swap_hash: SwapHash,
    pub amount_sat: u64,
    pub publication_deadline_unix: u64,
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug, Clone)]
pub struct LoopOutSwapCreated {
    pub swap_invoice: String,
    pub prepay_invoice: String,
    pub sender_key: PublicKey,
    pub cltv_expiry: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopInTerms {
    pub min_swap_amount_sat: u64,
    pub max_swap_amount_sat: u64,
}

/// Loop in quote. The server pre-commits to the swap hash here; the client
/// only ever learns the matching preimage through invoice settlement.
#[derive(Debug, Clone, Copy)]
pub struct LoopInQuote {
    pub swap_fee_sat: u64,
    pub miner_fee_sat: u64,
    pub cltv_delta: u32,
    pub swap_hash: SwapHash,
}

#[derive(Debug, Clone)]
pub struct NewLoopInSwap {
    pub sender_key: PublicKey,
    pub swap_hash: SwapHash,
    pub amount_sat: u64,
    pub swap_invoice: String,
    pub last_hop: Option<PublicKey>,
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug, Clone)]
pub struct LoopInSwapCreated {
    pub receiver_key: PublicKey,
    pub cltv_expiry: u32,
}

/// Message-level view of the swap server wire protocol.
#[async_trait]
pub trait SwapServer: Send + Sync {
    async fn loop_out_terms(&self) -> Result<LoopOutTerms>;

    async fn loop_out_quote(&self, amount_sat: u64) -> Result<LoopOutQuote>;

    async fn new_loop_out_swap(&self, req: NewLoopOutSwap) -> Result<LoopOutSwapCreated>;

    async fn loop_in_terms(&self) -> Result<LoopInTerms>;

    async fn loop_in_quote(&self, amount_sat: u64) -> Result<LoopInQuote>;

    async fn new_loop_in_swap(&self, req: NewLoopInSwap) -> Result<LoopInSwapCreated>;
}
