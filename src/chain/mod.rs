pub mod htlc;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction, Txid};
use tokio::sync::mpsc;

use crate::swap::SwapHash;

/// What a confirmation subscription watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Any transaction paying this script.
    Script { script_pubkey: ScriptBuf },
    /// One specific transaction.
    Transaction { txid: Txid },
}

/// Events from a confirmation subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationEvent {
    /// A matching transaction entered the mempool or a block.
    Seen {
        txid: Txid,
        vout: u32,
        amount_sat: u64,
        script_pubkey: ScriptBuf,
    },
    /// The transaction reached the requested depth.
    Confirmed { txid: Txid, height: u32 },
    /// A reorg dropped the transaction back out of the chain.
    Reorged { txid: Txid },
}

/// Chain access.
///
/// `broadcast` is idempotent by txid: re-broadcasting a known transaction
/// succeeds and returns the same txid. A confirmation subscription replays
/// `Seen`/`Confirmed` for matching transactions that already exist when it
/// is opened (this is what makes restart resync work), and the stream ends
/// once the confirmation is final, i.e. no reorg window remains.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_height(&self) -> Result<u32>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    async fn subscribe_confirmations(
        &self,
        target: WatchTarget,
        min_depth: u32,
    ) -> Result<mpsc::Receiver<ConfirmationEvent>>;

    /// Stream of connected block heights.
    async fn subscribe_blocks(&self) -> Result<mpsc::Receiver<u32>>;

    /// Fee estimate in sat/vbyte for confirmation within `target_blocks`.
    async fn estimate_fee(&self, target_blocks: u32) -> Result<u64>;
}

/// Wallet access: keys, loop in funding and spend signatures. This is the
/// seam behind which all signing lives; the core itself never constructs a
/// signature.
///
/// `fund_htlc` is idempotent per swap hash: funding a swap whose funding
/// transaction was already built returns that same transaction, so a crash
/// between build and broadcast cannot double-fund.
#[async_trait]
pub trait FundingWallet: Send + Sync {
    async fn fresh_pubkey(&self) -> Result<PublicKey>;

    /// Script to pay a refund to.
    async fn fresh_refund_script(&self) -> Result<ScriptBuf>;

    async fn fund_htlc(
        &self,
        swap_hash: SwapHash,
        script_pubkey: &ScriptBuf,
        amount_sat: u64,
        sat_per_vbyte: u64,
    ) -> Result<Transaction>;

    /// ECDSA signature (DER, sighash byte appended) for input 0 of `tx`
    /// spending an htlc output of `input_value_sat` under `witness_script`
    /// with the wallet key `key`.
    async fn sign_spend(
        &self,
        tx: &Transaction,
        input_value_sat: u64,
        witness_script: &ScriptBuf,
        key: PublicKey,
    ) -> Result<Vec<u8>>;
}
