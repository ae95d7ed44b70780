use bitcoin::Network;
use serde::Deserialize;

use crate::server::ProtocolVersion;

/// Client configuration. Every field has a default matching the behaviour of
/// the deployed protocol; deserialise a partial config over it to override.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: Network,

    /// Capability set advertised to the swap server.
    pub protocol_version: ProtocolVersion,

    /// Expansion factor applied to the quoted miner fee to form the on-chain
    /// fee ceiling, absorbing mempool volatility between quote and sweep.
    pub miner_fee_multiplier: u64,

    /// Base of the route-independent routing fee ceiling, in satoshis.
    pub routing_fee_base_sat: u64,

    /// Proportional part of the routing fee ceiling, in parts per million.
    pub routing_fee_ppm: u64,

    /// Blocks before `cltv_expiry` at which a loop in refund is initiated.
    pub refund_safety_margin: u32,

    /// Minimum distance between the current height and a new contract's
    /// `cltv_expiry`.
    pub cltv_safety_margin: u32,

    /// Confirmation depth at which an htlc counts as confirmed.
    pub htlc_conf_target: u32,

    /// Default fee-estimate target for loop out sweeps.
    pub sweep_conf_target: u32,

    /// Wall-clock window within which the htlc must appear on-chain.
    pub publication_deadline_secs: u64,

    /// Per-attempt timeout for off-chain payments.
    pub payment_timeout_secs: u64,

    /// Global bound on concurrently active swaps.
    pub max_active_swaps: usize,

    /// Per-peer bound on concurrently active loop in swaps, keyed by the
    /// declared last hop.
    pub max_loop_in_per_peer: usize,

    /// Terminal swaps older than this are eligible for garbage collection.
    pub terminal_retention_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            protocol_version: ProtocolVersion::NativeSegwitIn,
            miner_fee_multiplier: 100,
            routing_fee_base_sat: 10,
            routing_fee_ppm: 20_000,
            refund_safety_margin: 6,
            cltv_safety_margin: 20,
            htlc_conf_target: 3,
            sweep_conf_target: 6,
            publication_deadline_secs: 30 * 60,
            payment_timeout_secs: 60,
            max_active_swaps: 32,
            max_loop_in_per_peer: 2,
            terminal_retention_secs: 30 * 24 * 60 * 60,
        }
    }
}
