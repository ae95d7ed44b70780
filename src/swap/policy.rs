use crate::config::Config;
use crate::errors::SwapError;
use crate::server::{LoopInQuote, LoopOutQuote};

/// Ceilings the user declared for one swap. `None` falls back to the
/// route-independent defaults derived from the quote.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserLimits {
    pub max_swap_fee_sat: Option<u64>,
    pub max_prepay_amount_sat: Option<u64>,
    pub max_swap_routing_fee_sat: Option<u64>,
    pub max_prepay_routing_fee_sat: Option<u64>,
}

/// Finalised cost-ceiling snapshot written into the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostCeilings {
    pub max_miner_fee_sat: u64,
    pub max_swap_fee_sat: u64,
    pub max_swap_routing_fee_sat: Option<u64>,
    pub max_prepay_routing_fee_sat: Option<u64>,
    pub max_prepay_amount_sat: Option<u64>,
}

/// Route-independent routing fee ceiling. There is no reliable estimate of
/// real routing fees ahead of time, so a base plus a proportional part is
/// the best available bound.
pub fn default_routing_fee_sat(cfg: &Config, amount_sat: u64) -> u64 {
    cfg.routing_fee_base_sat + amount_sat * cfg.routing_fee_ppm / 1_000_000
}

/// Vet a loop out quote against the user's ceilings and snapshot the
/// contract limits. Rejection happens before any external action.
pub fn loop_out_limits(
    cfg: &Config,
    amount_sat: u64,
    quote: &LoopOutQuote,
    user: &UserLimits,
) -> Result<CostCeilings, SwapError> {
    let max_swap_fee_sat = user.max_swap_fee_sat.unwrap_or(quote.swap_fee_sat);
    if quote.swap_fee_sat > max_swap_fee_sat {
        return Err(SwapError::QuoteExceedsLimit {
            field: "swap_fee",
            quoted: quote.swap_fee_sat,
            limit: max_swap_fee_sat,
        });
    }

    let max_prepay_amount_sat = user.max_prepay_amount_sat.unwrap_or(quote.prepay_amount_sat);
    if quote.prepay_amount_sat > max_prepay_amount_sat {
        return Err(SwapError::QuoteExceedsLimit {
            field: "prepay_amount",
            quoted: quote.prepay_amount_sat,
            limit: max_prepay_amount_sat,
        });
    }

    Ok(CostCeilings {
        max_miner_fee_sat: quote.miner_fee_sat.saturating_mul(cfg.miner_fee_multiplier),
        max_swap_fee_sat,
        max_swap_routing_fee_sat: Some(
            user.max_swap_routing_fee_sat
                .unwrap_or_else(|| default_routing_fee_sat(cfg, amount_sat)),
        ),
        max_prepay_routing_fee_sat: Some(
            user.max_prepay_routing_fee_sat
                .unwrap_or_else(|| default_routing_fee_sat(cfg, quote.prepay_amount_sat)),
        ),
        max_prepay_amount_sat: Some(max_prepay_amount_sat),
    })
}

/// Vet a loop in quote. No prepay and no client-side routing on this
/// direction, so only the service and miner fee ceilings apply.
pub fn loop_in_limits(
    cfg: &Config,
    quote: &LoopInQuote,
    user: &UserLimits,
) -> Result<CostCeilings, SwapError> {
    let max_swap_fee_sat = user.max_swap_fee_sat.unwrap_or(quote.swap_fee_sat);
    if quote.swap_fee_sat > max_swap_fee_sat {
        return Err(SwapError::QuoteExceedsLimit {
            field: "swap_fee",
            quoted: quote.swap_fee_sat,
            limit: max_swap_fee_sat,
        });
    }

    Ok(CostCeilings {
        max_miner_fee_sat: quote.miner_fee_sat.saturating_mul(cfg.miner_fee_multiplier),
        max_swap_fee_sat,
        max_swap_routing_fee_sat: None,
        max_prepay_routing_fee_sat: None,
        max_prepay_amount_sat: None,
    })
}
