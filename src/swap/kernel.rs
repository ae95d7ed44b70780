use bitcoin::ScriptBuf;

use crate::chain::htlc::Htlc;
use crate::errors::FailureReason;
use crate::swap::{
    Contract, HtlcBroadcaster, SwapAction, SwapDirection, SwapEvent, SwapOutcome, SwapPhase,
    SwapState,
};

/// Kernel timing parameters. Heights only; wall-clock deadlines reach the
/// kernel as events.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Blocks before `cltv_expiry` at which a loop in refund is initiated.
    pub refund_safety_margin: u32,
    /// Minimum blocks that must remain before `cltv_expiry` for a loop out
    /// to still authorise the preimage-revealing payment.
    pub reveal_safety_margin: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            refund_safety_margin: 6,
            reveal_safety_margin: 20,
        }
    }
}

/// Result of one kernel step: the successor state and the effects the
/// executor must now carry out.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SwapState,
    pub actions: Vec<SwapAction>,
}

/// The per-swap state machine. `step` is a pure function of
/// (contract, config, state, event): no clocks, no IO, no randomness, so
/// replaying a persisted event log reproduces the state exactly.
pub struct Kernel {
    contract: Contract,
    cfg: KernelConfig,
    htlc_script_pubkey: ScriptBuf,
    htlc_np2wsh_script_pubkey: Option<ScriptBuf>,
}

impl Kernel {
    pub fn new(contract: Contract, cfg: KernelConfig) -> Self {
        let htlc = Htlc::new(
            contract.sender_key,
            contract.receiver_key,
            contract.swap_hash,
            contract.cltv_expiry,
        );
        let htlc_script_pubkey = htlc.script_pubkey();
        let htlc_np2wsh_script_pubkey = (contract.direction == SwapDirection::LoopIn
            && contract.protocol_version.supports_native_segwit_in())
        .then(|| htlc.np2wsh_script_pubkey());

        Self {
            contract,
            cfg,
            htlc_script_pubkey,
            htlc_np2wsh_script_pubkey,
        }
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn htlc(&self) -> Htlc {
        Htlc::new(
            self.contract.sender_key,
            self.contract.receiver_key,
            self.contract.swap_hash,
            self.contract.cltv_expiry,
        )
    }

    pub fn step(&self, state: &SwapState, event: &SwapEvent) -> Transition {
        match &state.phase {
            SwapPhase::Failed { .. } | SwapPhase::Refunded => return unchanged(state),
            // The one sanctioned exit from a terminal phase: the sweep
            // confirmation was reorged away before it became final.
            SwapPhase::Succeeded => {
                if self.contract.direction == SwapDirection::LoopOut
                    && let SwapEvent::ConfirmationReorged { txid } = event
                    && state.sweep_txid == Some(*txid)
                {
                    let mut next = state.clone();
                    next.phase = SwapPhase::Sweeping { txid: *txid };
                    return Transition {
                        next,
                        actions: vec![SwapAction::PublishSweep],
                    };
                }
                return unchanged(state);
            }
            _ => {}
        }

        if let SwapEvent::CancelRequested = event {
            return self.cancel(state);
        }

        match self.contract.direction {
            SwapDirection::LoopOut => self.step_loop_out(state, event),
            SwapDirection::LoopIn => self.step_loop_in(state, event),
        }
    }

    /// Actions to re-issue after rehydrating `state` from the store.
    pub fn resume_actions(&self, state: &SwapState) -> Vec<SwapAction> {
        use SwapAction as A;
        use SwapPhase as P;

        match self.contract.direction {
            SwapDirection::LoopOut => match &state.phase {
                P::Created => vec![],
                P::PrepayInFlight => vec![A::WatchHtlc, A::PayPrepay],
                P::PrepayPaid | P::HtlcPublished { .. } => vec![A::WatchHtlc],
                P::HtlcConfirmed { .. } => vec![A::WatchHtlc, A::PaySwapInvoice],
                P::PreimageRevealed | P::Sweeping { .. } => {
                    vec![A::WatchHtlc, A::PublishSweep]
                }
                _ => vec![],
            },
            SwapDirection::LoopIn => match &state.phase {
                P::Created => match self.contract.htlc_broadcaster {
                    HtlcBroadcaster::Internal => vec![A::WatchHtlc, A::BroadcastHtlc],
                    HtlcBroadcaster::External => vec![A::WatchHtlc],
                },
                P::HtlcPublished { .. } | P::HtlcConfirmed { .. } => vec![A::WatchHtlc],
                P::Refunding { .. } => vec![A::WatchHtlc, A::PublishRefund],
                _ => vec![],
            },
        }
    }

    fn cancel(&self, state: &SwapState) -> Transition {
        if state.no_return {
            // Past the point of no return cancels are ignored; the executor
            // reports the rejection.
            return unchanged(state);
        }
        let cancel_invoice = self.contract.direction == SwapDirection::LoopIn;
        self.fail(state, FailureReason::UserCancelled, cancel_invoice)
    }

    fn fail(&self, state: &SwapState, reason: FailureReason, cancel_invoice: bool) -> Transition {
        let mut next = state.clone();
        next.phase = SwapPhase::Failed { reason };
        let mut actions = Vec::new();
        if cancel_invoice {
            actions.push(SwapAction::CancelInvoice);
        }
        actions.push(SwapAction::MarkTerminal {
            outcome: SwapOutcome::Failed,
        });
        Transition { next, actions }
    }

    fn matches_htlc_script(&self, script_pubkey: &ScriptBuf) -> Option<bool> {
        if script_pubkey == &self.htlc_script_pubkey {
            return Some(false);
        }
        if self.htlc_np2wsh_script_pubkey.as_ref() == Some(script_pubkey) {
            return Some(true);
        }
        None
    }

    fn step_loop_out(&self, state: &SwapState, event: &SwapEvent) -> Transition {
        use SwapAction as A;
        use SwapEvent as E;
        use SwapPhase as P;

        match (&state.phase, event) {
            (P::Created, E::Initiated) => {
                let mut next = state.clone();
                next.phase = P::PrepayInFlight;
                Transition {
                    next,
                    actions: vec![A::WatchHtlc, A::PayPrepay],
                }
            }

            (P::PrepayInFlight, E::PrepaySucceeded { routing_fee_sat }) => {
                if let Some(limit) = self.contract.max_prepay_routing_fee_sat
                    && *routing_fee_sat > limit
                {
                    return self.fail(state, FailureReason::QuoteExceedsLimit, false);
                }
                let mut next = state.clone();
                next.phase = P::PrepayPaid;
                next.costs.offchain_sat += routing_fee_sat;
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (P::PrepayInFlight, E::PrepayFailed { error }) => {
                self.fail(state, FailureReason::OffchainPaymentFailed(error.clone()), false)
            }

            // The prepay settlement report can trail the server's htlc
            // publication; account for it without a phase change.
            (P::HtlcPublished { .. } | P::HtlcConfirmed { .. }, E::PrepaySucceeded { routing_fee_sat }) => {
                let mut next = state.clone();
                next.costs.offchain_sat += routing_fee_sat;
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (
                P::PrepayInFlight | P::PrepayPaid,
                E::HtlcCandidate {
                    txid,
                    vout,
                    amount_sat,
                    script_pubkey,
                },
            ) => {
                if state.htlc_txid.is_some() {
                    // earliest-seen candidate wins
                    return unchanged(state);
                }
                let Some(nested) = self.matches_htlc_script(script_pubkey) else {
                    return self.fail(
                        state,
                        FailureReason::ProtocolViolation(
                            "htlc output script does not match the contract".into(),
                        ),
                        false,
                    );
                };
                if *amount_sat != self.contract.amount_sat {
                    return self.fail(
                        state,
                        FailureReason::ProtocolViolation(format!(
                            "htlc pays {amount_sat} sat, contract is for {} sat",
                            self.contract.amount_sat
                        )),
                        false,
                    );
                }
                let mut next = state.clone();
                next.phase = P::HtlcPublished { txid: *txid };
                next.htlc_txid = Some(*txid);
                next.htlc_vout = Some(*vout);
                next.htlc_nested = nested;
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (P::HtlcPublished { txid: seen }, E::HtlcConfirmed { txid, height }) => {
                if txid != seen {
                    return unchanged(state);
                }
                // Authorising the swap payment reveals the preimage: the
                // point of no return.
                let mut next = state.clone();
                next.phase = P::HtlcConfirmed {
                    txid: *txid,
                    height: *height,
                };
                next.htlc_conf_height = Some(*height);
                next.no_return = true;
                Transition {
                    next,
                    actions: vec![A::PaySwapInvoice],
                }
            }

            (
                P::HtlcConfirmed { .. },
                E::SwapPaymentSucceeded {
                    preimage,
                    routing_fee_sat,
                    swap_fee_sat,
                },
            ) => {
                if preimage.hash() != self.contract.swap_hash {
                    return self.fail(
                        state,
                        FailureReason::ProtocolViolation(
                            "settled preimage does not match the swap hash".into(),
                        ),
                        false,
                    );
                }
                if let Some(limit) = self.contract.max_swap_routing_fee_sat
                    && *routing_fee_sat > limit
                {
                    return self.fail(state, FailureReason::QuoteExceedsLimit, false);
                }
                if *swap_fee_sat > self.contract.max_swap_fee_sat {
                    return self.fail(state, FailureReason::QuoteExceedsLimit, false);
                }
                let mut next = state.clone();
                next.phase = P::PreimageRevealed;
                next.preimage = Some(*preimage);
                next.costs.offchain_sat += routing_fee_sat;
                next.costs.server_sat += swap_fee_sat;
                Transition {
                    next,
                    actions: vec![A::PublishSweep],
                }
            }

            (P::HtlcConfirmed { .. }, E::SwapPaymentFailed { error }) => {
                self.fail(state, FailureReason::OffchainPaymentFailed(error.clone()), false)
            }

            (P::PreimageRevealed | P::Sweeping { .. }, E::SweepPublished { txid, fee_sat }) => {
                let mut next = state.clone();
                next.phase = P::Sweeping { txid: *txid };
                next.sweep_txid = Some(*txid);
                accrue_spend_fee(&mut next, *fee_sat);
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (P::Sweeping { txid: ours }, E::SweepConfirmed { txid, .. }) => {
                if txid != ours {
                    return unchanged(state);
                }
                let mut next = state.clone();
                next.phase = P::Succeeded;
                Transition {
                    next,
                    actions: vec![A::MarkTerminal {
                        outcome: SwapOutcome::Succeeded,
                    }],
                }
            }

            // Ack of the sweep broadcast was lost to a crash; the watcher
            // still reports the confirmation.
            (P::PreimageRevealed, E::SweepConfirmed { txid, .. }) => {
                let mut next = state.clone();
                next.phase = P::Succeeded;
                next.sweep_txid = Some(*txid);
                Transition {
                    next,
                    actions: vec![A::MarkTerminal {
                        outcome: SwapOutcome::Succeeded,
                    }],
                }
            }

            (P::Sweeping { .. }, E::BlockConnected { .. }) => Transition {
                next: state.clone(),
                actions: vec![A::PublishSweep],
            },

            (P::Sweeping { .. }, E::ConfirmationReorged { txid }) => {
                if state.sweep_txid == Some(*txid) {
                    Transition {
                        next: state.clone(),
                        actions: vec![A::PublishSweep],
                    }
                } else {
                    unchanged(state)
                }
            }

            (P::HtlcConfirmed { txid: ours, .. }, E::ConfirmationReorged { txid }) => {
                if txid != ours {
                    return unchanged(state);
                }
                let mut next = state.clone();
                next.phase = P::HtlcPublished { txid: *txid };
                next.htlc_conf_height = None;
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (
                P::Created | P::PrepayInFlight | P::PrepayPaid | P::HtlcPublished { .. },
                E::PublicationDeadlineElapsed,
            ) => self.fail(state, FailureReason::InsufficientConfirmations, false),

            // Too close to expiry to still reveal the preimage: the sweep
            // window would be unsafe, so abort while aborting is free.
            (_, E::BlockConnected { height }) if !state.no_return => {
                if *height + self.cfg.reveal_safety_margin >= self.contract.cltv_expiry {
                    self.fail(state, FailureReason::InsufficientConfirmations, false)
                } else {
                    unchanged(state)
                }
            }

            _ => unchanged(state),
        }
    }

    fn step_loop_in(&self, state: &SwapState, event: &SwapEvent) -> Transition {
        use SwapAction as A;
        use SwapEvent as E;
        use SwapPhase as P;

        match (&state.phase, event) {
            (P::Created, E::Initiated) => {
                let mut next = state.clone();
                let actions = match self.contract.htlc_broadcaster {
                    HtlcBroadcaster::Internal => {
                        // Committing to the broadcast is the point of no
                        // return, latched before the effect goes out.
                        next.no_return = true;
                        vec![A::WatchHtlc, A::BroadcastHtlc]
                    }
                    HtlcBroadcaster::External => vec![A::WatchHtlc],
                };
                Transition { next, actions }
            }

            (P::Created, E::HtlcPublished { txid, vout }) => {
                let mut next = state.clone();
                next.phase = P::HtlcPublished { txid: *txid };
                next.htlc_txid = Some(*txid);
                next.htlc_vout = Some(*vout);
                next.no_return = true;
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (
                P::Created,
                E::HtlcCandidate {
                    txid,
                    vout,
                    amount_sat,
                    script_pubkey,
                },
            ) => {
                let Some(nested) = self.matches_htlc_script(script_pubkey) else {
                    return self.fail(
                        state,
                        FailureReason::ProtocolViolation(
                            "htlc output script does not match the contract".into(),
                        ),
                        true,
                    );
                };
                if *amount_sat != self.contract.amount_sat {
                    return self.fail(
                        state,
                        FailureReason::ProtocolViolation(format!(
                            "htlc pays {amount_sat} sat, contract is for {} sat",
                            self.contract.amount_sat
                        )),
                        true,
                    );
                }
                let mut next = state.clone();
                next.phase = P::HtlcPublished { txid: *txid };
                next.htlc_txid = Some(*txid);
                next.htlc_vout = Some(*vout);
                next.htlc_nested = nested;
                next.no_return = true;
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (P::Created, E::HtlcPublishFailed { error }) => self.fail(
                state,
                FailureReason::OnchainBroadcastFailed(error.clone()),
                true,
            ),

            (P::Created, E::PublicationDeadlineElapsed) => {
                self.fail(state, FailureReason::InsufficientConfirmations, true)
            }

            (P::HtlcPublished { txid: ours }, E::HtlcConfirmed { txid, height }) => {
                if txid != ours {
                    return unchanged(state);
                }
                let mut next = state.clone();
                next.phase = P::HtlcConfirmed {
                    txid: *txid,
                    height: *height,
                };
                next.htlc_conf_height = Some(*height);
                Transition {
                    next,
                    actions: vec![],
                }
            }

            (
                P::HtlcPublished { .. } | P::HtlcConfirmed { .. },
                E::InvoiceSettled {
                    preimage,
                    swap_fee_sat,
                },
            ) => {
                if preimage.hash() != self.contract.swap_hash {
                    return self.fail(
                        state,
                        FailureReason::ProtocolViolation(
                            "settled preimage does not match the swap hash".into(),
                        ),
                        false,
                    );
                }
                let mut next = state.clone();
                next.phase = P::Succeeded;
                next.preimage = Some(*preimage);
                next.costs.server_sat += swap_fee_sat;
                Transition {
                    next,
                    actions: vec![A::MarkTerminal {
                        outcome: SwapOutcome::Succeeded,
                    }],
                }
            }

            (
                P::HtlcPublished { .. } | P::HtlcConfirmed { .. },
                E::BlockConnected { height },
            ) => {
                let refund_height = self
                    .contract
                    .cltv_expiry
                    .saturating_sub(self.cfg.refund_safety_margin);
                if *height >= refund_height {
                    Transition {
                        next: state.clone(),
                        actions: vec![A::PublishRefund],
                    }
                } else {
                    unchanged(state)
                }
            }

            (
                P::HtlcPublished { .. } | P::HtlcConfirmed { .. } | P::Refunding { .. },
                E::RefundPublished { txid, fee_sat },
            ) => {
                let mut next = state.clone();
                next.phase = P::Refunding { txid: *txid };
                accrue_spend_fee(&mut next, *fee_sat);
                let actions = if matches!(state.phase, P::Refunding { .. }) {
                    vec![]
                } else {
                    // the invoice can no longer settle against anything
                    vec![A::CancelInvoice]
                };
                Transition { next, actions }
            }

            (P::Refunding { txid: ours }, E::RefundConfirmed { txid, .. }) => {
                if txid != ours {
                    return unchanged(state);
                }
                let mut next = state.clone();
                next.phase = P::Refunded;
                Transition {
                    next,
                    actions: vec![A::MarkTerminal {
                        outcome: SwapOutcome::Refunded,
                    }],
                }
            }

            // Ack of the refund broadcast was lost to a crash.
            (
                P::HtlcPublished { .. } | P::HtlcConfirmed { .. },
                E::RefundConfirmed { .. },
            ) => {
                let mut next = state.clone();
                next.phase = P::Refunded;
                Transition {
                    next,
                    actions: vec![A::MarkTerminal {
                        outcome: SwapOutcome::Refunded,
                    }],
                }
            }

            (P::Refunding { .. }, E::BlockConnected { .. }) => Transition {
                next: state.clone(),
                actions: vec![A::PublishRefund],
            },

            (P::Refunding { txid: ours }, E::ConfirmationReorged { txid }) => {
                if txid == ours {
                    Transition {
                        next: state.clone(),
                        actions: vec![A::PublishRefund],
                    }
                } else {
                    unchanged(state)
                }
            }

            (P::HtlcConfirmed { txid: ours, .. }, E::ConfirmationReorged { txid }) => {
                if txid != ours {
                    return unchanged(state);
                }
                let mut next = state.clone();
                next.phase = P::HtlcPublished { txid: *txid };
                next.htlc_conf_height = None;
                Transition {
                    next,
                    actions: vec![],
                }
            }

            _ => unchanged(state),
        }
    }
}

fn unchanged(state: &SwapState) -> Transition {
    Transition {
        next: state.clone(),
        actions: vec![],
    }
}

/// Attribute an on-chain fee to our own spend at most once, so that reorg
/// re-publication and fee-bumped replacements never double-count.
fn accrue_spend_fee(state: &mut SwapState, fee_sat: u64) {
    if fee_sat > state.counted_spend_fee_sat {
        state.costs.onchain_sat += fee_sat - state.counted_spend_fee_sat;
        state.counted_spend_fee_sat = fee_sat;
    }
}
