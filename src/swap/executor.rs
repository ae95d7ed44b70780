use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result};
use bitcoin::{Address, OutPoint, ScriptBuf, Txid};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::chain::htlc::{self, Htlc};
use crate::chain::{ChainClient, ConfirmationEvent, FundingWallet, WatchTarget};
use crate::config::Config;
use crate::errors::SwapError;
use crate::lightning::{InvoiceState, LightningClient, PayInvoiceRequest, PaymentUpdate};
use crate::swap::kernel::Kernel;
use crate::swap::store::SwapStore;
use crate::swap::{
    SwapAction, SwapDirection, SwapEvent, SwapOutcome, SwapPhase, SwapState, SwapStatus,
};

const INVOICE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RETRY_ATTEMPTS: u32 = 5;

/// Inputs to an executor's single ordered queue. Kernel events from every
/// source funnel through here, so relative order is simply first-observed.
#[derive(Debug)]
pub(crate) enum ExecutorInput {
    Event(SwapEvent),
    /// The sweep confirmation stream finalised; a `Succeeded` loop out can
    /// now be released.
    SweepWatchClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchRole {
    Htlc,
    Sweep,
    Refund,
}

/// Drives one swap from creation (or rehydration) to its terminal state.
///
/// All effects go through the injected collaborators; every state advance is
/// appended to the store before the effects it authorises are performed.
pub(crate) struct Executor {
    kernel: Kernel,
    htlc: Htlc,
    state: SwapState,
    resumed: bool,

    cfg: Arc<Config>,
    lightning: Arc<dyn LightningClient>,
    chain: Arc<dyn ChainClient>,
    wallet: Arc<dyn FundingWallet>,
    store: Arc<dyn SwapStore>,

    input_tx: mpsc::UnboundedSender<ExecutorInput>,
    input_rx: mpsc::UnboundedReceiver<ExecutorInput>,
    status_tx: broadcast::Sender<SwapStatus>,
    no_return_flag: Arc<AtomicBool>,

    outcome: Option<SwapOutcome>,
    sweep_watch_closed: bool,

    prepay_dispatched: bool,
    swap_payment_dispatched: bool,
    invoice_watching: bool,
    htlc_watched: bool,
    watched_txs: HashSet<Txid>,
    sweep_tx_cache: Option<bitcoin::Transaction>,
    sweep_fee_cache: u64,
    refund_tx_cache: Option<bitcoin::Transaction>,
    refund_fee_cache: u64,

    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Executor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kernel: Kernel,
        state: SwapState,
        resumed: bool,
        cfg: Arc<Config>,
        lightning: Arc<dyn LightningClient>,
        chain: Arc<dyn ChainClient>,
        wallet: Arc<dyn FundingWallet>,
        store: Arc<dyn SwapStore>,
        status_tx: broadcast::Sender<SwapStatus>,
    ) -> (Self, mpsc::UnboundedSender<ExecutorInput>, Arc<AtomicBool>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let no_return_flag = Arc::new(AtomicBool::new(state.no_return));
        let htlc = kernel.htlc();

        let executor = Self {
            kernel,
            htlc,
            state,
            resumed,
            cfg,
            lightning,
            chain,
            wallet,
            store,
            input_tx: input_tx.clone(),
            input_rx,
            status_tx,
            no_return_flag: no_return_flag.clone(),
            outcome: None,
            sweep_watch_closed: false,
            prepay_dispatched: false,
            swap_payment_dispatched: false,
            invoice_watching: false,
            htlc_watched: false,
            watched_txs: HashSet::new(),
            sweep_tx_cache: None,
            sweep_fee_cache: 0,
            refund_tx_cache: None,
            refund_fee_cache: 0,
            tasks: Vec::new(),
        };
        (executor, input_tx, no_return_flag)
    }

    pub(crate) async fn run(mut self) -> Result<SwapOutcome, SwapError> {
        let swap_hash = self.kernel.contract().swap_hash;
        self.start_timers();

        if self.resumed {
            self.resync().await?;
        } else {
            self.process(SwapEvent::Initiated).await?;
        }

        while !self.finished() {
            let Some(input) = self.input_rx.recv().await else {
                break;
            };
            match input {
                ExecutorInput::Event(event) => self.process(event).await?,
                ExecutorInput::SweepWatchClosed => self.sweep_watch_closed = true,
            }
        }

        let outcome = self.outcome.expect("executor finished without an outcome");
        if outcome == SwapOutcome::Succeeded {
            // deferred for loop out until the sweep confirmation was final
            self.store.mark_terminal(swap_hash, outcome)?;
        }
        tracing::info!(swap = %swap_hash, outcome = outcome.as_str(), "swap released");
        Ok(outcome)
    }

    /// Rehydration: reopen subscriptions, re-dispatch in-flight effects and
    /// re-derive pending actions from the stored state.
    async fn resync(&mut self) -> Result<(), SwapError> {
        match self.state.phase.clone() {
            SwapPhase::Failed { .. } => {
                self.mark_terminal(SwapOutcome::Failed)?;
                return Ok(());
            }
            SwapPhase::Refunded => {
                self.mark_terminal(SwapOutcome::Refunded)?;
                return Ok(());
            }
            SwapPhase::Succeeded => {
                self.outcome = Some(SwapOutcome::Succeeded);
                if self.kernel.contract().direction == SwapDirection::LoopOut {
                    if let Some(txid) = self.state.sweep_txid {
                        self.watch_tx(txid, WatchRole::Sweep).await;
                    } else {
                        self.sweep_watch_closed = true;
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        for action in self.kernel.resume_actions(&self.state) {
            self.perform(action).await?;
        }
        if let Some(txid) = self.state.sweep_txid {
            self.watch_tx(txid, WatchRole::Sweep).await;
        }
        if let SwapPhase::Refunding { txid } = self.state.phase {
            self.watch_tx(txid, WatchRole::Refund).await;
        }
        self.ensure_invoice_watch();
        Ok(())
    }

    fn finished(&self) -> bool {
        match self.outcome {
            Some(SwapOutcome::Failed) | Some(SwapOutcome::Refunded) => true,
            Some(SwapOutcome::Succeeded) => {
                self.kernel.contract().direction == SwapDirection::LoopIn
                    || self.sweep_watch_closed
            }
            None => false,
        }
    }

    async fn process(&mut self, event: SwapEvent) -> Result<(), SwapError> {
        let swap_hash = self.kernel.contract().swap_hash;
        let transition = self.kernel.step(&self.state, &event);

        if transition.next != self.state {
            self.store
                .append_event(swap_hash, &event, &transition.next)?;
            tracing::info!(
                swap = %swap_hash,
                event = event.label(),
                phase = transition.next.phase.label(),
                "swap state advanced",
            );
            self.state = transition.next;
            self.no_return_flag
                .store(self.state.no_return, Ordering::Relaxed);
            if !self.state.phase.is_terminal() {
                // a sweep reorg regressed us out of `Succeeded`
                self.outcome = None;
            }
            self.publish_status();
        }

        for action in transition.actions {
            self.perform(action).await?;
        }
        self.ensure_invoice_watch();
        Ok(())
    }

    async fn perform(&mut self, action: SwapAction) -> Result<(), SwapError> {
        match action {
            SwapAction::WatchHtlc => self.watch_htlc().await,
            SwapAction::PayPrepay => self.dispatch_prepay().await,
            SwapAction::PaySwapInvoice => self.dispatch_swap_payment().await,
            SwapAction::BroadcastHtlc => self.broadcast_htlc().await,
            SwapAction::PublishSweep => self.publish_sweep().await,
            SwapAction::PublishRefund => self.publish_refund().await,
            SwapAction::CancelInvoice => self.cancel_invoice().await,
            SwapAction::MarkTerminal { outcome } => self.mark_terminal(outcome),
        }
    }

    fn mark_terminal(&mut self, outcome: SwapOutcome) -> Result<(), SwapError> {
        let swap_hash = self.kernel.contract().swap_hash;
        self.outcome = Some(outcome);
        match outcome {
            SwapOutcome::Failed | SwapOutcome::Refunded => {
                self.store.mark_terminal(swap_hash, outcome)?;
            }
            SwapOutcome::Succeeded => {
                // A loop out success is only final once the sweep
                // confirmation stream closes; a reorg can still regress it.
                if self.kernel.contract().direction == SwapDirection::LoopIn {
                    self.store.mark_terminal(swap_hash, outcome)?;
                }
            }
        }
        Ok(())
    }

    async fn watch_htlc(&mut self) -> Result<(), SwapError> {
        if self.htlc_watched {
            return Ok(());
        }
        self.htlc_watched = true;

        let mut scripts = vec![self.htlc.script_pubkey()];
        let contract = self.kernel.contract();
        if contract.direction == SwapDirection::LoopIn
            && contract.protocol_version.supports_native_segwit_in()
        {
            scripts.push(self.htlc.np2wsh_script_pubkey());
        }

        for script_pubkey in scripts {
            let chain = self.chain.clone();
            let min_depth = self.cfg.htlc_conf_target;
            let target = WatchTarget::Script { script_pubkey };
            let rx = retry("subscribe htlc confirmations", || {
                let target = target.clone();
                let chain = chain.clone();
                async move { chain.subscribe_confirmations(target, min_depth).await }
            })
            .await
            .map_err(|e| SwapError::Collaborator(format!("{e:#}")))?;
            self.spawn_conf_pump(rx, WatchRole::Htlc);
        }
        Ok(())
    }

    async fn watch_tx(&mut self, txid: Txid, role: WatchRole) {
        if !self.watched_txs.insert(txid) {
            return;
        }
        let chain = self.chain.clone();
        let min_depth = self.cfg.htlc_conf_target;
        let result = retry("subscribe tx confirmations", || {
            let chain = chain.clone();
            async move {
                chain
                    .subscribe_confirmations(WatchTarget::Transaction { txid }, min_depth)
                    .await
            }
        })
        .await;
        match result {
            Ok(rx) => self.spawn_conf_pump(rx, role),
            Err(e) => {
                self.watched_txs.remove(&txid);
                tracing::warn!(%txid, error = %e, "tx watch failed");
            }
        }
    }

    fn spawn_conf_pump(&mut self, mut rx: mpsc::Receiver<ConfirmationEvent>, role: WatchRole) {
        let input = self.input_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mapped = match (role, event) {
                    (
                        WatchRole::Htlc,
                        ConfirmationEvent::Seen {
                            txid,
                            vout,
                            amount_sat,
                            script_pubkey,
                        },
                    ) => Some(SwapEvent::HtlcCandidate {
                        txid,
                        vout,
                        amount_sat,
                        script_pubkey,
                    }),
                    (_, ConfirmationEvent::Seen { .. }) => None,
                    (WatchRole::Htlc, ConfirmationEvent::Confirmed { txid, height }) => {
                        Some(SwapEvent::HtlcConfirmed { txid, height })
                    }
                    (WatchRole::Sweep, ConfirmationEvent::Confirmed { txid, height }) => {
                        Some(SwapEvent::SweepConfirmed { txid, height })
                    }
                    (WatchRole::Refund, ConfirmationEvent::Confirmed { txid, height }) => {
                        Some(SwapEvent::RefundConfirmed { txid, height })
                    }
                    (_, ConfirmationEvent::Reorged { txid }) => {
                        Some(SwapEvent::ConfirmationReorged { txid })
                    }
                };
                if let Some(event) = mapped
                    && input.send(ExecutorInput::Event(event)).is_err()
                {
                    return;
                }
            }
            if role == WatchRole::Sweep {
                let _ = input.send(ExecutorInput::SweepWatchClosed);
            }
        }));
    }

    async fn dispatch_prepay(&mut self) -> Result<(), SwapError> {
        if self.prepay_dispatched {
            return Ok(());
        }
        self.prepay_dispatched = true;

        let contract = self.kernel.contract();
        let bolt11 = contract
            .prepay_invoice
            .clone()
            .expect("loop out contract carries a prepay invoice");
        let req = PayInvoiceRequest {
            bolt11,
            max_amount_sat: contract.max_prepay_amount_sat.unwrap_or(u64::MAX),
            max_routing_fee_sat: contract.max_prepay_routing_fee_sat.unwrap_or(u64::MAX),
            allow_multi_part: contract.protocol_version.supports_multi_part(),
            outgoing_channel: contract.outgoing_channel,
            last_hop: None,
            timeout_secs: self.cfg.payment_timeout_secs,
        };

        self.dispatch_payment(req, PaymentKind::Prepay).await;
        Ok(())
    }

    async fn dispatch_swap_payment(&mut self) -> Result<(), SwapError> {
        if self.swap_payment_dispatched {
            return Ok(());
        }
        self.swap_payment_dispatched = true;

        let contract = self.kernel.contract();
        let bolt11 = contract
            .swap_invoice
            .clone()
            .expect("loop out contract carries a swap invoice");
        let req = PayInvoiceRequest {
            bolt11,
            max_amount_sat: contract
                .amount_sat
                .saturating_add(contract.max_swap_fee_sat),
            max_routing_fee_sat: contract.max_swap_routing_fee_sat.unwrap_or(u64::MAX),
            allow_multi_part: contract.protocol_version.supports_multi_part(),
            outgoing_channel: contract.outgoing_channel,
            last_hop: None,
            timeout_secs: self.cfg.payment_timeout_secs,
        };

        self.dispatch_payment(req, PaymentKind::Swap).await;
        Ok(())
    }

    async fn dispatch_payment(&mut self, req: PayInvoiceRequest, kind: PaymentKind) {
        let lightning = self.lightning.clone();
        let input = self.input_tx.clone();
        let swap_fee_sat = self.kernel.contract().swap_fee_sat;
        // For the swap payment the authoritative secret is our own: the
        // initiating party generated it and persisted it in the contract.
        let contract_preimage = self.kernel.contract().preimage;

        let stream = retry("dispatch payment", || {
            let req = req.clone();
            let lightning = lightning.clone();
            async move { lightning.pay_invoice(req).await }
        })
        .await;

        let mut rx = match stream {
            Ok(rx) => rx,
            Err(e) => {
                let _ = input.send(ExecutorInput::Event(kind.failed(format!("{e:#}"))));
                return;
            }
        };

        self.tasks.push(tokio::spawn(async move {
            let mut resolved = false;
            while let Some(update) = rx.recv().await {
                match update {
                    PaymentUpdate::InFlight => {}
                    PaymentUpdate::Succeeded {
                        preimage,
                        routing_fee_sat,
                    } => {
                        let event = match kind {
                            PaymentKind::Prepay => {
                                SwapEvent::PrepaySucceeded { routing_fee_sat }
                            }
                            PaymentKind::Swap => SwapEvent::SwapPaymentSucceeded {
                                preimage: contract_preimage.unwrap_or(preimage),
                                routing_fee_sat,
                                swap_fee_sat,
                            },
                        };
                        let _ = input.send(ExecutorInput::Event(event));
                        resolved = true;
                        break;
                    }
                    PaymentUpdate::Failed { reason } => {
                        let _ = input.send(ExecutorInput::Event(kind.failed(reason)));
                        resolved = true;
                        break;
                    }
                }
            }
            if !resolved {
                let _ = input.send(ExecutorInput::Event(
                    kind.failed("payment update stream ended".into()),
                ));
            }
        }));
    }

    async fn broadcast_htlc(&mut self) -> Result<(), SwapError> {
        let contract = self.kernel.contract();
        let swap_hash = contract.swap_hash;
        let amount_sat = contract.amount_sat;
        let script_pubkey = self.htlc.script_pubkey();
        let input = self.input_tx.clone();

        let publish = async {
            let sat_per_vbyte = {
                let chain = self.chain.clone();
                let target = self.cfg.htlc_conf_target;
                retry("estimate htlc fee", || {
                    let chain = chain.clone();
                    async move { chain.estimate_fee(target).await }
                })
                .await?
                .max(1)
            };

            let wallet = self.wallet.clone();
            let spk = script_pubkey.clone();
            let tx = retry("fund htlc", || {
                let wallet = wallet.clone();
                let spk = spk.clone();
                async move {
                    wallet
                        .fund_htlc(swap_hash, &spk, amount_sat, sat_per_vbyte)
                        .await
                }
            })
            .await?;

            let vout = tx
                .output
                .iter()
                .position(|o| o.script_pubkey == script_pubkey)
                .context("funding tx does not pay the htlc script")?;

            let chain = self.chain.clone();
            let tx_clone = tx.clone();
            let txid = retry("broadcast htlc", || {
                let chain = chain.clone();
                let tx = tx_clone.clone();
                async move { chain.broadcast(&tx).await }
            })
            .await?;

            Ok::<_, anyhow::Error>((txid, vout as u32))
        };

        match publish.await {
            Ok((txid, vout)) => {
                let _ = input.send(ExecutorInput::Event(SwapEvent::HtlcPublished {
                    txid,
                    vout,
                }));
            }
            Err(e) => {
                let _ = input.send(ExecutorInput::Event(SwapEvent::HtlcPublishFailed {
                    error: format!("{e:#}"),
                }));
            }
        }
        Ok(())
    }

    async fn publish_sweep(&mut self) -> Result<(), SwapError> {
        let contract = self.kernel.contract();
        let preimage = self
            .state
            .preimage
            .expect("sweep authorised without a revealed preimage");
        let outpoint = OutPoint {
            txid: self
                .state
                .htlc_txid
                .expect("sweep authorised without a known htlc txid"),
            vout: self
                .state
                .htlc_vout
                .expect("sweep authorised without a known htlc vout"),
        };

        let tx = match &self.sweep_tx_cache {
            Some(tx) => tx.clone(),
            None => {
                let dest = self.sweep_script();
                let conf_target = contract
                    .sweep_conf_target
                    .unwrap_or(self.cfg.sweep_conf_target);
                let chain = self.chain.clone();
                let estimate = retry("estimate sweep fee", || {
                    let chain = chain.clone();
                    async move { chain.estimate_fee(conf_target).await }
                })
                .await;
                let estimate = match estimate {
                    Ok(rate) => rate,
                    Err(e) => {
                        tracing::warn!(error = %e, "sweep fee estimate failed");
                        return Ok(());
                    }
                };
                // never let the ceiling be breached by a fee spike
                let cap = (contract.max_miner_fee_sat / htlc::SWEEP_TX_VSIZE).max(1);
                let sat_per_vbyte = estimate.clamp(1, cap);

                let mut tx = match self.htlc.sweep_tx(
                    outpoint,
                    contract.amount_sat,
                    dest,
                    sat_per_vbyte,
                ) {
                    Ok(tx) => tx,
                    Err(e) => {
                        tracing::warn!(error = %e, "sweep construction failed");
                        return Ok(());
                    }
                };

                let wallet = self.wallet.clone();
                let witness_script = self.htlc.witness_script();
                let receiver_key = contract.receiver_key;
                let amount_sat = contract.amount_sat;
                let unsigned = tx.clone();
                let signature = retry("sign sweep", || {
                    let wallet = wallet.clone();
                    let tx = unsigned.clone();
                    let witness_script = witness_script.clone();
                    async move {
                        wallet
                            .sign_spend(&tx, amount_sat, &witness_script, receiver_key)
                            .await
                    }
                })
                .await;
                let signature = match signature {
                    Ok(sig) => sig,
                    Err(e) => {
                        tracing::warn!(error = %e, "sweep signing failed");
                        return Ok(());
                    }
                };

                self.htlc.finalize_sweep(&mut tx, signature, &preimage);
                self.sweep_fee_cache = htlc::sweep_fee_sat(sat_per_vbyte);
                self.sweep_tx_cache = Some(tx.clone());
                tx
            }
        };

        let chain = self.chain.clone();
        let broadcast_tx = tx.clone();
        let result = retry("broadcast sweep", || {
            let chain = chain.clone();
            let tx = broadcast_tx.clone();
            async move { chain.broadcast(&tx).await }
        })
        .await;

        match result {
            Ok(txid) => {
                let fee_sat = self.sweep_fee_cache;
                let input = self.input_tx.clone();
                let _ = input.send(ExecutorInput::Event(SwapEvent::SweepPublished {
                    txid,
                    fee_sat,
                }));
                self.watch_tx(txid, WatchRole::Sweep).await;
            }
            Err(e) => {
                // the next block tick re-issues the publish
                tracing::warn!(error = %e, "sweep broadcast failed");
            }
        }
        Ok(())
    }

    async fn publish_refund(&mut self) -> Result<(), SwapError> {
        let contract = self.kernel.contract();
        let Some(htlc_txid) = self.state.htlc_txid else {
            return Ok(());
        };
        let outpoint = OutPoint {
            txid: htlc_txid,
            vout: self
                .state
                .htlc_vout
                .expect("refund authorised without a known htlc vout"),
        };

        let tx = match &self.refund_tx_cache {
            Some(tx) => tx.clone(),
            None => {
                let wallet = self.wallet.clone();
                let dest = retry("refund destination", || {
                    let wallet = wallet.clone();
                    async move { wallet.fresh_refund_script().await }
                })
                .await;
                let dest = match dest {
                    Ok(script) => script,
                    Err(e) => {
                        tracing::warn!(error = %e, "refund destination failed");
                        return Ok(());
                    }
                };

                let chain = self.chain.clone();
                let conf_target = self.cfg.htlc_conf_target;
                let estimate = retry("estimate refund fee", || {
                    let chain = chain.clone();
                    async move { chain.estimate_fee(conf_target).await }
                })
                .await;
                let estimate = match estimate {
                    Ok(rate) => rate,
                    Err(e) => {
                        tracing::warn!(error = %e, "refund fee estimate failed");
                        return Ok(());
                    }
                };
                let cap = (contract.max_miner_fee_sat / htlc::REFUND_TX_VSIZE).max(1);
                let sat_per_vbyte = estimate.clamp(1, cap);

                let mut tx = match self.htlc.refund_tx(
                    outpoint,
                    contract.amount_sat,
                    dest,
                    sat_per_vbyte,
                    self.state.htlc_nested,
                ) {
                    Ok(tx) => tx,
                    Err(e) => {
                        tracing::warn!(error = %e, "refund construction failed");
                        return Ok(());
                    }
                };

                let wallet = self.wallet.clone();
                let witness_script = self.htlc.witness_script();
                let sender_key = contract.sender_key;
                let amount_sat = contract.amount_sat;
                let unsigned = tx.clone();
                let signature = retry("sign refund", || {
                    let wallet = wallet.clone();
                    let tx = unsigned.clone();
                    let witness_script = witness_script.clone();
                    async move {
                        wallet
                            .sign_spend(&tx, amount_sat, &witness_script, sender_key)
                            .await
                    }
                })
                .await;
                let signature = match signature {
                    Ok(sig) => sig,
                    Err(e) => {
                        tracing::warn!(error = %e, "refund signing failed");
                        return Ok(());
                    }
                };

                self.htlc.finalize_refund(&mut tx, signature);
                self.refund_fee_cache = htlc::refund_fee_sat(sat_per_vbyte);
                self.refund_tx_cache = Some(tx.clone());
                tx
            }
        };

        let chain = self.chain.clone();
        let broadcast_tx = tx.clone();
        let result = retry("broadcast refund", || {
            let chain = chain.clone();
            let tx = broadcast_tx.clone();
            async move { chain.broadcast(&tx).await }
        })
        .await;

        match result {
            Ok(txid) => {
                let fee_sat = self.refund_fee_cache;
                let input = self.input_tx.clone();
                let _ = input.send(ExecutorInput::Event(SwapEvent::RefundPublished {
                    txid,
                    fee_sat,
                }));
                self.watch_tx(txid, WatchRole::Refund).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "refund broadcast failed");
            }
        }
        Ok(())
    }

    async fn cancel_invoice(&mut self) -> Result<(), SwapError> {
        let swap_hash = self.kernel.contract().swap_hash;
        let lightning = self.lightning.clone();
        let result = retry("cancel invoice", || {
            let lightning = lightning.clone();
            async move { lightning.cancel_invoice(swap_hash).await }
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(swap = %swap_hash, error = %e, "invoice cancel failed");
        }
        Ok(())
    }

    /// Poll our own invoice until the server settles it (loop in).
    fn ensure_invoice_watch(&mut self) {
        if self.invoice_watching
            || self.kernel.contract().direction != SwapDirection::LoopIn
            || !matches!(
                self.state.phase,
                SwapPhase::HtlcPublished { .. } | SwapPhase::HtlcConfirmed { .. }
            )
        {
            return;
        }
        self.invoice_watching = true;

        let lightning = self.lightning.clone();
        let input = self.input_tx.clone();
        let swap_hash = self.kernel.contract().swap_hash;
        let amount_sat = self.kernel.contract().amount_sat;

        self.tasks.push(tokio::spawn(async move {
            loop {
                match lightning.lookup_invoice(swap_hash).await {
                    Ok(InvoiceState::Settled {
                        preimage,
                        amount_paid_sat,
                    }) => {
                        let swap_fee_sat = amount_sat.saturating_sub(amount_paid_sat);
                        let _ = input.send(ExecutorInput::Event(SwapEvent::InvoiceSettled {
                            preimage,
                            swap_fee_sat,
                        }));
                        return;
                    }
                    Ok(InvoiceState::Cancelled) => return,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(swap = %swap_hash, error = %e, "invoice lookup failed");
                    }
                }
                tokio::time::sleep(INVOICE_POLL_INTERVAL).await;
            }
        }));
    }

    fn start_timers(&mut self) {
        // block ticker
        let chain = self.chain.clone();
        let input = self.input_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let rx = retry("subscribe blocks", || {
                let chain = chain.clone();
                async move { chain.subscribe_blocks().await }
            })
            .await;
            let Ok(mut rx) = rx else { return };
            while let Some(height) = rx.recv().await {
                if input
                    .send(ExecutorInput::Event(SwapEvent::BlockConnected { height }))
                    .is_err()
                {
                    return;
                }
            }
        }));

        // wall-clock publication deadline
        let deadline_unix = self.kernel.contract().publication_deadline_unix;
        let input = self.input_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let delay = deadline_unix.saturating_sub(now_unix());
            tokio::time::sleep(Duration::from_secs(delay)).await;
            let _ = input.send(ExecutorInput::Event(SwapEvent::PublicationDeadlineElapsed));
        }));
    }

    fn sweep_script(&self) -> ScriptBuf {
        let contract = self.kernel.contract();
        let address = contract
            .sweep_address
            .as_deref()
            .expect("loop out contract carries a sweep address");
        Address::from_str(address)
            .expect("sweep address was validated at admission")
            .require_network(self.cfg.network)
            .expect("sweep address was validated at admission")
            .script_pubkey()
    }

    fn publish_status(&self) {
        let contract = self.kernel.contract();
        let np2wsh = (contract.direction == SwapDirection::LoopIn
            && contract.protocol_version.supports_native_segwit_in())
        .then(|| self.htlc.np2wsh_address(self.cfg.network).ok())
        .flatten();

        let status = SwapStatus {
            swap_hash: contract.swap_hash,
            direction: contract.direction,
            phase: self.state.phase.clone(),
            amount_sat: contract.amount_sat,
            htlc_address_p2wsh: self
                .htlc
                .p2wsh_address(self.cfg.network)
                .ok()
                .map(|a| a.to_string()),
            htlc_address_np2wsh: np2wsh.map(|a| a.to_string()),
            last_update_unix: now_unix(),
            costs: self.state.phase.reports_costs().then_some(self.state.costs),
        };
        let _ = self.status_tx.send(status);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaymentKind {
    Prepay,
    Swap,
}

impl PaymentKind {
    fn failed(self, error: String) -> SwapEvent {
        match self {
            PaymentKind::Prepay => SwapEvent::PrepayFailed { error },
            PaymentKind::Swap => SwapEvent::SwapPaymentFailed { error },
        }
    }
}

/// Capped exponential backoff for transient collaborator errors. Only the
/// final error surfaces; intermediate failures are logged.
async fn retry<T, F, Fut>(what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= RETRY_ATTEMPTS {
                    return Err(e.context(format!("{what}: gave up after {attempt} attempts")));
                }
                tracing::warn!(op = what, error = %e, "transient failure; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
