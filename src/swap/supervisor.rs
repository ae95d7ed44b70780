use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bitcoin::Address;
use bitcoin::secp256k1::PublicKey;
use tokio::sync::{broadcast, mpsc};

use crate::chain::{ChainClient, FundingWallet};
use crate::config::Config;
use crate::errors::SwapError;
use crate::lightning::{LightningClient, invoice};
use crate::server::{NewLoopInSwap, NewLoopOutSwap, SwapServer};
use crate::swap::executor::{Executor, ExecutorInput};
use crate::swap::kernel::{Kernel, KernelConfig};
use crate::swap::policy::{self, UserLimits};
use crate::swap::store::SwapStore;
use crate::swap::{
    Contract, HtlcBroadcaster, Preimage, SwapDirection, SwapEvent, SwapHash, SwapState, SwapStatus,
};

/// Everything the core talks to, injected at construction. No globals.
#[derive(Clone)]
pub struct Collaborators {
    pub lightning: Arc<dyn LightningClient>,
    pub chain: Arc<dyn ChainClient>,
    pub wallet: Arc<dyn FundingWallet>,
    pub server: Arc<dyn SwapServer>,
    pub store: Arc<dyn SwapStore>,
}

#[derive(Debug, Clone)]
pub struct LoopOutRequest {
    pub amount_sat: u64,
    pub sweep_address: String,
    pub sweep_conf_target: Option<u32>,
    pub outgoing_channel: Option<u64>,
    pub limits: UserLimits,
}

#[derive(Debug, Clone)]
pub struct LoopInRequest {
    pub amount_sat: u64,
    pub last_hop: Option<PublicKey>,
    /// The htlc is funded by an external wallet instead of our own; the
    /// point of no return moves to its first on-chain observation.
    pub external_htlc: bool,
    pub limits: UserLimits,
}

struct ActiveSwap {
    direction: SwapDirection,
    last_hop: Option<PublicKey>,
    input_tx: mpsc::UnboundedSender<ExecutorInput>,
    no_return: Arc<AtomicBool>,
}

/// Owns the executor population for the lifetime of the process.
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: Arc<Config>,
    collab: Collaborators,
    active: Mutex<HashMap<SwapHash, ActiveSwap>>,
    status_tx: broadcast::Sender<SwapStatus>,
    /// Set on the first storage failure; no further state-advancing
    /// decisions are made once we cannot record them.
    halted: AtomicBool,
}

impl Supervisor {
    pub fn new(collab: Collaborators, cfg: Config) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                cfg: Arc::new(cfg),
                collab,
                active: Mutex::new(HashMap::new()),
                status_tx,
                halted: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to per-transition status records.
    pub fn subscribe(&self) -> broadcast::Receiver<SwapStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().expect("active map poisoned").len()
    }

    /// Relaunch every non-terminal stored swap. Returns how many resumed.
    pub async fn resume(&self) -> Result<usize, SwapError> {
        let stored = self.inner.collab.store.load_all()?;
        let count = stored.len();
        for swap in stored {
            let state = swap.last_state();
            let resumed = !swap.events.is_empty();
            tracing::info!(
                swap = %swap.contract.swap_hash,
                phase = state.phase.label(),
                "resuming swap",
            );
            self.spawn_swap(swap.contract, state, resumed);
        }
        Ok(count)
    }

    /// Start a loop out: off-chain balance to on-chain coins.
    pub async fn loop_out(&self, req: LoopOutRequest) -> Result<SwapHash, SwapError> {
        self.ensure_capacity(None)?;

        Address::from_str(&req.sweep_address)
            .map_err(|e| SwapError::InvalidRequest(format!("invalid sweep address: {e}")))?
            .require_network(self.inner.cfg.network)
            .map_err(|_| SwapError::InvalidRequest("sweep address network mismatch".into()))?;

        let server = &self.inner.collab.server;
        let terms = server.loop_out_terms().await.map_err(server_err)?;
        if req.amount_sat < terms.min_swap_amount_sat
            || req.amount_sat > terms.max_swap_amount_sat
        {
            return Err(SwapError::InvalidRequest(format!(
                "amount {} sat outside server terms [{}, {}]",
                req.amount_sat, terms.min_swap_amount_sat, terms.max_swap_amount_sat
            )));
        }

        let quote = server.loop_out_quote(req.amount_sat).await.map_err(server_err)?;
        let ceilings =
            policy::loop_out_limits(&self.inner.cfg, req.amount_sat, &quote, &req.limits)?;

        let preimage = Preimage::generate();
        let swap_hash = preimage.hash();
        let receiver_key = self
            .inner
            .collab
            .wallet
            .fresh_pubkey()
            .await
            .map_err(collaborator_err)?;

        let now = now_unix();
        let publication_deadline_unix = now + self.inner.cfg.publication_deadline_secs;
        let created = server
            .new_loop_out_swap(NewLoopOutSwap {
                receiver_key,
                swap_hash,
                amount_sat: req.amount_sat,
                publication_deadline_unix,
                protocol_version: self.inner.cfg.protocol_version,
            })
            .await
            .map_err(server_err)?;

        let height = self
            .inner
            .collab
            .chain
            .current_height()
            .await
            .map_err(collaborator_err)?;
        if created.cltv_expiry <= height + self.inner.cfg.cltv_safety_margin {
            return Err(SwapError::ProtocolViolation(format!(
                "server cltv expiry {} leaves no margin over height {height}",
                created.cltv_expiry
            )));
        }

        // The invoices must commit to our hash and the quoted amounts.
        let invoice_hash = invoice::payment_hash_from_bolt11(&created.swap_invoice)
            .map_err(|e| SwapError::ProtocolViolation(format!("swap invoice: {e:#}")))?;
        if invoice_hash != swap_hash {
            return Err(SwapError::ProtocolViolation(
                "swap invoice does not commit to the swap hash".into(),
            ));
        }
        if invoice::is_expired_bolt11(&created.swap_invoice)
            .map_err(|e| SwapError::ProtocolViolation(format!("swap invoice: {e:#}")))?
        {
            return Err(SwapError::ProtocolViolation(
                "swap invoice is already expired".into(),
            ));
        }
        let invoice_amount = invoice::amount_sat_from_bolt11(&created.swap_invoice)
            .map_err(|e| SwapError::ProtocolViolation(format!("swap invoice: {e:#}")))?;
        if let Some(amount) = invoice_amount
            && amount != req.amount_sat + quote.swap_fee_sat
        {
            return Err(SwapError::ProtocolViolation(format!(
                "swap invoice asks {amount} sat, expected {}",
                req.amount_sat + quote.swap_fee_sat
            )));
        }
        let prepay_amount = invoice::amount_sat_from_bolt11(&created.prepay_invoice)
            .map_err(|e| SwapError::ProtocolViolation(format!("prepay invoice: {e:#}")))?;
        if let Some(amount) = prepay_amount
            && amount != quote.prepay_amount_sat
        {
            return Err(SwapError::ProtocolViolation(format!(
                "prepay invoice asks {amount} sat, quoted {}",
                quote.prepay_amount_sat
            )));
        }

        let contract = Contract {
            direction: SwapDirection::LoopOut,
            amount_sat: req.amount_sat,
            swap_hash,
            preimage: Some(preimage),
            sender_key: created.sender_key,
            receiver_key,
            cltv_expiry: created.cltv_expiry,
            swap_fee_sat: quote.swap_fee_sat,
            max_miner_fee_sat: ceilings.max_miner_fee_sat,
            max_swap_fee_sat: ceilings.max_swap_fee_sat,
            max_swap_routing_fee_sat: ceilings.max_swap_routing_fee_sat,
            max_prepay_routing_fee_sat: ceilings.max_prepay_routing_fee_sat,
            max_prepay_amount_sat: ceilings.max_prepay_amount_sat,
            initiation_height: height,
            created_at_unix: now,
            publication_deadline_unix,
            protocol_version: self.inner.cfg.protocol_version,
            htlc_broadcaster: HtlcBroadcaster::Internal,
            swap_invoice: Some(created.swap_invoice),
            prepay_invoice: Some(created.prepay_invoice),
            loop_in_invoice: None,
            sweep_address: Some(req.sweep_address),
            sweep_conf_target: req.sweep_conf_target,
            outgoing_channel: req.outgoing_channel,
            last_hop: None,
        };

        self.inner.collab.store.put_contract(&contract)?;
        tracing::info!(swap = %swap_hash, amount_sat = req.amount_sat, "loop out initiated");
        self.spawn_swap(contract, SwapState::initial(), false);
        Ok(swap_hash)
    }

    /// Start a loop in: on-chain coins to off-chain balance.
    pub async fn loop_in(&self, req: LoopInRequest) -> Result<SwapHash, SwapError> {
        self.ensure_capacity(Some(&req))?;

        let server = &self.inner.collab.server;
        let terms = server.loop_in_terms().await.map_err(server_err)?;
        if req.amount_sat < terms.min_swap_amount_sat
            || req.amount_sat > terms.max_swap_amount_sat
        {
            return Err(SwapError::InvalidRequest(format!(
                "amount {} sat outside server terms [{}, {}]",
                req.amount_sat, terms.min_swap_amount_sat, terms.max_swap_amount_sat
            )));
        }

        let quote = server.loop_in_quote(req.amount_sat).await.map_err(server_err)?;
        let ceilings = policy::loop_in_limits(&self.inner.cfg, &quote, &req.limits)?;

        // The server pre-committed to this hash; we learn the preimage only
        // if it settles our invoice.
        let swap_hash = quote.swap_hash;
        let sender_key = self
            .inner
            .collab
            .wallet
            .fresh_pubkey()
            .await
            .map_err(collaborator_err)?;

        let invoice_amount = req
            .amount_sat
            .checked_sub(quote.swap_fee_sat)
            .ok_or_else(|| {
                SwapError::InvalidRequest("server fee exceeds the swap amount".into())
            })?;
        let bolt11 = self
            .inner
            .collab
            .lightning
            .add_invoice(invoice_amount, swap_hash, quote.cltv_delta)
            .await
            .map_err(collaborator_err)?;

        let created = server
            .new_loop_in_swap(NewLoopInSwap {
                sender_key,
                swap_hash,
                amount_sat: req.amount_sat,
                swap_invoice: bolt11.clone(),
                last_hop: req.last_hop,
                protocol_version: self.inner.cfg.protocol_version,
            })
            .await
            .map_err(server_err)?;

        let height = self
            .inner
            .collab
            .chain
            .current_height()
            .await
            .map_err(collaborator_err)?;
        if created.cltv_expiry <= height + self.inner.cfg.cltv_safety_margin {
            return Err(SwapError::ProtocolViolation(format!(
                "server cltv expiry {} leaves no margin over height {height}",
                created.cltv_expiry
            )));
        }

        let now = now_unix();
        let contract = Contract {
            direction: SwapDirection::LoopIn,
            amount_sat: req.amount_sat,
            swap_hash,
            preimage: None,
            sender_key,
            receiver_key: created.receiver_key,
            cltv_expiry: created.cltv_expiry,
            swap_fee_sat: quote.swap_fee_sat,
            max_miner_fee_sat: ceilings.max_miner_fee_sat,
            max_swap_fee_sat: ceilings.max_swap_fee_sat,
            max_swap_routing_fee_sat: None,
            max_prepay_routing_fee_sat: None,
            max_prepay_amount_sat: None,
            initiation_height: height,
            created_at_unix: now,
            publication_deadline_unix: now + self.inner.cfg.publication_deadline_secs,
            protocol_version: self.inner.cfg.protocol_version,
            htlc_broadcaster: if req.external_htlc {
                HtlcBroadcaster::External
            } else {
                HtlcBroadcaster::Internal
            },
            swap_invoice: None,
            prepay_invoice: None,
            loop_in_invoice: Some(bolt11),
            sweep_address: None,
            sweep_conf_target: None,
            outgoing_channel: None,
            last_hop: req.last_hop,
        };

        self.inner.collab.store.put_contract(&contract)?;
        tracing::info!(swap = %swap_hash, amount_sat = req.amount_sat, "loop in initiated");
        self.spawn_swap(contract, SwapState::initial(), false);
        Ok(swap_hash)
    }

    /// Request a user cancel. Honoured only before the point of no return.
    pub fn cancel(&self, swap_hash: SwapHash) -> Result<(), SwapError> {
        let active = self.inner.active.lock().expect("active map poisoned");
        let swap = active
            .get(&swap_hash)
            .ok_or(SwapError::UnknownSwap(swap_hash))?;
        if swap.no_return.load(Ordering::Relaxed) {
            return Err(SwapError::PastPointOfNoReturn(swap_hash));
        }
        swap.input_tx
            .send(ExecutorInput::Event(SwapEvent::CancelRequested))
            .map_err(|_| SwapError::UnknownSwap(swap_hash))?;
        Ok(())
    }

    /// Garbage-collect terminal swaps past the retention window, preserving
    /// outcome records.
    pub fn gc_terminal(&self) -> Result<usize, SwapError> {
        Ok(self
            .inner
            .collab
            .store
            .gc_terminal(now_unix(), self.inner.cfg.terminal_retention_secs)?)
    }

    fn ensure_capacity(&self, loop_in: Option<&LoopInRequest>) -> Result<(), SwapError> {
        if self.inner.halted.load(Ordering::SeqCst) {
            return Err(SwapError::Halted);
        }
        let active = self.inner.active.lock().expect("active map poisoned");
        if active.len() >= self.inner.cfg.max_active_swaps {
            return Err(SwapError::MaxActiveSwaps);
        }
        if let Some(req) = loop_in {
            let peer_swaps = active
                .values()
                .filter(|s| s.direction == SwapDirection::LoopIn && s.last_hop == req.last_hop)
                .count();
            if peer_swaps >= self.inner.cfg.max_loop_in_per_peer {
                return Err(SwapError::PeerLimitExceeded);
            }
        }
        Ok(())
    }

    fn spawn_swap(&self, contract: Contract, state: SwapState, resumed: bool) {
        let swap_hash = contract.swap_hash;
        let direction = contract.direction;
        let last_hop = contract.last_hop;
        let kernel_cfg = KernelConfig {
            refund_safety_margin: self.inner.cfg.refund_safety_margin,
            reveal_safety_margin: self.inner.cfg.cltv_safety_margin,
        };
        let kernel = Kernel::new(contract, kernel_cfg);

        let (executor, input_tx, no_return) = Executor::new(
            kernel,
            state,
            resumed,
            self.inner.cfg.clone(),
            self.inner.collab.lightning.clone(),
            self.inner.collab.chain.clone(),
            self.inner.collab.wallet.clone(),
            self.inner.collab.store.clone(),
            self.inner.status_tx.clone(),
        );

        self.inner
            .active
            .lock()
            .expect("active map poisoned")
            .insert(
                swap_hash,
                ActiveSwap {
                    direction,
                    last_hop,
                    input_tx,
                    no_return,
                },
            );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match executor.run().await {
                Ok(outcome) => {
                    tracing::info!(swap = %swap_hash, outcome = outcome.as_str(), "swap terminal");
                }
                Err(e) => {
                    tracing::error!(swap = %swap_hash, error = %e, "executor aborted");
                    if matches!(e, SwapError::Storage(_)) {
                        inner.halted.store(true, Ordering::SeqCst);
                    }
                }
            }
            inner
                .active
                .lock()
                .expect("active map poisoned")
                .remove(&swap_hash);
        });
    }
}

fn server_err(e: anyhow::Error) -> SwapError {
    SwapError::Server(format!("{e:#}"))
}

fn collaborator_err(e: anyhow::Error) -> SwapError {
    SwapError::Collaborator(format!("{e:#}"))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
