use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tokio::sync::mpsc;

use ln_chain_swap::chain::{ChainClient, ConfirmationEvent, FundingWallet, WatchTarget};
use ln_chain_swap::errors::StoreError;
use ln_chain_swap::lightning::invoice::payment_hash_from_bolt11;
use ln_chain_swap::lightning::{InvoiceState, LightningClient, PayInvoiceRequest, PaymentUpdate};
use ln_chain_swap::server::{
    LoopInQuote, LoopInSwapCreated, LoopInTerms, LoopOutQuote, LoopOutSwapCreated, LoopOutTerms,
    NewLoopInSwap, NewLoopOutSwap, SwapServer,
};
use ln_chain_swap::swap::store::{StoredEvent, StoredSwap, SwapStore};
use ln_chain_swap::swap::{Contract, Preimage, SwapEvent, SwapHash, SwapOutcome, SwapState};

use super::invoices::build_invoice;
use super::{eventually, p2wpkh_script};

pub const PREPAY_PREIMAGE: [u8; 32] = [0xAB; 32];

pub fn test_key(byte: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).expect("non-zero key byte");
    PublicKey::from_secret_key(&secp, &sk)
}

// ---------------------------------------------------------------- lightning

struct HeldInvoice {
    amount_sat: u64,
    state: InvoiceState,
}

#[derive(Default)]
struct LightningState {
    invoices: HashMap<SwapHash, HeldInvoice>,
    scripts: HashMap<SwapHash, Vec<PaymentUpdate>>,
    default_script: Option<Vec<PaymentUpdate>>,
    dispatched: HashMap<SwapHash, Vec<PaymentUpdate>>,
    dispatch_counts: HashMap<SwapHash, u32>,
    open_streams: Vec<mpsc::Sender<PaymentUpdate>>,
    cancelled: Vec<SwapHash>,
}

/// Scriptable Lightning node. Payments resolve according to the updates
/// scripted per payment hash (or the default script); re-dispatching a known
/// payment replays its recorded outcome, mirroring payment-hash
/// deduplication in a real node.
#[derive(Default)]
pub struct MockLightning {
    inner: Mutex<LightningState>,
}

impl MockLightning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_payment(&self, payment_hash: SwapHash, updates: Vec<PaymentUpdate>) {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(payment_hash, updates);
    }

    pub fn script_default_payment(&self, updates: Vec<PaymentUpdate>) {
        self.inner.lock().unwrap().default_script = Some(updates);
    }

    pub fn dispatch_count(&self, payment_hash: SwapHash) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .dispatch_counts
            .get(&payment_hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_dispatches(&self) -> u32 {
        self.inner.lock().unwrap().dispatch_counts.values().sum()
    }

    pub fn cancelled(&self) -> Vec<SwapHash> {
        self.inner.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl LightningClient for MockLightning {
    async fn add_invoice(
        &self,
        amount_sat: u64,
        payment_hash: SwapHash,
        _cltv_delta: u32,
    ) -> Result<String> {
        let bolt11 = build_invoice(payment_hash, amount_sat);
        self.inner.lock().unwrap().invoices.insert(
            payment_hash,
            HeldInvoice {
                amount_sat,
                state: InvoiceState::Open,
            },
        );
        Ok(bolt11)
    }

    async fn pay_invoice(&self, req: PayInvoiceRequest) -> Result<mpsc::Receiver<PaymentUpdate>> {
        let payment_hash = payment_hash_from_bolt11(&req.bolt11)?;
        let (tx, rx) = mpsc::channel(8);

        let mut state = self.inner.lock().unwrap();
        *state.dispatch_counts.entry(payment_hash).or_insert(0) += 1;

        let updates = if let Some(prev) = state.dispatched.get(&payment_hash) {
            prev.clone()
        } else {
            let scripted = state
                .scripts
                .get(&payment_hash)
                .cloned()
                .or_else(|| state.default_script.clone())
                .unwrap_or_default();
            state.dispatched.insert(payment_hash, scripted.clone());
            scripted
        };

        if updates.is_empty() {
            // stays in flight until the process goes away
            state.open_streams.push(tx);
        } else {
            for update in updates {
                let _ = tx.try_send(update);
            }
        }
        Ok(rx)
    }

    async fn lookup_invoice(&self, payment_hash: SwapHash) -> Result<InvoiceState> {
        let state = self.inner.lock().unwrap();
        state
            .invoices
            .get(&payment_hash)
            .map(|i| i.state.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown invoice {payment_hash}"))
    }

    async fn settle_invoice(&self, preimage: Preimage) -> Result<()> {
        let payment_hash = preimage.hash();
        let mut state = self.inner.lock().unwrap();
        let invoice = state
            .invoices
            .get_mut(&payment_hash)
            .ok_or_else(|| anyhow::anyhow!("unknown invoice {payment_hash}"))?;
        invoice.state = InvoiceState::Settled {
            preimage,
            amount_paid_sat: invoice.amount_sat,
        };
        Ok(())
    }

    async fn cancel_invoice(&self, payment_hash: SwapHash) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.cancelled.push(payment_hash);
        if let Some(invoice) = state.invoices.get_mut(&payment_hash)
            && !matches!(invoice.state, InvoiceState::Settled { .. })
        {
            invoice.state = InvoiceState::Cancelled;
        }
        Ok(())
    }
}

// -------------------------------------------------------------------- chain

struct ScriptWatch {
    script_pubkey: ScriptBuf,
    sender: mpsc::Sender<ConfirmationEvent>,
}

struct TxWatch {
    txid: Txid,
    sender: mpsc::Sender<ConfirmationEvent>,
}

struct ChainState {
    height: u32,
    fee_rate: u64,
    broadcast_calls: u32,
    broadcasts: Vec<Transaction>,
    script_watches: Vec<ScriptWatch>,
    tx_watches: Vec<TxWatch>,
    block_watches: Vec<mpsc::Sender<u32>>,
}

/// Hand-driven chain backend: tests mine blocks and emit confirmation
/// events explicitly.
pub struct MockChain {
    inner: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(height: u32, fee_rate: u64) -> Self {
        Self {
            inner: Mutex::new(ChainState {
                height,
                fee_rate,
                broadcast_calls: 0,
                broadcasts: Vec::new(),
                script_watches: Vec::new(),
                tx_watches: Vec::new(),
                block_watches: Vec::new(),
            }),
        }
    }

    pub fn set_fee_rate(&self, sat_per_vbyte: u64) {
        self.inner.lock().unwrap().fee_rate = sat_per_vbyte;
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().broadcasts.clone()
    }

    pub fn broadcast_calls(&self) -> u32 {
        self.inner.lock().unwrap().broadcast_calls
    }

    pub async fn mine_block(&self, height: u32) {
        let senders: Vec<_> = {
            let mut state = self.inner.lock().unwrap();
            state.height = height;
            state.block_watches.iter().cloned().collect()
        };
        for sender in senders {
            let _ = sender.send(height).await;
        }
    }

    pub async fn emit_script(&self, script_pubkey: &ScriptBuf, event: ConfirmationEvent) {
        let senders: Vec<_> = {
            let state = self.inner.lock().unwrap();
            state
                .script_watches
                .iter()
                .filter(|w| &w.script_pubkey == script_pubkey)
                .map(|w| w.sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    pub async fn emit_tx(&self, txid: Txid, event: ConfirmationEvent) {
        let senders: Vec<_> = {
            let state = self.inner.lock().unwrap();
            state
                .tx_watches
                .iter()
                .filter(|w| w.txid == txid)
                .map(|w| w.sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    /// Drop the watchers for a txid: its confirmation is final and the
    /// stream ends.
    pub fn close_tx_watch(&self, txid: Txid) {
        self.inner
            .lock()
            .unwrap()
            .tx_watches
            .retain(|w| w.txid != txid);
    }

    pub async fn wait_script_watch(&self, script_pubkey: &ScriptBuf) {
        eventually("script watch", || {
            let state = self.inner.lock().unwrap();
            state
                .script_watches
                .iter()
                .any(|w| &w.script_pubkey == script_pubkey)
                .then_some(())
        })
        .await;
    }

    pub async fn wait_tx_watch(&self, txid: Txid) {
        eventually("tx watch", || {
            let state = self.inner.lock().unwrap();
            state.tx_watches.iter().any(|w| w.txid == txid).then_some(())
        })
        .await;
    }

    pub async fn wait_broadcasts(&self, count: usize) -> Vec<Transaction> {
        eventually("broadcast", || {
            let state = self.inner.lock().unwrap();
            (state.broadcasts.len() >= count).then(|| state.broadcasts.clone())
        })
        .await
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_height(&self) -> Result<u32> {
        Ok(self.inner.lock().unwrap().height)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = tx.compute_txid();
        let mut state = self.inner.lock().unwrap();
        state.broadcast_calls += 1;
        if !state.broadcasts.iter().any(|t| t.compute_txid() == txid) {
            state.broadcasts.push(tx.clone());
        }
        Ok(txid)
    }

    async fn subscribe_confirmations(
        &self,
        target: WatchTarget,
        _min_depth: u32,
    ) -> Result<mpsc::Receiver<ConfirmationEvent>> {
        let (sender, rx) = mpsc::channel(32);
        let mut state = self.inner.lock().unwrap();
        match target {
            WatchTarget::Script { script_pubkey } => state.script_watches.push(ScriptWatch {
                script_pubkey,
                sender,
            }),
            WatchTarget::Transaction { txid } => state.tx_watches.push(TxWatch { txid, sender }),
        }
        Ok(rx)
    }

    async fn subscribe_blocks(&self) -> Result<mpsc::Receiver<u32>> {
        let (sender, rx) = mpsc::channel(32);
        self.inner.lock().unwrap().block_watches.push(sender);
        Ok(rx)
    }

    async fn estimate_fee(&self, _target_blocks: u32) -> Result<u64> {
        Ok(self.inner.lock().unwrap().fee_rate)
    }
}

// ------------------------------------------------------------------- wallet

struct WalletState {
    next_key: u8,
    funded: HashMap<SwapHash, Transaction>,
    fund_calls: u32,
}

/// Deterministic wallet: fresh keys count up from a fixed range, funding is
/// cached per swap hash, signatures are opaque placeholders.
pub struct MockWallet {
    inner: Mutex<WalletState>,
}

impl MockWallet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WalletState {
                next_key: 10,
                funded: HashMap::new(),
                fund_calls: 0,
            }),
        }
    }

    pub fn fund_calls(&self) -> u32 {
        self.inner.lock().unwrap().fund_calls
    }

    /// The key `fresh_pubkey` hands out next.
    pub fn peek_key(&self) -> PublicKey {
        test_key(self.inner.lock().unwrap().next_key)
    }
}

impl Default for MockWallet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FundingWallet for MockWallet {
    async fn fresh_pubkey(&self) -> Result<PublicKey> {
        let mut state = self.inner.lock().unwrap();
        let key = test_key(state.next_key);
        state.next_key += 1;
        Ok(key)
    }

    async fn fresh_refund_script(&self) -> Result<ScriptBuf> {
        Ok(p2wpkh_script(0x77))
    }

    async fn fund_htlc(
        &self,
        swap_hash: SwapHash,
        script_pubkey: &ScriptBuf,
        amount_sat: u64,
        _sat_per_vbyte: u64,
    ) -> Result<Transaction> {
        let mut state = self.inner.lock().unwrap();
        state.fund_calls += 1;
        if let Some(tx) = state.funded.get(&swap_hash) {
            return Ok(tx.clone());
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array(swap_hash.to_byte_array()),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![
                TxOut {
                    value: Amount::from_sat(amount_sat),
                    script_pubkey: script_pubkey.clone(),
                },
                TxOut {
                    value: Amount::from_sat(12_345),
                    script_pubkey: p2wpkh_script(0x66),
                },
            ],
        };
        state.funded.insert(swap_hash, tx.clone());
        Ok(tx)
    }

    async fn sign_spend(
        &self,
        _tx: &Transaction,
        _input_value_sat: u64,
        _witness_script: &ScriptBuf,
        _key: PublicKey,
    ) -> Result<Vec<u8>> {
        Ok(vec![0x30; 72])
    }
}

// ------------------------------------------------------------------- server

#[derive(Clone)]
pub struct MockServerConfig {
    pub out_swap_fee_sat: u64,
    pub out_prepay_sat: u64,
    pub out_miner_fee_sat: u64,
    pub in_swap_fee_sat: u64,
    pub in_miner_fee_sat: u64,
    pub cltv_expiry: u32,
    pub server_key: PublicKey,
    pub loop_in_preimage: Preimage,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            out_swap_fee_sat: 1_000,
            out_prepay_sat: 3_000,
            out_miner_fee_sat: 150,
            in_swap_fee_sat: 1_500,
            in_miner_fee_sat: 120,
            cltv_expiry: 1_120,
            server_key: test_key(3),
            loop_in_preimage: Preimage::new([0x5A; 32]),
        }
    }
}

#[derive(Default)]
struct ServerState {
    new_out_calls: u32,
    new_in_calls: u32,
}

pub struct MockServer {
    cfg: MockServerConfig,
    state: Mutex<ServerState>,
}

impl MockServer {
    pub fn new(cfg: MockServerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(ServerState::default()),
        }
    }

    pub fn server_key(&self) -> PublicKey {
        self.cfg.server_key
    }

    pub fn new_out_calls(&self) -> u32 {
        self.state.lock().unwrap().new_out_calls
    }

    pub fn new_in_calls(&self) -> u32 {
        self.state.lock().unwrap().new_in_calls
    }

    pub fn prepay_hash(&self) -> SwapHash {
        Preimage::new(PREPAY_PREIMAGE).hash()
    }

    pub fn loop_in_preimage(&self) -> Preimage {
        self.cfg.loop_in_preimage
    }

    pub fn loop_in_hash(&self) -> SwapHash {
        self.cfg.loop_in_preimage.hash()
    }
}

#[async_trait]
impl SwapServer for MockServer {
    async fn loop_out_terms(&self) -> Result<LoopOutTerms> {
        Ok(LoopOutTerms {
            min_swap_amount_sat: 10_000,
            max_swap_amount_sat: 10_000_000,
            min_cltv_delta: 40,
            max_cltv_delta: 400,
        })
    }

    async fn loop_out_quote(&self, _amount_sat: u64) -> Result<LoopOutQuote> {
        Ok(LoopOutQuote {
            swap_fee_sat: self.cfg.out_swap_fee_sat,
            prepay_amount_sat: self.cfg.out_prepay_sat,
            miner_fee_sat: self.cfg.out_miner_fee_sat,
            cltv_delta: 120,
        })
    }

    async fn new_loop_out_swap(&self, req: NewLoopOutSwap) -> Result<LoopOutSwapCreated> {
        self.state.lock().unwrap().new_out_calls += 1;
        Ok(LoopOutSwapCreated {
            swap_invoice: build_invoice(
                req.swap_hash,
                req.amount_sat + self.cfg.out_swap_fee_sat,
            ),
            prepay_invoice: build_invoice(self.prepay_hash(), self.cfg.out_prepay_sat),
            sender_key: self.cfg.server_key,
            cltv_expiry: self.cfg.cltv_expiry,
        })
    }

    async fn loop_in_terms(&self) -> Result<LoopInTerms> {
        Ok(LoopInTerms {
            min_swap_amount_sat: 10_000,
            max_swap_amount_sat: 10_000_000,
        })
    }

    async fn loop_in_quote(&self, _amount_sat: u64) -> Result<LoopInQuote> {
        Ok(LoopInQuote {
            swap_fee_sat: self.cfg.in_swap_fee_sat,
            miner_fee_sat: self.cfg.in_miner_fee_sat,
            cltv_delta: 144,
            swap_hash: self.cfg.loop_in_preimage.hash(),
        })
    }

    async fn new_loop_in_swap(&self, _req: NewLoopInSwap) -> Result<LoopInSwapCreated> {
        self.state.lock().unwrap().new_in_calls += 1;
        Ok(LoopInSwapCreated {
            receiver_key: self.cfg.server_key,
            cltv_expiry: self.cfg.cltv_expiry,
        })
    }
}

// -------------------------------------------------------------------- store

struct MemoryRecord {
    contract: Contract,
    events: Vec<StoredEvent>,
    outcome: Option<(SwapOutcome, u64)>,
}

/// In-memory store with the same contract as the sqlite one, plus a switch
/// that makes appends fail to exercise the storage-failure policy.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<SwapHash, MemoryRecord>>,
    fail_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn event_count(&self, swap_hash: SwapHash) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(&swap_hash)
            .map(|r| r.events.len())
            .unwrap_or(0)
    }
}

impl SwapStore for MemoryStore {
    fn put_contract(&self, contract: &Contract) -> Result<(), StoreError> {
        let mut records = self.inner.lock().unwrap();
        if records.contains_key(&contract.swap_hash) {
            return Err(StoreError::DuplicateContract(contract.swap_hash));
        }
        records.insert(
            contract.swap_hash,
            MemoryRecord {
                contract: contract.clone(),
                events: Vec::new(),
                outcome: None,
            },
        );
        Ok(())
    }

    fn append_event(
        &self,
        swap_hash: SwapHash,
        event: &SwapEvent,
        state: &SwapState,
    ) -> Result<u64, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        let mut records = self.inner.lock().unwrap();
        let record = records
            .get_mut(&swap_hash)
            .ok_or(StoreError::UnknownSwap(swap_hash))?;
        if record.outcome.is_some() {
            return Err(StoreError::Terminal(swap_hash));
        }
        let seq = record.events.len() as u64 + 1;
        record.events.push(StoredEvent {
            seq,
            event: event.clone(),
            state: state.clone(),
            recorded_at_unix: now_unix(),
        });
        Ok(seq)
    }

    fn load_all(&self) -> Result<Vec<StoredSwap>, StoreError> {
        let records = self.inner.lock().unwrap();
        let mut out: Vec<StoredSwap> = records
            .values()
            .filter(|r| r.outcome.is_none())
            .map(|r| StoredSwap {
                contract: r.contract.clone(),
                events: r.events.clone(),
            })
            .collect();
        out.sort_by_key(|s| s.contract.created_at_unix);
        Ok(out)
    }

    fn mark_terminal(&self, swap_hash: SwapHash, outcome: SwapOutcome) -> Result<(), StoreError> {
        let mut records = self.inner.lock().unwrap();
        if let Some(record) = records.get_mut(&swap_hash)
            && record.outcome.is_none()
        {
            record.outcome = Some((outcome, now_unix()));
        }
        Ok(())
    }

    fn outcome(&self, swap_hash: SwapHash) -> Result<Option<SwapOutcome>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(&swap_hash)
            .and_then(|r| r.outcome.map(|(outcome, _)| outcome)))
    }

    fn gc_terminal(&self, now_unix: u64, retention_secs: u64) -> Result<usize, StoreError> {
        let cutoff = now_unix.saturating_sub(retention_secs);
        let mut records = self.inner.lock().unwrap();
        let mut collected = 0;
        for record in records.values_mut() {
            if let Some((_, recorded_at)) = record.outcome
                && recorded_at < cutoff
                && !record.events.is_empty()
            {
                // events and contract payload go; the outcome stays
                record.events.clear();
                collected += 1;
            }
        }
        Ok(collected)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
