#![allow(dead_code)]

pub mod harness;
pub mod invoices;
pub mod mocks;

use std::time::Duration;

use bitcoin::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::script::Builder;
use bitcoin::{Address, Network, ScriptBuf};
use tokio::sync::broadcast;

use ln_chain_swap::swap::SwapStatus;

/// How long a test will wait for the swap machinery before giving up.
const WAIT_BUDGET: Duration = Duration::from_secs(10);

/// Probe cadence, comfortably inside the executor's invoice poll interval.
const PROBE_INTERVAL: Duration = Duration::from_millis(25);

/// A throwaway P2WPKH destination for sweeps and refunds.
pub fn p2wpkh_script(byte: u8) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_PUSHBYTES_0)
        .push_slice([byte; 20])
        .into_script()
}

pub fn p2wpkh_address(byte: u8, network: Network) -> Address {
    Address::from_script(&p2wpkh_script(byte), network).expect("valid p2wpkh script")
}

/// Re-run a synchronous probe at the test cadence until it yields a value.
/// Swap progress is asynchronous but all observable side effects (store
/// rows, mock registries, broadcast logs) are plain state, so probes stay
/// non-async and infallible.
pub async fn eventually<T>(what: &str, mut probe: impl FnMut() -> Option<T>) -> T {
    tokio::time::timeout(WAIT_BUDGET, async {
        let mut tick = tokio::time::interval(PROBE_INTERVAL);
        loop {
            tick.tick().await;
            if let Some(value) = probe() {
                return value;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("gave up waiting for {what}"))
}

/// Wait until the status stream reports the wanted phase, returning that
/// record.
pub async fn await_phase(rx: &mut broadcast::Receiver<SwapStatus>, want: &str) -> SwapStatus {
    tokio::time::timeout(WAIT_BUDGET, async {
        loop {
            match rx.recv().await {
                Ok(status) if status.phase.label() == want => return status,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("status stream closed while waiting for {want}")
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for phase {want}"))
}
