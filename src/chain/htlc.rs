use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, hash160, sha256};
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160, OP_IF,
    OP_PUSHBYTES_0, OP_SHA256, OP_SIZE,
};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};

use crate::swap::{Preimage, SwapHash};

/// Virtual size budgeted for a sweep (success-path spend, one input, one
/// output). Fees are `rate * vsize`.
pub const SWEEP_TX_VSIZE: u64 = 160;

/// Virtual size budgeted for a refund (timeout-path spend).
pub const REFUND_TX_VSIZE: u64 = 155;

const DUST_LIMIT_SAT: u64 = 546;

/// Htlc parameters. Derivation is deterministic: the same inputs always
/// yield the same script bytes and addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Htlc {
    pub sender_key: PublicKey,
    pub receiver_key: PublicKey,
    pub swap_hash: SwapHash,
    pub cltv_expiry: u32,
}

impl Htlc {
    pub fn new(
        sender_key: PublicKey,
        receiver_key: PublicKey,
        swap_hash: SwapHash,
        cltv_expiry: u32,
    ) -> Self {
        Self {
            sender_key,
            receiver_key,
            swap_hash,
            cltv_expiry,
        }
    }

    /// Success path: `(receiver_sig, preimage)`. Refund path:
    /// `(sender_sig)` once the chain passes `cltv_expiry`.
    pub fn witness_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_SHA256)
            .push_slice(self.swap_hash.to_byte_array())
            .push_opcode(OP_EQUALVERIFY)
            .push_slice(self.receiver_key.serialize())
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(i64::from(self.cltv_expiry))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_slice(self.sender_key.serialize())
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// Native segwit (P2WSH) output script.
    pub fn script_pubkey(&self) -> ScriptBuf {
        let script_hash = sha256::Hash::hash(self.witness_script().as_bytes());
        Builder::new()
            .push_opcode(OP_PUSHBYTES_0)
            .push_slice(script_hash.to_byte_array())
            .into_script()
    }

    /// Nested segwit (P2SH-wrapped P2WSH) output script, accepted for loop
    /// in htlcs under `NativeSegwitIn`.
    pub fn np2wsh_script_pubkey(&self) -> ScriptBuf {
        let redeem_hash = hash160::Hash::hash(self.script_pubkey().as_bytes());
        Builder::new()
            .push_opcode(OP_HASH160)
            .push_slice(redeem_hash.to_byte_array())
            .push_opcode(OP_EQUAL)
            .into_script()
    }

    pub fn p2wsh_address(&self, network: Network) -> Result<Address> {
        Address::from_script(&self.script_pubkey(), network).context("derive p2wsh address")
    }

    pub fn np2wsh_address(&self, network: Network) -> Result<Address> {
        Address::from_script(&self.np2wsh_script_pubkey(), network)
            .context("derive np2wsh address")
    }

    /// Unsigned success-path spend of the htlc output.
    pub fn sweep_tx(
        &self,
        htlc_outpoint: OutPoint,
        htlc_value_sat: u64,
        dest_script: ScriptBuf,
        sat_per_vbyte: u64,
    ) -> Result<Transaction> {
        let fee_sat = sweep_fee_sat(sat_per_vbyte);
        let output_value = htlc_value_sat
            .checked_sub(fee_sat)
            .context("sweep fee exceeds htlc value")?;
        anyhow::ensure!(output_value >= DUST_LIMIT_SAT, "sweep output below dust");

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: htlc_outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(output_value),
                script_pubkey: dest_script,
            }],
        })
    }

    /// Unsigned timeout-path spend. Locktime is pinned to `cltv_expiry`;
    /// `nested` selects the NP2WSH variant, which additionally needs the
    /// redeem script in its script_sig.
    pub fn refund_tx(
        &self,
        htlc_outpoint: OutPoint,
        htlc_value_sat: u64,
        dest_script: ScriptBuf,
        sat_per_vbyte: u64,
        nested: bool,
    ) -> Result<Transaction> {
        let fee_sat = refund_fee_sat(sat_per_vbyte);
        let output_value = htlc_value_sat
            .checked_sub(fee_sat)
            .context("refund fee exceeds htlc value")?;
        anyhow::ensure!(output_value >= DUST_LIMIT_SAT, "refund output below dust");

        let script_sig = if nested {
            let redeem = PushBytesBuf::try_from(self.script_pubkey().to_bytes())
                .context("redeem script too long for script_sig push")?;
            Builder::new().push_slice(redeem).into_script()
        } else {
            ScriptBuf::new()
        };

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_height(self.cltv_expiry)
                .context("cltv_expiry is not a valid locktime height")?,
            input: vec![TxIn {
                previous_output: htlc_outpoint,
                script_sig,
                // locktime is only enforced on non-final sequences
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(output_value),
                script_pubkey: dest_script,
            }],
        })
    }

    /// Attach the success-path witness: `[sig, preimage, witness_script]`.
    pub fn finalize_sweep(&self, tx: &mut Transaction, signature: Vec<u8>, preimage: &Preimage) {
        let mut witness = Witness::new();
        witness.push(signature);
        witness.push(preimage.as_bytes());
        witness.push(self.witness_script().as_bytes());
        tx.input[0].witness = witness;
    }

    /// Attach the timeout-path witness: `[sig, <>, witness_script]`. The
    /// empty element fails the size check and selects the refund branch.
    pub fn finalize_refund(&self, tx: &mut Transaction, signature: Vec<u8>) {
        let mut witness = Witness::new();
        witness.push(signature);
        witness.push([]);
        witness.push(self.witness_script().as_bytes());
        tx.input[0].witness = witness;
    }

    /// Parse a witness script of the expected shape back into parameters.
    pub fn parse_witness_script(witness_script: &Script) -> Result<Self> {
        let mut iter = witness_script.instructions_minimal();

        expect_op(next_instruction(&mut iter)?, OP_SIZE)?;
        let size = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(size == 32, "unexpected preimage size check: {size}");
        expect_op(next_instruction(&mut iter)?, OP_EQUAL)?;
        expect_op(next_instruction(&mut iter)?, OP_IF)?;

        expect_op(next_instruction(&mut iter)?, OP_SHA256)?;
        let swap_hash = expect_push::<32>(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, OP_EQUALVERIFY)?;
        let receiver_key = expect_push::<33>(next_instruction(&mut iter)?)?;

        expect_op(next_instruction(&mut iter)?, OP_ELSE)?;
        expect_op(next_instruction(&mut iter)?, OP_DROP)?;
        let cltv_expiry = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(
            cltv_expiry >= 0 && cltv_expiry <= i64::from(u32::MAX),
            "cltv_expiry out of range: {cltv_expiry}"
        );
        expect_op(next_instruction(&mut iter)?, OP_CLTV)?;
        expect_op(next_instruction(&mut iter)?, OP_DROP)?;
        let sender_key = expect_push::<33>(next_instruction(&mut iter)?)?;

        expect_op(next_instruction(&mut iter)?, OP_ENDIF)?;
        expect_op(next_instruction(&mut iter)?, OP_CHECKSIG)?;
        anyhow::ensure!(
            iter.next().is_none(),
            "unexpected trailing instructions in witness script"
        );

        Ok(Self {
            sender_key: PublicKey::from_slice(&sender_key).context("parse sender key")?,
            receiver_key: PublicKey::from_slice(&receiver_key).context("parse receiver key")?,
            swap_hash: SwapHash::from_bytes(swap_hash),
            cltv_expiry: cltv_expiry as u32,
        })
    }
}

pub fn sweep_fee_sat(sat_per_vbyte: u64) -> u64 {
    sat_per_vbyte * SWEEP_TX_VSIZE
}

pub fn refund_fee_sat(sat_per_vbyte: u64) -> u64 {
    sat_per_vbyte * REFUND_TX_VSIZE
}

type InstructionResult<'a> = std::result::Result<Instruction<'a>, bitcoin::script::Error>;

fn next_instruction<'a>(iter: &mut impl Iterator<Item = InstructionResult<'a>>) -> Result<Instruction<'a>> {
    iter.next()
        .transpose()
        .map_err(|e| anyhow::anyhow!("decode witness script instruction: {e:?}"))?
        .context("unexpected end of witness script")
}

fn expect_op(actual: Instruction<'_>, expected: bitcoin::Opcode) -> Result<()> {
    match actual {
        Instruction::Op(op) if op == expected => Ok(()),
        other => {
            anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}")
        }
    }
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes.as_bytes());
            Ok(out)
        }
        other => {
            anyhow::bail!("unexpected instruction: expected push of {N} bytes, got {other:?}")
        }
    }
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    use bitcoin::opcodes::all::{OP_PUSHNUM_1, OP_PUSHNUM_16, OP_PUSHNUM_NEG1};

    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
        Instruction::Op(op) => {
            let code = op.to_u8();
            if code == OP_PUSHNUM_NEG1.to_u8() {
                return Ok(-1);
            }

            let one = OP_PUSHNUM_1.to_u8();
            let sixteen = OP_PUSHNUM_16.to_u8();
            if (one..=sixteen).contains(&code) {
                return Ok(i64::from(code - one + 1));
            }

            anyhow::bail!("unexpected opcode where script number expected: {op:?}");
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        anyhow::bail!("script number too large: {} bytes", bytes.len());
    }

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }

    Ok(if negative { -value } else { value })
}
