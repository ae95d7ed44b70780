use bitcoin::secp256k1::{Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

use ln_chain_swap::swap::SwapHash;

/// Sign regtest invoices with a fixed node key; only the payment hash and
/// amount matter to the client under test.
pub fn build_invoice(payment_hash: SwapHash, amount_sat: u64) -> String {
    let secp = Secp256k1::new();
    let node_key = SecretKey::from_slice(&[41u8; 32]).expect("static key");

    InvoiceBuilder::new(Currency::Regtest)
        .description("swap".into())
        .payment_hash(payment_hash.0)
        .payment_secret(PaymentSecret([42u8; 32]))
        .amount_milli_satoshis(amount_sat * 1000)
        .current_timestamp()
        .min_final_cltv_expiry_delta(80)
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &node_key))
        .expect("build invoice")
        .to_string()
}
