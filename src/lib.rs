//! Client core for atomic submarine swaps between an off-chain Lightning
//! balance and an on-chain wallet.
//!
//! The crate sequences and reacts: the swap state machine lives in
//! [`swap::kernel`], one [`swap::executor`] drives each swap through the
//! injected Lightning/chain/server collaborators, and the
//! [`swap::supervisor::Supervisor`] owns the executor population for the
//! lifetime of the process. Chain access, Lightning access, the swap server
//! wire transport and key handling are all behind the collaborator traits in
//! [`chain`], [`lightning`] and [`server`].

pub mod chain;
pub mod config;
pub mod errors;
pub mod lightning;
pub mod logging;
pub mod server;
pub mod swap;
