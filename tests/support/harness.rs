use std::sync::Arc;

use bitcoin::Network;

use ln_chain_swap::config::Config;
use ln_chain_swap::swap::store::SwapStore;
use ln_chain_swap::swap::supervisor::{Collaborators, Supervisor};

use super::mocks::{MemoryStore, MockChain, MockLightning, MockServer, MockServerConfig, MockWallet};

pub struct Harness<S> {
    pub supervisor: Supervisor,
    pub lightning: Arc<MockLightning>,
    pub chain: Arc<MockChain>,
    pub wallet: Arc<MockWallet>,
    pub server: Arc<MockServer>,
    pub store: Arc<S>,
}

pub fn test_config() -> Config {
    Config {
        network: Network::Regtest,
        ..Config::default()
    }
}

pub fn harness_with_store<S: SwapStore + 'static>(
    server_cfg: MockServerConfig,
    cfg: Config,
    height: u32,
    fee_rate: u64,
    store: Arc<S>,
) -> Harness<S> {
    let lightning = Arc::new(MockLightning::new());
    let chain = Arc::new(MockChain::new(height, fee_rate));
    let wallet = Arc::new(MockWallet::new());
    let server = Arc::new(MockServer::new(server_cfg));

    let supervisor = Supervisor::new(
        Collaborators {
            lightning: lightning.clone(),
            chain: chain.clone(),
            wallet: wallet.clone(),
            server: server.clone(),
            store: store.clone(),
        },
        cfg,
    );

    Harness {
        supervisor,
        lightning,
        chain,
        wallet,
        server,
        store,
    }
}

pub fn harness(server_cfg: MockServerConfig, cfg: Config) -> Harness<MemoryStore> {
    harness_with_store(server_cfg, cfg, 1_000, 5, Arc::new(MemoryStore::new()))
}
