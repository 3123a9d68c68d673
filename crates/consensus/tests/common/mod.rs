//! Shared fixtures for engine tests.

use ed25519_dalek::SigningKey;
use palisade_consensus::{ConsensusConfig, PeerManager};
use palisade_core::EngineError;
use palisade_types::{
    Address, ConsensusParams, EpochInfo, Hash, NetworkMessage, ValidatorInfo, ValidatorSet,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every outbound message and reports a configurable number of
/// connected peers.
pub struct MockNetwork {
    pub connected: u64,
    pub broadcasts: Mutex<Vec<NetworkMessage>>,
}

impl MockNetwork {
    pub fn new(connected: u64) -> Arc<Self> {
        Arc::new(Self {
            connected,
            broadcasts: Mutex::new(Vec::new()),
        })
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }
}

impl PeerManager for MockNetwork {
    fn broadcast(&self, msg: NetworkMessage) -> Result<(), EngineError> {
        self.broadcasts.lock().unwrap().push(msg);
        Ok(())
    }

    fn unicast(&self, _to: u64, msg: NetworkMessage) -> Result<(), EngineError> {
        self.broadcasts.lock().unwrap().push(msg);
        Ok(())
    }

    fn count_connected_peers(&self) -> u64 {
        self.connected
    }
}

pub fn validator_set(own_key: &SigningKey, total: u64) -> ValidatorSet {
    let mut validators = vec![ValidatorInfo {
        id: 0,
        account: Address::from_public_key(&own_key.verifying_key().to_bytes()),
        public_key: own_key.verifying_key().to_bytes(),
    }];
    for id in 1..total {
        validators.push(ValidatorInfo {
            id,
            account: Address::ZERO,
            public_key: [id as u8; 32],
        });
    }
    ValidatorSet::new(validators)
}

pub struct ConfigBuilder {
    pub epoch: EpochInfo,
    pub batch_timeout: Duration,
    pub no_tx_batch_timeout: Duration,
    pub pool_size: usize,
    pub enable_locals_persist: bool,
    pub rotate_interval: Duration,
    pub validators: u64,
    pub connected_peers: u64,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            epoch: EpochInfo {
                epoch: 1,
                start_block: 1,
                epoch_period: 1_000,
                consensus_params: ConsensusParams {
                    checkpoint_period: 2,
                    block_max_tx_num: 10,
                    enable_timed_gen_empty_block: false,
                },
            },
            batch_timeout: Duration::from_millis(100),
            no_tx_batch_timeout: Duration::from_millis(200),
            pool_size: 50_000,
            enable_locals_persist: false,
            rotate_interval: Duration::from_secs(3600),
            validators: 1,
            connected_peers: 0,
        }
    }
}

impl ConfigBuilder {
    pub fn build(self, repo_root: &Path) -> (ConsensusConfig, Arc<MockNetwork>) {
        let signing_key = SigningKey::from_bytes(&[42; 32]);
        let network = MockNetwork::new(self.connected_peers);
        let epoch = self.epoch.clone();
        let config = ConsensusConfig {
            chain_id: 1,
            validators: validator_set(&signing_key, self.validators),
            signing_key,
            pool: palisade_txpool::PoolConfig {
                pool_size: self.pool_size,
                enable_locals_persist: self.enable_locals_persist,
                rotate_tx_locals_interval: self.rotate_interval,
                repo_root: repo_root.to_path_buf(),
                ..palisade_txpool::PoolConfig::default()
            },
            batch_timeout: self.batch_timeout,
            no_tx_batch_timeout: self.no_tx_batch_timeout,
            prepare_timeout: Duration::from_secs(5),
            applied_height: 0,
            applied_digest: Hash::ZERO,
            network: network.clone(),
            get_current_epoch: Arc::new(move || Ok(epoch.clone())),
            get_account_nonce: Arc::new(|_| 0),
        };
        (config, network)
    }
}
