//! Consensus Node
//!
//! Shares one [`ChainState`] between async tasks. Header submission checks
//! the cheap rules under a read lock, evaluates the proof of work on the
//! blocking pool, then links the header under the write lock. Every tip
//! change is published on a watch channel that `wait_for_*` callers follow.

use crate::consensus::params::{ConsensusParams, DeploymentPos};
use crate::consensus::pow::{ChainType, PowValidator, PrimeChainVerifier};
use crate::consensus::target::CompactTarget;
use crate::consensus::versionbits::{DeploymentStats, ThresholdState};
use crate::core::block::BlockHeader;
use crate::core::chain_state::{
    AcceptOutcome, ChainConnector, ChainState, ChainTip, ChainTxStats, ConsensusError, HeaderInfo,
    NoopConnector, TipInfo,
};
use crate::core::records::PrimeRecord;
use crate::crypto::BlockHash;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Status of one deployment at the active tip
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentInfo {
    pub name: &'static str,
    pub bit: u8,
    pub start_time: i64,
    pub timeout: i64,
    pub state: ThresholdState,
    pub since: u32,
    /// Present while signalling is open
    pub statistics: Option<DeploymentStats>,
}

/// Summary of the chain
#[derive(Debug, Clone, Serialize)]
pub struct ChainInfo {
    pub network: String,
    pub blocks: u32,
    pub headers: u32,
    pub best_block_hash: BlockHash,
    pub difficulty: f64,
    pub median_time: i64,
    pub chain_work: String,
    pub deployments: Vec<DeploymentInfo>,
}

/// Async front of the chain state
pub struct ConsensusNode {
    state: Arc<RwLock<ChainState>>,
    pow: PowValidator,
    tip_tx: watch::Sender<TipInfo>,
    shutdown: CancellationToken,
}

impl ConsensusNode {
    /// Header-only node
    pub fn new(params: Arc<ConsensusParams>, verifier: Arc<dyn PrimeChainVerifier>) -> Self {
        Self::with_connector(params, verifier, Box::new(NoopConnector))
    }

    pub fn with_connector(
        params: Arc<ConsensusParams>,
        verifier: Arc<dyn PrimeChainVerifier>,
        connector: Box<dyn ChainConnector>,
    ) -> Self {
        let pow = PowValidator::new(verifier, params.target_min_length);
        let state = ChainState::with_connector(params, connector);
        let (tip_tx, _) = watch::channel(state.tip());
        Self {
            state: Arc::new(RwLock::new(state)),
            pow,
            tip_tx,
            shutdown: CancellationToken::new(),
        }
    }

    fn publish(&self, state: &ChainState) {
        let tip = state.tip();
        self.tip_tx.send_if_modified(|current| {
            if *current == tip {
                return false;
            }
            *current = tip;
            true
        });
    }

    fn check_running(&self) -> Result<(), ConsensusError> {
        if self.shutdown.is_cancelled() {
            return Err(ConsensusError::ShuttingDown);
        }
        Ok(())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Validate and link a header
    pub async fn submit_header(&self, header: BlockHeader) -> Result<AcceptOutcome, ConsensusError> {
        self.check_running()?;
        self.state.read().await.precheck(&header)?;

        let pow = self.pow.clone();
        let hash = header.pow_hash();
        let bits = header.bits;
        let multiplier = header.prime_chain_multiplier.clone();
        let proof = tokio::task::spawn_blocking(move || pow.verify(&hash, bits, &multiplier))
            .await
            .map_err(|e| ConsensusError::Internal(e.to_string()))?;

        let mut state = self.state.write().await;
        let outcome = state.accept_header(header, proof, chrono::Utc::now().timestamp())?;
        self.publish(&state);
        Ok(outcome)
    }

    /// Decode and submit a serialized header
    pub async fn submit_header_bytes(&self, data: &[u8]) -> Result<AcceptOutcome, ConsensusError> {
        let header = BlockHeader::from_bytes(data)?;
        self.submit_header(header).await
    }

    // =========================================================================
    // Operator controls
    // =========================================================================

    pub async fn invalidate(&self, hash: &BlockHash) -> Result<(), ConsensusError> {
        self.check_running()?;
        let mut state = self.state.write().await;
        state.invalidate(hash)?;
        self.publish(&state);
        Ok(())
    }

    pub async fn reconsider(&self, hash: &BlockHash) -> Result<(), ConsensusError> {
        self.check_running()?;
        let mut state = self.state.write().await;
        state.reconsider(hash)?;
        self.publish(&state);
        Ok(())
    }

    pub async fn mark_precious(&self, hash: &BlockHash) -> Result<(), ConsensusError> {
        self.check_running()?;
        let mut state = self.state.write().await;
        state.mark_precious(hash)?;
        self.publish(&state);
        Ok(())
    }

    pub async fn record_block_data(&self, hash: &BlockHash, tx_count: u32, size: u64) -> Result<bool, ConsensusError> {
        self.check_running()?;
        let mut state = self.state.write().await;
        let changed = state.record_block_data(hash, tx_count, size)?;
        self.publish(&state);
        Ok(changed)
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Wait until `done` holds for the tip, the timeout elapses (0 waits
    /// forever) or the node shuts down. Returns the tip at that moment.
    async fn wait_until(&self, timeout_ms: u64, done: impl Fn(&TipInfo) -> bool) -> TipInfo {
        let mut rx = self.tip_tx.subscribe();
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            {
                let tip = rx.borrow_and_update();
                if done(&tip) {
                    return tip.clone();
                }
            }
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = expired => break,
                _ = self.shutdown.cancelled() => break,
            }
        }
        let tip = rx.borrow().clone();
        tip
    }

    /// Wait for the active tip to change
    pub async fn wait_for_new_tip(&self, timeout_ms: u64) -> TipInfo {
        let current = self.tip_tx.borrow().hash;
        self.wait_until(timeout_ms, |tip| tip.hash != current).await
    }

    /// Wait for `hash` to become the active tip
    pub async fn wait_for_block(&self, hash: BlockHash, timeout_ms: u64) -> TipInfo {
        self.wait_until(timeout_ms, |tip| tip.hash == hash).await
    }

    /// Wait for the active chain to reach `height`
    pub async fn wait_for_height(&self, height: u32, timeout_ms: u64) -> TipInfo {
        self.wait_until(timeout_ms, |tip| tip.height >= height).await
    }

    /// Release every waiter and refuse further changes
    pub fn shutdown(&self) {
        log::info!("Consensus node shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn best_tip(&self) -> TipInfo {
        self.state.read().await.tip()
    }

    pub async fn header_by_hash(&self, hash: &BlockHash) -> Result<HeaderInfo, ConsensusError> {
        self.state
            .read()
            .await
            .header_info(hash)
            .ok_or(ConsensusError::BlockNotFound(*hash))
    }

    pub async fn ancestor_at_height(&self, hash: &BlockHash, height: u32) -> Result<BlockHash, ConsensusError> {
        self.state.read().await.ancestor_at_height(hash, height)
    }

    /// Active block at `height`
    pub async fn block_hash(&self, height: u32) -> Result<BlockHash, ConsensusError> {
        self.state
            .read()
            .await
            .active_hash(height)
            .ok_or_else(|| ConsensusError::InvalidParameter(format!("height {} out of range", height)))
    }

    pub async fn chain_tips(&self) -> Vec<ChainTip> {
        self.state.read().await.chain_tips()
    }

    pub async fn difficulty_of(&self, hash: Option<&BlockHash>) -> Result<f64, ConsensusError> {
        self.state.read().await.difficulty_of(hash)
    }

    pub async fn next_target(&self) -> Result<CompactTarget, ConsensusError> {
        self.state.read().await.next_target(None)
    }

    pub async fn chain_tx_stats(&self, window: Option<u32>, hash: Option<&BlockHash>) -> Result<ChainTxStats, ConsensusError> {
        self.state.read().await.chain_tx_stats(window, hash)
    }

    pub async fn prime_records(&self, length: u32, chain_type: Option<ChainType>) -> Result<Vec<PrimeRecord>, ConsensusError> {
        self.state.read().await.prime_records(length, chain_type)
    }

    pub async fn top_primes(&self, length: u32, chain_type: Option<ChainType>) -> Result<Vec<PrimeRecord>, ConsensusError> {
        self.state.read().await.top_primes(length, chain_type)
    }

    pub async fn version_bits_state(&self, name: &str, hash: Option<&BlockHash>) -> Result<ThresholdState, ConsensusError> {
        self.state.write().await.version_bits_state(name, hash)
    }

    pub async fn version_bits_since(&self, name: &str, hash: Option<&BlockHash>) -> Result<u32, ConsensusError> {
        self.state.write().await.version_bits_since(name, hash)
    }

    /// `None` unless the deployment is `Started`
    pub async fn version_bits_statistics(
        &self,
        name: &str,
        hash: Option<&BlockHash>,
    ) -> Result<Option<DeploymentStats>, ConsensusError> {
        self.state.write().await.version_bits_statistics(name, hash)
    }

    pub async fn compute_block_version(&self) -> i32 {
        self.state.write().await.compute_block_version()
    }

    /// Status of every enabled deployment at the tip
    pub async fn deployments(&self) -> Result<Vec<DeploymentInfo>, ConsensusError> {
        let mut state = self.state.write().await;
        deployments(&mut state)
    }

    pub async fn chain_info(&self) -> Result<ChainInfo, ConsensusError> {
        let mut state = self.state.write().await;
        let tip = state.tip();
        let info = state
            .header_info(&tip.hash)
            .ok_or(ConsensusError::BlockNotFound(tip.hash))?;
        Ok(ChainInfo {
            network: state.params().network.to_string(),
            blocks: tip.height,
            headers: state.best_header().height,
            best_block_hash: tip.hash,
            difficulty: info.difficulty,
            median_time: info.median_time,
            chain_work: info.chain_work,
            deployments: deployments(&mut state)?,
        })
    }
}

fn deployments(state: &mut ChainState) -> Result<Vec<DeploymentInfo>, ConsensusError> {
    let enabled: Vec<(DeploymentPos, u8, i64, i64)> = state
        .params()
        .active_deployments()
        .map(|(pos, d)| (pos, d.bit, d.start_time, d.timeout))
        .collect();
    let mut result = Vec::with_capacity(enabled.len());
    for (pos, bit, start_time, timeout) in enabled {
        let name = pos.name();
        let threshold_state = state.version_bits_state(name, None)?;
        let statistics = state.version_bits_statistics(name, None)?;
        result.push(DeploymentInfo {
            name,
            bit,
            start_time,
            timeout,
            state: threshold_state,
            since: state.version_bits_since(name, None)?,
            statistics,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::NetworkKind;
    use crate::consensus::pow::tests::FixedVerifier;
    use num_bigint::BigUint;

    fn node() -> (ConsensusNode, ConsensusParams) {
        let params = ConsensusParams::for_network(NetworkKind::Regtest).unwrap();
        let verifier = Arc::new(FixedVerifier::new(CompactTarget::from_length(1)));
        (ConsensusNode::new(Arc::new(params.clone()), verifier), params)
    }

    /// Next header on `parent` whose proof-of-work hash has its top bit set
    fn mine(parent: &BlockHeader, salt: u32) -> BlockHeader {
        let mut header = BlockHeader {
            version: 2,
            prev_block: parent.hash(),
            merkle_root: BlockHash::of(&salt.to_le_bytes()),
            time: parent.time + 60,
            bits: parent.bits,
            nonce: 0,
            prime_chain_multiplier: BigUint::from(3u32),
        };
        while header.pow_hash().to_biguint().bits() < 256 {
            header.nonce += 1;
        }
        header
    }

    #[tokio::test]
    async fn test_submit_header_extends_chain() {
        let (node, params) = node();
        let first = mine(&params.genesis, 1);
        let outcome = node.submit_header(first.clone()).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Linked { height: 1, activated: true, .. }));
        assert_eq!(node.best_tip().await.hash, first.hash());

        let info = node.header_by_hash(&first.hash()).await.unwrap();
        assert_eq!(info.prime_chain.as_deref(), Some("1CC01.000000"));
        assert_eq!(
            node.submit_header(first.clone()).await,
            Err(ConsensusError::Duplicate(first.hash()))
        );

        let encoded = mine(&first, 2).to_bytes();
        assert!(matches!(
            node.submit_header_bytes(&encoded).await,
            Ok(AcceptOutcome::Linked { height: 2, .. })
        ));
        assert!(matches!(
            node.submit_header_bytes(&encoded[..40]).await,
            Err(ConsensusError::MalformedHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_new_tip() {
        let (node, params) = node();
        let node = Arc::new(node);
        let header = mine(&params.genesis, 1);
        let expected = header.hash();

        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.wait_for_new_tip(0).await })
        };
        tokio::task::yield_now().await;
        node.submit_header(header).await.unwrap();
        let tip = waiter.await.unwrap();
        assert_eq!(tip.hash, expected);
        assert_eq!(tip.height, 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_current_tip() {
        let (node, params) = node();
        let tip = node.wait_for_new_tip(20).await;
        assert_eq!(tip.hash, params.genesis_hash);
        let tip = node.wait_for_height(5, 20).await;
        assert_eq!(tip.height, 0);
        // Already satisfied
        let tip = node.wait_for_block(params.genesis_hash, 0).await;
        assert_eq!(tip.height, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let (node, params) = node();
        let node = Arc::new(node);
        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.wait_for_height(10, 0).await })
        };
        tokio::task::yield_now().await;
        node.shutdown();
        let tip = waiter.await.unwrap();
        assert_eq!(tip.height, 0);
        assert!(node.is_shutdown());
        assert_eq!(
            node.submit_header(mine(&params.genesis, 1)).await,
            Err(ConsensusError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn test_admin_operations_publish_tip() {
        let (node, params) = node();
        let a = mine(&params.genesis, 1);
        let b = mine(&a, 2);
        node.submit_header(a.clone()).await.unwrap();
        node.submit_header(b.clone()).await.unwrap();

        node.invalidate(&b.hash()).await.unwrap();
        assert_eq!(node.wait_for_block(a.hash(), 100).await.hash, a.hash());
        node.reconsider(&b.hash()).await.unwrap();
        assert_eq!(node.best_tip().await.hash, b.hash());
        assert_eq!(node.block_hash(1).await.unwrap(), a.hash());
        assert_eq!(node.ancestor_at_height(&b.hash(), 0).await.unwrap(), params.genesis_hash);
        assert_eq!(node.chain_tips().await.len(), 1);
    }

    #[tokio::test]
    async fn test_chain_info() {
        let (node, _) = node();
        let info = node.chain_info().await.unwrap();
        assert_eq!(info.network, "regtest");
        assert_eq!(info.blocks, 0);
        assert_eq!(info.headers, 0);
        let names: Vec<&str> = info.deployments.iter().map(|d| d.name).collect();
        assert!(names.contains(&"csv"));
        assert!(info.deployments.iter().all(|d| d.state == ThresholdState::Defined));
        assert!(info.deployments.iter().all(|d| d.statistics.is_none()));
        assert_eq!(node.version_bits_statistics("csv", None).await.unwrap(), None);
        assert_eq!(node.compute_block_version().await, 0x2000_0000);
    }
}
