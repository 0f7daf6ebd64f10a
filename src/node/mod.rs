//! Node composition root
//!
//! Wires the ledger to the network manager: inbound wire events flow into
//! ledger validation, and whatever the ledger accepts is broadcast back out
//! minus the originating peer. Also runs the periodic chain-sync trigger
//! and, when configured as a validator, the block forging loop.

use crate::config::NodeConfig;
use crate::core::{
    Block, BlockAdmission, BlockRejection, DifficultyAdjustment, Ledger, Transaction, TxAdmission,
};
use crate::error::{BlockchainError, Result};
use crate::network::{MessagePayload, NetworkEvent, NetworkManager, PeerInfo};
use crate::utils::{hex_encode, new_key_pair, public_key_from_pkcs8};
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, error, info, warn};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest number of blocks returned for one GET_BLOCKS request; the
/// requester re-issues as its height advances.
const MAX_BLOCKS_PER_RESPONSE: u64 = 500;

pub struct Node {
    config: NodeConfig,
    node_id: String,
    node_key: Vec<u8>,
    ledger: Arc<RwLock<Ledger>>,
    network: Arc<NetworkManager>,
    local_height: Arc<AtomicU64>,
    events: Option<Receiver<NetworkEvent>>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open the ledger and assemble the node. A corrupt persisted chain
    /// fails here, before any socket is opened.
    pub fn new(config: NodeConfig) -> Result<Node> {
        let ledger = Ledger::open(
            &config.data_dir,
            &config.genesis_allocations(),
            config.max_block_transactions,
        )?;
        let local_height = Arc::new(AtomicU64::new(ledger.height()));

        let node_key = load_or_create_key(&config)?;
        let node_id = hex_encode(&public_key_from_pkcs8(&node_key)?);
        info!("Node identity: {node_id}");

        let (event_tx, event_rx) = unbounded();
        let network = Arc::new(NetworkManager::new(
            config.network.clone(),
            node_id.clone(),
            Arc::clone(&local_height),
            event_tx,
        ));

        Ok(Node {
            config,
            node_id,
            node_key,
            ledger: Arc::new(RwLock::new(ledger)),
            network,
            local_height,
            events: Some(event_rx),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        })
    }

    /// Start the network and the dispatch, sync, and forge threads
    pub fn start(&mut self) -> Result<()> {
        Arc::clone(&self.network).start()?;

        let events = self
            .events
            .take()
            .ok_or_else(|| BlockchainError::Network("Node already started".to_string()))?;
        let dispatcher = self.runtime();
        self.handles
            .push(thread::spawn(move || dispatcher.dispatch_loop(events)));

        let syncer = self.runtime();
        let sync_interval = Duration::from_secs(self.config.network.sync_interval_secs);
        self.handles.push(thread::spawn(move || {
            syncer.sync_loop(sync_interval);
        }));

        if self.config.validator.enabled {
            let forger = self.runtime();
            self.handles.push(thread::spawn(move || {
                forger.forge_loop(Duration::from_millis(
                    DifficultyAdjustment::get_target_block_time(),
                ));
            }));
            info!("Validator mode enabled; forging to {}", self.node_id);
        }

        info!("Node started at height {}", self.local_height.load(Ordering::SeqCst));
        Ok(())
    }

    /// Stop background threads and close every peer socket
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.network.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("Node stopped");
    }

    fn runtime(&self) -> NodeRuntime {
        NodeRuntime {
            node_id: self.node_id.clone(),
            node_key: self.node_key.clone(),
            ledger: Arc::clone(&self.ledger),
            network: Arc::clone(&self.network),
            local_height: Arc::clone(&self.local_height),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Submit a locally created transaction: mempool first, then broadcast
    /// to every peer on acceptance.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<TxAdmission> {
        self.runtime().admit_transaction(tx, None)
    }

    /// Forge one block from the mempool immediately, regardless of the
    /// validator tick. Used by the forge loop and by tests.
    pub fn forge_block(&self) -> Result<BlockAdmission> {
        self.runtime().forge_once()
    }

    pub fn height(&self) -> u64 {
        self.local_height.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        self.node_id.as_str()
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.read_ledger(|ledger| ledger.balance(address))
    }

    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        self.read_ledger(|ledger| ledger.block_by_index(index).cloned())
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        self.read_ledger(|ledger| ledger.block_by_hash(hash).cloned())
    }

    pub fn transaction_by_id(&self, id: &str) -> Option<Transaction> {
        self.read_ledger(|ledger| ledger.transaction_by_id(id))
    }

    pub fn transactions_by_address(&self, address: &str) -> Vec<Transaction> {
        self.read_ledger(|ledger| ledger.transactions_by_address(address))
    }

    pub fn mempool_size(&self) -> usize {
        self.read_ledger(|ledger| ledger.mempool_len())
    }

    pub fn peer_count(&self) -> usize {
        self.network.peer_count()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.network.peer_infos()
    }

    fn read_ledger<T>(&self, f: impl FnOnce(&Ledger) -> T) -> T {
        let ledger = self
            .ledger
            .read()
            .expect("Ledger lock poisoned - a writer panicked");
        f(&ledger)
    }
}

/// The cloneable half of the node shared by its background threads
struct NodeRuntime {
    node_id: String,
    node_key: Vec<u8>,
    ledger: Arc<RwLock<Ledger>>,
    network: Arc<NetworkManager>,
    local_height: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl NodeRuntime {
    fn dispatch_loop(&self, events: Receiver<NetworkEvent>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let event = match events.recv_timeout(Duration::from_secs(1)) {
                Ok(event) => event,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            };
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerActivated { peer_id, height } => {
                // A freshly active peer that is ahead of us kick-starts a sync
                if let Some(remote_height) = height {
                    self.request_missing_blocks(&peer_id, remote_height);
                }
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                debug!("Peer {peer_id} disconnected");
            }
            NetworkEvent::BlockReceived { peer_id, block } => {
                self.admit_block(block, Some(&peer_id));
            }
            NetworkEvent::BlocksReceived { peer_id, mut blocks } => {
                // Sync responses apply in index order; anything the ledger
                // rejects is logged there and dropped.
                blocks.sort_by_key(|block| block.get_index());
                for block in blocks {
                    self.admit_synced_block(block, &peer_id);
                }
            }
            NetworkEvent::TransactionReceived {
                peer_id,
                transaction,
            } => {
                if let Err(e) = self.admit_transaction(transaction, Some(&peer_id)) {
                    error!("Failed to admit transaction from {peer_id}: {e}");
                }
            }
            NetworkEvent::BlocksRequested { peer_id, from, to } => {
                self.serve_blocks(&peer_id, from, to);
            }
            NetworkEvent::TransactionsRequested { peer_id } => {
                self.serve_mempool(&peer_id);
            }
        }
    }

    /// Validate and append a gossiped block, rebroadcasting on acceptance
    /// to everyone except its origin. An index ahead of our tip triggers a
    /// catch-up request instead of buffering.
    fn admit_block(&self, block: Block, origin: Option<&str>) {
        let admission = {
            let mut ledger = match self.ledger.write() {
                Ok(ledger) => ledger,
                Err(_) => return,
            };
            match ledger.add_block(block.clone()) {
                Ok(admission) => {
                    self.local_height.store(ledger.height(), Ordering::SeqCst);
                    admission
                }
                Err(e) => {
                    error!("Append aborted: {e}");
                    return;
                }
            }
        };

        match admission {
            BlockAdmission::Appended => {
                self.network.broadcast_block(block, origin);
            }
            BlockAdmission::Rejected(BlockRejection::IndexMismatch { expected, got })
                if got > expected =>
            {
                if let Some(peer_id) = origin {
                    self.request_missing_blocks(peer_id, got);
                }
            }
            BlockAdmission::Rejected(_) => {
                // Already logged with its rule by the ledger
            }
        }
    }

    /// Blocks arriving in a sync batch are appended without rebroadcast;
    /// the tip will be announced by its forger through normal gossip.
    fn admit_synced_block(&self, block: Block, peer_id: &str) {
        let mut ledger = match self.ledger.write() {
            Ok(ledger) => ledger,
            Err(_) => return,
        };
        match ledger.add_block(block) {
            Ok(BlockAdmission::Appended) => {
                self.local_height.store(ledger.height(), Ordering::SeqCst);
            }
            Ok(BlockAdmission::Rejected(_)) => {}
            Err(e) => error!("Append aborted during sync from {peer_id}: {e}"),
        }
    }

    fn admit_transaction(&self, tx: Transaction, origin: Option<&str>) -> Result<TxAdmission> {
        let admission = {
            let mut ledger = self.ledger.write().map_err(|_| {
                BlockchainError::Network("Ledger lock poisoned".to_string())
            })?;
            ledger.add_transaction(tx.clone())
        };
        if admission == TxAdmission::Accepted {
            self.network.broadcast_transaction(tx, origin);
        }
        Ok(admission)
    }

    fn request_missing_blocks(&self, peer_id: &str, remote_height: u64) {
        let local = self.local_height.load(Ordering::SeqCst);
        if remote_height <= local {
            return;
        }
        info!(
            "Requesting blocks {}..{remote_height} from peer {peer_id} (local height {local})",
            local + 1
        );
        if let Err(e) = self.network.send_to(
            peer_id,
            MessagePayload::GetBlocks {
                from: local + 1,
                to: remote_height,
            },
        ) {
            warn!("Failed to request blocks from {peer_id}: {e}");
        }
    }

    fn serve_blocks(&self, peer_id: &str, from: u64, to: u64) {
        let to = to.min(from.saturating_add(MAX_BLOCKS_PER_RESPONSE - 1));
        let blocks = {
            let ledger = match self.ledger.read() {
                Ok(ledger) => ledger,
                Err(_) => return,
            };
            ledger.blocks_in_range(from, to)
        };
        if blocks.is_empty() {
            return;
        }
        debug!("Serving {} block(s) [{from}..{to}] to peer {peer_id}", blocks.len());
        if let Err(e) = self
            .network
            .send_to(peer_id, MessagePayload::Blocks { blocks })
        {
            warn!("Failed to serve blocks to {peer_id}: {e}");
        }
    }

    /// GET_TRANSACTIONS has no batch reply in the protocol; the mempool is
    /// served as one TRANSACTION message per entry.
    fn serve_mempool(&self, peer_id: &str) {
        let pending = {
            let ledger = match self.ledger.read() {
                Ok(ledger) => ledger,
                Err(_) => return,
            };
            ledger.mempool_transactions()
        };
        for transaction in pending {
            if let Err(e) = self
                .network
                .send_to(peer_id, MessagePayload::Transaction { transaction })
            {
                warn!("Failed to serve mempool to {peer_id}: {e}");
                return;
            }
        }
    }

    /// Ask the best peer for anything we are missing
    fn sync_loop(&self, interval: Duration) {
        let ticker = crossbeam_channel::tick(interval);
        loop {
            if ticker.recv().is_err() || self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Some((peer_id, remote_height)) = self.network.best_peer() {
                self.request_missing_blocks(&peer_id, remote_height);
            }
        }
    }

    /// Forge a block from the mempool every target interval
    fn forge_loop(&self, interval: Duration) {
        let ticker = crossbeam_channel::tick(interval);
        loop {
            if ticker.recv().is_err() || self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let pending = self
                .ledger
                .read()
                .map(|ledger| ledger.mempool_len())
                .unwrap_or(0);
            if pending == 0 {
                continue;
            }
            match self.forge_once() {
                Ok(BlockAdmission::Appended) => {}
                Ok(BlockAdmission::Rejected(rejection)) => {
                    warn!("Locally forged block was rejected: {rejection}");
                }
                Err(e) => error!("Forging failed: {e}"),
            }
        }
    }

    fn forge_once(&self) -> Result<BlockAdmission> {
        let block = {
            let ledger = self.ledger.read().map_err(|_| {
                BlockchainError::Network("Ledger lock poisoned".to_string())
            })?;
            ledger.create_block(&self.node_id, Some(&self.node_key))?
        };
        info!(
            "Forged block {} at index {} with {} transaction(s)",
            block.get_hash(),
            block.get_index(),
            block.get_transactions().len()
        );

        let admission = {
            let mut ledger = self.ledger.write().map_err(|_| {
                BlockchainError::Network("Ledger lock poisoned".to_string())
            })?;
            let admission = ledger.add_block(block.clone())?;
            self.local_height.store(ledger.height(), Ordering::SeqCst);
            admission
        };
        if admission == BlockAdmission::Appended {
            self.network.broadcast_block(block, None);
        }
        Ok(admission)
    }
}

/// Read the node's PKCS#8 key, generating and persisting one on first run
fn load_or_create_key(config: &NodeConfig) -> Result<Vec<u8>> {
    let path = config.node_key_path();
    if path.exists() {
        return fs::read(&path).map_err(|e| {
            BlockchainError::Key(format!("Failed to read key file {}: {e}", path.display()))
        });
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let pkcs8 = new_key_pair()?;
    fs::write(&path, &pkcs8).map_err(|e| {
        BlockchainError::Key(format!("Failed to write key file {}: {e}", path.display()))
    })?;
    info!("Generated node key at {}", path.display());
    Ok(pkcs8)
}
