// The ledger is the single authority over chain state: every mutation goes
// through validation here, and the balance index is always derivable by
// replaying the chain from genesis. Callers serialize access (the node holds
// the ledger behind one RwLock); nothing in this module spawns or locks.

use crate::core::{Block, DifficultyAdjustment, Transaction};
use crate::core::monetary::block_reward;
use crate::error::{BlockchainError, Result};
use crate::storage::{ChainStore, Mempool};
use log::{info, warn};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// One entry of the genesis initial distribution
#[derive(Debug, Clone)]
pub struct GenesisAllocation {
    pub address: String,
    pub amount: u64,
}

/// Outcome of validating a single transaction. Invalidity is a normal
/// outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxVerdict {
    Valid,
    InvalidSignature,
    InsufficientBalance { required: u64, available: u64 },
}

impl fmt::Display for TxVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxVerdict::Valid => write!(f, "valid"),
            TxVerdict::InvalidSignature => write!(f, "invalid signature"),
            TxVerdict::InsufficientBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient balance: required {required}, available {available}"
            ),
        }
    }
}

/// Outcome of submitting a transaction to the mempool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxAdmission {
    /// Newly accepted; worth rebroadcasting
    Accepted,
    /// Same id already pending; a no-op success
    AlreadyKnown,
    Rejected(TxVerdict),
}

/// Reason a block failed validation, in rule order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRejection {
    IndexMismatch { expected: u64, got: u64 },
    PrevHashMismatch,
    HashMismatch,
    MerkleRootMismatch,
    InvalidTransaction { index: usize, verdict: TxVerdict },
    InvalidValidatorSignature,
}

impl fmt::Display for BlockRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRejection::IndexMismatch { expected, got } => {
                write!(f, "index mismatch: expected {expected}, got {got}")
            }
            BlockRejection::PrevHashMismatch => write!(f, "previousHash mismatch"),
            BlockRejection::HashMismatch => write!(f, "hash mismatch"),
            BlockRejection::MerkleRootMismatch => write!(f, "merkle root mismatch"),
            BlockRejection::InvalidTransaction { index, verdict } => {
                write!(f, "invalid transaction at index {index}: {verdict}")
            }
            BlockRejection::InvalidValidatorSignature => write!(f, "invalid validator signature"),
        }
    }
}

/// Outcome of offering a block for appending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockAdmission {
    Appended,
    Rejected(BlockRejection),
}

#[derive(Debug)]
pub struct Ledger {
    chain: Vec<Block>,
    index_by_hash: HashMap<String, u64>,
    balances: HashMap<String, u64>,
    total_supply: u64,
    mempool: Mempool,
    store: ChainStore,
    max_block_transactions: usize,
}

impl Ledger {
    /// Open the ledger at `data_dir`. Replays any persisted chain, rebuilding
    /// the balance index from scratch; otherwise synthesizes and persists a
    /// genesis block carrying the configured initial distribution. Malformed
    /// or internally inconsistent persisted data is a fatal Storage error.
    pub fn open(
        data_dir: &Path,
        genesis_allocations: &[GenesisAllocation],
        max_block_transactions: usize,
    ) -> Result<Ledger> {
        let store = ChainStore::open(data_dir)?;
        let blocks = store.load_blocks()?;

        let mut ledger = Ledger {
            chain: Vec::new(),
            index_by_hash: HashMap::new(),
            balances: HashMap::new(),
            total_supply: 0,
            mempool: Mempool::new(),
            store,
            max_block_transactions,
        };

        if blocks.is_empty() {
            let mut distribution = Vec::with_capacity(genesis_allocations.len());
            for allocation in genesis_allocations {
                distribution.push(Transaction::new_coinbase(
                    allocation.address.clone(),
                    allocation.amount,
                )?);
            }
            let genesis = Block::generate_genesis_block(
                distribution,
                DifficultyAdjustment::get_initial_difficulty(),
            )?;
            info!(
                "Creating genesis block {} with {} allocation(s)",
                genesis.get_hash(),
                genesis.get_transactions().len()
            );
            ledger.store.append_block(&genesis)?;
            ledger.admit(genesis);
        } else {
            for block in blocks {
                let prev = ledger.chain.last();
                if let Err(rejection) =
                    Self::validate_block_against(&ledger.balances, &block, prev)
                {
                    return Err(BlockchainError::Storage(format!(
                        "Persisted chain is inconsistent at index {}: {rejection}",
                        block.get_index()
                    )));
                }
                ledger.admit(block);
            }
            info!(
                "Replayed chain to height {} ({} address(es) hold a balance)",
                ledger.height(),
                ledger.balances.len()
            );
        }

        Ok(ledger)
    }

    /// Append `block` to in-memory state. The block must already be
    /// validated (and persisted, when it is new).
    fn admit(&mut self, block: Block) {
        Self::apply_block_to(&mut self.balances, &mut self.total_supply, &block);
        for tx in block.get_transactions() {
            self.mempool.remove(tx.get_id());
        }
        self.index_by_hash
            .insert(block.get_hash().to_string(), block.get_index());
        self.chain.push(block);
    }

    /// Validate a transaction against the confirmed balance index. Pending
    /// mempool debits are deliberately not considered.
    pub fn validate_transaction(&self, tx: &Transaction) -> TxVerdict {
        Self::validate_transaction_against(&self.balances, tx)
    }

    fn validate_transaction_against(
        balances: &HashMap<String, u64>,
        tx: &Transaction,
    ) -> TxVerdict {
        let sender = match tx.get_sender() {
            Some(sender) => sender,
            None => return TxVerdict::Valid,
        };
        if !tx.verify_signature() {
            return TxVerdict::InvalidSignature;
        }
        let available = balances.get(sender).copied().unwrap_or(0);
        let required = tx.total_cost();
        if available < required {
            return TxVerdict::InsufficientBalance {
                required,
                available,
            };
        }
        TxVerdict::Valid
    }

    /// Submit a transaction to the mempool. Idempotent on id; rejection
    /// leaves the pool untouched and names the failed rule.
    pub fn add_transaction(&mut self, tx: Transaction) -> TxAdmission {
        if self.mempool.contains(tx.get_id()) {
            return TxAdmission::AlreadyKnown;
        }
        match self.validate_transaction(&tx) {
            TxVerdict::Valid => {
                info!("Accepted transaction {} into mempool", tx.get_id());
                self.mempool.insert(tx);
                TxAdmission::Accepted
            }
            verdict => {
                warn!("Rejected transaction {}: {verdict}", tx.get_id());
                TxAdmission::Rejected(verdict)
            }
        }
    }

    /// Validate a candidate block against its predecessor and the current
    /// balance index, in rule order, short-circuiting on the first failure.
    pub fn validate_block(
        &self,
        block: &Block,
        prev: Option<&Block>,
    ) -> std::result::Result<(), BlockRejection> {
        Self::validate_block_against(&self.balances, block, prev)
    }

    fn validate_block_against(
        balances: &HashMap<String, u64>,
        block: &Block,
        prev: Option<&Block>,
    ) -> std::result::Result<(), BlockRejection> {
        // Genesis is exempt from linkage checks
        if let Some(prev) = prev {
            if block.get_index() != prev.get_index() + 1 {
                return Err(BlockRejection::IndexMismatch {
                    expected: prev.get_index() + 1,
                    got: block.get_index(),
                });
            }
            if block.get_prev_hash() != prev.get_hash() {
                return Err(BlockRejection::PrevHashMismatch);
            }
        }

        match block.compute_hash() {
            Ok(hash) if hash == block.get_hash() => {}
            _ => return Err(BlockRejection::HashMismatch),
        }
        match block.compute_merkle_root() {
            Ok(root) if root == block.get_merkle_root() => {}
            _ => return Err(BlockRejection::MerkleRootMismatch),
        }

        // Each transaction is checked against the balance index as it stood
        // BEFORE this block, not incrementally within it. Two transfers from
        // one sender that together overspend the pre-block balance both
        // pass; see apply_block_to for how such a block settles.
        for (index, tx) in block.get_transactions().iter().enumerate() {
            match Self::validate_transaction_against(balances, tx) {
                TxVerdict::Valid => {}
                verdict => {
                    return Err(BlockRejection::InvalidTransaction { index, verdict });
                }
            }
        }

        if block.get_validator().is_some() && !block.verify_signature() {
            return Err(BlockRejection::InvalidValidatorSignature);
        }

        Ok(())
    }

    /// Validate, persist and append a block. On rejection, and on a failed
    /// disk write, no state changes; partial application is never
    /// observable. A storage failure aborts the append without crashing the
    /// caller.
    pub fn add_block(&mut self, block: Block) -> Result<BlockAdmission> {
        if let Err(rejection) = self.validate_block(&block, self.chain.last()) {
            warn!(
                "Rejected block {} at index {}: {rejection}",
                block.get_hash(),
                block.get_index()
            );
            return Ok(BlockAdmission::Rejected(rejection));
        }

        // Persist before mutating memory: a write failure must not leave an
        // in-memory-only block.
        self.store.append_block(&block)?;

        info!(
            "Appended block {} at index {} with {} transaction(s)",
            block.get_hash(),
            block.get_index(),
            block.get_transactions().len()
        );
        self.admit(block);
        Ok(BlockAdmission::Appended)
    }

    /// Assemble a candidate block from the mempool: the highest-fee pending
    /// transactions (arrival order on ties) behind a coinbase paying the
    /// block reward to the validator. The block is not appended; callers
    /// still go through `add_block`.
    pub fn create_block(
        &self,
        validator_address: &str,
        validator_key: Option<&[u8]>,
    ) -> Result<Block> {
        let tip = self.tip();
        let next_index = tip.get_index() + 1;

        let mut transactions = Vec::with_capacity(self.max_block_transactions + 1);
        transactions.push(Transaction::new_coinbase(
            validator_address.to_string(),
            block_reward(next_index),
        )?);
        transactions.extend(self.mempool.select_by_fee(self.max_block_transactions));

        let mut block = Block::new_block(
            next_index,
            tip.get_hash().to_string(),
            transactions,
            self.next_difficulty(),
            Some(validator_address.to_string()),
        )?;
        if let Some(key) = validator_key {
            block.sign(key)?;
        }
        Ok(block)
    }

    /// Difficulty for the next block (see `DifficultyAdjustment`)
    pub fn next_difficulty(&self) -> u32 {
        DifficultyAdjustment::next_difficulty(&self.chain)
    }

    /// Re-validate every adjacent block pair from genesis, replaying the
    /// balance index as it goes. A consistency self-check, not a hot path.
    pub fn validate_chain(&self) -> bool {
        let mut balances = HashMap::new();
        let mut supply = 0u64;
        let mut prev: Option<&Block> = None;
        for block in &self.chain {
            if let Err(rejection) = Self::validate_block_against(&balances, block, prev) {
                warn!(
                    "Chain self-check failed at index {}: {rejection}",
                    block.get_index()
                );
                return false;
            }
            Self::apply_block_to(&mut balances, &mut supply, block);
            prev = Some(block);
        }
        true
    }

    /// Apply every transaction of a block to the balance index. The sender
    /// is debited amount + fee (the fee leaves circulation); the recipient
    /// is credited the amount. Coinbase credits only and counts as issuance.
    /// The debit saturates at zero: blocks that exercise the intra-block
    /// overspend gap must still apply without partial failure.
    fn apply_block_to(
        balances: &mut HashMap<String, u64>,
        total_supply: &mut u64,
        block: &Block,
    ) {
        for tx in block.get_transactions() {
            if let Some(sender) = tx.get_sender() {
                let entry = balances.entry(sender.to_string()).or_insert(0);
                *entry = entry.saturating_sub(tx.total_cost());
            } else {
                *total_supply = total_supply.saturating_add(tx.get_amount());
            }
            *balances.entry(tx.get_recipient().to_string()).or_insert(0) += tx.get_amount();
        }
    }

    pub fn height(&self) -> u64 {
        self.tip().get_index()
    }

    pub fn tip(&self) -> &Block {
        self.chain
            .last()
            .expect("Ledger chain always holds at least the genesis block")
    }

    pub fn block_by_index(&self, index: u64) -> Option<&Block> {
        self.chain.get(index as usize)
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.index_by_hash
            .get(hash)
            .and_then(|index| self.chain.get(*index as usize))
    }

    /// Blocks in the inclusive index range, clamped to the current height
    pub fn blocks_in_range(&self, from: u64, to: u64) -> Vec<Block> {
        if from > self.height() || from > to {
            return Vec::new();
        }
        let to = to.min(self.height());
        self.chain[from as usize..=to as usize].to_vec()
    }

    /// Look up a transaction by id, pending entries first, then the chain
    pub fn transaction_by_id(&self, id: &str) -> Option<Transaction> {
        if let Some(tx) = self.mempool.get(id) {
            return Some(tx.clone());
        }
        for block in self.chain.iter().rev() {
            for tx in block.get_transactions() {
                if tx.get_id() == id {
                    return Some(tx.clone());
                }
            }
        }
        None
    }

    /// Confirmed transactions where the address is sender or recipient,
    /// oldest first
    pub fn transactions_by_address(&self, address: &str) -> Vec<Transaction> {
        let mut found = Vec::new();
        for block in &self.chain {
            for tx in block.get_transactions() {
                if tx.get_sender() == Some(address) || tx.get_recipient() == address {
                    found.push(tx.clone());
                }
            }
        }
        found
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn total_supply(&self) -> u64 {
        self.total_supply
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.len()
    }

    pub fn mempool_transactions(&self) -> Vec<Transaction> {
        self.mempool.all()
    }
}
