use crate::core::{MerkleTree, Transaction};
use crate::error::Result;
use crate::utils::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, hex_decode,
    hex_encode, sha256_digest,
};
use serde::{Deserialize, Serialize};

/// Previous-hash value of the genesis block, and the merkle root of a block
/// with no transactions.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    index: u64,
    timestamp: i64,
    transactions: Vec<Transaction>,
    prev_hash: String,
    hash: String,
    nonce: u64,
    difficulty: u32,
    merkle_root: String,
    validator: Option<String>,
    signature: Option<Vec<u8>>,
}

/// Bincode preimage of the block hash: everything that identifies the block
/// except the hash itself and the validator signature. Transactions enter
/// through their ids, which are themselves pinned by the merkle root.
#[derive(Serialize, bincode::Encode)]
struct BlockHashPayload {
    index: u64,
    timestamp: i64,
    tx_ids: Vec<String>,
    prev_hash: String,
    nonce: u64,
    difficulty: u32,
    merkle_root: String,
    validator: Option<String>,
}

impl Block {
    pub fn new_block(
        index: u64,
        prev_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
        validator: Option<String>,
    ) -> Result<Block> {
        let mut block = Block {
            index,
            timestamp: current_timestamp()?,
            transactions,
            prev_hash,
            hash: String::new(),
            nonce: 0,
            difficulty,
            merkle_root: String::new(),
            validator,
            signature: None,
        };
        block.merkle_root = block.compute_merkle_root()?;
        block.hash = block.compute_hash()?;
        Ok(block)
    }

    /// Genesis block: index 0 linked to the all-zero hash, optionally
    /// carrying an initial-distribution set of coinbase transactions.
    pub fn generate_genesis_block(
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Result<Block> {
        Self::new_block(0, ZERO_HASH.to_string(), transactions, difficulty, None)
    }

    /// Recompute the block hash from its contents. Pure; does not touch the
    /// stored hash field.
    pub fn compute_hash(&self) -> Result<String> {
        let payload = BlockHashPayload {
            index: self.index,
            timestamp: self.timestamp,
            tx_ids: self
                .transactions
                .iter()
                .map(|tx| tx.get_id().to_string())
                .collect(),
            prev_hash: self.prev_hash.clone(),
            nonce: self.nonce,
            difficulty: self.difficulty,
            merkle_root: self.merkle_root.clone(),
            validator: self.validator.clone(),
        };
        let preimage = crate::utils::serialize(&payload)?;
        Ok(hex_encode(&sha256_digest(&preimage)))
    }

    /// Recompute the merkle root over the transactions' content hashes
    pub fn compute_merkle_root(&self) -> Result<String> {
        let mut leaves = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            leaves.push(tx.compute_hash()?);
        }
        Ok(hex_encode(&MerkleTree::compute_root(&leaves)))
    }

    /// Sign the block hash with the validator's PKCS#8 key. The validator
    /// field must already carry the matching public key for verification to
    /// succeed later.
    pub fn sign(&mut self, pkcs8: &[u8]) -> Result<()> {
        self.signature = Some(ecdsa_p256_sha256_sign_digest(pkcs8, self.hash.as_bytes())?);
        Ok(())
    }

    /// Verify the validator signature over the block hash. False when either
    /// the validator identity or the signature is absent; never errors.
    pub fn verify_signature(&self) -> bool {
        let validator = match &self.validator {
            Some(validator) => validator,
            None => return false,
        };
        let signature = match &self.signature {
            Some(signature) => signature,
            None => return false,
        };
        let public_key = match hex_decode(validator) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        ecdsa_p256_sha256_sign_verify(&public_key, signature, self.hash.as_bytes())
    }

    pub fn get_index(&self) -> u64 {
        self.index
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_prev_hash(&self) -> &str {
        self.prev_hash.as_str()
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_merkle_root(&self) -> &str {
        self.merkle_root.as_str()
    }

    pub fn get_validator(&self) -> Option<&str> {
        self.validator.as_deref()
    }

    pub fn get_signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Build a block with explicit header fields. Test hook for forged and
    /// corrupted blocks; production assembly goes through `new_block`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        index: u64,
        timestamp: i64,
        transactions: Vec<Transaction>,
        prev_hash: String,
        hash: String,
        nonce: u64,
        difficulty: u32,
        merkle_root: String,
        validator: Option<String>,
        signature: Option<Vec<u8>>,
    ) -> Block {
        Block {
            index,
            timestamp,
            transactions,
            prev_hash,
            hash,
            nonce,
            difficulty,
            merkle_root,
            validator,
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{new_key_pair, public_key_from_pkcs8};

    fn coinbase(recipient: &str, reward: u64) -> Transaction {
        Transaction::new_coinbase(recipient.to_string(), reward).unwrap()
    }

    #[test]
    fn stored_hash_matches_recomputed() {
        let block =
            Block::new_block(1, ZERO_HASH.to_string(), vec![coinbase("miner", 50)], 1, None)
                .unwrap();
        assert_eq!(block.get_hash(), block.compute_hash().unwrap());
        assert_eq!(block.get_merkle_root(), block.compute_merkle_root().unwrap());
    }

    #[test]
    fn empty_block_has_zero_merkle_root() {
        let block = Block::new_block(1, ZERO_HASH.to_string(), vec![], 1, None).unwrap();
        assert_eq!(block.get_merkle_root(), ZERO_HASH);
    }

    #[test]
    fn genesis_links_to_zero_hash() {
        let block = Block::generate_genesis_block(vec![coinbase("pool", 100)], 1).unwrap();
        assert_eq!(block.get_index(), 0);
        assert_eq!(block.get_prev_hash(), ZERO_HASH);
    }

    #[test]
    fn validator_signature_round_trip() {
        let pkcs8 = new_key_pair().unwrap();
        let validator = hex_encode(&public_key_from_pkcs8(&pkcs8).unwrap());

        let mut block = Block::new_block(
            1,
            ZERO_HASH.to_string(),
            vec![coinbase(&validator, 50)],
            1,
            Some(validator),
        )
        .unwrap();

        // Unsigned block does not verify
        assert!(!block.verify_signature());

        block.sign(&pkcs8).unwrap();
        assert!(block.verify_signature());
    }

    #[test]
    fn signature_without_validator_identity_never_verifies() {
        let pkcs8 = new_key_pair().unwrap();
        let mut block =
            Block::new_block(1, ZERO_HASH.to_string(), vec![coinbase("miner", 50)], 1, None)
                .unwrap();
        block.sign(&pkcs8).unwrap();
        // Signature present but validator identity absent
        assert!(!block.verify_signature());
    }

    #[test]
    fn hash_covers_transaction_ids() {
        let a = Block::new_block(1, ZERO_HASH.to_string(), vec![coinbase("miner", 50)], 1, None)
            .unwrap();
        let b = Block::from_parts(
            a.get_index(),
            a.get_timestamp(),
            vec![coinbase("miner", 50)],
            a.get_prev_hash().to_string(),
            a.get_hash().to_string(),
            a.get_nonce(),
            a.get_difficulty(),
            a.get_merkle_root().to_string(),
            None,
            None,
        );
        // Different coinbase id means a different recomputed hash
        assert_ne!(b.compute_hash().unwrap(), a.get_hash());
    }
}
