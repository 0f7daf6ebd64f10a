// Account-model value transfers. A transaction debits its sender by
// amount + fee and credits its recipient by amount; a coinbase transaction
// (sender = None) mints new currency and is exempt from signature and
// balance checks. The content hash covers every field except the signature,
// and the signature signs that hash.

use crate::error::Result;
use crate::utils::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, hex_decode,
    hex_encode, public_key_from_pkcs8, sha256_digest,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: String,
    timestamp: i64,
    sender: Option<String>,
    recipient: String,
    amount: u64,
    fee: u64,
    data: Option<Vec<u8>>,
    nonce: u64,
    signature: Option<Vec<u8>>,
}

impl Transaction {
    /// Create an unsigned transfer. The sender is the hex-encoded public key
    /// that will later sign the transaction.
    pub fn new(
        sender: String,
        recipient: String,
        amount: u64,
        fee: u64,
        data: Option<Vec<u8>>,
        nonce: u64,
    ) -> Result<Transaction> {
        Ok(Transaction {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp()?,
            sender: Some(sender),
            recipient,
            amount,
            fee,
            data,
            nonce,
            signature: None,
        })
    }

    /// Create and sign a transfer in one step, deriving the sender address
    /// from the PKCS#8 key material.
    pub fn new_signed(
        pkcs8: &[u8],
        recipient: String,
        amount: u64,
        fee: u64,
        data: Option<Vec<u8>>,
        nonce: u64,
    ) -> Result<Transaction> {
        let public_key = public_key_from_pkcs8(pkcs8)?;
        let mut tx = Self::new(hex_encode(&public_key), recipient, amount, fee, data, nonce)?;
        tx.sign(pkcs8)?;
        Ok(tx)
    }

    /// Create a coinbase transaction minting `reward` to `recipient`
    pub fn new_coinbase(recipient: String, reward: u64) -> Result<Transaction> {
        Ok(Transaction {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp()?,
            sender: None,
            recipient,
            amount: reward,
            fee: 0,
            data: None,
            nonce: 0,
            signature: None,
        })
    }

    /// Content hash over every field except the signature. Deterministic
    /// across processes: the preimage is the bincode encoding of a copy with
    /// the signature stripped.
    pub fn compute_hash(&self) -> Result<Vec<u8>> {
        let unsigned = Transaction {
            signature: None,
            ..self.clone()
        };
        let preimage = crate::utils::serialize(&unsigned)?;
        Ok(sha256_digest(&preimage))
    }

    /// Sign the content hash with the given PKCS#8 private key. Only the
    /// signature field is mutated. Malformed key material is a `Key` error.
    pub fn sign(&mut self, pkcs8: &[u8]) -> Result<()> {
        let digest = self.compute_hash()?;
        self.signature = Some(ecdsa_p256_sha256_sign_digest(pkcs8, &digest)?);
        Ok(())
    }

    /// Verify the signature against the sender public key. Coinbase
    /// transactions always verify. Returns false for an absent, malformed,
    /// or mismatched signature; never errors.
    pub fn verify_signature(&self) -> bool {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return true,
        };
        let signature = match &self.signature {
            Some(signature) => signature,
            None => return false,
        };
        let public_key = match hex_decode(sender) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let digest = match self.compute_hash() {
            Ok(digest) => digest,
            Err(_) => return false,
        };
        ecdsa_p256_sha256_sign_verify(&public_key, signature, &digest)
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender.is_none()
    }

    pub fn get_id(&self) -> &str {
        self.id.as_str()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn get_recipient(&self) -> &str {
        self.recipient.as_str()
    }

    pub fn get_amount(&self) -> u64 {
        self.amount
    }

    pub fn get_fee(&self) -> u64 {
        self.fee
    }

    pub fn get_data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Total debit against the sender's balance
    pub fn total_cost(&self) -> u64 {
        self.amount.saturating_add(self.fee)
    }

    /// Replace the signature wholesale. Exists so tamper scenarios can be
    /// exercised in tests; normal code paths go through `sign`.
    pub fn set_signature(&mut self, signature: Option<Vec<u8>>) {
        self.signature = signature;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockchainError;
    use crate::utils::new_key_pair;

    #[test]
    fn hash_excludes_signature() {
        let pkcs8 = new_key_pair().unwrap();
        let mut tx =
            Transaction::new_signed(&pkcs8, "merchant".to_string(), 100, 1, None, 0).unwrap();

        let before = tx.compute_hash().unwrap();
        tx.set_signature(None);
        let after = tx.compute_hash().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn signed_transfer_verifies() {
        let pkcs8 = new_key_pair().unwrap();
        let tx = Transaction::new_signed(&pkcs8, "merchant".to_string(), 100, 1, None, 0).unwrap();
        assert!(tx.verify_signature());
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let pkcs8 = new_key_pair().unwrap();
        let mut tx =
            Transaction::new_signed(&pkcs8, "merchant".to_string(), 100, 1, None, 0).unwrap();

        let mut tampered = tx.get_signature().unwrap().to_vec();
        tampered[0] ^= 0xFF;
        tx.set_signature(Some(tampered));
        assert!(!tx.verify_signature());
    }

    #[test]
    fn unsigned_transfer_does_not_verify() {
        let pkcs8 = new_key_pair().unwrap();
        let public_key = public_key_from_pkcs8(&pkcs8).unwrap();
        let tx = Transaction::new(
            hex_encode(&public_key),
            "merchant".to_string(),
            100,
            1,
            None,
            0,
        )
        .unwrap();
        assert!(!tx.verify_signature());
    }

    #[test]
    fn coinbase_always_verifies() {
        let tx = Transaction::new_coinbase("validator".to_string(), 50).unwrap();
        assert!(tx.is_coinbase());
        assert!(tx.verify_signature());
        assert_eq!(tx.get_fee(), 0);
    }

    #[test]
    fn malformed_sender_hex_fails_quietly() {
        let mut tx = Transaction::new(
            "not hex!".to_string(),
            "merchant".to_string(),
            100,
            1,
            None,
            0,
        )
        .unwrap();
        tx.set_signature(Some(vec![1, 2, 3]));
        assert!(!tx.verify_signature());
    }

    #[test]
    fn signing_with_garbage_key_is_a_key_error() {
        let mut tx = Transaction::new(
            "ab".to_string(),
            "merchant".to_string(),
            100,
            1,
            None,
            0,
        )
        .unwrap();
        let err = tx.sign(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, BlockchainError::Key(_)));
        assert!(tx.get_signature().is_none());
    }
}
