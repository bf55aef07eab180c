//! Response attestation
//!
//! A response is signed over the SHA-256 digest of its canonical encoding:
//! each field is length-prefixed so no two distinct responses share a
//! message.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::SignatureError;
use crate::models::{NodeId, OracleValue, RequestId, Response, SignedResponse};

pub trait ResponseSigner: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn sign(
        &self,
        request_id: RequestId,
        value: OracleValue,
        submitted_at: DateTime<Utc>,
    ) -> SignedResponse;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signed: &SignedResponse) -> Result<(), SignatureError>;
}

/// SHA-256 digest of the canonical response message
pub fn response_digest(response: &Response) -> [u8; 32] {
    let kind = match &response.value {
        OracleValue::Numeric(_) => "numeric",
        OracleValue::Text(_) => "text",
        OracleValue::Boolean(_) => "boolean",
    };

    let value = response.value.canonical();
    let millis = response.submitted_at.timestamp_millis().to_be_bytes();

    let mut hasher = Sha256::new();
    let fields: [&[u8]; 5] = [
        response.request_id.0.as_bytes(),
        response.node_id.as_str().as_bytes(),
        kind.as_bytes(),
        value.as_bytes(),
        &millis,
    ];
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hasher.finalize().into()
}

/// Ed25519 node identity
pub struct Ed25519Signer {
    key: SigningKey,
    node_id: NodeId,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let key = SigningKey::from_bytes(&seed);
        let node_id = NodeId(hex::encode(key.verifying_key().to_bytes()));
        Self { key, node_id }
    }

    pub fn from_seed_hex(seed: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| SignatureError::InvalidKey(format!("invalid seed hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        Self::from_seed(key.to_bytes())
    }
}

impl ResponseSigner for Ed25519Signer {
    fn node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn sign(
        &self,
        request_id: RequestId,
        value: OracleValue,
        submitted_at: DateTime<Utc>,
    ) -> SignedResponse {
        let response = Response {
            request_id,
            node_id: self.node_id.clone(),
            value,
            submitted_at,
        };
        let signature = self.key.sign(&response_digest(&response));
        SignedResponse {
            response,
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

/// Admitted oracle nodes and their verifying keys
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, VerifyingKey>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a node by its id, which is its hex-encoded verifying key.
    pub fn admit(&self, node_id: NodeId) -> Result<(), SignatureError> {
        let bytes = hex::decode(node_id.as_str())
            .map_err(|e| SignatureError::InvalidKey(format!("invalid key hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

        info!(node_id = %node_id, "node admitted");
        self.nodes.write().insert(node_id, key);
        Ok(())
    }

    pub fn remove(&self, node_id: &NodeId) -> bool {
        let removed = self.nodes.write().remove(node_id).is_some();
        if removed {
            info!(node_id = %node_id, "node removed");
        }
        removed
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl SignatureVerifier for NodeRegistry {
    fn verify(&self, signed: &SignedResponse) -> Result<(), SignatureError> {
        let node_id = &signed.response.node_id;
        let key = self
            .nodes
            .read()
            .get(node_id)
            .copied()
            .ok_or_else(|| SignatureError::UnknownNode(node_id.clone()))?;

        let bytes = hex::decode(&signed.signature).map_err(|_| SignatureError::InvalidSignature)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidSignature)?;
        let signature = Signature::from_bytes(&bytes);

        key.verify(&response_digest(&signed.response), &signature)
            .map_err(|_| {
                debug!(node_id = %node_id, request_id = %signed.response.request_id, "bad signature");
                SignatureError::InvalidSignature
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519Signer::from_seed([7u8; 32]);
        let registry = NodeRegistry::new();
        registry.admit(signer.node_id()).unwrap();

        let signed = signer.sign(RequestId::new(), OracleValue::from(101), at());
        assert_eq!(signed.response.node_id, signer.node_id());
        assert!(registry.verify(&signed).is_ok());
    }

    #[test]
    fn test_tampered_value_is_rejected() {
        let signer = Ed25519Signer::generate();
        let registry = NodeRegistry::new();
        registry.admit(signer.node_id()).unwrap();

        let mut signed = signer.sign(RequestId::new(), OracleValue::from(101), at());
        signed.response.value = OracleValue::from(5000);
        assert_eq!(registry.verify(&signed), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn test_value_kind_is_part_of_message() {
        let signer = Ed25519Signer::generate();
        let registry = NodeRegistry::new();
        registry.admit(signer.node_id()).unwrap();

        let mut signed = signer.sign(RequestId::new(), OracleValue::Boolean(true), at());
        signed.response.value = OracleValue::Text("true".into());
        assert_eq!(registry.verify(&signed), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn test_unknown_node_and_bad_keys() {
        let signer = Ed25519Signer::generate();
        let registry = NodeRegistry::new();

        let signed = signer.sign(RequestId::new(), OracleValue::from(1), at());
        assert_eq!(
            registry.verify(&signed),
            Err(SignatureError::UnknownNode(signer.node_id()))
        );

        assert!(registry.admit(NodeId::from("zz")).is_err());
        assert!(registry.admit(NodeId::from("abcd")).is_err());

        registry.admit(signer.node_id()).unwrap();
        assert!(registry.remove(&signer.node_id()));
        assert!(!registry.contains(&signer.node_id()));
    }

    #[test]
    fn test_seed_hex_is_deterministic() {
        let a = Ed25519Signer::from_seed_hex(&"2a".repeat(32)).unwrap();
        let b = Ed25519Signer::from_seed([0x2a; 32]);
        assert_eq!(a.node_id(), b.node_id());
        assert!(Ed25519Signer::from_seed_hex("2a2a").is_err());
    }
}
