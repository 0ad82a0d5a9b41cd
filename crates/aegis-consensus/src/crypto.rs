// DEFAULT CRYPTO COLLABORATOR
// Ed25519 signatures and SHA-256 digests behind the `Crypto` trait.
//
// SAFETY: Each node signs only with its own key; verification looks the
// sender's public key up in a directory shared by the whole cluster.

use crate::collaborators::Crypto;
use crate::types::{Digest, NodeId, Signature as SignatureBytes};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Ed25519 signer/verifier for one node.
pub struct Ed25519Crypto {
    node_id: NodeId,
    signing_key: SigningKey,
    directory: Arc<HashMap<NodeId, VerifyingKey>>,
}

impl Ed25519Crypto {
    pub fn new(
        node_id: NodeId,
        signing_key: SigningKey,
        directory: Arc<HashMap<NodeId, VerifyingKey>>,
    ) -> Self {
        Ed25519Crypto {
            node_id,
            signing_key,
            directory,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl Crypto for Ed25519Crypto {
    fn sign(&self, payload: &[u8]) -> SignatureBytes {
        self.signing_key.sign(payload).to_bytes().to_vec()
    }

    fn verify(&self, node: &NodeId, payload: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.directory.get(node) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(payload, &signature).is_ok()
    }

    fn digest(&self, payload: &[u8]) -> Digest {
        sha256(payload)
    }

    fn public_key(&self, node: &NodeId) -> Option<Vec<u8>> {
        self.directory.get(node).map(|key| key.to_bytes().to_vec())
    }
}

/// SHA-256 of `payload` as a `Digest`.
pub fn sha256(payload: &[u8]) -> Digest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(payload));
    Digest(out)
}

/// Key material for a whole cluster, used by simulations and tests.
pub struct KeyRing {
    keys: BTreeMap<NodeId, SigningKey>,
    directory: Arc<HashMap<NodeId, VerifyingKey>>,
}

impl KeyRing {
    /// Fresh random keys from the operating system RNG.
    pub fn generate<S: AsRef<str>>(ids: &[S]) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::build(ids, |_| {
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            seed
        })
    }

    /// Keys derived from the node id. Reproducible; never use outside simulations.
    pub fn deterministic<S: AsRef<str>>(ids: &[S]) -> Self {
        Self::build(ids, |id| {
            let mut material = b"aegis-simulation-key:".to_vec();
            material.extend_from_slice(id.as_bytes());
            sha256(&material).0
        })
    }

    fn build<S, F>(ids: &[S], mut seed_for: F) -> Self
    where
        S: AsRef<str>,
        F: FnMut(&str) -> [u8; 32],
    {
        let keys: BTreeMap<NodeId, SigningKey> = ids
            .iter()
            .map(|id| {
                let id = id.as_ref();
                (id.to_string(), SigningKey::from_bytes(&seed_for(id)))
            })
            .collect();
        let directory = keys
            .iter()
            .map(|(id, key)| (id.clone(), key.verifying_key()))
            .collect();

        KeyRing {
            keys,
            directory: Arc::new(directory),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.keys.keys().cloned().collect()
    }

    pub fn crypto_for(&self, node_id: &str) -> Option<Arc<Ed25519Crypto>> {
        self.keys.get(node_id).map(|key| {
            Arc::new(Ed25519Crypto::new(
                node_id.to_string(),
                key.clone(),
                Arc::clone(&self.directory),
            ))
        })
    }
}
