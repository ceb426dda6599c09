//! # Peer Identity
//!
//! This module defines the identity types used throughout the node:
//!
//! - [`Keypair`]: Ed25519 signing keypair loaded from persisted key material
//! - [`PeerId`]: 32-byte blake3 digest of the public key, the overlay address
//! - [`PeerInfo`]: peer ID plus the multiaddresses it can be dialed on
//!
//! ## Identity Model
//!
//! `PeerId = blake3(ed25519 public key)`. The public key itself travels in the
//! transport handshake, where the receiver recomputes the digest, so a peer ID
//! is bound to possession of the matching private key.
//!
//! ## Key Material
//!
//! Key files are accepted in three encodings:
//!
//! ```text
//! raw seed        32 bytes
//! raw keypair     64 bytes   seed || public
//! enveloped       0x08 0x01 0x12 <len> <raw>   (key type 1 = Ed25519)
//! ```
//!
//! The enveloped form is what `destra-node keygen` writes.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::multiaddr::Multiaddr;

/// Length of an Ed25519 seed or public key.
const KEY_LEN: usize = 32;

/// Envelope header: field 1 (varint) = key type, field 2 (bytes) = key data.
const ENVELOPE_KEY_TYPE_TAG: u8 = 0x08;
const ENVELOPE_DATA_TAG: u8 = 0x12;
const KEY_TYPE_ED25519: u8 = 0x01;

/// Maximum addresses accepted in a single [`PeerInfo`].
pub const MAX_PEER_ADDRS: usize = 16;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key file {} not found", path.display())]
    Missing { path: PathBuf },

    #[error("failed to access key file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} key is malformed: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("public key does not correspond to private key")]
    Mismatch,

    #[error("refusing to overwrite existing key file {}", path.display())]
    AlreadyExists { path: PathBuf },
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Build a keypair from the contents of the private and public key files.
    ///
    /// Loading is a pure function of the two byte strings.
    pub fn from_key_material(private: &[u8], public: &[u8]) -> Result<Self, IdentityError> {
        if private.is_empty() {
            return Err(IdentityError::Malformed {
                what: "private",
                reason: "empty".into(),
            });
        }
        if public.is_empty() {
            return Err(IdentityError::Malformed {
                what: "public",
                reason: "empty".into(),
            });
        }

        let private = unwrap_envelope(private, "private")?;
        let public = unwrap_envelope(public, "public")?;

        let (seed, embedded_public) = match private.len() {
            32 => (&private[..KEY_LEN], None),
            64 => (&private[..KEY_LEN], Some(&private[KEY_LEN..])),
            n => {
                return Err(IdentityError::Malformed {
                    what: "private",
                    reason: format!("expected 32 or 64 bytes, got {n}"),
                })
            }
        };
        if public.len() != KEY_LEN {
            return Err(IdentityError::Malformed {
                what: "public",
                reason: format!("expected 32 bytes, got {}", public.len()),
            });
        }

        let mut seed_arr = Zeroizing::new([0u8; KEY_LEN]);
        seed_arr.copy_from_slice(seed);
        let keypair = Self::from_secret_key_bytes(&seed_arr);

        let derived = keypair.public_key_bytes();
        if let Some(embedded) = embedded_public {
            if embedded != &derived[..] {
                return Err(IdentityError::Mismatch);
            }
        }
        if public != &derived[..] {
            return Err(IdentityError::Mismatch);
        }
        Ok(keypair)
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// Private key file contents: enveloped `seed || public`.
    pub fn encode_private(&self) -> Zeroizing<Vec<u8>> {
        let mut raw = Zeroizing::new(Vec::with_capacity(64));
        raw.extend_from_slice(&self.secret_key_bytes()[..]);
        raw.extend_from_slice(&self.public_key_bytes());
        Zeroizing::new(envelope(&raw))
    }

    /// Public key file contents: enveloped public key.
    pub fn encode_public(&self) -> Vec<u8> {
        envelope(&self.public_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

fn envelope(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 4);
    out.extend_from_slice(&[ENVELOPE_KEY_TYPE_TAG, KEY_TYPE_ED25519, ENVELOPE_DATA_TAG]);
    out.push(raw.len() as u8);
    out.extend_from_slice(raw);
    out
}

fn unwrap_envelope<'a>(bytes: &'a [u8], what: &'static str) -> Result<&'a [u8], IdentityError> {
    if bytes.first() != Some(&ENVELOPE_KEY_TYPE_TAG) {
        return Ok(bytes);
    }
    // A raw key may start with 0x08 too; only treat it as an envelope when the
    // whole header and declared length line up.
    if bytes.len() < 4 || bytes[2] != ENVELOPE_DATA_TAG || bytes[3] as usize != bytes.len() - 4 {
        return Ok(bytes);
    }
    if bytes[1] != KEY_TYPE_ED25519 {
        return Err(IdentityError::Malformed {
            what,
            reason: format!("unsupported key type {}", bytes[1]),
        });
    }
    Ok(&bytes[4..])
}

/// Load the node identity from the two key files.
pub fn load_from_files(private_path: &Path, public_path: &Path) -> Result<Keypair, IdentityError> {
    let private = Zeroizing::new(read_key_file(private_path)?);
    let public = read_key_file(public_path)?;
    Keypair::from_key_material(&private, &public)
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, IdentityError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(IdentityError::Missing {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(IdentityError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write a freshly generated keypair to the two key files.
pub fn write_key_files(
    keypair: &Keypair,
    private_path: &Path,
    public_path: &Path,
) -> Result<(), IdentityError> {
    for path in [private_path, public_path] {
        if path.exists() {
            return Err(IdentityError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| IdentityError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    std::fs::write(private_path, keypair.encode_private().as_slice()).map_err(|source| {
        IdentityError::Io {
            path: private_path.to_path_buf(),
            source,
        }
    })?;
    std::fs::write(public_path, keypair.encode_public()).map_err(|source| IdentityError::Io {
        path: public_path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer-info record as carried by the DHT wire protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    pub fn single(peer_id: PeerId, addr: Multiaddr) -> Self {
        Self::new(peer_id, vec![addr])
    }

    /// Copy of this record with every non-globally-routable address removed.
    pub fn public_only(&self) -> Self {
        Self {
            peer_id: self.peer_id,
            addrs: self
                .addrs
                .iter()
                .filter(|a| a.is_globally_routable())
                .cloned()
                .collect(),
        }
    }

    /// Merge addresses from `other` (same peer), keeping order and the size cap.
    pub fn merge_addrs(&mut self, other: &PeerInfo) {
        for addr in &other.addrs {
            if self.addrs.len() >= MAX_PEER_ADDRS {
                break;
            }
            if !self.addrs.contains(addr) {
                self.addrs.push(addr.clone());
            }
        }
    }

    /// Bounds check for records decoded from the network.
    pub fn validate_structure(&self) -> bool {
        self.addrs.len() <= MAX_PEER_ADDRS
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for PeerInfo {}

impl std::hash::Hash for PeerInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}
