//! # Authenticated Key Exchange
//!
//! Three-message handshake run over a fresh TCP stream before any multiplexed
//! traffic flows:
//!
//! ```text
//! Initiator                                   Responder
//!   Hello  { version, e_i }            ──►
//!                                      ◄──   Reply  { e_r, S_r, sig_r(T) }
//!   Finish { S_i, sig_i(T) }           ──►
//! ```
//!
//! `e_*` are X25519 ephemeral public keys, `S_*` Ed25519 static public keys and
//! `T = blake3(domain || e_i || e_r)` the transcript hash. Each side signs `T`
//! under its own role label, so a signature cannot be replayed in the other
//! direction or on another connection. Session keys come from the X25519 shared
//! secret and `T` (see [`SessionKeys::derive`]).
//!
//! The state machine is split into [`Initiator`] and [`Responder`] values that
//! are consumed on each transition, so an out-of-order message is a type error
//! rather than a runtime state check. The async drivers at the bottom of the
//! module only add framing and per-step timeouts.

use std::fmt;
use std::time::Duration;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::crypto::SessionKeys;
use crate::identity::{Keypair, PeerId};
use crate::messages;

pub const PROTOCOL_VERSION: u8 = 1;

const TRANSCRIPT_DOMAIN: &[u8] = b"destra-handshake-v1";
const RESPONDER_LABEL: &[u8] = b"destra-handshake-v1 responder";
const INITIATOR_LABEL: &[u8] = b"destra-handshake-v1 initiator";

/// Handshake messages are tiny; anything larger is hostile.
const MAX_HANDSHAKE_MESSAGE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    Hello,
    Reply,
    Finish,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStep::Hello => f.write_str("hello"),
            HandshakeStep::Reply => f.write_str("reply"),
            HandshakeStep::Finish => f.write_str("finish"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u8),
    #[error("remote static key is not a valid ed25519 point")]
    InvalidStaticKey,
    #[error("remote signature does not verify")]
    BadSignature,
    #[error("expected peer {expected}, remote authenticated as {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("remote peer has our own identity")]
    SelfConnection,
    #[error("x25519 key agreement failed")]
    KeyAgreement,
    #[error("ephemeral key generation failed")]
    Rng,
    #[error("timed out waiting for {0}")]
    Timeout(HandshakeStep),
    #[error("malformed {step} message: {reason}")]
    Malformed { step: HandshakeStep, reason: String },
    #[error("i/o error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub ephemeral: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub ephemeral: [u8; 32],
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Finish {
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct Session {
    pub remote_peer: PeerId,
    pub remote_public_key: [u8; 32],
    pub keys: SessionKeys,
}

fn transcript_hash(initiator_ephemeral: &[u8; 32], responder_ephemeral: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    hasher.update(initiator_ephemeral);
    hasher.update(responder_ephemeral);
    *hasher.finalize().as_bytes()
}

fn signed_payload(label: &[u8], transcript: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(label.len() + transcript.len());
    payload.extend_from_slice(label);
    payload.extend_from_slice(transcript);
    payload
}

fn generate_ephemeral() -> Result<(EphemeralPrivateKey, [u8; 32]), HandshakeError> {
    let rng = SystemRandom::new();
    let private = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| HandshakeError::Rng)?;
    let public = private.compute_public_key().map_err(|_| HandshakeError::Rng)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(public.as_ref());
    Ok((private, out))
}

fn derive_keys(
    private: EphemeralPrivateKey,
    remote_ephemeral: &[u8; 32],
    transcript: &[u8; 32],
    is_initiator: bool,
) -> Result<SessionKeys, HandshakeError> {
    let remote = UnparsedPublicKey::new(&X25519, remote_ephemeral);
    agreement::agree_ephemeral(private, &remote, |shared| {
        SessionKeys::derive(shared, transcript, is_initiator)
    })
    .map_err(|_| HandshakeError::KeyAgreement)
}

/// Check the remote's static key and signature; returns its peer ID.
fn authenticate_remote(
    public_key: &[u8; 32],
    signature: &[u8],
    label: &[u8],
    transcript: &[u8; 32],
    local: PeerId,
) -> Result<PeerId, HandshakeError> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| HandshakeError::InvalidStaticKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| HandshakeError::BadSignature)?;
    verifying_key
        .verify(&signed_payload(label, transcript), &signature)
        .map_err(|_| HandshakeError::BadSignature)?;

    let remote = PeerId::from_public_key(public_key);
    if remote == local {
        return Err(HandshakeError::SelfConnection);
    }
    Ok(remote)
}

/// Dialing side, after sending [`Hello`] and before receiving [`Reply`].
pub struct Initiator {
    keypair: Keypair,
    expected: Option<PeerId>,
    ephemeral: EphemeralPrivateKey,
    ephemeral_public: [u8; 32],
}

impl Initiator {
    pub fn start(keypair: &Keypair, expected: Option<PeerId>) -> Result<(Self, Hello), HandshakeError> {
        let (ephemeral, ephemeral_public) = generate_ephemeral()?;
        let hello = Hello {
            version: PROTOCOL_VERSION,
            ephemeral: ephemeral_public,
        };
        Ok((
            Self {
                keypair: keypair.clone(),
                expected,
                ephemeral,
                ephemeral_public,
            },
            hello,
        ))
    }

    pub fn on_reply(self, reply: &Reply) -> Result<(Finish, Session), HandshakeError> {
        let transcript = transcript_hash(&self.ephemeral_public, &reply.ephemeral);
        let remote = authenticate_remote(
            &reply.public_key,
            &reply.signature,
            RESPONDER_LABEL,
            &transcript,
            self.keypair.peer_id(),
        )?;
        if let Some(expected) = self.expected {
            if expected != remote {
                return Err(HandshakeError::PeerIdMismatch {
                    expected,
                    actual: remote,
                });
            }
        }

        let keys = derive_keys(self.ephemeral, &reply.ephemeral, &transcript, true)?;
        let signature = self.keypair.sign(&signed_payload(INITIATOR_LABEL, &transcript));
        let finish = Finish {
            public_key: self.keypair.public_key_bytes(),
            signature: signature.to_bytes().to_vec(),
        };
        Ok((
            finish,
            Session {
                remote_peer: remote,
                remote_public_key: reply.public_key,
                keys,
            },
        ))
    }
}

/// Accepting side, after sending [`Reply`] and before receiving [`Finish`].
pub struct Responder {
    local: PeerId,
    transcript: [u8; 32],
    keys: SessionKeys,
}

impl Responder {
    pub fn on_hello(keypair: &Keypair, hello: &Hello) -> Result<(Self, Reply), HandshakeError> {
        if hello.version != PROTOCOL_VERSION {
            return Err(HandshakeError::UnsupportedVersion(hello.version));
        }
        let (ephemeral, ephemeral_public) = generate_ephemeral()?;
        let transcript = transcript_hash(&hello.ephemeral, &ephemeral_public);
        let keys = derive_keys(ephemeral, &hello.ephemeral, &transcript, false)?;

        let signature = keypair.sign(&signed_payload(RESPONDER_LABEL, &transcript));
        let reply = Reply {
            ephemeral: ephemeral_public,
            public_key: keypair.public_key_bytes(),
            signature: signature.to_bytes().to_vec(),
        };
        Ok((
            Self {
                local: keypair.peer_id(),
                transcript,
                keys,
            },
            reply,
        ))
    }

    pub fn on_finish(self, finish: &Finish) -> Result<Session, HandshakeError> {
        let remote = authenticate_remote(
            &finish.public_key,
            &finish.signature,
            INITIATOR_LABEL,
            &self.transcript,
            self.local,
        )?;
        Ok(Session {
            remote_peer: remote,
            remote_public_key: finish.public_key,
            keys: self.keys,
        })
    }
}

async fn write_message<S, T>(io: &mut S, message: &T) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = messages::serialize(message).map_err(|e| {
        HandshakeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    io.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

async fn read_message<S, T>(
    io: &mut S,
    step: HandshakeStep,
    timeout: Duration,
) -> Result<T, HandshakeError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let read = async {
        let mut len_buf = [0u8; 2];
        io.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len > MAX_HANDSHAKE_MESSAGE {
            return Err(HandshakeError::Malformed {
                step,
                reason: format!("{len} bytes exceeds {MAX_HANDSHAKE_MESSAGE}"),
            });
        }
        let mut body = vec![0u8; len];
        io.read_exact(&mut body).await?;
        messages::deserialize_bounded(&body).map_err(|e| HandshakeError::Malformed {
            step,
            reason: e.to_string(),
        })
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| HandshakeError::Timeout(step))?
}

/// Run the dialing side of the handshake over `io`.
pub async fn initiate<S>(
    io: &mut S,
    keypair: &Keypair,
    expected: Option<PeerId>,
    timeout: Duration,
) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (initiator, hello) = Initiator::start(keypair, expected)?;
    write_message(io, &hello).await?;
    trace!("handshake: hello sent");

    let reply: Reply = read_message(io, HandshakeStep::Reply, timeout).await?;
    let (finish, session) = initiator.on_reply(&reply)?;
    write_message(io, &finish).await?;
    trace!(peer = ?session.remote_peer, "handshake: finish sent");
    Ok(session)
}

/// Run the accepting side of the handshake over `io`.
pub async fn respond<S>(
    io: &mut S,
    keypair: &Keypair,
    timeout: Duration,
) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello: Hello = read_message(io, HandshakeStep::Hello, timeout).await?;
    let (responder, reply) = Responder::on_hello(keypair, &hello)?;
    write_message(io, &reply).await?;
    trace!("handshake: reply sent");

    let finish: Finish = read_message(io, HandshakeStep::Finish, timeout).await?;
    responder.on_finish(&finish)
}
