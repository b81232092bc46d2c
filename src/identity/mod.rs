//! Node identity and the message signing protocol.
//!
//! Two substrate key schemes are supported. A signature travels as
//! `hex(typebyte || raw)` where the typebyte selects the verifier on the
//! receiving side: `'e'` for ed25519, `'s'` for sr25519 (Schnorrkel over
//! Ristretto25519, signing context `"substrate"`).
//!
//! What gets signed is not the raw JSON but a fixed challenge digest over
//! the semantically relevant fields, so re-encoding a message at a hop does
//! not invalidate its signature.

use anyhow::{bail, Context, Result};
use ed25519_dalek::Signer as _;
use md5::{Digest, Md5};

use crate::message::{epoch_now, Message};

/// Replay window: a signed message whose epoch is further than this from the
/// verifier's clock is rejected.
pub const EPOCH_WINDOW_SECS: i64 = 20;

const TYPE_ED25519: u8 = b'e';
const TYPE_SR25519: u8 = b's';

const SIGNING_CONTEXT: &[u8] = b"substrate";

/// Key scheme selector, as configured on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KeyType {
    Ed25519,
    Sr25519,
}

/// The node's signing identity.
pub enum Identity {
    Ed25519(ed25519_dalek::SigningKey),
    Sr25519(schnorrkel::Keypair),
}

impl Identity {
    /// Derive an identity from a BIP-39 mnemonic the way substrate wallets
    /// do: entropy → mini secret (sr25519) or seed prefix (ed25519).
    pub fn from_mnemonic(phrase: &str, key_type: KeyType) -> Result<Self> {
        let mnemonic = bip39::Mnemonic::parse(phrase).context("invalid mnemonic")?;
        let entropy = mnemonic.to_entropy();
        match key_type {
            KeyType::Ed25519 => {
                let seed = substrate_bip39::seed_from_entropy(&entropy, "")
                    .map_err(|e| anyhow::anyhow!("seed derivation failed: {e:?}"))?;
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&seed[..32]);
                Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&secret)))
            }
            KeyType::Sr25519 => {
                let mini = substrate_bip39::mini_secret_from_entropy(&entropy, "")
                    .map_err(|e| anyhow::anyhow!("mini secret derivation failed: {e:?}"))?;
                Ok(Self::Sr25519(
                    mini.expand_to_keypair(schnorrkel::ExpansionMode::Ed25519),
                ))
            }
        }
    }

    /// Build an identity from a raw 32-byte seed, hex encoded. Mostly useful
    /// for tests and throwaway deployments without a wallet.
    pub fn from_seed_hex(seed_hex: &str, key_type: KeyType) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim_start_matches("0x")).context("invalid hex seed")?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("seed must be exactly 32 bytes"))?;
        match key_type {
            KeyType::Ed25519 => Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(
                &secret,
            ))),
            KeyType::Sr25519 => {
                let mini = schnorrkel::MiniSecretKey::from_bytes(&secret)
                    .map_err(|e| anyhow::anyhow!("invalid sr25519 seed: {e}"))?;
                Ok(Self::Sr25519(
                    mini.expand_to_keypair(schnorrkel::ExpansionMode::Ed25519),
                ))
            }
        }
    }

    /// Raw 32-byte public key, as a twin directory would publish it.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            Self::Sr25519(pair) => pair.public.to_bytes().to_vec(),
        }
    }

    fn sign_challenge(&self, digest: &[u8]) -> String {
        match self {
            Self::Ed25519(key) => {
                let sig = key.sign(digest);
                let mut out = vec![TYPE_ED25519];
                out.extend_from_slice(&sig.to_bytes());
                hex::encode(out)
            }
            Self::Sr25519(pair) => {
                let ctx = schnorrkel::signing_context(SIGNING_CONTEXT);
                let sig = pair.sign(ctx.bytes(digest));
                let mut out = vec![TYPE_SR25519];
                out.extend_from_slice(&sig.to_bytes());
                hex::encode(out)
            }
        }
    }

    /// Stamp `msg.signature` over the current field values. Any later change
    /// to a challenge field invalidates the signature.
    pub fn sign_message(&self, msg: &mut Message) {
        msg.signature = self.sign_challenge(&challenge(msg));
    }
}

/// MD5 digest over the textual forms of the signed fields, in wire order.
pub fn challenge(msg: &Message) -> [u8; 16] {
    let mut hash = Md5::new();
    hash.update(msg.version.to_string());
    hash.update(&msg.id);
    hash.update(&msg.command);
    hash.update(&msg.data);
    hash.update(msg.twin_src.to_string());
    for dst in &msg.twin_dst {
        hash.update(dst.to_string());
    }
    hash.update(&msg.retqueue);
    hash.update(msg.epoch.to_string());
    hash.update(if msg.proxy { "true" } else { "false" });
    hash.finalize().into()
}

/// Verify `msg.signature` against the sender's 32-byte public key. The
/// scheme is picked from the signature's leading typebyte.
pub fn verify_message(msg: &Message, public_key: &[u8]) -> Result<()> {
    let raw = hex::decode(&msg.signature).context("signature is not valid hex")?;
    let (&typebyte, sig) = raw.split_first().context("signature is empty")?;
    let digest = challenge(msg);

    match typebyte {
        TYPE_ED25519 => {
            let key: [u8; 32] = public_key
                .try_into()
                .map_err(|_| anyhow::anyhow!("ed25519 public key must be 32 bytes"))?;
            let key = ed25519_dalek::VerifyingKey::from_bytes(&key)
                .map_err(|e| anyhow::anyhow!("invalid ed25519 public key: {e}"))?;
            let sig = ed25519_dalek::Signature::from_slice(sig)
                .map_err(|e| anyhow::anyhow!("malformed ed25519 signature: {e}"))?;
            ed25519_dalek::Verifier::verify(&key, &digest, &sig)
                .map_err(|_| anyhow::anyhow!("bad signature"))
        }
        TYPE_SR25519 => {
            let key = schnorrkel::PublicKey::from_bytes(public_key)
                .map_err(|e| anyhow::anyhow!("invalid sr25519 public key: {e}"))?;
            let sig = schnorrkel::Signature::from_bytes(sig)
                .map_err(|e| anyhow::anyhow!("malformed sr25519 signature: {e}"))?;
            key.verify_simple(SIGNING_CONTEXT, &digest, &sig)
                .map_err(|_| anyhow::anyhow!("bad signature"))
        }
        other => bail!("unrecognized signature type byte {other:#x}"),
    }
}

/// Reject messages outside the replay window.
pub fn ensure_fresh(msg: &Message) -> Result<()> {
    let age = epoch_now() - msg.epoch;
    if age.abs() > EPOCH_WINDOW_SECS {
        bail!("message epoch out of range ({age}s off)");
    }
    Ok(())
}
