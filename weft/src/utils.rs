//! Keys, signing, box encryption, time

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use ed25519_dalek::{Keypair, PublicKey, Signature as DalekSig, Signer};
use rand::rngs::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

use crate::errors::*;
use crate::types::*;

/// Size of the sealed box prefix: ephemeral public key and nonce
pub const BOX_PREFIX_SIZE: usize = 32 + 12;

/// Generate an Ed25519 keypair for signing
pub fn generate_keypair() -> (PrivKey, PubKey) {
    let mut csprng = OsRng {};
    let keypair = Keypair::generate(&mut csprng);
    (
        PrivKey::Ed25519PrivKey(keypair.secret.to_bytes()),
        PubKey::Ed25519PubKey(keypair.public.to_bytes()),
    )
}

/// Generate an X25519 keypair for box encryption
pub fn generate_box_keypair() -> (BoxPrivKey, BoxPubKey) {
    let csprng = OsRng {};
    let secret = StaticSecret::new(csprng);
    let public = XPublicKey::from(&secret);
    (
        BoxPrivKey::X25519PrivKey(secret.to_bytes()),
        BoxPubKey::X25519PubKey(public.to_bytes()),
    )
}

/// Sign a byte slice
pub fn sign(author_privkey: PrivKey, author_pubkey: PubKey, content: &[u8]) -> Result<Signature, WeftError> {
    let kp = match (author_privkey, author_pubkey) {
        (PrivKey::Ed25519PrivKey(sk), PubKey::Ed25519PubKey(pk)) => [sk, pk].concat(),
    };
    let keypair = Keypair::from_bytes(kp.as_slice())?;
    let sig_bytes = keypair.sign(content).to_bytes();
    let mut it = sig_bytes.chunks_exact(32);
    let mut ss: Ed25519Sig = [[0; 32], [0; 32]];
    ss[0].copy_from_slice(it.next().unwrap());
    ss[1].copy_from_slice(it.next().unwrap());
    Ok(Signature::Ed25519Sig(ss))
}

/// Verify a signature over a byte slice
pub fn verify(content: &[u8], sig: Signature, author_pubkey: PubKey) -> Result<(), WeftError> {
    let pubkey = match author_pubkey {
        PubKey::Ed25519PubKey(pk) => pk,
    };
    let pk = PublicKey::from_bytes(&pubkey)?;
    let sig_bytes = match sig {
        Signature::Ed25519Sig(ss) => [ss[0], ss[1]].concat(),
    };
    let sig = DalekSig::from_bytes(&sig_bytes)?;
    Ok(pk.verify_strict(content, &sig)?)
}

/// Seal a cleartext to a recipient box key
///
/// Layout: `ephemeral_pubkey(32) ‖ nonce(12) ‖ ciphertext`
pub fn seal_box(recipient: &BoxPubKey, cleartext: &[u8]) -> Vec<u8> {
    let csprng = OsRng {};
    let ephemeral = StaticSecret::new(csprng);
    let ephemeral_pub = XPublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&XPublicKey::from(*recipient.slice()));
    let key = blake3::derive_key("Weft Box ChaCha20 key", shared.as_bytes());

    let mut nonce = [0u8; 12];
    getrandom::getrandom(&mut nonce).unwrap();

    let mut cipher = ChaCha20::new((&key).into(), (&nonce).into());
    let mut sealed = Vec::with_capacity(BOX_PREFIX_SIZE + cleartext.len());
    sealed.extend_from_slice(ephemeral_pub.as_bytes());
    sealed.extend_from_slice(&nonce);
    let mut ciphertext = Vec::from(cleartext);
    cipher.apply_keystream(ciphertext.as_mut_slice());
    sealed.extend_from_slice(&ciphertext);
    sealed
}

/// Open a sealed box with the recipient's private key
pub fn open_box(recipient: &BoxPrivKey, sealed: &[u8]) -> Result<Vec<u8>, WeftError> {
    if sealed.len() < BOX_PREFIX_SIZE {
        return Err(WeftError::DecryptionError);
    }
    let mut ephemeral_pub = [0u8; 32];
    ephemeral_pub.copy_from_slice(&sealed[0..32]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&sealed[32..BOX_PREFIX_SIZE]);

    let secret = StaticSecret::from(*recipient.slice());
    let shared = secret.diffie_hellman(&XPublicKey::from(ephemeral_pub));
    let key = blake3::derive_key("Weft Box ChaCha20 key", shared.as_bytes());

    let mut cipher = ChaCha20::new((&key).into(), (&nonce).into());
    let mut cleartext = Vec::from(&sealed[BOX_PREFIX_SIZE..]);
    cipher.apply_keystream(cleartext.as_mut_slice());
    Ok(cleartext)
}

/// Current time in milliseconds since the UNIX epoch
pub fn now_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// BLAKE3 hash over the serialized public key,
/// the peer's address in message `to` lists and its ring position
pub fn peer_hash(peer: &PeerId) -> PeerHash {
    let ser = serde_bare::to_vec(peer).unwrap();
    Digest::Blake3Digest32(*blake3::hash(ser.as_slice()).as_bytes())
}

/// Map a digest to a uniform number on the unit interval
pub fn hash_to_unit(digest: &Digest) -> f64 {
    let mut eight = [0u8; 8];
    eight.copy_from_slice(&digest.slice()[0..8]);
    u64::from_be_bytes(eight) as f64 / u64::MAX as f64
}

/// Derive a fresh group ID for a root entry
pub fn fresh_gid() -> GroupId {
    let mut random_buf = [0u8; 32];
    getrandom::getrandom(&mut random_buf).unwrap();
    Digest::Blake3Digest32(*blake3::hash(&random_buf).as_bytes())
}

#[cfg(test)]
mod test {
    use crate::utils::*;

    #[test]
    pub fn test_sign_verify() {
        let (priv_key, pub_key) = generate_keypair();
        let content = [77u8; 64].to_vec();
        let sig = sign(priv_key, pub_key, &content).unwrap();
        verify(&content, sig, pub_key).expect("Invalid signature");

        let (_, other_pub) = generate_keypair();
        assert!(verify(&content, sig, other_pub).is_err());
    }

    #[test]
    pub fn test_seal_open() {
        let (box_priv, box_pub) = generate_box_keypair();
        let cleartext = b"sealed for your eyes only".to_vec();
        let sealed = seal_box(&box_pub, &cleartext);
        assert_ne!(&sealed[BOX_PREFIX_SIZE..], cleartext.as_slice());
        let opened = open_box(&box_priv, &sealed).unwrap();
        assert_eq!(opened, cleartext);

        let (other_priv, _) = generate_box_keypair();
        let garbled = open_box(&other_priv, &sealed).unwrap();
        assert_ne!(garbled, cleartext);
    }

    #[test]
    pub fn test_hash_to_unit() {
        let unit = hash_to_unit(&fresh_gid());
        assert!((0.0..=1.0).contains(&unit));
        let zero = hash_to_unit(&Digest::Blake3Digest32([0; 32]));
        assert_eq!(zero, 0.0);
    }
}
