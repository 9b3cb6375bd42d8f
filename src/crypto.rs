//! Thin wrappers around the primitives the rest of the client needs: SHA-1
//! (the Type III protocol is specified in terms of it), AES-128 in counter
//! mode, and a CSPRNG that can be redirected at a file per the
//! Host.EntropySource option.

use crate::prelude::*;
use aes::cipher::{KeyIvInit, StreamCipher};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use ring::digest;
use std::fs::File;

pub const DIGEST_LEN: usize = 20;
pub type Digest = [u8; DIGEST_LEN];

pub fn sha1(parts: &[&[u8]]) -> Digest {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    for p in parts {
        ctx.update(p);
    }
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// Uppercase hex SHA-1 of a public key's bytes.
pub fn fingerprint(identity: &[u8]) -> String {
    data_encoding::HEXUPPER.encode(&sha1(&[identity]))
}

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Counter-mode streams are symmetric: this both encrypts and decrypts.
/// The counter starts at zero, so a key must never be reused.
pub fn ctr_crypt(key: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), &[0u8; 16].into());
    cipher.apply_keystream(data);
}

/// Derive a 16-byte cipher key by hashing the given parts.
pub fn derive_key(parts: &[&[u8]]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&sha1(parts)[..16]);
    key
}

/// The client's source of randomness: the OS CSPRNG by default, or a file
/// (e.g. a hardware RNG device) when Host.EntropySource is set.
pub enum ClientRng {
    Os(OsRng),
    File(File),
}

impl ClientRng {
    pub fn from_config(entropy_source: Option<&Path>) -> Result<ClientRng> {
        match entropy_source {
            None => Ok(ClientRng::Os(OsRng)),
            Some(path) => {
                let f = File::open(path).wrap_err_with(|| {
                    format!("couldn't open entropy source {}", path.display())
                })?;
                Ok(ClientRng::File(f))
            }
        }
    }
}

impl RngCore for ClientRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if let Err(e) = self.try_fill_bytes(dest) {
            panic!("entropy source failed: {}", e);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        match self {
            ClientRng::Os(rng) => rng.try_fill_bytes(dest),
            ClientRng::File(f) => f.read_exact(dest).map_err(rand::Error::new),
        }
    }
}

impl CryptoRng for ClientRng {}
