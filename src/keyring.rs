//! The password-protected key store.  Its one current job is holding the
//! key that decrypts replies sent through our reply blocks.

use crate::crypto::{ctr_crypt, sha1, DIGEST_LEN};
use crate::prelude::*;
use crate::util::{atomic_write, create_private_dir};
use rand::{CryptoRng, RngCore};
use std::fs;

const KEY_MAGIC: &[u8; 8] = b"SURBKEY0";
const SALT_LEN: usize = 8;
pub const SURB_KEY_LEN: usize = 20;

pub type SurbKey = [u8; SURB_KEY_LEN];

/// How the keyring asks the user for passwords.  The terminal
/// implementation lives here; tests substitute a scripted one.
pub trait PasswordPrompt {
    fn get_password(&mut self, which: &str) -> Result<String>;
    fn get_new_password(&mut self, which: &str) -> Result<String>;
}

/// Prompts on the controlling terminal, with echo disabled.
pub struct TermPrompt;

impl PasswordPrompt for TermPrompt {
    fn get_password(&mut self, which: &str) -> Result<String> {
        let term = console::Term::stderr();
        term.write_str(&format!("Enter password for {}: ", which))?;
        Ok(term.read_secure_line()?)
    }

    fn get_new_password(&mut self, which: &str) -> Result<String> {
        let term = console::Term::stderr();
        loop {
            term.write_str(&format!("Enter new password for {}: ", which))?;
            let first = term.read_secure_line()?;
            term.write_str("Verify password: ")?;
            let second = term.read_secure_line()?;
            if first == second {
                return Ok(first);
            }
            term.write_line("Passwords do not match.")?;
        }
    }
}

pub struct ClientKeyring {
    key_dir: PathBuf,
    surb_key: Option<SurbKey>,
}

impl ClientKeyring {
    pub fn new(key_dir: &Path) -> Result<ClientKeyring> {
        create_private_dir(key_dir)?;
        Ok(ClientKeyring {
            key_dir: key_dir.to_path_buf(),
            surb_key: None,
        })
    }

    /// The key our reply blocks are built around, or None if we've never
    /// generated one.  Loaded once per process.
    pub fn get_surb_key(
        &mut self,
        prompt: &mut dyn PasswordPrompt,
    ) -> Result<Option<SurbKey>> {
        if let Some(key) = self.surb_key {
            return Ok(Some(key));
        }
        let path = self.key_dir.join("SURBKey");
        if !path.exists() {
            return Ok(None);
        }
        let key = load_key(&path, prompt, "reply block key")?;
        self.surb_key = Some(key);
        Ok(Some(key))
    }

    /// Like `get_surb_key`, but generates (and stores) a fresh key when
    /// none exists yet.
    pub fn get_or_create_surb_key<R: RngCore + CryptoRng>(
        &mut self,
        prompt: &mut dyn PasswordPrompt,
        rng: &mut R,
    ) -> Result<SurbKey> {
        if let Some(key) = self.get_surb_key(prompt)? {
            return Ok(key);
        }
        warn!("No reply block key found; generating.");
        let mut key = [0u8; SURB_KEY_LEN];
        rng.fill_bytes(&mut key);
        let password = prompt.get_new_password("reply block key")?;
        save_key_file(
            &self.key_dir.join("SURBKey"),
            &key,
            password.as_bytes(),
            rng,
        )?;
        self.surb_key = Some(key);
        Ok(key)
    }
}

fn load_key(
    path: &Path,
    prompt: &mut dyn PasswordPrompt,
    which: &str,
) -> Result<SurbKey> {
    let bytes = fs::read(path)?;
    // Check the file shape once; only the password can change between
    // prompt attempts.
    let (salt, ciphertext) = check_key_file(&bytes)?;
    loop {
        let password = prompt.get_password(which)?;
        match decrypt_key_file(salt, ciphertext, password.as_bytes()) {
            Ok(key) => return Ok(key),
            Err(e)
                if matches!(
                    e.downcast_ref::<MixError>(),
                    Some(MixError::WrongPassword)
                ) =>
            {
                error!("Cannot load key: {}", e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Layout: magic(8) | salt(8) | CTR(key | SHA-1(key | salt | magic)),
/// with the wrapping key SHA-1(salt | password | salt)[..16].
fn check_key_file(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let rest = bytes
        .strip_prefix(KEY_MAGIC.as_slice())
        .ok_or(MixError::BadKeyMagic)?;
    if rest.len() < SALT_LEN + SURB_KEY_LEN + DIGEST_LEN {
        return Err(MixError::KeyFileTruncated.into());
    }
    Ok(rest.split_at(SALT_LEN))
}

fn wrapping_key(salt: &[u8], password: &[u8]) -> [u8; 16] {
    crate::crypto::derive_key(&[salt, password, salt])
}

fn decrypt_key_file(
    salt: &[u8],
    ciphertext: &[u8],
    password: &[u8],
) -> Result<SurbKey> {
    let mut body = ciphertext.to_vec();
    ctr_crypt(&wrapping_key(salt, password), &mut body);
    let (data, mac) = body.split_at(body.len() - DIGEST_LEN);
    if mac != sha1(&[data, salt, KEY_MAGIC]) {
        return Err(MixError::WrongPassword.into());
    }
    data.try_into()
        .map_err(|_| MixError::KeyFileTruncated.into())
}

fn save_key_file<R: RngCore + CryptoRng>(
    path: &Path,
    key: &SurbKey,
    password: &[u8],
    rng: &mut R,
) -> Result<()> {
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut body = key.to_vec();
    body.extend_from_slice(&sha1(&[key, &salt, KEY_MAGIC]));
    ctr_crypt(&wrapping_key(&salt, password), &mut body);

    let mut out = KEY_MAGIC.to_vec();
    out.extend_from_slice(&salt);
    out.extend_from_slice(&body);
    atomic_write(path, &out)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
