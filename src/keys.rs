//! Ephemeral SSH key material for one run.
//!
//! When the caller supplies neither key half, a fresh RSA-2048 pair is
//! generated in memory for that run only; nothing is ever written to disk.

use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::rand_core::OsRng;
use ssh_key::{LineEnding, PrivateKey};
use thiserror::Error;

const KEY_BITS: usize = 2048;
const KEY_COMMENT: &str = "caravel";

/// OpenSSH-encoded key pair used for one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPair {
    /// Public half in authorized-keys form.
    pub public_key: String,
    /// Private half in OpenSSH PEM form.
    pub private_key: String,
}

impl KeyPair {
    /// Generates a fresh RSA-2048 pair.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when key generation or encoding fails.
    pub fn generate() -> Result<Self, KeyError> {
        let keypair = RsaKeypair::random(&mut OsRng, KEY_BITS)?;
        let private = PrivateKey::new(KeypairData::Rsa(keypair), KEY_COMMENT)?;
        let private_key = private.to_openssh(LineEnding::LF)?.to_string();
        let public_key = private.public_key().to_openssh()?;
        Ok(Self {
            public_key,
            private_key,
        })
    }

}

/// Fills in missing key material: a fresh pair when neither half is
/// supplied, or the public half derived from a supplied private key.
/// Supplied halves are left untouched.
///
/// # Errors
///
/// Returns [`KeyError`] when generation fails or the supplied private key
/// cannot be parsed.
pub fn ensure_key_material(config: &mut crate::config::RunConfig) -> Result<(), KeyError> {
    match (config.public_key.is_empty(), config.private_key.is_empty()) {
        (true, true) => {
            let pair = KeyPair::generate()?;
            config.public_key = pair.public_key;
            config.private_key = pair.private_key;
        }
        (true, false) => {
            let private = PrivateKey::from_openssh(&config.private_key)?;
            config.public_key = private.public_key().to_openssh()?;
        }
        _ => {}
    }
    Ok(())
}

/// Errors raised while generating or encoding key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Wraps failures from the underlying key library.
    #[error("key material error: {0}")]
    Encoding(#[from] ssh_key::Error),
}
