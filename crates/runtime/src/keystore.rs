//! Password-protected account keys
//!
//! One file per account, named by its address. The file holds the 32-byte
//! secret encrypted with age's passphrase recipient (scrypt KDF, salt and
//! nonce embedded in the envelope).

use crate::identity::{Address, Identity};
use age::{Decryptor, Encryptor};
use secrecy::Secret;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Shortest password accepted for an account
pub const MIN_PASSWORD_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("Password must be at least {min} bytes")]
    WeakPassword { min: usize },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("No key stored for {0}")]
    NotFound(Address),

    #[error("Key file for {0} holds a different key")]
    CorruptKey(Address),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn check_password(password: &str) -> Result<(), KeystoreError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(KeystoreError::WeakPassword {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

fn encrypt_secret(secret: &[u8], password: &str) -> Result<Vec<u8>, KeystoreError> {
    let encryptor = Encryptor::with_user_passphrase(Secret::new(password.to_string()));

    let mut output = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut output)
        .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
    writer
        .write_all(secret)
        .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| KeystoreError::Encryption(e.to_string()))?;

    Ok(output)
}

fn decrypt_secret(ciphertext: &[u8], password: &str) -> Result<Vec<u8>, KeystoreError> {
    let decryptor = match Decryptor::new(ciphertext) {
        Ok(Decryptor::Passphrase(d)) => d,
        Ok(_) => {
            return Err(KeystoreError::Decryption(
                "expected passphrase encryption".to_string(),
            ))
        }
        Err(e) => return Err(KeystoreError::Decryption(e.to_string())),
    };

    let mut reader = decryptor
        .decrypt(&Secret::new(password.to_string()), None)
        .map_err(|e| match e {
            age::DecryptError::DecryptionFailed => KeystoreError::InvalidPassword,
            other => KeystoreError::Decryption(other.to_string()),
        })?;

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
    Ok(plaintext)
}

/// Directory of encrypted account keys
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, KeystoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_path(&self, address: &Address) -> PathBuf {
        self.dir.join(address.to_hex())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.key_path(address).exists()
    }

    /// Generate a new identity and store it under `password`
    pub fn create(&self, password: &str) -> Result<Identity, KeystoreError> {
        check_password(password)?;
        let identity = Identity::generate()?;
        self.store(&identity, password)?;
        Ok(identity)
    }

    pub fn store(&self, identity: &Identity, password: &str) -> Result<PathBuf, KeystoreError> {
        check_password(password)?;
        let mut secret = identity.secret_bytes();
        let ciphertext = encrypt_secret(&secret, password);
        secret.fill(0);

        let path = self.key_path(&identity.address());
        fs::write(&path, ciphertext?)?;

        tracing::info!("Stored key for {} at {:?}", identity.address(), path);
        Ok(path)
    }

    pub fn load(&self, address: &Address, password: &str) -> Result<Identity, KeystoreError> {
        let path = self.key_path(address);
        if !path.exists() {
            return Err(KeystoreError::NotFound(*address));
        }

        let mut plaintext = decrypt_secret(&fs::read(&path)?, password)?;
        let secret: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::CorruptKey(*address))?;
        plaintext.fill(0);

        let identity = Identity::from_secret_bytes(&secret);
        if &identity.address() != address {
            return Err(KeystoreError::CorruptKey(*address));
        }
        Ok(identity)
    }
}
