//! Secure in-memory holder for private key material
//!
//! Keys are kept as PKCS#8 DER inside a [`secrecy::Secret`], zeroized on drop and
//! redacted from debug output. An OpenSSL `PKey` is only reconstructed for the
//! duration of a single operation via [`SecureKey::with_pkey`].

use std::fmt;

use openssl::pkey::{PKey, Private};
use secrecy::{ExposeSecret, Secret, Zeroize};

use crate::error::CryptoError;

/// PKCS#8 DER bytes that zeroize on drop
#[derive(Clone)]
struct KeyBytes {
    der_bytes: Vec<u8>,
}

impl Zeroize for KeyBytes {
    fn zeroize(&mut self) {
        self.der_bytes.zeroize();
    }
}

pub struct SecureKey {
    private_key: Secret<KeyBytes>,
}

impl SecureKey {
    /// Take ownership of PKCS#8 DER key bytes
    pub fn from_pkcs8_der(der_bytes: Vec<u8>) -> Self {
        Self {
            private_key: Secret::new(KeyBytes { der_bytes }),
        }
    }

    /// Capture an OpenSSL key as PKCS#8 DER
    pub fn from_pkey(key: &PKey<Private>) -> Result<Self, CryptoError> {
        let der_bytes = key
            .private_key_to_pkcs8()
            .map_err(|e| CryptoError::new("encode private key", e))?;
        Ok(Self::from_pkcs8_der(der_bytes))
    }

    /// Run `f` with a temporarily reconstructed key; the `PKey` is dropped afterwards
    pub fn with_pkey<T>(
        &self,
        f: impl FnOnce(&PKey<Private>) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let der_bytes = &self.private_key.expose_secret().der_bytes;
        let pkey = PKey::private_key_from_pkcs8(der_bytes)
            .map_err(|e| CryptoError::new("load private key", e))?;
        f(&pkey)
    }

    /// Raw PKCS#8 DER, for persisting to a key store
    pub fn expose_pkcs8_der(&self) -> &[u8] {
        &self.private_key.expose_secret().der_bytes
    }
}

impl Clone for SecureKey {
    fn clone(&self) -> Self {
        Self::from_pkcs8_der(self.private_key.expose_secret().der_bytes.clone())
    }
}

impl fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureKey")
            .field("private_key", &"<securely stored>")
            .finish()
    }
}
