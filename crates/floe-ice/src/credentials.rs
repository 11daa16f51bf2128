//! ICE credentials: random ufrag/password generation and a password wrapper
//! that zeroes its storage on drop.

use std::fmt;

use rand::Rng;
use zeroize::Zeroizing;

/// Length of a generated ufrag (RFC 8445 Section 5.3 minimum is 4).
pub const UFRAG_LEN: usize = 4;

/// Length of a generated password (RFC 8445 Section 5.3 minimum is 22).
pub const PASSWORD_LEN: usize = 22;

/// Random printable credential: `a-zA-Z0-9`.
pub fn random_credential(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// An ICE or TURN password.
///
/// Every copy zeroes its backing storage on drop. The bytes leave the
/// wrapper only through [`Password::key`], whose result feeds the HMAC
/// context.
#[derive(Clone)]
pub struct Password(Zeroizing<String>);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn generate() -> Self {
        Self::new(random_credential(PASSWORD_LEN))
    }

    /// Short-term credential key for MESSAGE-INTEGRITY.
    pub fn key(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// The cleartext, needed when handing credentials to the signalling
    /// layer.
    pub fn reveal(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_credential_alphabet_and_length() {
        let cred = random_credential(22);
        assert_eq!(cred.len(), 22);
        assert!(cred.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_credentials_differ() {
        assert_ne!(random_credential(22), random_credential(22));
    }

    #[test]
    fn test_password_debug_is_redacted() {
        let p = Password::new("super secret");
        assert_eq!(format!("{p:?}"), "Password(..)");
        assert_eq!(p.key(), b"super secret".to_vec());
    }
}
