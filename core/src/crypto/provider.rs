// Crypto provider: the fixed input/output contract for key agreement and AEAD
//
// Handshake steps (AES-128-CCM, 4-byte tag, 7-byte nonce, keyed by kAuth):
//   challenge response   r1(16) ‖ r2(16) ‖ pin(4)       36 -> 40 bytes
//   session info         60 bytes -> r2 ‖ r1 ‖ key(16) ‖ iv(8)
//
// Session traffic uses AES-128-CCM with a 13-byte nonce and the same 4-byte tag.
// The vendor's key agreement is not reproduced: the application ephemeral key
// and kAuth are supplied by the caller.

use super::session::{SessionKeys, IV_SIZE, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use super::CryptoError;
use aes::Aes128;
use ccm::aead::consts::{U13, U4, U7};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::Ccm;
use std::fmt;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const EPHEMERAL_KEY_SIZE: usize = 65;
pub const HANDSHAKE_NONCE_SIZE: usize = 7;
pub const CHALLENGE_RANDOM_SIZE: usize = 16;
pub const BLE_PIN_SIZE: usize = 4;
pub const CHALLENGE_INPUT_SIZE: usize = 2 * CHALLENGE_RANDOM_SIZE + BLE_PIN_SIZE;
pub const CHALLENGE_RESPONSE_SIZE: usize = CHALLENGE_INPUT_SIZE + TAG_SIZE;
pub const SESSION_INFO_BLOCK_SIZE: usize = SESSION_INFO_PLAINTEXT_SIZE + TAG_SIZE;

const SESSION_INFO_PLAINTEXT_SIZE: usize = 2 * CHALLENGE_RANDOM_SIZE + KEY_SIZE + IV_SIZE;

type HandshakeCcm = Ccm<Aes128, U4, U7>;
type SessionCcm = Ccm<Aes128, U4, U13>;

/// Values recovered from the decrypted session-info block
#[derive(Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Echo of the application's random
    pub r2: [u8; CHALLENGE_RANDOM_SIZE],
    /// Echo of the patch's challenge random
    pub r1: [u8; CHALLENGE_RANDOM_SIZE],
    pub keys: SessionKeys,
}

impl SessionInfo {
    /// Parse the 56-byte plaintext
    pub fn from_plaintext(plaintext: &[u8]) -> Result<Self, CryptoError> {
        if plaintext.len() != SESSION_INFO_PLAINTEXT_SIZE {
            return Err(CryptoError::InvalidLength {
                what: "session info",
                expected: SESSION_INFO_PLAINTEXT_SIZE,
                got: plaintext.len(),
            });
        }

        let mut r2 = [0u8; CHALLENGE_RANDOM_SIZE];
        let mut r1 = [0u8; CHALLENGE_RANDOM_SIZE];
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        r2.copy_from_slice(&plaintext[0..16]);
        r1.copy_from_slice(&plaintext[16..32]);
        key.copy_from_slice(&plaintext[32..48]);
        iv.copy_from_slice(&plaintext[48..56]);
        let keys = SessionKeys::new(key, iv);
        key.zeroize();
        iv.zeroize();
        Ok(Self { r2, r1, keys })
    }

    /// Serialize back to the 56-byte plaintext layout
    pub fn to_plaintext(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SESSION_INFO_PLAINTEXT_SIZE);
        out.extend_from_slice(&self.r2);
        out.extend_from_slice(&self.r1);
        out.extend_from_slice(self.keys.key());
        out.extend_from_slice(self.keys.iv());
        out
    }
}

impl fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInfo")
            .field("r2", &hex::encode(self.r2))
            .field("r1", &hex::encode(self.r1))
            .field("keys", &self.keys)
            .finish()
    }
}

/// Key agreement and AEAD operations the handshake and session depend on
///
/// Implementations own whatever native key handles they need; the engine
/// only ever sees the byte-level contract below.
pub trait CryptoProvider {
    /// The 65-byte application ephemeral public key, given the patch certificate
    fn application_ephemeral(
        &mut self,
        patch_certificate: &[u8],
    ) -> Result<[u8; EPHEMERAL_KEY_SIZE], CryptoError>;

    /// Record the patch's 65-byte ephemeral public key
    fn accept_patch_ephemeral(
        &mut self,
        patch_ephemeral: &[u8; EPHEMERAL_KEY_SIZE],
    ) -> Result<(), CryptoError>;

    /// Seal `r1 ‖ r2 ‖ pin` into the 40-byte challenge response
    fn challenge_response(
        &mut self,
        nonce1: &[u8; HANDSHAKE_NONCE_SIZE],
        input: &[u8; CHALLENGE_INPUT_SIZE],
    ) -> Result<[u8; CHALLENGE_RESPONSE_SIZE], CryptoError>;

    /// Open the 60-byte session-info block
    fn open_session_info(
        &mut self,
        block: &[u8; SESSION_INFO_BLOCK_SIZE],
        nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    ) -> Result<SessionInfo, CryptoError>;

    /// Session AEAD seal: returns `ciphertext ‖ tag`
    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Session AEAD open of `ciphertext ‖ tag`
    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// AES-128-CCM seal with a 7-byte nonce
pub(crate) fn handshake_seal(
    k_auth: &[u8; KEY_SIZE],
    nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = HandshakeCcm::new(GenericArray::from_slice(k_auth));
    cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Cipher(e.to_string()))
}

/// AES-128-CCM open with a 7-byte nonce
pub(crate) fn handshake_open(
    k_auth: &[u8; KEY_SIZE],
    nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = HandshakeCcm::new(GenericArray::from_slice(k_auth));
    cipher
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::HandshakeAuthenticationFailed)
}

/// Default provider: AES-128-CCM throughout
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CcmProvider {
    k_auth: [u8; KEY_SIZE],
    ephemeral: Option<[u8; EPHEMERAL_KEY_SIZE]>,
    patch_ephemeral: Option<[u8; EPHEMERAL_KEY_SIZE]>,
}

impl CcmProvider {
    /// Provider keyed by an exported authentication key; supports reconnection only
    pub fn new(k_auth: [u8; KEY_SIZE]) -> Self {
        Self {
            k_auth,
            ephemeral: None,
            patch_ephemeral: None,
        }
    }

    /// Supply the application ephemeral key, enabling full pairing
    pub fn with_ephemeral(mut self, ephemeral: [u8; EPHEMERAL_KEY_SIZE]) -> Self {
        self.ephemeral = Some(ephemeral);
        self
    }

    /// Patch ephemeral key received during pairing
    pub fn patch_ephemeral(&self) -> Option<&[u8; EPHEMERAL_KEY_SIZE]> {
        self.patch_ephemeral.as_ref()
    }
}

impl fmt::Debug for CcmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CcmProvider")
            .field("k_auth", &"[REDACTED]")
            .field("ephemeral", &self.ephemeral.is_some())
            .field("patch_ephemeral", &self.patch_ephemeral.is_some())
            .finish()
    }
}

impl CryptoProvider for CcmProvider {
    fn application_ephemeral(
        &mut self,
        patch_certificate: &[u8],
    ) -> Result<[u8; EPHEMERAL_KEY_SIZE], CryptoError> {
        debug!(
            "Patch certificate received ({} bytes)",
            patch_certificate.len()
        );
        self.ephemeral
            .ok_or(CryptoError::Unsupported("no application ephemeral key configured"))
    }

    fn accept_patch_ephemeral(
        &mut self,
        patch_ephemeral: &[u8; EPHEMERAL_KEY_SIZE],
    ) -> Result<(), CryptoError> {
        self.patch_ephemeral = Some(*patch_ephemeral);
        Ok(())
    }

    fn challenge_response(
        &mut self,
        nonce1: &[u8; HANDSHAKE_NONCE_SIZE],
        input: &[u8; CHALLENGE_INPUT_SIZE],
    ) -> Result<[u8; CHALLENGE_RESPONSE_SIZE], CryptoError> {
        let sealed = handshake_seal(&self.k_auth, nonce1, input)?;
        <[u8; CHALLENGE_RESPONSE_SIZE]>::try_from(sealed.as_slice()).map_err(|_| {
            CryptoError::InvalidLength {
                what: "challenge response",
                expected: CHALLENGE_RESPONSE_SIZE,
                got: sealed.len(),
            }
        })
    }

    fn open_session_info(
        &mut self,
        block: &[u8; SESSION_INFO_BLOCK_SIZE],
        nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    ) -> Result<SessionInfo, CryptoError> {
        let mut plaintext = handshake_open(&self.k_auth, nonce, block)?;
        let info = SessionInfo::from_plaintext(&plaintext);
        plaintext.zeroize();
        info
    }

    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = SessionCcm::new(GenericArray::from_slice(key));
        cipher
            .encrypt(GenericArray::from_slice(nonce), plaintext)
            .map_err(|e| CryptoError::Cipher(e.to_string()))
    }

    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = SessionCcm::new(GenericArray::from_slice(key));
        cipher
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|e| CryptoError::Cipher(e.to_string()))
    }
}
