//! Signed wire envelope carrying ratchet metadata and ciphertext.
//!
//! Fixed field order, each field independently length-determined:
//!
//! ```text
//! magicBytes          5 B   constant "DICES"
//! version             1 B   0x01
//! keyId               8 B   recipient pre-key bundle id
//! dhPublicKey        32 B   sender's current ratchet DH key
//! messageNumber      var    LEB128
//! previousChainLength var   LEB128
//! kemCiphertext     1+[1568] presence flag, ML-KEM-1024 ciphertext
//! cipherData        24+var+n nonce, ciphertext length, ciphertext+tag
//! rSignature         65 B   compact signature + recovery selector
//! ```
//!
//! The signed hash covers every field before `rSignature`. Authentication
//! is inseparable from identity: the sender's public key is *recovered*
//! from the signature over that hash and the node id is derived from the
//! recovered key, so there is no separate signer field to forge.

use bytes::BufMut;
use dices_crypto::{
    CipherData, KEM_CIPHERTEXT_SIZE, KemCiphertext, KeyId, Keys, NodeId, RSignature,
};
use sha2::{Digest, Sha256};

use crate::{
    errors::{ProtocolError, Result},
    varint::{get_varint, put_varint},
};

/// Protocol magic bytes ("DICES")
pub const MAGIC_BYTES: [u8; 5] = [0x44, 0x49, 0x43, 0x45, 0x53];

/// Supported protocol version
pub const VERSION: u8 = 0x01;

/// XChaCha20 nonce size carried in `cipherData`
const NONCE_SIZE: usize = dices_crypto::NONCE_SIZE;

/// Unsigned envelope content, in wire order.
///
/// Everything the signature covers. [`Envelope::create`] hashes and signs
/// these fields; decoding recomputes the same hash for recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeFields {
    /// Identifies which of the recipient's pre-key bundles to use
    pub key_id: KeyId,
    /// Sender's current ratchet DH public key
    pub dh_public_key: [u8; 32],
    /// Position in the sender's current sending chain
    pub message_number: u64,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u64,
    /// Present only on session-establishing or rekeying messages
    pub kem_ciphertext: Option<Box<KemCiphertext>>,
    /// AEAD-protected payload
    pub cipher_data: CipherData,
}

impl EnvelopeFields {
    /// Serialize the signed prefix of the envelope.
    fn put_signed(&self, dst: &mut impl BufMut) {
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(VERSION);
        dst.put_slice(&self.key_id);
        dst.put_slice(&self.dh_public_key);
        put_varint(dst, self.message_number);
        put_varint(dst, self.previous_chain_length);
        match &self.kem_ciphertext {
            Some(ciphertext) => {
                dst.put_u8(1);
                dst.put_slice(ciphertext.as_slice());
            },
            None => dst.put_u8(0),
        }
        dst.put_slice(&self.cipher_data.nonce);
        put_varint(dst, self.cipher_data.data.len() as u64);
        dst.put_slice(&self.cipher_data.data);
    }

    /// Hash of the signed prefix.
    pub fn hash(&self) -> [u8; 32] {
        let mut prefix = Vec::with_capacity(self.signed_len());
        self.put_signed(&mut prefix);
        Sha256::digest(&prefix).into()
    }

    fn signed_len(&self) -> usize {
        let kem_len = self.kem_ciphertext.as_ref().map_or(0, |_| KEM_CIPHERTEXT_SIZE);
        MAGIC_BYTES.len()
            + 1
            + self.key_id.len()
            + self.dh_public_key.len()
            + 10 // varint upper bounds
            + 10
            + 1
            + kem_len
            + NONCE_SIZE
            + 10
            + self.cipher_data.data.len()
    }
}

/// A signed, versioned wire envelope.
///
/// Immutable once constructed: the signature binds every other field, so
/// mutation would require re-signing through [`Envelope::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    fields: EnvelopeFields,
    r_signature: RSignature,
}

impl Envelope {
    /// Sign `fields` with the local identity and assemble the envelope.
    ///
    /// # Errors
    ///
    /// - `Signature` if signing fails (effectively never for a valid key)
    pub fn create(fields: EnvelopeFields, keys: &Keys) -> Result<Self> {
        let r_signature = keys.sign_recoverable(&fields.hash())?;
        Ok(Self { fields, r_signature })
    }

    /// Recipient pre-key bundle id.
    pub fn key_id(&self) -> &KeyId {
        &self.fields.key_id
    }

    /// Sender's current ratchet DH public key.
    pub fn dh_public_key(&self) -> &[u8; 32] {
        &self.fields.dh_public_key
    }

    /// Position in the sender's sending chain.
    pub fn message_number(&self) -> u64 {
        self.fields.message_number
    }

    /// Length of the sender's previous sending chain.
    pub fn previous_chain_length(&self) -> u64 {
        self.fields.previous_chain_length
    }

    /// ML-KEM ciphertext, present on session-establishing and rekeying
    /// messages.
    pub fn kem_ciphertext(&self) -> Option<&KemCiphertext> {
        self.fields.kem_ciphertext.as_deref()
    }

    /// AEAD-protected payload.
    pub fn cipher_data(&self) -> &CipherData {
        &self.fields.cipher_data
    }

    /// Recoverable signature over the envelope hash.
    pub fn r_signature(&self) -> &RSignature {
        &self.r_signature
    }

    /// Hash of all fields preceding the signature.
    pub fn hash(&self) -> [u8; 32] {
        self.fields.hash()
    }

    /// Recover the sender's compressed public key from the signature.
    ///
    /// # Errors
    ///
    /// - `Signature` if the signature is malformed or recovery fails
    pub fn recover_public_key(&self) -> Result<[u8; 33]> {
        Ok(self.r_signature.recover(&self.hash())?)
    }

    /// Recover the sender's node id from the signature.
    ///
    /// Flipping any bit of any signed field changes the recovered identity,
    /// so a successfully recovered id authenticates the entire envelope.
    ///
    /// # Errors
    ///
    /// - `Signature` if the signature is malformed or recovery fails
    pub fn recover_node_id(&self) -> Result<NodeId> {
        Ok(self.r_signature.recover_node_id(&self.hash())?)
    }

    /// Encode the envelope into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        self.fields.put_signed(dst);
        dst.put_slice(&self.r_signature.signature);
        dst.put_u8(self.r_signature.recovery_id);
    }

    /// Encode the envelope into a fresh buffer.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.fields.signed_len() + 65);
        self.encode(&mut buf);
        buf
    }

    /// Decode an envelope from wire bytes.
    ///
    /// Validation is cheapest-first: magic and version are checked before
    /// anything is allocated. Trailing bytes after the signature are
    /// ignored; datagram transports may pad.
    ///
    /// # Errors
    ///
    /// - `InvalidMagic` / `UnsupportedVersion` on foreign or future buffers
    /// - `Truncated` / `VarIntOverflow` / `InvalidPresenceFlag` on
    ///   malformed field content
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        let magic = reader.take(MAGIC_BYTES.len(), "magicBytes")?;
        if magic != MAGIC_BYTES {
            return Err(ProtocolError::InvalidMagic);
        }
        let version = reader.take_u8("version")?;
        if version != VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(reader.take(8, "keyId")?);

        let mut dh_public_key = [0u8; 32];
        dh_public_key.copy_from_slice(reader.take(32, "dhPublicKey")?);

        let message_number = reader.take_varint("messageNumber")?;
        let previous_chain_length = reader.take_varint("previousChainLength")?;

        let kem_ciphertext = match reader.take_u8("kemCiphertext")? {
            0 => None,
            1 => {
                let raw = reader.take(KEM_CIPHERTEXT_SIZE, "kemCiphertext")?;
                let mut ciphertext = Box::new([0u8; KEM_CIPHERTEXT_SIZE]);
                ciphertext.copy_from_slice(raw);
                Some(ciphertext)
            },
            value => {
                return Err(ProtocolError::InvalidPresenceFlag { field: "kemCiphertext", value });
            },
        };

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(reader.take(NONCE_SIZE, "cipherData.nonce")?);
        let data_len = reader.take_varint("cipherData.length")? as usize;
        let data = reader.take(data_len, "cipherData.data")?.to_vec();

        let mut signature = [0u8; 64];
        signature.copy_from_slice(reader.take(64, "rSignature")?);
        let recovery_id = reader.take_u8("rSignature.recoveryId")?;

        Ok(Self {
            fields: EnvelopeFields {
                key_id,
                dh_public_key,
                message_number,
                previous_chain_length,
                kem_ciphertext,
                cipher_data: CipherData { nonce, data },
            },
            r_signature: RSignature { signature, recovery_id },
        })
    }
}

/// Quick transport-boundary check: does `buffer` carry our magic bytes and
/// a supported version?
///
/// Buffers failing this check are dropped silently rather than decoded, so
/// protocol-confusion probes never produce an application-visible error.
pub fn is_supported_buffer(buffer: &[u8]) -> bool {
    buffer.len() > MAGIC_BYTES.len()
        && buffer[..MAGIC_BYTES.len()] == MAGIC_BYTES
        && buffer[MAGIC_BYTES.len()] == VERSION
}

/// Cursor over an inbound buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        // INVARIANT: pos never exceeds buf.len(); take() only advances
        // after a successful bounds check.
        &self.buf[self.pos.min(self.buf.len())..]
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if remaining.len() < len {
            return Err(ProtocolError::Truncated {
                field,
                needed: len,
                available: remaining.len(),
            });
        }
        self.pos += len;
        Ok(&remaining[..len])
    }

    fn take_u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn take_varint(&mut self, field: &'static str) -> Result<u64> {
        let (value, consumed) = get_varint(self.remaining(), field)?;
        self.pos += consumed;
        Ok(value)
    }
}
