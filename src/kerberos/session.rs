use picky_krb::constants::key_usages::{ACCEPTOR_SEAL, INITIATOR_SEAL};
use picky_krb::crypto::CipherSuite;

use super::DEFAULT_ENCRYPTION_TYPE;
use crate::Secret;

/// Keys and sequence numbers negotiated by the handshake.
#[derive(Debug, Clone, Default)]
pub struct SessionMaterial {
    pub enctype: Option<CipherSuite>,
    /// Ticket session key.
    pub session_key: Option<Secret<Vec<u8>>>,
    /// Subkey we put into our authenticator or AP-REP.
    pub local_subkey: Option<Secret<Vec<u8>>>,
    /// Subkey the peer put into its authenticator or AP-REP.
    pub remote_subkey: Option<Secret<Vec<u8>>>,
    pub local_seq: u32,
    pub remote_seq: u32,
    /// [RFC 4121](https://www.rfc-editor.org/rfc/rfc4121) per-message tokens are used with this key.
    pub is_cfx: bool,
    /// Key usage for sealing messages sent by us.
    pub seal_key_usage: i32,
    /// Key usage for unsealing messages sent by the peer.
    pub unseal_key_usage: i32,
}

impl SessionMaterial {
    pub fn for_initiator() -> Self {
        Self {
            seal_key_usage: INITIATOR_SEAL,
            unseal_key_usage: ACCEPTOR_SEAL,
            ..Default::default()
        }
    }

    pub fn for_acceptor() -> Self {
        Self {
            seal_key_usage: ACCEPTOR_SEAL,
            unseal_key_usage: INITIATOR_SEAL,
            ..Default::default()
        }
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.enctype.clone().unwrap_or(DEFAULT_ENCRYPTION_TYPE)
    }

    /// Key protecting per-message tokens: the acceptor subkey wins over the initiator subkey,
    /// which wins over the ticket session key.
    pub fn context_key(&self, is_initiator: bool) -> Option<&Secret<Vec<u8>>> {
        let (acceptor_subkey, initiator_subkey) = if is_initiator {
            (self.remote_subkey.as_ref(), self.local_subkey.as_ref())
        } else {
            (self.local_subkey.as_ref(), self.remote_subkey.as_ref())
        };

        acceptor_subkey.or(initiator_subkey).or(self.session_key.as_ref())
    }

    /// Wipes every key.
    pub fn clear(&mut self) {
        let (seal_key_usage, unseal_key_usage) = (self.seal_key_usage, self.unseal_key_usage);

        *self = Self {
            seal_key_usage,
            unseal_key_usage,
            ..Default::default()
        };
    }
}

/// CFX (RFC 4121) tokens are used with every enctype newer than the RFC 1964 ones.
pub fn is_cfx_enctype(cipher_suite: &CipherSuite) -> bool {
    !matches!(cipher_suite, CipherSuite::Des3CbcSha1Kd)
}
