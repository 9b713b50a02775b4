pub mod acquire;
pub mod client;
pub mod flags;
pub mod messages;
pub mod server;
mod session;
pub mod utils;

use picky_krb::crypto::CipherSuite;

pub use self::session::SessionMaterial;

pub const KERBEROS_VERSION: u8 = 0x05;
pub const TGT_SERVICE_NAME: &str = "krbtgt";

pub const DEFAULT_ENCRYPTION_TYPE: CipherSuite = CipherSuite::Aes256CtsHmacSha196;

/// [Microseconds](https://www.rfc-editor.org/rfc/rfc4120#section-5.2.4).
/// The maximum microseconds value.
///
/// ```not_rust
/// Microseconds    ::= INTEGER (0..999999)
/// ```
pub const MAX_MICROSECONDS: u32 = 999_999;

/// [KRB_CRED message type](https://www.rfc-editor.org/rfc/rfc4120#section-5.8.1).
pub const KRB_CRED_MSG_TYPE: u8 = 22;
/// Key usage of the `EncKrbCredPart` ([RFC 4120, section 7.5.1](https://www.rfc-editor.org/rfc/rfc4120#section-7.5.1)).
pub const KRB_CRED_ENC_PART: i32 = 14;

/// [AD-IF-RELEVANT](https://www.rfc-editor.org/rfc/rfc4120#section-5.2.6.1).
pub const AD_IF_RELEVANT: u8 = 1;
/// [AD-WIN2K-PAC](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-pac/c34adc61-80e1-4920-8923-22ef5054c4b2).
pub const AD_WIN2K_PAC: u8 = 128;

/// Key usage of the channel-binding keyed checksum carried as an authenticator checksum extension.
pub const KEY_USAGE_GSS_EXTS_CB: i32 = 1030;
/// Key usage of the KRB-FINISHED checksum in PKU2U
/// ([draft-zhu-pku2u-09, section 6](https://datatracker.ietf.org/doc/html/draft-zhu-pku2u-09#section-6)).
pub const KEY_USAGE_PKU2U_FINISHED: i32 = picky_krb::constants::key_usages::KEY_USAGE_FINISHED;
/// Key usage of the KRB-FINISHED checksum in IAKERB
/// ([draft-ietf-kitten-iakerb-03, section 3](https://datatracker.ietf.org/doc/html/draft-ietf-kitten-iakerb-03#section-3)).
pub const KEY_USAGE_IAKERB_FINISHED: i32 = 42;

/// Reads an unsigned big-endian ASN.1 INTEGER payload (e.g. a sequence number or a kvno).
pub fn integer_to_u32(bytes: &[u8]) -> crate::Result<u32> {
    // strip the sign octet of positive values with the high bit set
    let bytes = match bytes {
        [0, rest @ ..] if !rest.is_empty() => rest,
        bytes => bytes,
    };

    if bytes.len() > 4 {
        return Err(crate::Error::new(
            crate::ErrorKind::DefectiveToken,
            format!("integer does not fit in 32 bits: {:?}", bytes),
        ));
    }

    Ok(bytes.iter().fold(0_u32, |value, byte| (value << 8) | u32::from(*byte)))
}
