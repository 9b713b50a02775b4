//! Authenticator checksum (type `0x8003`) that binds channel bindings, context flags, delegated
//! credentials and checksum extensions to the AP-REQ.
//!
//! [RFC 4121, section 4.1.1](https://datatracker.ietf.org/doc/html/rfc4121#section-4.1.1):
//!
//! ```not_rust
//! Octet   Name      Description
//! ---------------------------------------------------------------
//! 0..3    Lgth      Number of octets in Bnd field;  Represented
//!                   in big-endian order here: 00 00 00 10 (16).
//! 4..19   Bnd       Channel binding information.
//! 20..23  Flags     Four-octet context-establishment flags in
//!                   little-endian order.
//! 24..25  DlgOpt    The delegation option identifier (=1) in
//!                   little-endian order [optional].
//! 26..27  Dlgth     The length of the Deleg field in little-endian order [optional].
//! 28..(n-1) Deleg   A KRB_CRED message (n = Dlgth + 28) [optional].
//! n..last  Exts     Extensions [optional].
//! ```
//!
//! Every extension is a little-endian 2-byte `type`, a little-endian 2-byte `length` and `length`
//! bytes of value. The big-endian `Lgth` next to little-endian everything else is how peers emit it.

use std::io::Read;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, IntegerAsn1, OctetStringAsn1};
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::Checksum;
use picky_krb::pkinit::KrbFinished;

use crate::channel_bindings::ChannelBindings;
use crate::crypto::{compute_md5_channel_bindings_hash, HASH_SIZE};
use crate::flags::ContextFlags;
use crate::kerberos::utils::{keyed_checksum, verify_keyed_checksum};
use crate::kerberos::{integer_to_u32, KEY_USAGE_GSS_EXTS_CB};
use crate::{Error, ErrorKind, Result};

/// GSS-API authenticator checksum type.
pub const GSS_CHECKSUM_TYPE: u32 = 0x8003;

const BINDING_LENGTH: u32 = HASH_SIZE as u32;
const MIN_CHECKSUM_LEN: usize = 24;
const DELEGATION_OPTION: u16 = 1;
const EXTENSION_HEADER_LEN: usize = 4;

/// Checksum extension types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ExtensionType {
    /// Keyed integrity checksum over the channel-binding hash.
    ChannelBindingIntegrity = 0,
    /// Checksum of the outer (e.g. SPNEGO) message.
    OuterChecksum = 1,
    /// KRB-FINISHED over the IAKERB/PKU2U token transcript.
    Finished = 2,
}

/// Session key material used for keyed checksums.
#[derive(Debug, Clone, Copy)]
pub struct SessionCrypto<'a> {
    pub cipher_suite: &'a CipherSuite,
    pub key: &'a [u8],
}

/// Raw authenticator checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumBinding {
    pub checksum_type: u32,
    pub value: Vec<u8>,
}

impl ChecksumBinding {
    pub fn from_checksum(checksum: &Checksum) -> Result<Self> {
        Ok(Self {
            checksum_type: integer_to_u32(&checksum.cksumtype.0.0)?,
            value: checksum.checksum.0.0.clone(),
        })
    }

    pub fn to_checksum(&self) -> Checksum {
        Checksum {
            cksumtype: ExplicitContextTag0::from(IntegerAsn1::from_bytes_be_unsigned(
                self.checksum_type.to_be_bytes().iter().skip_while(|byte| **byte == 0).copied().collect(),
            )),
            checksum: ExplicitContextTag1::from(OctetStringAsn1::from(self.value.clone())),
        }
    }
}

/// Inputs of the checksum construction.
#[derive(Debug, Default)]
pub struct ChecksumRequest<'a> {
    pub channel_bindings: Option<&'a ChannelBindings>,
    pub flags: ContextFlags,
    /// Encoded KRB-CRED.
    pub delegation: Option<&'a [u8]>,
    pub outer_checksum: Option<&'a [u8]>,
    pub session_crypto: Option<SessionCrypto<'a>>,
    /// Encoded KRB-FINISHED.
    pub finished: Option<&'a [u8]>,
}

/// Result of a successful checksum verification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifiedChecksum {
    pub flags: ContextFlags,
    pub delegation: Option<Vec<u8>>,
    pub finished: Option<Vec<u8>>,
    pub outer_checksum: Option<Vec<u8>>,
    /// The binding hash did not match and was accepted for compatibility.
    pub legacy: bool,
}

#[derive(Debug, Default)]
pub struct VerifyOptions<'a> {
    pub channel_bindings: Option<&'a ChannelBindings>,
    pub session_crypto: Option<SessionCrypto<'a>>,
    /// Accept a zero binding hash when the acceptor has channel bindings, and any binding hash
    /// when it has none.
    pub allow_legacy: bool,
}

#[instrument(level = "trace", ret, skip_all, fields(flags = ?request.flags))]
pub fn build(request: &ChecksumRequest<'_>) -> Result<ChecksumBinding> {
    let binding_hash = request
        .channel_bindings
        .map(compute_md5_channel_bindings_hash)
        .unwrap_or([0; HASH_SIZE]);

    let delegation = request
        .delegation
        .filter(|delegation| request.flags.contains(ContextFlags::DELEG) && !delegation.is_empty());

    let mut flags = request.flags;
    if delegation.is_none() {
        flags.remove(ContextFlags::DELEG);
    }

    let mut value = Vec::with_capacity(MIN_CHECKSUM_LEN);
    value.write_u32::<BigEndian>(BINDING_LENGTH)?;
    value.extend_from_slice(&binding_hash);
    value.write_u32::<LittleEndian>(flags.bits())?;

    if let Some(delegation) = delegation {
        let len = u16::try_from(delegation.len()).map_err(|_| {
            Error::new(
                ErrorKind::EncodingFailure,
                format!("delegated credentials are too long: {} bytes", delegation.len()),
            )
        })?;

        value.write_u16::<LittleEndian>(DELEGATION_OPTION)?;
        value.write_u16::<LittleEndian>(len)?;
        value.extend_from_slice(delegation);
    }

    if let (Some(crypto), Some(_)) = (request.session_crypto, request.channel_bindings) {
        let (checksum_type, checksum) =
            keyed_checksum(crypto.cipher_suite, crypto.key, KEY_USAGE_GSS_EXTS_CB, &binding_hash)?;

        let extension = picky_asn1_der::to_vec(&Checksum {
            cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(vec![checksum_type])),
            checksum: ExplicitContextTag1::from(OctetStringAsn1::from(checksum)),
        })?;

        write_extension(&mut value, ExtensionType::ChannelBindingIntegrity, &extension)?;
    }

    if let Some(outer_checksum) = request.outer_checksum.filter(|checksum| !checksum.is_empty()) {
        write_extension(&mut value, ExtensionType::OuterChecksum, outer_checksum)?;
    }

    if let Some(finished) = request.finished {
        write_extension(&mut value, ExtensionType::Finished, finished)?;
    }

    Ok(ChecksumBinding {
        checksum_type: GSS_CHECKSUM_TYPE,
        value,
    })
}

fn write_extension(value: &mut Vec<u8>, extension_type: ExtensionType, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        Error::new(
            ErrorKind::EncodingFailure,
            format!("{:?} checksum extension is too long", extension_type),
        )
    })?;

    value.write_u16::<LittleEndian>(extension_type as u16)?;
    value.write_u16::<LittleEndian>(len)?;
    value.extend_from_slice(data);

    Ok(())
}

#[instrument(level = "trace", ret, skip_all)]
pub fn verify(binding: &ChecksumBinding, options: &VerifyOptions<'_>) -> Result<VerifiedChecksum> {
    if binding.checksum_type != GSS_CHECKSUM_TYPE {
        return Err(Error::new(
            ErrorKind::BadBindings,
            format!("unexpected authenticator checksum type: {:#x}", binding.checksum_type),
        ));
    }

    if binding.value.len() < MIN_CHECKSUM_LEN {
        return Err(Error::new(
            ErrorKind::BadBindings,
            format!("authenticator checksum is too short: {} bytes", binding.value.len()),
        ));
    }

    let mut reader = binding.value.as_slice();

    let binding_length = reader.read_u32::<BigEndian>()?;
    if binding_length != BINDING_LENGTH {
        return Err(Error::new(
            ErrorKind::BadBindings,
            format!("invalid channel binding length: {}", binding_length),
        ));
    }

    let mut received_hash = [0; HASH_SIZE];
    reader.read_exact(&mut received_hash)?;

    let mut verified = VerifiedChecksum::default();

    let expected_hash = options
        .channel_bindings
        .map(compute_md5_channel_bindings_hash)
        .unwrap_or([0; HASH_SIZE]);
    if expected_hash != received_hash {
        let unbound_peer = received_hash == [0; HASH_SIZE];
        let unbound_acceptor = options.channel_bindings.is_none();

        if !options.allow_legacy || !(unbound_peer || unbound_acceptor) {
            return Err(Error::new(ErrorKind::BadBindings, "channel bindings do not match"));
        }

        debug!(unbound_peer, unbound_acceptor, "channel bindings differ, accepting for compatibility");
        verified.legacy = true;
    }

    verified.flags = ContextFlags::from_bits_truncate(reader.read_u32::<LittleEndian>()?);

    if verified.flags.contains(ContextFlags::DELEG) {
        if reader.len() < 4 {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                "delegation flag is set but the delegation option is missing",
            ));
        }

        let option = reader.read_u16::<LittleEndian>()?;
        if option != DELEGATION_OPTION {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("unexpected delegation option: {}", option),
            ));
        }

        let len = usize::from(reader.read_u16::<LittleEndian>()?);
        verified.delegation = Some(take(&mut reader, len, "delegated credentials")?.to_vec());
    }

    let mut has_extensions = false;
    let mut channel_binding_verified = false;

    while !reader.is_empty() {
        if reader.len() < EXTENSION_HEADER_LEN {
            return Err(Error::new(ErrorKind::TruncatedData, "truncated checksum extension header"));
        }

        let extension_type = reader.read_u16::<LittleEndian>()?;
        let len = usize::from(reader.read_u16::<LittleEndian>()?);
        let data = take(&mut reader, len, "checksum extension")?;

        has_extensions = true;

        match extension_type {
            t if t == ExtensionType::ChannelBindingIntegrity as u16 => {
                verify_channel_binding_integrity(data, &received_hash, options.session_crypto)?;
                channel_binding_verified = true;
            }
            t if t == ExtensionType::OuterChecksum as u16 => verified.outer_checksum = Some(data.to_vec()),
            t if t == ExtensionType::Finished as u16 => verified.finished = Some(data.to_vec()),
            unknown => trace!(extension_type = unknown, "skipping unknown checksum extension"),
        }
    }

    if has_extensions && options.channel_bindings.is_some() && !channel_binding_verified {
        return Err(Error::new(
            ErrorKind::InvalidParameter,
            "checksum extensions are present without the channel-binding integrity extension",
        ));
    }

    Ok(verified)
}

fn take<'a>(reader: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    if reader.len() < len {
        return Err(Error::new(
            ErrorKind::TruncatedData,
            format!("{} is truncated: {} bytes expected but {} left", what, len, reader.len()),
        ));
    }

    let (data, rest) = reader.split_at(len);
    *reader = rest;

    Ok(data)
}

fn verify_channel_binding_integrity(
    extension: &[u8],
    binding_hash: &[u8; HASH_SIZE],
    session_crypto: Option<SessionCrypto<'_>>,
) -> Result<()> {
    let crypto = session_crypto.ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidParameter,
            "channel-binding integrity extension cannot be checked without a session key",
        )
    })?;

    let checksum: Checksum = picky_asn1_der::from_bytes(extension)?;

    verify_keyed_checksum(
        &checksum.cksumtype.0.0,
        &checksum.checksum.0.0,
        crypto.key,
        KEY_USAGE_GSS_EXTS_CB,
        binding_hash,
    )
    .map_err(|_| Error::new(ErrorKind::BadBindings, "channel-binding integrity checksum mismatch"))
}

/// Encodes KRB-FINISHED: a keyed checksum over the concatenated IAKERB/PKU2U tokens.
pub fn make_finished(crypto: SessionCrypto<'_>, key_usage: i32, transcript: &[u8]) -> Result<Vec<u8>> {
    let (checksum_type, checksum) = keyed_checksum(crypto.cipher_suite, crypto.key, key_usage, transcript)?;

    Ok(picky_asn1_der::to_vec(&KrbFinished {
        gss_mic: ExplicitContextTag1::from(Checksum {
            cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(vec![checksum_type])),
            checksum: ExplicitContextTag1::from(OctetStringAsn1::from(checksum)),
        }),
    })?)
}

pub fn verify_finished(finished: &[u8], key: &[u8], key_usage: i32, transcript: &[u8]) -> Result<()> {
    let finished: KrbFinished = picky_asn1_der::from_bytes(finished)?;

    verify_keyed_checksum(
        &finished.gss_mic.0.cksumtype.0.0,
        &finished.gss_mic.0.checksum.0.0,
        key,
        key_usage,
        transcript,
    )
    .map_err(|_| Error::new(ErrorKind::BadSignature, "KRB-FINISHED checksum does not match the transcript"))
}
