use std::io::Write;

use picky_asn1::date::GeneralizedTime;
use picky_asn1::wrapper::{
    ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_krb::crypto::{ChecksumSuite, CipherSuite};
use picky_krb::data_types::{EncryptedData, KerberosTime, Microseconds};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use super::{integer_to_u32, MAX_MICROSECONDS};
use crate::{Error, ErrorKind, Result};

/// Prefixes a DER-encoded KDC message with its 4-byte big-endian length (Kerberos over TCP).
pub fn serialize_message<T: ?Sized + Serialize>(v: &T) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    // 4 bytes: length of the message
    data.write_all(&[0, 0, 0, 0])?;

    picky_asn1_der::to_writer(v, &mut data)?;

    let len = data.len() as u32 - 4;
    data[0..4].copy_from_slice(&len.to_be_bytes());

    Ok(data)
}

/// Appends a DER definite length.
pub fn write_der_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }

    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|byte| **byte == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Reads a DER definite length. Returns the length and the number of length octets.
pub fn read_der_length(data: &[u8]) -> Result<(usize, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| Error::new(ErrorKind::DefectiveToken, "missing DER length"))?;

    if first < 0x80 {
        return Ok((usize::from(first), 1));
    }

    let octets = usize::from(first & 0x7f);
    if octets == 0 || octets > 4 {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            format!("unsupported DER length encoding: {:#04x}", first),
        ));
    }

    let bytes = data
        .get(1..1 + octets)
        .ok_or_else(|| Error::new(ErrorKind::DefectiveToken, "truncated DER length"))?;
    let len = bytes.iter().fold(0_usize, |len, byte| (len << 8) | usize::from(*byte));

    Ok((len, 1 + octets))
}

/// Full size (tag, length and value) of the DER element at the start of `data`.
pub fn der_element_len(data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Err(Error::new(ErrorKind::DefectiveToken, "empty DER element"));
    }

    let (len, len_octets) = read_der_length(&data[1..])?;
    let total = 1 + len_octets + len;

    if total > data.len() {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            format!("DER element is truncated: {} bytes expected but {} present", total, data.len()),
        ));
    }

    Ok(total)
}

/// Current time shifted by the KDC time offset, as Kerberos `(time, usec)`.
pub fn kerberos_time_now(offset: Duration) -> (OffsetDateTime, KerberosTime, Microseconds) {
    let now = OffsetDateTime::now_utc() + offset;
    let microseconds = now.microsecond().min(MAX_MICROSECONDS);

    (
        now,
        KerberosTime::from(GeneralizedTime::from(now)),
        Microseconds::from(microseconds.to_be_bytes().to_vec()),
    )
}

pub fn kerberos_time(time: OffsetDateTime) -> KerberosTime {
    KerberosTime::from(GeneralizedTime::from(time))
}

pub fn offset_date_time(time: &KerberosTime) -> Result<OffsetDateTime> {
    OffsetDateTime::try_from(time.0.clone())
        .map_err(|err| Error::new(ErrorKind::DefectiveToken, format!("invalid Kerberos time: {:?}", err)))
}

/// Kerberos time plus microseconds, used to compare authenticator timestamps.
pub fn timestamp_with_usec(time: &KerberosTime, usec: &Microseconds) -> Result<OffsetDateTime> {
    let usec = integer_to_u32(&usec.0)?.min(MAX_MICROSECONDS);

    Ok(offset_date_time(time)? + Duration::microseconds(i64::from(usec)))
}

pub fn cipher_suite_of(encrypted_data: &EncryptedData) -> Result<CipherSuite> {
    Ok(CipherSuite::try_from(encrypted_data.etype.0.0.as_slice())?)
}

pub fn encrypt_data(
    cipher_suite: &CipherSuite,
    key: &[u8],
    key_usage: i32,
    payload: &[u8],
    kvno: Option<u32>,
) -> Result<EncryptedData> {
    let cipher = cipher_suite.cipher();

    Ok(EncryptedData {
        etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![cipher_suite.into()])),
        kvno: Optional::from(kvno.map(|kvno| {
            ExplicitContextTag1::from(IntegerAsn1::from_bytes_be_unsigned(kvno.to_be_bytes().to_vec()))
        })),
        cipher: ExplicitContextTag2::from(OctetStringAsn1::from(cipher.encrypt(key, key_usage, payload)?)),
    })
}

pub fn decrypt_data(key: &[u8], key_usage: i32, encrypted_data: &EncryptedData) -> Result<Vec<u8>> {
    let cipher = cipher_suite_of(encrypted_data)?.cipher();

    Ok(cipher.decrypt(key, key_usage, &encrypted_data.cipher.0.0)?)
}

/// [RFC 3962, section 7](https://www.rfc-editor.org/rfc/rfc3962#section-7) checksum types.
const HMAC_SHA1_96_AES128: usize = 15;
const HMAC_SHA1_96_AES256: usize = 16;

/// Checksum type matching the session encryption type.
pub fn checksum_type_for(cipher_suite: &CipherSuite) -> Result<usize> {
    match cipher_suite {
        CipherSuite::Aes256CtsHmacSha196 => Ok(HMAC_SHA1_96_AES256),
        CipherSuite::Aes128CtsHmacSha196 => Ok(HMAC_SHA1_96_AES128),
        CipherSuite::Des3CbcSha1Kd => Err(Error::new(
            ErrorKind::CryptoFailure,
            "keyed checksums are only supported for AES session keys",
        )),
    }
}

/// Computes a keyed checksum with the checksum suite of the session key. Returns `(cksumtype, checksum)`.
pub fn keyed_checksum(
    cipher_suite: &CipherSuite,
    key: &[u8],
    key_usage: i32,
    payload: &[u8],
) -> Result<(u8, Vec<u8>)> {
    let checksum_type = checksum_type_for(cipher_suite)?;
    let checksum = ChecksumSuite::try_from(checksum_type)?
        .hasher()
        .checksum(key, key_usage, payload)?;

    Ok((checksum_type as u8, checksum))
}

pub fn verify_keyed_checksum(
    checksum_type: &[u8],
    checksum: &[u8],
    key: &[u8],
    key_usage: i32,
    payload: &[u8],
) -> Result<()> {
    let checksum_suite = ChecksumSuite::try_from(integer_to_u32(checksum_type)? as usize)?;
    let expected = checksum_suite.hasher().checksum(key, key_usage, payload)?;

    if expected != checksum {
        return Err(Error::new(ErrorKind::BadSignature, "keyed checksum mismatch"));
    }

    Ok(())
}
