//! Privilege Attribute Certificate server signature check
//! ([MS-PAC](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-pac/166d8064-c863-41e1-9c23-edaaa5f36962)).
//!
//! ```not_rust
//! PACTYPE            ::= cBuffers (u32 LE), Version (u32 LE), PAC_INFO_BUFFER[cBuffers]
//! PAC_INFO_BUFFER    ::= ulType (u32 LE), cbBufferSize (u32 LE), Offset (u64 LE)
//! PAC_SIGNATURE_DATA ::= SignatureType (i32 LE), Signature, [RODCIdentifier (u16 LE)]
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use picky_krb::crypto::ChecksumSuite;
use picky_krb::data_types::{AuthorizationData, EncTicketPart};

use crate::kerberos::{integer_to_u32, AD_IF_RELEVANT, AD_WIN2K_PAC};
use crate::{Error, ErrorKind, Result};

/// `KERB_NON_KERB_CKSUM_SALT`: key usage of the PAC signatures.
pub const PAC_SIGNATURE_KEY_USAGE: i32 = 17;

const PAC_SERVER_CHECKSUM: u32 = 6;
const PAC_PRIVSVR_CHECKSUM: u32 = 7;
const PAC_HEADER_LEN: usize = 8;
const PAC_INFO_BUFFER_LEN: usize = 16;
const SIGNATURE_TYPE_LEN: usize = 4;

#[derive(Debug, Clone, Copy)]
struct PacBuffer {
    ty: u32,
    offset: usize,
    size: usize,
}

fn pac_buffers(pac: &[u8]) -> Result<Vec<PacBuffer>> {
    let mut reader = Cursor::new(pac);

    let count = reader.read_u32::<LittleEndian>()? as usize;
    let _version = reader.read_u32::<LittleEndian>()?;

    if pac.len() < PAC_HEADER_LEN + count * PAC_INFO_BUFFER_LEN {
        return Err(Error::new(ErrorKind::DefectiveToken, "PAC buffer table is truncated"));
    }

    (0..count)
        .map(|_| {
            let ty = reader.read_u32::<LittleEndian>()?;
            let size = reader.read_u32::<LittleEndian>()? as usize;
            let offset = usize::try_from(reader.read_u64::<LittleEndian>()?)
                .map_err(|_| Error::new(ErrorKind::DefectiveToken, "PAC buffer offset is too large"))?;

            if offset.checked_add(size).map(|end| end > pac.len()).unwrap_or(true) {
                return Err(Error::new(
                    ErrorKind::DefectiveToken,
                    format!("PAC buffer {} is out of bounds", ty),
                ));
            }

            Ok(PacBuffer { ty, offset, size })
        })
        .collect()
}

fn signature_buffer(buffers: &[PacBuffer], ty: u32) -> Result<PacBuffer> {
    let buffer = buffers
        .iter()
        .find(|buffer| buffer.ty == ty)
        .copied()
        .ok_or_else(|| Error::new(ErrorKind::DefectiveToken, format!("PAC has no signature buffer {}", ty)))?;

    if buffer.size <= SIGNATURE_TYPE_LEN {
        return Err(Error::new(ErrorKind::DefectiveToken, "PAC signature buffer is too small"));
    }

    Ok(buffer)
}

fn signature_len(signature_type: i32) -> Result<usize> {
    match signature_type {
        // HMAC-SHA1-96-AES128, HMAC-SHA1-96-AES256
        15 | 16 => Ok(12),
        // KERB_CHECKSUM_HMAC_MD5
        -138 => Ok(16),
        _ => Err(Error::new(
            ErrorKind::CryptoFailure,
            format!("unsupported PAC signature type: {}", signature_type),
        )),
    }
}

/// Finds the PAC in the ticket authorization data (`AD-IF-RELEVANT` wrapping `AD-WIN2K-PAC`).
pub fn find_pac(ticket: &EncTicketPart) -> Result<Option<Vec<u8>>> {
    let Some(authorization_data) = ticket.0.authorization_data.0.as_ref() else {
        return Ok(None);
    };

    for element in authorization_data.0.0.iter() {
        if integer_to_u32(&element.ad_type.0.0)? != u32::from(AD_IF_RELEVANT) {
            continue;
        }

        let relevant: AuthorizationData = picky_asn1_der::from_bytes(&element.ad_data.0.0)?;

        for element in relevant.0 {
            if integer_to_u32(&element.ad_type.0.0)? == u32::from(AD_WIN2K_PAC) {
                return Ok(Some(element.ad_data.0.0));
            }
        }
    }

    Ok(None)
}

/// Checks the PAC server signature with the service key that decrypted the ticket.
#[instrument(level = "trace", skip_all, fields(len = pac.len()))]
pub fn verify_server_signature(pac: &[u8], service_key: &[u8]) -> Result<()> {
    let buffers = pac_buffers(pac)?;

    let server = signature_buffer(&buffers, PAC_SERVER_CHECKSUM)?;
    let privsvr = signature_buffer(&buffers, PAC_PRIVSVR_CHECKSUM)?;

    let signature_type = (&pac[server.offset..]).read_i32::<LittleEndian>()?;
    let len = signature_len(signature_type)?;
    if server.size < SIGNATURE_TYPE_LEN + len {
        return Err(Error::new(ErrorKind::DefectiveToken, "PAC server signature is truncated"));
    }

    let signature_start = server.offset + SIGNATURE_TYPE_LEN;
    let signature = &pac[signature_start..signature_start + len];

    // both signatures are computed with zeroed signature fields
    let mut signed = pac.to_vec();
    for buffer in [server, privsvr] {
        let start = buffer.offset + SIGNATURE_TYPE_LEN;
        let end = (start + len).min(buffer.offset + buffer.size);
        signed[start..end].iter_mut().for_each(|byte| *byte = 0);
    }

    let checksum_type = usize::try_from(signature_type)
        .map_err(|_| Error::new(ErrorKind::CryptoFailure, "RC4 PAC signatures are not supported"))?;
    let expected = ChecksumSuite::try_from(checksum_type)?
        .hasher()
        .checksum(service_key, PAC_SIGNATURE_KEY_USAGE, &signed)?;

    if expected != signature {
        return Err(Error::new(ErrorKind::BadSignature, "PAC server signature mismatch"));
    }

    Ok(())
}
