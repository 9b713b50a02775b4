//! GSS-API token envelope ([RFC 2743, section 3.1](https://www.rfc-editor.org/rfc/rfc2743#section-3.1)):
//! `0x60 len OID tok_id body`.

use std::fmt;

use oid::ObjectIdentifier;
use picky::oids;
use picky_asn1::wrapper::ObjectIdentifierAsn1;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::utils::{read_der_length, write_der_length};
use crate::{Error, ErrorKind, Result};

pub const AP_REQ_TOKEN_ID: [u8; 2] = [0x01, 0x00];
pub const AP_REP_TOKEN_ID: [u8; 2] = [0x02, 0x00];
pub const KRB_ERROR_TOKEN_ID: [u8; 2] = [0x03, 0x00];
/// [draft-zhu-pku2u-09, section 4](https://datatracker.ietf.org/doc/html/draft-zhu-pku2u-09#section-4)
pub const PKU2U_AS_REQ_TOKEN_ID: [u8; 2] = [0x05, 0x00];
pub const PKU2U_AS_REP_TOKEN_ID: [u8; 2] = [0x06, 0x00];
/// [draft-ietf-kitten-iakerb-03, section 3](https://datatracker.ietf.org/doc/html/draft-ietf-kitten-iakerb-03#section-3)
pub const IAKERB_TOKEN_ID: [u8; 2] = [0x05, 0x01];

const GSS_TOKEN_TAG: u8 = 0x60;
const OID_TAG: u8 = 0x06;

// [APPLICATION n] tags of bare Kerberos messages
const AP_REQ_TAG: u8 = 0x6e;
const AP_REP_TAG: u8 = 0x6f;
const KRB_ERROR_TAG: u8 = 0x7e;

/// `iakerb-proxy` mechanism OID.
const IAKERB_OID: &str = "1.3.6.1.5.2.5";

lazy_static! {
    static ref IAKERB_MECH: ObjectIdentifier =
        ObjectIdentifier::try_from(IAKERB_OID).expect("IAKERB mechanism OID is valid");
}

/// Security mechanism of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Kerberos5,
    Iakerb,
    Pku2u,
}

impl Mechanism {
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Mechanism::Kerberos5 => oids::krb5(),
            Mechanism::Iakerb => IAKERB_MECH.clone(),
            Mechanism::Pku2u => oids::gss_pku2u(),
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [Mechanism::Kerberos5, Mechanism::Iakerb, Mechanism::Pku2u]
            .into_iter()
            .find(|mechanism| &mechanism.oid() == oid)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mechanism::Kerberos5 => "Kerberos 5",
            Mechanism::Iakerb => "IAKERB",
            Mechanism::Pku2u => "PKU2U",
        };

        f.write_str(name)
    }
}

/// A decoded context token.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    /// `None` for a bare Kerberos message.
    pub mechanism: Option<ObjectIdentifier>,
    pub token_id: [u8; 2],
    pub body: &'a [u8],
}

impl Token<'_> {
    pub fn is_framed(&self) -> bool {
        self.mechanism.is_some()
    }

    /// Decodes the token body as a single DER message.
    pub fn decode<T: DeserializeOwned>(&self, expected_token_id: [u8; 2]) -> Result<T> {
        if self.token_id != expected_token_id {
            return Err(Error::new(
                ErrorKind::DefectiveToken,
                format!(
                    "invalid kerberos token id: expected {:?} but got {:?}",
                    expected_token_id, self.token_id
                ),
            ));
        }

        Ok(picky_asn1_der::from_bytes(self.body)?)
    }
}

/// Splits the GSS-API framing off the token. Unframed input is a bare AP-REQ, AP-REP or KRB-ERROR.
pub fn parse_token(data: &[u8]) -> Result<Token<'_>> {
    let first = *data
        .first()
        .ok_or_else(|| Error::new(ErrorKind::DefectiveToken, "empty context token"))?;

    if first != GSS_TOKEN_TAG {
        let token_id = bare_token_id(first).ok_or_else(|| {
            Error::new(
                ErrorKind::DefectiveToken,
                format!("unknown bare Kerberos message tag: {:#04x}", first),
            )
        })?;

        return Ok(Token {
            mechanism: None,
            token_id,
            body: data,
        });
    }

    let (len, len_octets) = read_der_length(&data[1..])?;
    let inner = &data[1 + len_octets..];
    if inner.len() != len {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            format!("GSS token length mismatch: header says {} but {} bytes follow", len, inner.len()),
        ));
    }

    if inner.first() != Some(&OID_TAG) {
        return Err(Error::new(ErrorKind::DefectiveToken, "GSS token without mechanism OID"));
    }
    let (oid_len, oid_len_octets) = read_der_length(&inner[1..])?;
    let oid_end = 1 + oid_len_octets + oid_len;
    if inner.len() < oid_end + 2 {
        return Err(Error::new(ErrorKind::DefectiveToken, "GSS token is truncated"));
    }

    let mechanism: ObjectIdentifierAsn1 = picky_asn1_der::from_bytes(&inner[..oid_end])?;
    let token_id = [inner[oid_end], inner[oid_end + 1]];

    Ok(Token {
        mechanism: Some(mechanism.0),
        token_id,
        body: &inner[oid_end + 2..],
    })
}

fn bare_token_id(tag: u8) -> Option<[u8; 2]> {
    match tag {
        AP_REQ_TAG => Some(AP_REQ_TOKEN_ID),
        AP_REP_TAG => Some(AP_REP_TOKEN_ID),
        KRB_ERROR_TAG => Some(KRB_ERROR_TOKEN_ID),
        _ => None,
    }
}

/// Wraps an already encoded body into the GSS-API framing.
pub fn frame_token(mechanism: &ObjectIdentifier, token_id: [u8; 2], body: &[u8]) -> Result<Vec<u8>> {
    let oid = picky_asn1_der::to_vec(&ObjectIdentifierAsn1::from(mechanism.clone()))?;

    let inner_len = oid.len() + token_id.len() + body.len();

    let mut token = Vec::with_capacity(inner_len + 6);
    token.push(GSS_TOKEN_TAG);
    write_der_length(inner_len, &mut token);
    token.extend_from_slice(&oid);
    token.extend_from_slice(&token_id);
    token.extend_from_slice(body);

    Ok(token)
}

/// Encodes a Kerberos message and frames it, or returns it bare.
pub fn encode_token<T: Serialize>(
    mechanism: &ObjectIdentifier,
    token_id: [u8; 2],
    message: &T,
    bare: bool,
) -> Result<Vec<u8>> {
    let body = picky_asn1_der::to_vec(message)?;

    if bare {
        Ok(body)
    } else {
        frame_token(mechanism, token_id, &body)
    }
}
