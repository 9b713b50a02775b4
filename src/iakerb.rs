//! IAKERB message framing ([draft-ietf-kitten-iakerb-03](https://datatracker.ietf.org/doc/html/draft-ietf-kitten-iakerb-03)).
//!
//! An IAKERB token body is the header followed by the DER encoded KDC request or reply:
//!
//! ```not_rust
//! IAKERB-HEADER ::= SEQUENCE {
//!     target-realm      [1] UTF8String,
//!     cookie            [2] OCTET STRING OPTIONAL,
//!     ...
//! }
//! ```

use picky_asn1::restricted_string::Utf8String;
use picky_asn1::wrapper::{ExplicitContextTag1, ExplicitContextTag2, OctetStringAsn1, Optional, Utf8StringAsn1};
use serde::{Deserialize, Serialize};

use crate::kerberos::utils::der_element_len;
use crate::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IakerbHeaderInner {
    target_realm: ExplicitContextTag1<Utf8StringAsn1>,
    #[serde(default)]
    cookie: Optional<Option<ExplicitContextTag2<OctetStringAsn1>>>,
}

/// Realm the tunneled message is for, and the opaque acceptor state echoed by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IakerbHeader {
    pub target_realm: String,
    pub cookie: Option<Vec<u8>>,
}

impl IakerbHeader {
    pub fn new(target_realm: impl Into<String>) -> Self {
        Self {
            target_realm: target_realm.into(),
            cookie: None,
        }
    }
}

/// Encodes the body of an IAKERB token.
pub fn encode_iakerb_message(header: &IakerbHeader, kdc_message: &[u8]) -> Result<Vec<u8>> {
    let header = IakerbHeaderInner {
        target_realm: ExplicitContextTag1::from(Utf8StringAsn1::from(Utf8String::from_string(
            header.target_realm.clone(),
        )?)),
        cookie: Optional::from(
            header
                .cookie
                .clone()
                .map(|cookie| ExplicitContextTag2::from(OctetStringAsn1::from(cookie))),
        ),
    };

    let mut body = picky_asn1_der::to_vec(&header)?;
    body.extend_from_slice(kdc_message);

    Ok(body)
}

/// Splits an IAKERB token body into the header and the KDC message.
pub fn decode_iakerb_message(body: &[u8]) -> Result<(IakerbHeader, &[u8])> {
    let header_len = der_element_len(body)?;
    let header: IakerbHeaderInner = picky_asn1_der::from_bytes(&body[..header_len])?;

    let kdc_message = &body[header_len..];
    if kdc_message.is_empty() {
        return Err(Error::new(ErrorKind::DefectiveToken, "IAKERB token without a KDC message"));
    }

    Ok((
        IakerbHeader {
            target_realm: header.target_realm.0.0.as_utf8().to_owned(),
            cookie: header.cookie.0.map(|cookie| cookie.0.0),
        },
        kdc_message,
    ))
}
