//! KRB-CRED messages carrying delegated tickets
//! ([RFC 4120, section 5.8](https://www.rfc-editor.org/rfc/rfc4120#section-5.8)).
//!
//! ```not_rust
//! KRB-CRED        ::= [APPLICATION 22] SEQUENCE {
//!         pvno            [0] INTEGER (5),
//!         msg-type        [1] INTEGER (22),
//!         tickets         [2] SEQUENCE OF Ticket,
//!         enc-part        [3] EncryptedData -- EncKrbCredPart
//! }
//!
//! EncKrbCredPart  ::= [APPLICATION 29] SEQUENCE {
//!         ticket-info     [0] SEQUENCE OF KrbCredInfo,
//!         nonce           [1] UInt32 OPTIONAL,
//!         timestamp       [2] KerberosTime OPTIONAL,
//!         usec            [3] Microseconds OPTIONAL,
//!         s-address       [4] HostAddress OPTIONAL,
//!         r-address       [5] HostAddress OPTIONAL
//! }
//! ```

use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag10, ExplicitContextTag2,
    ExplicitContextTag3, ExplicitContextTag4, ExplicitContextTag5, ExplicitContextTag6, ExplicitContextTag7,
    ExplicitContextTag8, ExplicitContextTag9, IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_asn1_der::Asn1RawDer;
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{
    EncryptedData, EncryptionKey, KerberosFlags, KerberosTime, Microseconds, PrincipalName, Realm, Ticket,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::ccache::TicketCredentials;
use crate::kerberos::flags::{kerberos_flags_to_u32, u32_to_kerberos_flags, TicketFlags};
use crate::kerberos::utils::{
    decrypt_data, encrypt_data, kerberos_time, kerberos_time_now, offset_date_time, read_der_length,
    write_der_length,
};
use crate::kerberos::{integer_to_u32, KERBEROS_VERSION, KRB_CRED_ENC_PART, KRB_CRED_MSG_TYPE};
use crate::principal::Principal;
use crate::{Error, ErrorKind, Result, Secret};

const KRB_CRED_TAG: u8 = 0x76;
const ENC_KRB_CRED_PART_TAG: u8 = 0x7d;
/// Some implementations send the enc-part unencrypted with etype 0.
const NULL_ETYPE: u32 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KrbCredInner {
    pvno: ExplicitContextTag0<IntegerAsn1>,
    msg_type: ExplicitContextTag1<IntegerAsn1>,
    tickets: ExplicitContextTag2<Asn1SequenceOf<Ticket>>,
    enc_part: ExplicitContextTag3<EncryptedData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KrbCredInfo {
    key: ExplicitContextTag0<EncryptionKey>,
    #[serde(default)]
    prealm: Optional<Option<ExplicitContextTag1<Realm>>>,
    #[serde(default)]
    pname: Optional<Option<ExplicitContextTag2<PrincipalName>>>,
    #[serde(default)]
    flags: Optional<Option<ExplicitContextTag3<KerberosFlags>>>,
    #[serde(default)]
    auth_time: Optional<Option<ExplicitContextTag4<KerberosTime>>>,
    #[serde(default)]
    start_time: Optional<Option<ExplicitContextTag5<KerberosTime>>>,
    #[serde(default)]
    end_time: Optional<Option<ExplicitContextTag6<KerberosTime>>>,
    #[serde(default)]
    renew_till: Optional<Option<ExplicitContextTag7<KerberosTime>>>,
    #[serde(default)]
    srealm: Optional<Option<ExplicitContextTag8<Realm>>>,
    #[serde(default)]
    sname: Optional<Option<ExplicitContextTag9<PrincipalName>>>,
    #[serde(default)]
    caddr: Optional<Option<ExplicitContextTag10<Asn1RawDer>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EncKrbCredPartInner {
    ticket_info: ExplicitContextTag0<Asn1SequenceOf<KrbCredInfo>>,
    #[serde(default)]
    nonce: Optional<Option<ExplicitContextTag1<IntegerAsn1>>>,
    #[serde(default)]
    timestamp: Optional<Option<ExplicitContextTag2<KerberosTime>>>,
    #[serde(default)]
    usec: Optional<Option<ExplicitContextTag3<Microseconds>>>,
    #[serde(default)]
    s_address: Optional<Option<ExplicitContextTag4<Asn1RawDer>>>,
    #[serde(default)]
    r_address: Optional<Option<ExplicitContextTag5<Asn1RawDer>>>,
}

fn wrap_application(tag: u8, body: Vec<u8>) -> Vec<u8> {
    let mut data = Vec::with_capacity(body.len() + 6);
    data.push(tag);
    write_der_length(body.len(), &mut data);
    data.extend_from_slice(&body);

    data
}

fn unwrap_application(tag: u8, data: &[u8]) -> Result<&[u8]> {
    if data.first() != Some(&tag) {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            format!("expected application tag {:#04x} but got {:?}", tag, data.first()),
        ));
    }

    let (len, len_octets) = read_der_length(&data[1..])?;

    data.get(1 + len_octets..1 + len_octets + len)
        .ok_or_else(|| Error::new(ErrorKind::TruncatedData, "KRB-CRED is truncated"))
}

fn cred_info(credentials: &TicketCredentials) -> Result<KrbCredInfo> {
    Ok(KrbCredInfo {
        key: ExplicitContextTag0::from(EncryptionKey {
            key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![(&credentials.session_etype).into()])),
            key_value: ExplicitContextTag1::from(OctetStringAsn1::from(credentials.session_key.as_ref().clone())),
        }),
        prealm: Optional::from(Some(ExplicitContextTag1::from(credentials.client.to_realm()?))),
        pname: Optional::from(Some(ExplicitContextTag2::from(credentials.client.to_principal_name()?))),
        flags: Optional::from(Some(ExplicitContextTag3::from(u32_to_kerberos_flags(
            credentials.flags.bits(),
        )))),
        auth_time: Optional::from(Some(ExplicitContextTag4::from(kerberos_time(credentials.auth_time)))),
        start_time: Optional::from(
            credentials
                .start_time
                .map(|start_time| ExplicitContextTag5::from(kerberos_time(start_time))),
        ),
        end_time: Optional::from(Some(ExplicitContextTag6::from(kerberos_time(credentials.end_time)))),
        renew_till: Optional::from(
            credentials
                .renew_till
                .map(|renew_till| ExplicitContextTag7::from(kerberos_time(renew_till))),
        ),
        srealm: Optional::from(Some(ExplicitContextTag8::from(credentials.server.to_realm()?))),
        sname: Optional::from(Some(ExplicitContextTag9::from(credentials.server.to_principal_name()?))),
        caddr: Optional::from(None),
    })
}

/// Packs the tickets into a KRB-CRED encrypted with `key` (the ticket session key of the context).
#[instrument(level = "trace", skip_all, fields(tickets = credentials.len()))]
pub fn encode_krb_cred(credentials: &[TicketCredentials], cipher_suite: &CipherSuite, key: &[u8]) -> Result<Vec<u8>> {
    let (_, timestamp, usec) = kerberos_time_now(Duration::ZERO);

    let enc_part = EncKrbCredPartInner {
        ticket_info: ExplicitContextTag0::from(Asn1SequenceOf::from(
            credentials.iter().map(cred_info).collect::<Result<Vec<_>>>()?,
        )),
        nonce: Optional::from(None),
        timestamp: Optional::from(Some(ExplicitContextTag2::from(timestamp))),
        usec: Optional::from(Some(ExplicitContextTag3::from(usec))),
        s_address: Optional::from(None),
        r_address: Optional::from(None),
    };
    let enc_part = wrap_application(ENC_KRB_CRED_PART_TAG, picky_asn1_der::to_vec(&enc_part)?);

    let krb_cred = KrbCredInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_CRED_MSG_TYPE])),
        tickets: ExplicitContextTag2::from(Asn1SequenceOf::from(
            credentials
                .iter()
                .map(|credentials| credentials.ticket.clone())
                .collect::<Vec<_>>(),
        )),
        enc_part: ExplicitContextTag3::from(encrypt_data(cipher_suite, key, KRB_CRED_ENC_PART, &enc_part, None)?),
    };

    Ok(wrap_application(KRB_CRED_TAG, picky_asn1_der::to_vec(&krb_cred)?))
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        Error::new(
            ErrorKind::DefectiveToken,
            format!("KRB-CRED ticket info without {}", field),
        )
    })
}

fn credentials_from_info(ticket: Ticket, info: KrbCredInfo) -> Result<TicketCredentials> {
    let KrbCredInfo {
        key,
        prealm,
        pname,
        flags,
        auth_time,
        start_time,
        end_time,
        renew_till,
        srealm,
        sname,
        caddr: _,
    } = info;

    let client = Principal::from_principal_name(
        &required(pname.0, "pname")?.0,
        &required(prealm.0, "prealm")?.0,
    )?;
    let server = match (sname.0, srealm.0) {
        (Some(sname), Some(srealm)) => Principal::from_principal_name(&sname.0, &srealm.0)?,
        _ => Principal::from_principal_name(&ticket.0.sname.0, &ticket.0.realm.0)?,
    };

    let end_time = offset_date_time(&required(end_time.0, "endtime")?.0)?;
    let start_time = start_time.0.map(|time| offset_date_time(&time.0)).transpose()?;

    Ok(TicketCredentials {
        client,
        server,
        ticket,
        session_key: Secret::copy_from(&key.0.key_value.0.0),
        session_etype: CipherSuite::try_from(key.0.key_type.0.0.as_slice())?,
        flags: TicketFlags::from_bits_truncate(flags.0.map(|flags| kerberos_flags_to_u32(&flags.0)).unwrap_or(0)),
        auth_time: match auth_time.0 {
            Some(auth_time) => offset_date_time(&auth_time.0)?,
            None => start_time.unwrap_or_else(OffsetDateTime::now_utc),
        },
        start_time,
        end_time,
        renew_till: renew_till.0.map(|time| offset_date_time(&time.0)).transpose()?,
    })
}

/// Decrypts a KRB-CRED with `key` and returns the forwarded tickets.
#[instrument(level = "trace", skip_all)]
pub fn decode_krb_cred(data: &[u8], key: &[u8]) -> Result<Vec<TicketCredentials>> {
    let krb_cred: KrbCredInner = picky_asn1_der::from_bytes(unwrap_application(KRB_CRED_TAG, data)?)?;

    if integer_to_u32(&krb_cred.msg_type.0.0)? != u32::from(KRB_CRED_MSG_TYPE) {
        return Err(Error::new(ErrorKind::DefectiveToken, "delegation blob is not a KRB-CRED"));
    }

    let enc_part = &krb_cred.enc_part.0;
    let enc_part = if integer_to_u32(&enc_part.etype.0.0)? == NULL_ETYPE {
        enc_part.cipher.0.0.clone()
    } else {
        decrypt_data(key, KRB_CRED_ENC_PART, enc_part)?
    };
    let enc_part: EncKrbCredPartInner =
        picky_asn1_der::from_bytes(unwrap_application(ENC_KRB_CRED_PART_TAG, &enc_part)?)?;

    let tickets = krb_cred.tickets.0.0;
    let infos = enc_part.ticket_info.0.0;
    if tickets.len() != infos.len() {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            format!("KRB-CRED has {} tickets but {} ticket infos", tickets.len(), infos.len()),
        ));
    }

    tickets
        .into_iter()
        .zip(infos)
        .map(|(ticket, info)| credentials_from_info(ticket, info))
        .collect()
}
