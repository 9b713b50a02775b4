use picky_asn1::bit_string::BitString;
use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3,
    ExplicitContextTag4, ExplicitContextTag5, ExplicitContextTag6, ExplicitContextTag7, ExplicitContextTag8,
    ExplicitContextTag11, IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_krb::constants::key_usages::TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR;
use picky_krb::constants::types::{
    AP_REQ_MSG_TYPE, AS_REQ_MSG_TYPE, PA_ENC_TIMESTAMP, PA_ENC_TIMESTAMP_KEY_USAGE, PA_PAC_OPTIONS_TYPE,
    PA_PAC_REQUEST_TYPE, PA_TGS_REQ_TYPE, TGS_REQ_MSG_TYPE,
};
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{
    ApOptions as ApOptionsAsn1, Authenticator, AuthenticatorInner, Checksum, EncryptionKey, KerbPaPacRequest,
    KerberosFlags, KerberosStringAsn1, PaData, PaEncTsEnc, PaPacOptions, Realm, Ticket,
};
use picky_krb::messages::{ApReq, ApReqInner, AsReq, KdcReq, KdcReqBody, TgsReq};
use time::{Duration, OffsetDateTime};

use crate::ccache::TicketCredentials;
use crate::crypto::{compute_md5, random_bytes};
use crate::kerberos::flags::{ApOptions, KdcOptions};
use crate::kerberos::utils::{encrypt_data, kerberos_time, kerberos_time_now};
use crate::kerberos::KERBEROS_VERSION;
use crate::principal::Principal;
use crate::{Result, Secret};

pub const TGT_TICKET_LIFETIME_DAYS: i64 = 3;
pub const NONCE_LEN: usize = 4;
const MD5_CHECKSUM_TYPE: [u8; 1] = [0x07];

// Forwardable, Renewable, Canonicalize, and Renewable-ok
// https://www.rfc-editor.org/rfc/rfc4120#section-5.4.1
pub const DEFAULT_AS_REQ_OPTIONS: KdcOptions = KdcOptions::FORWARDABLE
    .union(KdcOptions::RENEWABLE)
    .union(KdcOptions::CANONICALIZE)
    .union(KdcOptions::RENEWABLE_OK);

// Renewable, Canonicalize.
// https://www.rfc-editor.org/rfc/rfc4120#section-5.4.1
pub const DEFAULT_TGS_REQ_OPTIONS: KdcOptions = KdcOptions::RENEWABLE.union(KdcOptions::CANONICALIZE);

// claims support
const DEFAULT_PA_PAC_OPTIONS: [u8; 4] = [0x40, 0x00, 0x00, 0x00];

/// Encryption types we ask the KDC for, strongest first.
pub fn supported_etypes() -> Vec<CipherSuite> {
    vec![CipherSuite::Aes256CtsHmacSha196, CipherSuite::Aes128CtsHmacSha196]
}

/// Random KDC request nonce. The high bit is cleared so the INTEGER stays positive.
pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = random_bytes(NONCE_LEN);
    nonce[0] &= 0x7f;

    nonce
}

/// Parameters for generating [KdcReqBody].
#[derive(Debug)]
pub struct KdcReqBodyOptions<'a> {
    /// `None` in TGS requests: the client name comes from the TGT.
    pub client: Option<&'a Principal>,
    pub server: &'a Principal,
    pub realm: &'a str,
    pub options: KdcOptions,
    pub nonce: &'a [u8],
    pub additional_tickets: Option<Vec<Ticket>>,
}

#[instrument(level = "trace", ret, skip_all, fields(server = %options.server, realm = options.realm))]
pub fn generate_kdc_req_body(options: &KdcReqBodyOptions<'_>) -> Result<KdcReqBody> {
    let KdcReqBodyOptions {
        client,
        server,
        realm,
        options: kdc_options,
        nonce,
        additional_tickets,
    } = options;

    let expiration_date = OffsetDateTime::now_utc() + Duration::days(TGT_TICKET_LIFETIME_DAYS);

    let cname = match client {
        Some(client) => Some(ExplicitContextTag1::from(client.to_principal_name()?)),
        None => None,
    };

    let rtime = kdc_options
        .contains(KdcOptions::RENEWABLE)
        .then(|| ExplicitContextTag6::from(kerberos_time(expiration_date)));

    Ok(KdcReqBody {
        kdc_options: ExplicitContextTag0::from(KerberosFlags::from(BitString::with_bytes(
            kdc_options.bits().to_be_bytes().to_vec(),
        ))),
        cname: Optional::from(cname),
        realm: ExplicitContextTag2::from(Realm::from(IA5String::from_string((*realm).to_owned())?)),
        sname: Optional::from(Some(ExplicitContextTag3::from(server.to_principal_name()?))),
        from: Optional::from(None),
        till: ExplicitContextTag5::from(kerberos_time(expiration_date)),
        rtime: Optional::from(rtime),
        nonce: ExplicitContextTag7::from(IntegerAsn1::from(nonce.to_vec())),
        etype: ExplicitContextTag8::from(Asn1SequenceOf::from(
            supported_etypes()
                .into_iter()
                .map(|etype| IntegerAsn1::from(vec![etype.into()]))
                .collect::<Vec<_>>(),
        )),
        addresses: Optional::from(None),
        enc_authorization_data: Optional::from(None),
        additional_tickets: Optional::from(
            additional_tickets
                .clone()
                .map(|tickets| ExplicitContextTag11::from(Asn1SequenceOf::from(tickets))),
        ),
    })
}

/// `PA-ENC-TIMESTAMP` encrypted with the client long-term key.
///
/// [RFC 4120, section 5.2.7.2](https://www.rfc-editor.org/rfc/rfc4120#section-5.2.7.2)
#[instrument(level = "trace", ret, skip(key))]
pub fn generate_pa_enc_timestamp(cipher_suite: &CipherSuite, key: &[u8], time_offset: Duration) -> Result<PaData> {
    let (_, patimestamp, pausec) = kerberos_time_now(time_offset);

    let timestamp = PaEncTsEnc {
        patimestamp: ExplicitContextTag0::from(patimestamp),
        pausec: Optional::from(Some(ExplicitContextTag1::from(pausec))),
    };
    let encrypted_timestamp = encrypt_data(
        cipher_suite,
        key,
        PA_ENC_TIMESTAMP_KEY_USAGE,
        &picky_asn1_der::to_vec(&timestamp)?,
        None,
    )?;

    Ok(PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ENC_TIMESTAMP.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&encrypted_timestamp)?)),
    })
}

pub fn generate_pa_pac_request() -> Result<PaData> {
    Ok(PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_PAC_REQUEST_TYPE.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&KerbPaPacRequest {
            include_pac: ExplicitContextTag0::from(true),
        })?)),
    })
}

#[instrument(level = "debug", ret, skip_all)]
pub fn generate_as_req(pa_datas: Vec<PaData>, kdc_req_body: KdcReqBody) -> AsReq {
    AsReq::from(KdcReq {
        pvno: ExplicitContextTag1::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag2::from(IntegerAsn1::from(vec![AS_REQ_MSG_TYPE])),
        padata: Optional::from(Some(ExplicitContextTag3::from(Asn1SequenceOf::from(pa_datas)))),
        req_body: ExplicitContextTag4::from(kdc_req_body),
    })
}

/// Parameters for generating [TgsReq].
#[derive(Debug)]
pub struct TgsReqOptions<'a> {
    pub tgt: &'a TicketCredentials,
    pub server: &'a Principal,
    pub options: KdcOptions,
    pub nonce: &'a [u8],
    pub time_offset: Duration,
}

#[instrument(level = "debug", ret, skip_all, fields(server = %options.server, kdc_options = ?options.options))]
pub fn generate_tgs_req(options: TgsReqOptions<'_>) -> Result<TgsReq> {
    let TgsReqOptions {
        tgt,
        server,
        options: kdc_options,
        nonce,
        time_offset,
    } = options;

    let req_body = generate_kdc_req_body(&KdcReqBodyOptions {
        client: None,
        server,
        realm: &tgt.server.realm,
        options: kdc_options,
        nonce,
        additional_tickets: None,
    })?;

    // [RFC 4120, section 7.2.2](https://www.rfc-editor.org/rfc/rfc4120#section-7.2.2): the authenticator checksum
    // covers the request body
    let checksum = Checksum {
        cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(MD5_CHECKSUM_TYPE.to_vec())),
        checksum: ExplicitContextTag1::from(OctetStringAsn1::from(
            compute_md5(&picky_asn1_der::to_vec(&req_body)?).to_vec(),
        )),
    };

    let authenticator = generate_authenticator(AuthenticatorOptions {
        client: &tgt.client,
        checksum: Some(checksum),
        subkey: None,
        seq_number: None,
        time_offset,
    })?;

    let ap_req = generate_ap_req(
        tgt.ticket.clone(),
        &tgt.session_etype,
        tgt.session_key.as_ref(),
        &authenticator,
        ApOptions::empty(),
        TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR,
    )?;

    let pa_tgs_req = PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_TGS_REQ_TYPE.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&ap_req)?)),
    };

    let pa_pac_options = PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_PAC_OPTIONS_TYPE.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&PaPacOptions {
            flags: ExplicitContextTag0::from(KerberosFlags::from(BitString::with_bytes(
                DEFAULT_PA_PAC_OPTIONS.to_vec(),
            ))),
        })?)),
    };

    Ok(TgsReq::from(KdcReq {
        pvno: ExplicitContextTag1::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag2::from(IntegerAsn1::from(vec![TGS_REQ_MSG_TYPE])),
        padata: Optional::from(Some(ExplicitContextTag3::from(Asn1SequenceOf::from(vec![
            pa_tgs_req,
            pa_pac_options,
        ])))),
        req_body: ExplicitContextTag4::from(req_body),
    }))
}

/// Input parameters for generating ApReq Authenticator.
#[derive(Debug)]
pub struct AuthenticatorOptions<'a> {
    pub client: &'a Principal,
    pub checksum: Option<Checksum>,
    pub subkey: Option<(&'a CipherSuite, &'a Secret<Vec<u8>>)>,
    pub seq_number: Option<u32>,
    /// Offset to the KDC clock, applied to `ctime`.
    pub time_offset: Duration,
}

#[instrument(level = "trace", ret, skip_all, fields(client = %options.client, seq_number = ?options.seq_number))]
pub fn generate_authenticator(options: AuthenticatorOptions<'_>) -> Result<Authenticator> {
    let AuthenticatorOptions {
        client,
        checksum,
        subkey,
        seq_number,
        time_offset,
    } = options;

    let (_, ctime, cusec) = kerberos_time_now(time_offset);

    Ok(Authenticator::from(AuthenticatorInner {
        authenticator_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        crealm: ExplicitContextTag1::from(client.to_realm()?),
        cname: ExplicitContextTag2::from(client.to_principal_name()?),
        cksum: Optional::from(checksum.map(ExplicitContextTag3::from)),
        cusec: ExplicitContextTag4::from(cusec),
        ctime: ExplicitContextTag5::from(ctime),
        subkey: Optional::from(subkey.map(|(key_type, key_value)| {
            ExplicitContextTag6::from(EncryptionKey {
                key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![key_type.into()])),
                key_value: ExplicitContextTag1::from(OctetStringAsn1::from(key_value.as_ref().clone())),
            })
        })),
        seq_number: Optional::from(seq_number.map(|seq_number| {
            ExplicitContextTag7::from(IntegerAsn1::from_bytes_be_unsigned(seq_number.to_be_bytes().to_vec()))
        })),
        authorization_data: Optional::from(None),
    }))
}

/// Encrypts the authenticator with the ticket session key. `key_usage` is `AP_REQ_AUTHENTICATOR` for
/// application requests and `TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR` inside a TGS request.
#[instrument(level = "trace", ret, skip(session_key, authenticator, ticket))]
pub fn generate_ap_req(
    ticket: Ticket,
    cipher_suite: &CipherSuite,
    session_key: &[u8],
    authenticator: &Authenticator,
    options: ApOptions,
    key_usage: i32,
) -> Result<ApReq> {
    let encoded_authenticator = picky_asn1_der::to_vec(authenticator)?;
    let encrypted_authenticator = encrypt_data(cipher_suite, session_key, key_usage, &encoded_authenticator, None)?;

    Ok(ApReq::from(ApReqInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REQ_MSG_TYPE])),
        ap_options: ExplicitContextTag2::from(ApOptionsAsn1::from(BitString::with_bytes(
            options.bits().to_be_bytes().to_vec(),
        ))),
        ticket: ExplicitContextTag3::from(ticket),
        authenticator: ExplicitContextTag4::from(encrypted_authenticator),
    }))
}

/// Salt used when the KDC does not send one: the realm followed by the name components.
///
/// [RFC 4120, section 4](https://www.rfc-editor.org/rfc/rfc4120#section-4)
pub fn default_salt(principal: &Principal) -> String {
    let mut salt = principal.realm.clone();
    for component in &principal.components {
        salt.push_str(component);
    }

    salt
}

pub fn kerberos_string(value: &str) -> Result<KerberosStringAsn1> {
    Ok(KerberosStringAsn1::from(IA5String::from_string(value.to_owned())?))
}
