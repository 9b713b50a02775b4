use picky_asn1::wrapper::{
    ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3, ExplicitContextTag4,
    ExplicitContextTag5, ExplicitContextTag6, ExplicitContextTag9, ExplicitContextTag10, ExplicitContextTag12,
    IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_krb::constants::key_usages::AP_REP_ENC;
use picky_krb::constants::types::{AP_REP_MSG_TYPE, KRB_ERROR_MSG_TYPE};
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{EncApRepPart, EncApRepPartInner, EncryptionKey, KerberosTime, Microseconds};
use picky_krb::messages::{ApRep, ApRepInner, KrbError, KrbErrorInner};
use time::Duration;

use crate::kerberos::utils::{encrypt_data, kerberos_time_now};
use crate::kerberos::KERBEROS_VERSION;
use crate::principal::Principal;
use crate::{Result, Secret};

/// Builds an AP-REP. `ctime` and `cusec` echo the authenticator being answered.
///
/// The initiator uses the same message in DCE style to answer the acceptor AP-REP.
#[instrument(level = "trace", ret, skip(session_key, subkey))]
pub fn generate_ap_rep(
    session_key: &[u8],
    cipher_suite: &CipherSuite,
    ctime: KerberosTime,
    cusec: Microseconds,
    subkey: Option<&Secret<Vec<u8>>>,
    seq_number: Option<u32>,
) -> Result<ApRep> {
    let enc_part = EncApRepPart::from(EncApRepPartInner {
        ctime: ExplicitContextTag0::from(ctime),
        cusec: ExplicitContextTag1::from(cusec),
        subkey: Optional::from(subkey.map(|subkey| {
            ExplicitContextTag2::from(EncryptionKey {
                key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![cipher_suite.into()])),
                key_value: ExplicitContextTag1::from(OctetStringAsn1::from(subkey.as_ref().clone())),
            })
        })),
        seq_number: Optional::from(seq_number.map(|seq_number| {
            ExplicitContextTag3::from(IntegerAsn1::from_bytes_be_unsigned(seq_number.to_be_bytes().to_vec()))
        })),
    });

    let enc_data = encrypt_data(
        cipher_suite,
        session_key,
        AP_REP_ENC,
        &picky_asn1_der::to_vec(&enc_part)?,
        None,
    )?;

    Ok(ApRep::from(ApRepInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REP_MSG_TYPE])),
        enc_part: ExplicitContextTag2::from(enc_data),
    }))
}

/// KRB-ERROR answered by the acceptor (`KRB_AP_ERR_SKEW`, `KRB_AP_ERR_MODIFIED`).
///
/// `stime` is our clock plus `clock_offset`; the initiator derives its time offset from it.
#[instrument(level = "debug", ret, skip(e_data))]
pub fn generate_krb_error(
    error_code: u32,
    server: &Principal,
    e_data: Option<Vec<u8>>,
    clock_offset: Duration,
) -> Result<KrbError> {
    let (_, stime, susec) = kerberos_time_now(clock_offset);

    Ok(KrbError::from(KrbErrorInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_ERROR_MSG_TYPE])),
        ctime: Optional::from(None),
        cusec: Optional::from(None),
        stime: ExplicitContextTag4::from(stime),
        susec: ExplicitContextTag5::from(susec),
        error_code: ExplicitContextTag6::from(error_code),
        crealm: Optional::from(None),
        cname: Optional::from(None),
        realm: ExplicitContextTag9::from(server.to_realm()?),
        sname: ExplicitContextTag10::from(server.to_principal_name()?),
        e_text: Optional::from(None),
        e_data: Optional::from(e_data.map(|e_data| ExplicitContextTag12::from(OctetStringAsn1::from(e_data)))),
    }))
}
