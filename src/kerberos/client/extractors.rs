use byteorder::{LittleEndian, ReadBytesExt};
use picky_asn1::wrapper::{Asn1SequenceOf, ExplicitContextTag1, ExplicitContextTag2, IntegerAsn1, OctetStringAsn1};
use picky_asn1::wrapper::Optional;
use picky_krb::constants::key_usages::AP_REP_ENC;
use picky_krb::constants::types::PA_ETYPE_INFO2_TYPE;
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{EtypeInfo2, PaData};
use picky_krb::data_types::EncApRepPart;
use picky_krb::messages::{ApRep, EncAsRepPart, EncKdcRepPart, EncTgsRepPart, KdcRep, KrbError};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::ccache::TicketCredentials;
use crate::kerberos::flags::{kerberos_flags_to_u32, TicketFlags};
use crate::kerberos::integer_to_u32;
use crate::kerberos::utils::{decrypt_data, offset_date_time};
use crate::principal::Principal;
use crate::{Error, ErrorKind, Result, Secret};

/// `KERB-ERR-TYPE-EXTENDED`: e-data carries an NT status.
const KERB_ERR_TYPE_EXTENDED: u8 = 3;
/// `STATUS_TIME_DIFFERENCE_AT_DC`.
const STATUS_TIME_DIFFERENCE_AT_DC: u32 = 0xc000_0133;

/// `KERB-ERROR-DATA` sent by Windows KDCs and acceptors.
///
/// [MS-KILE, 2.2.1](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-kile/)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KerbErrorData {
    pub data_type: ExplicitContextTag1<IntegerAsn1>,
    #[serde(default)]
    pub data_value: Optional<Option<ExplicitContextTag2<OctetStringAsn1>>>,
}

/// Reads the first ETYPE-INFO2 entry of a KRB-ERROR: the encryption type and salt for the long-term key.
pub fn extract_etype_info2(error: &KrbError) -> Result<Option<(CipherSuite, Option<String>)>> {
    let Some(e_data) = error.0.e_data.0.as_ref() else {
        return Ok(None);
    };

    let pa_datas: Asn1SequenceOf<PaData> = picky_asn1_der::from_bytes(&e_data.0.0)?;

    let Some(pa_etype_info_2) = pa_datas
        .0
        .into_iter()
        .find(|pa_data| pa_data.padata_type.0.0 == PA_ETYPE_INFO2_TYPE)
    else {
        return Ok(None);
    };

    let etype_info_2: EtypeInfo2 = picky_asn1_der::from_bytes(&pa_etype_info_2.padata_data.0.0)?;

    // the first entry is the KDC preference
    let Some(entry) = etype_info_2.0.first() else {
        return Ok(None);
    };

    let cipher_suite = CipherSuite::try_from(entry.etype.0.0.as_slice())?;
    let salt = entry.salt.0.as_ref().map(|salt| salt.0.to_string());

    Ok(Some((cipher_suite, salt)))
}

/// Decrypts the `enc-part` of an AS-REP or TGS-REP.
///
/// Some KDCs use the `EncTGSRepPart` tag in AS replies, so both tags are accepted.
pub fn extract_enc_kdc_rep_part(kdc_rep: &KdcRep, key: &[u8], key_usage: i32) -> Result<EncKdcRepPart> {
    let data = decrypt_data(key, key_usage, &kdc_rep.enc_part.0)?;

    if let Ok(enc_as_rep_part) = picky_asn1_der::from_bytes::<EncAsRepPart>(&data) {
        return Ok(enc_as_rep_part.0);
    }

    let enc_tgs_rep_part: EncTgsRepPart = picky_asn1_der::from_bytes(&data)?;

    Ok(enc_tgs_rep_part.0)
}

/// Builds the ticket credentials from a decrypted KDC reply. The nonce must echo the request.
#[instrument(level = "trace", skip_all)]
pub fn credentials_from_kdc_rep(
    kdc_rep: &KdcRep,
    enc_part: &EncKdcRepPart,
    expected_nonce: &[u8],
) -> Result<TicketCredentials> {
    if integer_to_u32(&enc_part.nonce.0.0)? != integer_to_u32(expected_nonce)? {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            "KDC reply nonce does not match the request nonce",
        ));
    }

    let client = Principal::from_principal_name(&kdc_rep.cname.0, &kdc_rep.crealm.0)?;
    let server = Principal::from_principal_name(&enc_part.sname.0, &enc_part.srealm.0)?;

    let session_etype = CipherSuite::try_from(enc_part.key.0.key_type.0.0.as_slice())?;

    Ok(TicketCredentials {
        client,
        server,
        ticket: kdc_rep.ticket.0.clone(),
        session_key: Secret::copy_from(&enc_part.key.0.key_value.0.0),
        session_etype,
        flags: TicketFlags::from_bits_truncate(kerberos_flags_to_u32(&enc_part.flags.0)),
        auth_time: offset_date_time(&enc_part.auth_time.0)?,
        start_time: enc_part
            .start_time
            .0
            .as_ref()
            .map(|start_time| offset_date_time(&start_time.0))
            .transpose()?,
        end_time: offset_date_time(&enc_part.end_time.0)?,
        renew_till: enc_part
            .renew_till
            .0
            .as_ref()
            .map(|renew_till| offset_date_time(&renew_till.0))
            .transpose()?,
    })
}

/// Decrypts the AP-REP `enc-part` with the ticket session key.
pub fn extract_ap_rep_part(ap_rep: &ApRep, session_key: &[u8]) -> Result<EncApRepPart> {
    let data = decrypt_data(session_key, AP_REP_ENC, &ap_rep.0.enc_part.0)?;

    Ok(picky_asn1_der::from_bytes(&data)?)
}

pub fn krb_error_code(error: &KrbError) -> u32 {
    error.0.error_code.0
}

/// Offset between the server clock (`stime`, `susec`) and ours.
pub fn krb_error_time_offset(error: &KrbError) -> Result<Duration> {
    let server_time = offset_date_time(&error.0.stime.0)?;

    Ok(server_time - OffsetDateTime::now_utc())
}

/// Checks for the `STATUS_TIME_DIFFERENCE_AT_DC` NT status Windows sends in `KRB_ERR_GENERIC` replies.
pub fn has_time_difference_status(error: &KrbError) -> bool {
    let Some(e_data) = error.0.e_data.0.as_ref() else {
        return false;
    };

    let Ok(error_data) = picky_asn1_der::from_bytes::<KerbErrorData>(&e_data.0.0) else {
        return false;
    };

    if error_data.data_type.0.0.last() != Some(&KERB_ERR_TYPE_EXTENDED) {
        return false;
    }

    let Some(data_value) = error_data.data_value.0.as_ref() else {
        return false;
    };

    // KERB-EXT-ERROR: status (u32 LE), reserved, flags
    let mut status = data_value.0.0.as_slice();
    matches!(status.read_u32::<LittleEndian>(), Ok(STATUS_TIME_DIFFERENCE_AT_DC))
}
