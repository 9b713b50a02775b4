use picky_krb::constants::key_usages::{AP_REQ_AUTHENTICATOR, TICKET_REP};
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{Authenticator, EncTicketPart};
use picky_krb::messages::ApReq;

use crate::kerberos::integer_to_u32;
use crate::kerberos::utils::{cipher_suite_of, decrypt_data};
use crate::principal::Principal;
use crate::{Error, ErrorKind, Result, Secret};

/// Service principal, key version and encryption type the ticket is encrypted for.
pub(super) fn ticket_key_selector(ap_req: &ApReq) -> Result<(Principal, Option<u32>, CipherSuite)> {
    let ticket = &ap_req.0.ticket.0.0;

    let sname = Principal::from_principal_name(&ticket.sname.0, &ticket.realm.0)?;
    let kvno = ticket
        .enc_part
        .0
        .kvno
        .0
        .as_ref()
        .map(|kvno| integer_to_u32(&kvno.0.0))
        .transpose()?;

    Ok((sname, kvno, cipher_suite_of(&ticket.enc_part.0)?))
}

/// Decrypts the [ApReq] ticket and returns decoded encrypted part of the ticket.
pub(super) fn decrypt_ap_req_ticket(key: &Secret<Vec<u8>>, ap_req: &ApReq) -> Result<EncTicketPart> {
    let encoded_enc_part = decrypt_data(key.as_ref(), TICKET_REP, &ap_req.0.ticket.0.0.enc_part.0)?;

    Ok(picky_asn1_der::from_bytes(&encoded_enc_part)?)
}

/// Decrypts [ApReq] Authenticator and returns decoded authenticator.
pub(super) fn decrypt_ap_req_authenticator(session_key: &Secret<Vec<u8>>, ap_req: &ApReq) -> Result<Authenticator> {
    let encoded_authenticator = decrypt_data(session_key.as_ref(), AP_REQ_AUTHENTICATOR, &ap_req.0.authenticator.0)?;

    Ok(picky_asn1_der::from_bytes(&encoded_authenticator)?)
}

/// Client named by the ticket. The authenticator must name the same client.
pub(super) fn client_principal(ticket: &EncTicketPart, authenticator: &Authenticator) -> Result<Principal> {
    let ticket_client = Principal::from_principal_name(&ticket.0.cname.0, &ticket.0.crealm.0)?;
    let authenticator_client = Principal::from_principal_name(&authenticator.0.cname.0, &authenticator.0.crealm.0)?;

    if !ticket_client.same_name(&authenticator_client) {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            format!(
                "ticket client ({}) and authenticator client ({}) do not match",
                ticket_client, authenticator_client
            ),
        ));
    }

    Ok(ticket_client)
}

/// Session key from the ticket, with its encryption type.
pub(super) fn ticket_session_key(ticket: &EncTicketPart) -> Result<(CipherSuite, Secret<Vec<u8>>)> {
    let key = &ticket.0.key.0;

    Ok((
        CipherSuite::try_from(key.key_type.0.0.as_slice())?,
        Secret::copy_from(&key.key_value.0.0),
    ))
}

/// Subkey carried by the authenticator, if any.
pub(super) fn authenticator_subkey(authenticator: &Authenticator) -> Result<Option<(CipherSuite, Secret<Vec<u8>>)>> {
    authenticator
        .0
        .subkey
        .0
        .as_ref()
        .map(|subkey| -> Result<_> {
            Ok((
                CipherSuite::try_from(subkey.0.key_type.0.0.as_slice())?,
                Secret::copy_from(&subkey.0.key_value.0.0),
            ))
        })
        .transpose()
}
