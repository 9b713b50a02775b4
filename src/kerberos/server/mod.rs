//! Acceptor side of the context establishment.

pub mod cache;
mod extractors;
pub mod generators;

use std::sync::Arc;

use picky_krb::constants::error_codes::{KRB_AP_ERR_MODIFIED, KRB_AP_ERR_SKEW, KRB_AP_ERR_TKT_EXPIRED};
use picky_krb::messages::{ApRep, ApReq};
use time::{Duration, OffsetDateTime};

use self::cache::AuthenticatorCacheRecord;
use self::extractors::{
    authenticator_subkey, client_principal, decrypt_ap_req_authenticator, decrypt_ap_req_ticket, ticket_key_selector,
    ticket_session_key,
};
use self::generators::{generate_ap_rep, generate_krb_error};
use crate::ccache::{CredentialCache, MemoryCcache};
use crate::checksum::{self, verify_finished, ChecksumBinding, SessionCrypto, VerifyOptions};
use crate::config::ProcessConfig;
use crate::context::{AcceptorState, SecurityContext};
use crate::credential::CredentialHandle;
use crate::crypto::generate_random_symmetric_key;
use crate::flags::{ContextFlags, CredentialFlags, InternalFlags};
use crate::iakerb::{decode_iakerb_message, encode_iakerb_message, IakerbHeader};
use crate::kerberos::client::extractors::extract_ap_rep_part;
use crate::kerberos::flags::{kerberos_flags_to_u32, ApOptions};
use crate::kerberos::integer_to_u32;
use crate::kerberos::messages::{
    encode_token, frame_token, parse_token, Mechanism, AP_REP_TOKEN_ID, AP_REQ_TOKEN_ID, IAKERB_TOKEN_ID,
    KRB_ERROR_TOKEN_ID, PKU2U_AS_REP_TOKEN_ID, PKU2U_AS_REQ_TOKEN_ID,
};
use crate::kerberos::session::is_cfx_enctype;
use crate::kerberos::utils::{offset_date_time, timestamp_with_usec};
use crate::keytab::KeyTable;
use crate::krb_cred::decode_krb_cred;
use crate::network_client::KdcRequest;
use crate::pac::{find_pac, verify_server_signature};
use crate::pk_init::WELLKNOWN_PKU2U_REALM;
use crate::principal::Principal;
use crate::sequence::SequenceWindow;
use crate::{Error, ErrorKind, Result, StepOutput, StepStatus};

/// Every state handler runs at most once per call.
const MAX_HANDLER_RUNS: usize = 6;

/// Runs acceptor state handlers on `input` until a token is produced or the context is established.
pub(crate) fn accept_step(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
    input: &[u8],
) -> Result<StepOutput> {
    let mut output = None;

    for run in 0..MAX_HANDLER_RUNS {
        let token = match context.acceptor_state()? {
            AcceptorState::Completed if run == 0 => {
                return Err(Error::new(ErrorKind::CallBadStructure, "acceptor stepped after completion"));
            }
            AcceptorState::Completed => {
                return Ok(StepOutput {
                    token: output,
                    status: StepStatus::Complete,
                })
            }
            AcceptorState::Krb5Start => krb5_start(context, credential, config, input)?,
            AcceptorState::IakerbStart => iakerb_start(context, config, input)?,
            AcceptorState::Pku2uStart => pku2u_start(context, config, input)?,
            AcceptorState::DceWait => dce_wait(context, input)?,
            AcceptorState::Ready => ready(context)?,
        };

        if token.is_some() {
            output = token;
        }

        let state = context.acceptor_state()?;
        if output.is_some() && !matches!(state, AcceptorState::Ready | AcceptorState::Completed) {
            return Ok(StepOutput {
                token: output,
                status: StepStatus::ContinueNeeded,
            });
        }
    }

    Err(Error::new(ErrorKind::Failure, "acceptor did not make progress"))
}

/// Answers the AP-REQ with a KRB-ERROR token and stays in the current state.
fn reject(context: &SecurityContext, error_code: u32, server: &Principal) -> Result<Option<Vec<u8>>> {
    let krb_error = generate_krb_error(error_code, server, None, Duration::ZERO)?;

    Ok(Some(encode_token(
        &context.mechanism.oid(),
        KRB_ERROR_TOKEN_ID,
        &krb_error,
        false,
    )?))
}

fn acceptor_keytab(credential: Option<&CredentialHandle>, config: &ProcessConfig) -> Result<Arc<dyn KeyTable>> {
    if let Some(keytab) = credential.and_then(|credential| credential.keytab()) {
        return Ok(Arc::clone(keytab));
    }

    config
        .resolve_default_keytab()
        .map_err(|err| Error::new(ErrorKind::Failure, format!("no keytab to accept with: {}", err)))
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn krb5_start(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
    input: &[u8],
) -> Result<Option<Vec<u8>>> {
    let token = parse_token(input)?;
    if let Some(mechanism) = token.mechanism.as_ref() {
        if Mechanism::from_oid(mechanism).is_none() {
            return Err(Error::new(
                ErrorKind::BadMech,
                format!("unsupported mechanism: {:?}", mechanism),
            ));
        }
    }
    let ap_req: ApReq = token.decode(AP_REQ_TOKEN_ID)?;

    if let Some(credential) = credential {
        if !credential.usage().can_accept() {
            return Err(Error::new(ErrorKind::NoCredentials, "credential cannot be used to accept"));
        }
    }
    let keytab = acceptor_keytab(credential, config)?;

    let (sname, kvno, ticket_etype) = ticket_key_selector(&ap_req)?;
    if let Some(principal) = credential.and_then(|credential| credential.principal()) {
        if !principal.same_name(&sname) {
            return Err(Error::new(
                ErrorKind::NoCredentials,
                format!("ticket is for {}, not for {}", sname, principal),
            ));
        }
    }

    let Some(entry) = keytab.lookup(&sname, kvno, Some(i32::from(u8::from(&ticket_etype))))? else {
        warn!(%sname, ?kvno, ?ticket_etype, keytab = %keytab.name(), "no key for the ticket");
        return reject(context, KRB_AP_ERR_MODIFIED, &sname);
    };

    let ticket = match decrypt_ap_req_ticket(&entry.key, &ap_req) {
        Ok(ticket) => ticket,
        Err(err) => {
            warn!(%sname, kvno = entry.kvno, %err, "cannot decrypt the ticket");
            return reject(context, KRB_AP_ERR_MODIFIED, &sname);
        }
    };

    let (session_etype, session_key) = ticket_session_key(&ticket)?;
    let authenticator = decrypt_ap_req_authenticator(&session_key, &ap_req)?;

    // [3.2.3.  Receipt of KRB_AP_REQ Message](https://www.rfc-editor.org/rfc/rfc4120#section-3.2.3)
    let client = client_principal(&ticket, &authenticator)?;

    let now = OffsetDateTime::now_utc();
    let max_skew = config.max_skew;

    let ctime = &authenticator.0.ctime.0;
    let cusec = &authenticator.0.cusec.0;
    let client_time = timestamp_with_usec(ctime, cusec)?;
    if (now - client_time).abs() > max_skew {
        warn!(%client, %client_time, "authenticator time is outside the allowed skew");
        return reject(context, KRB_AP_ERR_SKEW, &sname);
    }

    // [5.3.  Tickets](https://www.rfc-editor.org/rfc/rfc4120#section-5.3)
    // If the starttime field is absent from the ticket, then the authtime field SHOULD be used in its place.
    let start_time = offset_date_time(
        ticket
            .0
            .starttime
            .0
            .as_ref()
            .map(|start_time| &start_time.0)
            .unwrap_or(&ticket.0.auth_time.0),
    )?;
    if start_time > now + max_skew {
        return Err(Error::new(ErrorKind::DefectiveToken, "ticket is not yet valid"));
    }

    let end_time = offset_date_time(&ticket.0.endtime.0)?;
    if now > end_time + max_skew {
        warn!(%client, %end_time, "ticket is expired");
        return reject(context, KRB_AP_ERR_TKT_EXPIRED, &sname);
    }

    config.replay_cache.check_and_store(
        AuthenticatorCacheRecord {
            cname: client.clone(),
            sname: sname.clone(),
            ctime: client_time,
            microseconds: integer_to_u32(&cusec.0)?,
        },
        max_skew,
    )?;

    if let Some(pac) = find_pac(&ticket)? {
        verify_server_signature(&pac, entry.key.as_ref())?;
        context.internal_flags |= InternalFlags::PAC_VALIDATED;
    }

    let remote_subkey = authenticator_subkey(&authenticator)?;
    let remote_seq = authenticator
        .0
        .seq_number
        .0
        .as_ref()
        .map(|seq_number| integer_to_u32(&seq_number.0.0))
        .transpose()?
        .unwrap_or(0);

    let (checksum_etype, checksum_key) = match remote_subkey.as_ref() {
        Some((etype, key)) => (etype.clone(), key),
        None => (session_etype.clone(), &session_key),
    };
    let is_cfx = is_cfx_enctype(&checksum_etype);

    let checksum = authenticator
        .0
        .cksum
        .0
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::DefectiveToken, "authenticator carries no checksum"))?;
    let verified = checksum::verify(
        &ChecksumBinding::from_checksum(&checksum.0)?,
        &VerifyOptions {
            channel_bindings: context.channel_bindings.as_ref(),
            session_crypto: Some(SessionCrypto {
                cipher_suite: &checksum_etype,
                key: checksum_key.as_ref(),
            }),
            allow_legacy: context.internal_flags.contains(InternalFlags::LEGACY_CHECKSUM_COMPAT),
        },
    )?;

    if verified.legacy {
        context.internal_flags |= InternalFlags::LEGACY_CHECKSUM_SELECTED;
    }

    if let (Some(finished), true) = (verified.finished.as_ref(), is_cfx) {
        let (_, subkey) = remote_subkey
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::BadSignature, "KRB-FINISHED without an initiator subkey"))?;

        verify_finished(finished, subkey.as_ref(), context.finished_key_usage(), &context.transcript)?;
        debug!(len = context.transcript.len(), "transcript verified");
    }

    let ap_options = ApOptions::from_bits_truncate(kerberos_flags_to_u32(&ap_req.0.ap_options.0));
    let mut flags = verified.flags | ContextFlags::always_offered();
    let mutual = ap_options.contains(ApOptions::MUTUAL_REQUIRED)
        || flags.intersects(ContextFlags::MUTUAL | ContextFlags::DCE_STYLE);
    if mutual {
        flags |= ContextFlags::MUTUAL;
    }
    if credential
        .map(|credential| credential.flags().contains(CredentialFlags::SUPPRESS_CONF_INT_FLAGS))
        .unwrap_or(false)
    {
        flags.remove(ContextFlags::CONF | ContextFlags::INTEG);
    }

    info!(%client, server = %sname, ?flags, "AP-REQ accepted");

    context.flags = flags;
    context.delegation_blob = verified.delegation;
    context.source = Some(client);
    context.target = Some(sname);
    context.expiration = Some(end_time);
    context.auth_context.authenticator_time = Some((ctime.clone(), cusec.clone()));
    context.session.is_cfx = is_cfx;
    if is_cfx {
        context.internal_flags |= InternalFlags::CFX_MODE;
    }
    context.session.enctype = Some(session_etype.clone());
    context.session.remote_seq = remote_seq;
    context.session.remote_subkey = remote_subkey.map(|(_, key)| key);

    if !mutual {
        context.session.session_key = Some(session_key);
        context.set_acceptor_state(AcceptorState::Ready);

        return Ok(None);
    }

    let local_subkey = is_cfx.then(|| generate_random_symmetric_key(&session_etype));
    let ap_rep = generate_ap_rep(
        session_key.as_ref(),
        &session_etype,
        ctime.clone(),
        cusec.clone(),
        local_subkey.as_ref(),
        Some(context.session.local_seq),
    )?;

    let dce_style = flags.contains(ContextFlags::DCE_STYLE);
    let token = encode_token(&context.mechanism.oid(), AP_REP_TOKEN_ID, &ap_rep, dce_style)?;

    context.session.session_key = Some(session_key);
    context.session.local_subkey = local_subkey;
    context.set_acceptor_state(if dce_style {
        AcceptorState::DceWait
    } else {
        AcceptorState::Ready
    });

    Ok(Some(token))
}

/// Forwards a tunneled KDC message through the configured transport.
fn tunnel(config: &ProcessConfig, realm: &str, message: &[u8]) -> Result<Vec<u8>> {
    let transport = config
        .kdc_transport
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::Failure, "no KDC transport to forward the tunneled request"))?;

    let realm = if realm.is_empty() {
        config.default_realm.clone().unwrap_or_default()
    } else {
        realm.to_owned()
    };
    debug!(%realm, len = message.len(), "forwarding tunneled KDC request");

    transport.send(&KdcRequest {
        realm,
        data: message.to_vec(),
    })
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn iakerb_start(context: &mut SecurityContext, config: &ProcessConfig, input: &[u8]) -> Result<Option<Vec<u8>>> {
    let token = parse_token(input)?;
    if token.token_id != IAKERB_TOKEN_ID {
        debug!("no IAKERB message, continuing with the AP-REQ");
        context.set_acceptor_state(AcceptorState::Krb5Start);

        return Ok(None);
    }

    let (header, kdc_request) = decode_iakerb_message(token.body)?;
    let kdc_reply = tunnel(config, &header.target_realm, kdc_request)?;

    let body = encode_iakerb_message(
        &IakerbHeader {
            target_realm: header.target_realm,
            cookie: header.cookie,
        },
        &kdc_reply,
    )?;
    let output = frame_token(&context.mechanism.oid(), IAKERB_TOKEN_ID, &body)?;

    context.transcript.extend_from_slice(input);
    context.transcript.extend_from_slice(&output);

    Ok(Some(output))
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn pku2u_start(context: &mut SecurityContext, config: &ProcessConfig, input: &[u8]) -> Result<Option<Vec<u8>>> {
    let token = parse_token(input)?;
    if token.token_id != PKU2U_AS_REQ_TOKEN_ID {
        debug!("no PKU2U AS-REQ, continuing with the AP-REQ");
        context.set_acceptor_state(AcceptorState::Krb5Start);

        return Ok(None);
    }

    let as_rep = tunnel(config, WELLKNOWN_PKU2U_REALM, token.body)?;
    let output = frame_token(&context.mechanism.oid(), PKU2U_AS_REP_TOKEN_ID, &as_rep)?;

    context.transcript.extend_from_slice(input);
    context.transcript.extend_from_slice(&output);

    Ok(Some(output))
}

/// Third leg of a DCE-style exchange: the initiator echoes our sequence number in its own AP-REP.
#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn dce_wait(context: &mut SecurityContext, input: &[u8]) -> Result<Option<Vec<u8>>> {
    let ap_rep: ApRep = parse_token(input)?.decode(AP_REP_TOKEN_ID)?;

    let session_key = context
        .session
        .session_key
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "session key is not established"))?;
    let enc_part = extract_ap_rep_part(&ap_rep, session_key.as_ref())?;

    let seq_number = enc_part
        .0
        .seq_number
        .0
        .as_ref()
        .map(|seq_number| integer_to_u32(&seq_number.0.0))
        .transpose()?;
    if seq_number != Some(context.session.local_seq) {
        return Err(Error::new(
            ErrorKind::UnseqToken,
            format!(
                "DCE AP-REP sequence number {:?} does not echo {}",
                seq_number, context.session.local_seq
            ),
        ));
    }

    if let Some(expiration) = context.expiration {
        if OffsetDateTime::now_utc() > expiration {
            return Err(Error::new(ErrorKind::ContextExpired, "ticket expired during the DCE exchange"));
        }
    }

    context.set_acceptor_state(AcceptorState::Ready);

    Ok(None)
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn ready(context: &mut SecurityContext) -> Result<Option<Vec<u8>>> {
    context.sequence_window = Some(SequenceWindow::new(
        u64::from(context.session.remote_seq),
        context.session.is_cfx,
        context.flags,
    ));

    match context.delegation_blob.take() {
        Some(blob) if context.flags.contains(ContextFlags::DELEG) => {
            let session_key = context
                .session
                .session_key
                .as_ref()
                .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "session key is not established"))?;
            let client = context
                .source
                .clone()
                .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "initiator is not known"))?;

            let delegated = decode_krb_cred(&blob, session_key.as_ref())?;
            let ccache = MemoryCcache::with_principal(format!("delegated:{}", client), &client);
            for credentials in delegated {
                ccache.store(credentials)?;
            }

            debug!(%client, "delegated credentials imported");
            context.delegated_ccache = Some(Arc::new(ccache));
        }
        _ => context.flags.remove(ContextFlags::DELEG),
    }

    context.internal_flags |= InternalFlags::OPEN;
    context.set_acceptor_state(AcceptorState::Completed);

    Ok(None)
}
