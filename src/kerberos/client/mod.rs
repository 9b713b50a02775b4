//! Initiator side of the context establishment.

pub mod extractors;
pub mod generators;

use std::sync::Arc;

use picky_krb::constants::error_codes::{KRB_AP_ERR_MODIFIED, KRB_AP_ERR_SKEW, KRB_AP_ERR_TKT_EXPIRED, KRB_ERR_GENERIC};
use picky_krb::constants::key_usages::AP_REQ_AUTHENTICATOR;
use picky_krb::crypto::CipherSuite;
use picky_krb::messages::{ApRep, KrbError};
use time::{Duration, OffsetDateTime};

use self::extractors::{extract_ap_rep_part, has_time_difference_status, krb_error_code, krb_error_time_offset};
use self::generators::{
    generate_ap_req, generate_authenticator, AuthenticatorOptions, DEFAULT_TGS_REQ_OPTIONS,
};
use crate::ccache::{CredentialCache, TicketCredentials};
use crate::checksum::{self, make_finished, ChecksumRequest, SessionCrypto};
use crate::config::{DnsPolicy, ProcessConfig};
use crate::context::{InitiatorState, SecurityContext};
use crate::credential::CredentialHandle;
use crate::crypto::generate_random_symmetric_key;
use crate::flags::{ContextFlags, CredentialFlags, InternalFlags};
use crate::iakerb::{decode_iakerb_message, encode_iakerb_message, IakerbHeader};
use crate::kerberos::acquire::{drive, kdc_error, AcquireStep, Acquisition, AsExchange, PkinitExchange, TgsExchange};
use crate::kerberos::flags::{ApOptions, TicketFlags};
use crate::kerberos::integer_to_u32;
use crate::kerberos::messages::{
    encode_token, frame_token, parse_token, Mechanism, AP_REP_TOKEN_ID, AP_REQ_TOKEN_ID, IAKERB_TOKEN_ID,
    KRB_ERROR_TOKEN_ID, PKU2U_AS_REP_TOKEN_ID, PKU2U_AS_REQ_TOKEN_ID,
};
use crate::kerberos::server::generators::generate_ap_rep;
use crate::kerberos::session::is_cfx_enctype;
use crate::kerberos::utils::timestamp_with_usec;
use crate::krb_cred::encode_krb_cred;
use crate::pk_init::{principal_from_certificate, WELLKNOWN_PKU2U_REALM};
use crate::principal::{parse_host_based_service, Principal, NT_SRV_HST};
use crate::sequence::SequenceWindow;
use crate::{Error, ErrorKind, Result, Secret, StepOutput, StepStatus};

/// Every state handler runs at most once per call, a retry revisits a few of them.
const MAX_HANDLER_RUNS: usize = 8;

/// Runs initiator state handlers until a token has to be sent or the context is established.
///
/// `input` is handed to the first handler that consumes a peer token.
pub(crate) fn init_step(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
    input: Option<&[u8]>,
) -> Result<StepOutput> {
    let mut input = input;
    let mut output = None;

    for run in 0..MAX_HANDLER_RUNS {
        let token = match context.initiator_state()? {
            InitiatorState::Completed if run == 0 => {
                return Err(Error::new(ErrorKind::CallBadStructure, "initiator stepped after completion"));
            }
            InitiatorState::Completed => {
                return Ok(StepOutput {
                    token: output,
                    status: StepStatus::Complete,
                })
            }
            InitiatorState::Krb5Start => krb5_start(context, credential, config)?,
            InitiatorState::IakerbStart => iakerb_start(context, credential, config, input.take())?,
            InitiatorState::Pku2uStart => pku2u_start(context, credential, input.take())?,
            InitiatorState::SetupKeys => setup_keys(context)?,
            InitiatorState::AuthStep => auth_step(context, credential, config)?,
            InitiatorState::WaitMutual => wait_mutual(context, input.take())?,
        };

        if token.is_some() {
            output = token;
        }

        if output.is_some() && context.initiator_state()? != InitiatorState::Completed {
            return Ok(StepOutput {
                token: output,
                status: StepStatus::ContinueNeeded,
            });
        }
    }

    Err(Error::new(ErrorKind::Failure, "initiator did not make progress"))
}

fn suppresses_conf_int(credential: Option<&CredentialHandle>) -> bool {
    credential
        .map(|credential| credential.flags().contains(CredentialFlags::SUPPRESS_CONF_INT_FLAGS))
        .unwrap_or(false)
}

fn target_service(context: &SecurityContext) -> Result<(String, String)> {
    let name = context
        .target_name
        .as_deref()
        .ok_or_else(|| Error::new(ErrorKind::BadName, "no target name"))?;

    match parse_host_based_service(name)? {
        (service, Some(host)) => Ok((service, host)),
        (_, None) => Err(Error::new(
            ErrorKind::BadName,
            format!("target name has no host: {}", name),
        )),
    }
}

/// The credential's ccache, else the process default one (closed again once the context is ready).
fn resolve_ccache(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
) -> Result<Arc<dyn CredentialCache>> {
    if let Some(ccache) = context.ccache.as_ref() {
        return Ok(Arc::clone(ccache));
    }

    if let Some(credential) = credential {
        if !credential.usage().can_initiate() {
            return Err(Error::new(ErrorKind::NoCredentials, "credential cannot be used to initiate"));
        }

        if let Some(ccache) = credential.ccache() {
            context.ccache = Some(Arc::clone(ccache));

            return Ok(Arc::clone(ccache));
        }
    }

    let ccache = config
        .default_ccache()?
        .ok_or_else(|| Error::new(ErrorKind::NoCredentials, "no credential cache"))?;
    context.internal_flags |= InternalFlags::CLOSE_STORE_ON_DELETE;
    context.ccache = Some(Arc::clone(&ccache));

    Ok(ccache)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostLookup {
    AsGiven,
    Canonical,
}

fn host_lookups(policy: DnsPolicy) -> &'static [HostLookup] {
    match policy {
        DnsPolicy::Never => &[HostLookup::AsGiven],
        DnsPolicy::Fallback => &[HostLookup::AsGiven, HostLookup::Canonical],
        DnsPolicy::Always => &[HostLookup::Canonical],
    }
}

fn canonical_host(config: &ProcessConfig, host: &str) -> Result<String> {
    match config.canonicalizer.as_ref() {
        Some(canonicalizer) => Ok(canonicalizer.canonicalize(host)?.to_ascii_lowercase()),
        None => Ok(host.to_owned()),
    }
}

/// Service ticket from the ccache, or from the KDC with the TGT when there is a transport.
fn service_ticket(
    config: &ProcessConfig,
    ccache: &dyn CredentialCache,
    client: &Principal,
    server: &Principal,
    time_offset: Duration,
) -> Result<TicketCredentials> {
    let now = OffsetDateTime::now_utc() + time_offset;

    let cached = ccache.retrieve(client, server)?;
    if let Some(credentials) = cached.as_ref().filter(|credentials| !credentials.is_expired(now)) {
        debug!(%server, "service ticket found in the ccache");

        return Ok(credentials.clone());
    }

    let Some(transport) = config.kdc_transport.as_ref() else {
        return cached.ok_or_else(|| {
            Error::new(
                ErrorKind::NoCredentials,
                format!("no ticket for {} and no KDC to ask", server),
            )
        });
    };

    let tgt = ccache
        .retrieve(client, &Principal::tgs(&client.realm))?
        .ok_or_else(|| Error::new(ErrorKind::NoCredentials, format!("no TGT for {}", client)))?;

    let mut acquisition = Acquisition::Tgs(TgsExchange::new(
        tgt,
        server.clone(),
        DEFAULT_TGS_REQ_OPTIONS,
        time_offset,
    ));
    let credentials = drive(&mut acquisition, transport.as_ref())?;

    ccache.store(credentials.clone())?;
    config.negative_cache.notify_cache_changed();

    Ok(credentials)
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn krb5_start(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
) -> Result<Option<Vec<u8>>> {
    let ccache = resolve_ccache(context, credential, config)?;
    let client = ccache.principal()?;
    let time_offset = ccache.time_offset()?;

    let (service, host) = target_service(context)?;
    let lookups = host_lookups(config.dns_policy);

    let mut result = Err(Error::new(ErrorKind::BadName, "no host name to try"));
    for (attempt, lookup) in lookups.iter().enumerate() {
        let host = match lookup {
            HostLookup::AsGiven => host.clone(),
            HostLookup::Canonical => canonical_host(config, &host)?,
        };
        let realm = config.realm_for_host(&host).unwrap_or_else(|| client.realm.clone());
        let server = Principal::new(NT_SRV_HST, vec![service.clone(), host], realm);

        let has_fallback = attempt + 1 < lookups.len();
        if has_fallback && config.negative_cache.contains(&client, &server) {
            debug!(%server, "skipping a known failing service name");
            continue;
        }

        result = service_ticket(config, ccache.as_ref(), &client, &server, time_offset);
        match &result {
            Err(err) if err.error_type == ErrorKind::BadName => {
                warn!(%server, %err, "service ticket lookup failed");
                config.negative_cache.insert(&client, &server);
            }
            _ => break,
        }
    }
    let ticket = result?;

    let now = OffsetDateTime::now_utc() + time_offset;
    if ticket.is_expired(now) {
        return Err(Error::new(
            ErrorKind::ContextExpired,
            format!("ticket for {} expired at {}", ticket.server, ticket.end_time),
        ));
    }

    info!(%client, server = %ticket.server, "service ticket ready");

    context.auth_context.time_offset = time_offset;
    context.source = Some(client);
    context.target = Some(ticket.server.clone());
    context.expiration = Some(ticket.end_time);
    context.ticket = Some(ticket);
    context.set_initiator_state(InitiatorState::SetupKeys);

    Ok(None)
}

/// Picks the first exchange of the IAKERB handshake from what the credential holds.
fn start_iakerb_acquisition(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
) -> Result<Acquisition> {
    let credential = credential.ok_or_else(|| Error::new(ErrorKind::NoCredentials, "IAKERB needs a credential"))?;
    if !credential.usage().can_initiate() {
        return Err(Error::new(ErrorKind::NoCredentials, "credential cannot be used to initiate"));
    }

    let (service, host) = target_service(context)?;
    let realm = config
        .realm_for_host(&host)
        .ok_or_else(|| Error::new(ErrorKind::BadName, format!("no realm for {}", host)))?;
    let target = Principal::new(NT_SRV_HST, vec![service, host], realm);

    context.ccache = credential.ccache().cloned();
    let time_offset = match context.ccache.as_ref() {
        Some(ccache) => ccache.time_offset()?,
        None => Duration::ZERO,
    };
    context.auth_context.time_offset = time_offset;
    context.target = Some(target.clone());

    if let Some(ccache) = context.ccache.as_ref() {
        let client = ccache.principal()?;
        let now = OffsetDateTime::now_utc() + time_offset;

        if let Some(tgt) = ccache
            .retrieve(&client, &Principal::tgs(&client.realm))?
            .filter(|tgt| !tgt.is_expired(now))
        {
            debug!(%client, "IAKERB with a cached TGT");

            return Ok(Acquisition::Tgs(TgsExchange::new(
                tgt,
                target,
                DEFAULT_TGS_REQ_OPTIONS,
                time_offset,
            )));
        }
    }

    if let (Some(principal), Some(password)) = (credential.principal(), credential.password()) {
        return Ok(Acquisition::As(AsExchange::new(
            principal.clone(),
            password.clone(),
            time_offset,
        )));
    }

    if let Some((certificate, private_key)) = credential.certificate() {
        let mut client = principal_from_certificate(certificate)?;
        client.realm = target.realm.clone();
        let server = Principal::tgs(&target.realm);

        return Ok(Acquisition::Pkinit(PkinitExchange::new(
            certificate.clone(),
            private_key.clone(),
            client,
            server,
            time_offset,
        )));
    }

    Err(Error::new(
        ErrorKind::NoCredentials,
        "credential has neither a TGT, a password nor a certificate",
    ))
}

fn ticket_acquired(context: &mut SecurityContext, credentials: TicketCredentials) {
    info!(client = %credentials.client, server = %credentials.server, "service ticket acquired");

    context.source = Some(credentials.client.clone());
    context.target = Some(credentials.server.clone());
    context.expiration = Some(credentials.end_time);
    context.ticket = Some(credentials);
    context.set_initiator_state(InitiatorState::SetupKeys);
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn iakerb_start(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
    input: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    let (mut acquisition, mut reply) = match (context.acquisition.take(), input) {
        (None, None) => (start_iakerb_acquisition(context, credential, config)?, None),
        (Some(acquisition), Some(input)) => {
            let token = parse_token(input)?;
            if token.token_id != IAKERB_TOKEN_ID {
                return Err(Error::new(
                    ErrorKind::DefectiveToken,
                    format!("expected an IAKERB token but got {:?}", token.token_id),
                ));
            }

            let (header, kdc_reply) = decode_iakerb_message(token.body)?;
            context.iakerb_cookie = header.cookie;
            context.transcript.extend_from_slice(input);

            (acquisition, Some(kdc_reply))
        }
        (Some(_), None) => {
            return Err(Error::new(ErrorKind::DefectiveToken, "IAKERB reply expected"));
        }
        (None, Some(_)) => {
            return Err(Error::new(ErrorKind::CallBadStructure, "no IAKERB exchange in progress"));
        }
    };

    loop {
        match acquisition.step(reply.take())? {
            AcquireStep::Send(request) => {
                let body = encode_iakerb_message(
                    &IakerbHeader {
                        target_realm: request.realm,
                        cookie: context.iakerb_cookie.clone(),
                    },
                    &request.data,
                )?;
                let token = frame_token(&context.mechanism.oid(), IAKERB_TOKEN_ID, &body)?;

                context.transcript.extend_from_slice(&token);
                context.acquisition = Some(acquisition);

                return Ok(Some(token));
            }
            AcquireStep::Done(credentials) if credentials.is_tgt() => {
                let target = context
                    .target
                    .clone()
                    .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "IAKERB target is not set"))?;
                if target.is_tgs() {
                    ticket_acquired(context, credentials);

                    return Ok(None);
                }

                debug!(client = %credentials.client, "TGT acquired through IAKERB");
                if let Some(ccache) = context.ccache.as_ref() {
                    ccache.store(credentials.clone())?;
                }

                acquisition = Acquisition::Tgs(TgsExchange::new(
                    credentials,
                    target,
                    DEFAULT_TGS_REQ_OPTIONS,
                    context.auth_context.time_offset,
                ));
            }
            AcquireStep::Done(credentials) => {
                ticket_acquired(context, credentials);

                return Ok(None);
            }
        }
    }
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn pku2u_start(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    input: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    match (context.acquisition.take(), input) {
        (None, None) => {
            let (certificate, private_key) = credential
                .and_then(|credential| credential.certificate())
                .ok_or_else(|| Error::new(ErrorKind::NoCredentials, "PKU2U needs a certificate credential"))?;

            let (service, host) = target_service(context)?;
            let client = principal_from_certificate(certificate)?;
            let server = Principal::new(NT_SRV_HST, vec![service, host], WELLKNOWN_PKU2U_REALM);
            context.target = Some(server.clone());

            let mut acquisition = Acquisition::Pkinit(PkinitExchange::new(
                certificate.clone(),
                private_key.clone(),
                client,
                server,
                Duration::ZERO,
            ));

            let AcquireStep::Send(request) = acquisition.step(None)? else {
                return Err(Error::new(ErrorKind::Failure, "PKINIT completed without a KDC request"));
            };
            let token = frame_token(&context.mechanism.oid(), PKU2U_AS_REQ_TOKEN_ID, &request.data)?;

            context.transcript.extend_from_slice(&token);
            context.acquisition = Some(acquisition);

            Ok(Some(token))
        }
        (Some(mut acquisition), Some(input)) => {
            let token = parse_token(input)?;
            if token.token_id != PKU2U_AS_REP_TOKEN_ID {
                return Err(Error::new(
                    ErrorKind::DefectiveToken,
                    format!("expected a PKU2U AS-REP token but got {:?}", token.token_id),
                ));
            }
            context.transcript.extend_from_slice(input);

            match acquisition.step(Some(token.body))? {
                AcquireStep::Done(credentials) => {
                    ticket_acquired(context, credentials);

                    Ok(None)
                }
                AcquireStep::Send(_) => Err(Error::new(ErrorKind::Failure, "PKU2U needs a single AS exchange")),
            }
        }
        (Some(_), None) => Err(Error::new(ErrorKind::DefectiveToken, "PKU2U AS-REP expected")),
        (None, Some(_)) => Err(Error::new(ErrorKind::CallBadStructure, "no PKU2U exchange in progress")),
    }
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn setup_keys(context: &mut SecurityContext) -> Result<Option<Vec<u8>>> {
    let ticket = context
        .ticket
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "no service ticket"))?;
    let cipher_suite = ticket.session_etype.clone();

    context.session.session_key = Some(ticket.session_key.clone());
    context.session.local_subkey = Some(generate_random_symmetric_key(&cipher_suite));
    context.session.is_cfx = is_cfx_enctype(&cipher_suite);
    if context.session.is_cfx {
        context.internal_flags |= InternalFlags::CFX_MODE;
    }
    context.session.enctype = Some(cipher_suite);

    context.set_initiator_state(InitiatorState::AuthStep);

    Ok(None)
}

/// Forwarded TGT packed in a KRB-CRED for the acceptor.
fn delegation(
    context: &SecurityContext,
    config: &ProcessConfig,
    flags: ContextFlags,
    cipher_suite: &CipherSuite,
    session_key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let ticket = context
        .ticket
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "no service ticket"))?;
    let allowed = flags.contains(ContextFlags::DELEG)
        || (flags.contains(ContextFlags::DELEG_POLICY) && ticket.flags.contains(TicketFlags::OK_AS_DELEGATE));
    if !allowed {
        debug!(server = %ticket.server, "delegation is not allowed by policy");

        return Ok(None);
    }

    let ccache = context
        .ccache
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::NoCredentials, "no ccache to delegate from"))?;
    let transport = config
        .kdc_transport
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::Failure, "no KDC transport to forward the TGT"))?;

    let tgt = ccache
        .retrieve(&ticket.client, &Principal::tgs(&ticket.client.realm))?
        .ok_or_else(|| Error::new(ErrorKind::NoCredentials, "no TGT to delegate"))?;
    if !tgt.flags.contains(TicketFlags::FORWARDABLE) {
        return Err(Error::new(ErrorKind::NoCredentials, "TGT is not forwardable"));
    }

    let mut acquisition = Acquisition::Tgs(TgsExchange::forwarded(tgt, context.auth_context.time_offset));
    let forwarded = drive(&mut acquisition, transport.as_ref())?;

    Ok(Some(encode_krb_cred(&[forwarded], cipher_suite, session_key)?))
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn auth_step(
    context: &mut SecurityContext,
    credential: Option<&CredentialHandle>,
    config: &ProcessConfig,
) -> Result<Option<Vec<u8>>> {
    let mut flags = (context.requested_flags | ContextFlags::always_offered()) - ContextFlags::ANON;
    if flags.contains(ContextFlags::DCE_STYLE) {
        flags |= ContextFlags::MUTUAL;
    }
    if suppresses_conf_int(credential) {
        flags.remove(ContextFlags::CONF | ContextFlags::INTEG);
    }

    let cipher_suite = context.session.cipher_suite();
    let session_key = context
        .session
        .session_key
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "session key is not established"))?;
    let subkey = context
        .session
        .local_subkey
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "initiator subkey is not generated"))?;

    let delegated = if flags.intersects(ContextFlags::DELEG | ContextFlags::DELEG_POLICY) {
        delegation(context, config, flags, &cipher_suite, session_key.as_ref()).unwrap_or_else(|err| {
            warn!(%err, "continuing without delegation");

            None
        })
    } else {
        None
    };
    flags.set(ContextFlags::DELEG, delegated.is_some());

    let crypto = SessionCrypto {
        cipher_suite: &cipher_suite,
        key: subkey.as_ref(),
    };

    let finished = if context.transcript.is_empty() {
        None
    } else {
        Some(make_finished(crypto, context.finished_key_usage(), &context.transcript)?)
    };

    let checksum = checksum::build(&ChecksumRequest {
        channel_bindings: context.channel_bindings.as_ref(),
        flags,
        delegation: delegated.as_deref(),
        outer_checksum: None,
        session_crypto: Some(crypto),
        finished: finished.as_deref(),
    })?;

    let ticket = context
        .ticket
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "no service ticket"))?;
    let authenticator = generate_authenticator(AuthenticatorOptions {
        client: &ticket.client,
        checksum: Some(checksum.to_checksum()),
        subkey: Some((&cipher_suite, &subkey)),
        seq_number: Some(context.session.local_seq),
        time_offset: context.auth_context.time_offset,
    })?;

    let ap_req = generate_ap_req(
        ticket.ticket.clone(),
        &cipher_suite,
        session_key.as_ref(),
        &authenticator,
        ApOptions::from(flags),
        AP_REQ_AUTHENTICATOR,
    )?;

    let token = encode_token(
        &context.mechanism.oid(),
        AP_REQ_TOKEN_ID,
        &ap_req,
        flags.contains(ContextFlags::DCE_STYLE),
    )?;

    debug!(?flags, "AP-REQ ready");

    context.auth_context.authenticator_time =
        Some((authenticator.0.ctime.0.clone(), authenticator.0.cusec.0.clone()));
    context.flags = flags;

    if flags.contains(ContextFlags::MUTUAL) {
        context.set_initiator_state(InitiatorState::WaitMutual);
    } else {
        finalize(context);
    }

    Ok(Some(token))
}

/// Recovers from the KRB-ERROR the acceptor answered our AP-REQ with, when the budget allows it.
fn retry_after_error(context: &mut SecurityContext, error: &KrbError) -> Result<Option<Vec<u8>>> {
    let code = krb_error_code(error);
    warn!(code, "acceptor rejected the AP-REQ");

    match code {
        KRB_AP_ERR_SKEW => adjust_clock(context, error),
        KRB_ERR_GENERIC if has_time_difference_status(error) => adjust_clock(context, error),
        KRB_AP_ERR_MODIFIED | KRB_AP_ERR_TKT_EXPIRED if context.mechanism == Mechanism::Kerberos5 => {
            if !context.retry_budget.spend_new_ticket() {
                return Err(Error::new(
                    ErrorKind::ContextExpired,
                    "acceptor rejected a fresh service ticket",
                ));
            }

            if let (Some(ccache), Some(ticket)) = (context.ccache.as_ref(), context.ticket.as_ref()) {
                ccache.remove(&ticket.client, &ticket.server)?;
            }
            context.ticket = None;
            context.session.session_key = None;
            context.session.local_subkey = None;
            context.set_initiator_state(InitiatorState::Krb5Start);

            Ok(None)
        }
        _ => Err(kdc_error(error)),
    }
}

fn adjust_clock(context: &mut SecurityContext, error: &KrbError) -> Result<Option<Vec<u8>>> {
    if !context.retry_budget.spend_skew() {
        return Err(Error::new(
            ErrorKind::TimeSkew,
            "clock skew persists after adjusting the time offset",
        ));
    }

    let time_offset = krb_error_time_offset(error)?;
    info!(%time_offset, "retrying with the acceptor clock");

    if let Some(ccache) = context.ccache.as_ref() {
        ccache.set_time_offset(time_offset)?;
    }
    context.auth_context.time_offset = time_offset;
    context.set_initiator_state(InitiatorState::AuthStep);

    Ok(None)
}

#[instrument(level = "debug", ret, fields(state = ?context.role_state), skip_all)]
fn wait_mutual(context: &mut SecurityContext, input: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
    let input = input.ok_or_else(|| Error::new(ErrorKind::DefectiveToken, "AP-REP expected"))?;
    let token = parse_token(input)?;

    if token.token_id == KRB_ERROR_TOKEN_ID {
        let error: KrbError = token.decode(KRB_ERROR_TOKEN_ID)?;

        return retry_after_error(context, &error);
    }

    let ap_rep: ApRep = token.decode(AP_REP_TOKEN_ID)?;
    let session_key = context
        .session
        .session_key
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "session key is not established"))?;
    let enc_part = extract_ap_rep_part(&ap_rep, session_key.as_ref())?;

    let (ctime, cusec) = context
        .auth_context
        .authenticator_time
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "no authenticator was sent"))?;
    if timestamp_with_usec(&enc_part.0.ctime.0, &enc_part.0.cusec.0)? != timestamp_with_usec(ctime, cusec)? {
        return Err(Error::new(
            ErrorKind::Failure,
            "AP-REP does not answer our authenticator",
        ));
    }

    if let Some(subkey) = enc_part.0.subkey.0.as_ref() {
        context.session.remote_subkey = Some(Secret::copy_from(&subkey.0.key_value.0.0));
    }
    context.session.remote_seq = enc_part
        .0
        .seq_number
        .0
        .as_ref()
        .map(|seq_number| integer_to_u32(&seq_number.0.0))
        .transpose()?
        .unwrap_or(0);

    let output = if context.flags.contains(ContextFlags::DCE_STYLE) {
        // the third leg echoes the acceptor sequence number back
        let ap_rep = generate_ap_rep(
            session_key.as_ref(),
            &context.session.cipher_suite(),
            enc_part.0.ctime.0.clone(),
            enc_part.0.cusec.0.clone(),
            None,
            Some(context.session.remote_seq),
        )?;

        Some(encode_token(&context.mechanism.oid(), AP_REP_TOKEN_ID, &ap_rep, true)?)
    } else {
        None
    };

    finalize(context);

    Ok(output)
}

fn finalize(context: &mut SecurityContext) {
    context.ticket = None;

    if context.internal_flags.contains(InternalFlags::CLOSE_STORE_ON_DELETE) {
        if let Some(ccache) = context.ccache.take() {
            if let Err(err) = ccache.close() {
                warn!(ccache = %ccache.name(), %err, "failed to close the default ccache");
            }
        }
        context.internal_flags.remove(InternalFlags::CLOSE_STORE_ON_DELETE);
    }

    context.sequence_window = Some(SequenceWindow::new(
        u64::from(context.session.remote_seq),
        context.session.is_cfx,
        context.flags,
    ));
    context.internal_flags |= InternalFlags::OPEN;
    context.set_initiator_state(InitiatorState::Completed);

    info!(source = ?context.source, target = ?context.target, flags = ?context.flags, "context established");
}
