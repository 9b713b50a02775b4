use std::sync::Arc;

use gss_krb5::config::ProcessConfig;
use gss_krb5::credential::{CredentialHandle, CredentialUsage};
use gss_krb5::flags::ContextFlags;
use gss_krb5::kerberos::messages::{parse_token, Mechanism, PKU2U_AS_REP_TOKEN_ID, PKU2U_AS_REQ_TOKEN_ID};
use gss_krb5::keytab::KeyTable;
use gss_krb5::pk_init::{principal_from_certificate, WELLKNOWN_PKU2U_REALM};
use gss_krb5::{accept_step, init_step, ErrorKind, Secret, StepStatus};
use picky::key::PrivateKey;
use picky_asn1_x509::Certificate;
use picky_krb::messages::AsReq;

use crate::kdc::PkinitSigner;
use crate::network_client::CannedTransport;
use crate::{client_principal, establish, service_principal, Environment, PASSWORD, SERVICE_HOST, TARGET};

fn certificate() -> (Certificate, PrivateKey) {
    let certificate = picky_asn1_der::from_bytes(include_bytes!("fixtures/p2p_certificate.der")).unwrap();
    let private_key = PrivateKey::from_pem_str(include_str!("fixtures/p2p_private_key.pem")).unwrap();

    (certificate, private_key)
}

fn certificate_credential() -> CredentialHandle {
    let (certificate, private_key) = certificate();

    CredentialHandle::acquire_with_certificate(certificate, private_key).unwrap()
}

/// Lets the KDC answer PKINIT requests and gives the acceptor the service key in the PKU2U realm.
fn pku2u_environment() -> Environment {
    let env = Environment::new();

    let (certificate, private_key) = certificate();
    env.kdc.enable_pkinit(PkinitSigner {
        certificate,
        private_key,
    });

    let mut entry = env.keytab.lookup(&service_principal(), Some(1), None).unwrap().unwrap();
    entry.principal.realm = WELLKNOWN_PKU2U_REALM.to_owned();
    env.keytab.add_entry(entry).unwrap();

    env
}

fn first_token() -> Vec<u8> {
    let env = Environment::new();
    let credential = certificate_credential();

    let step = init_step(
        &mut None,
        Some(&credential),
        &env.isolated_initiator_config(),
        Mechanism::Pku2u,
        TARGET,
        ContextFlags::MUTUAL,
        None,
        &[],
    )
    .unwrap();
    assert_eq!(step.status, StepStatus::ContinueNeeded);

    step.token.unwrap()
}

#[test]
fn certificate_credential_is_in_the_pku2u_realm() {
    let credential = certificate_credential();

    assert_eq!(credential.principal().unwrap().realm, WELLKNOWN_PKU2U_REALM);
    assert_eq!(credential.usage(), CredentialUsage::Initiate);
    assert!(credential.certificate().is_some());
}

#[test]
fn first_token_carries_the_pkinit_as_req() {
    let token = first_token();
    assert_eq!(token[0], 0x60);

    let parsed = parse_token(&token).unwrap();
    assert_eq!(parsed.mechanism, Some(Mechanism::Pku2u.oid()));
    assert_eq!(parsed.token_id, PKU2U_AS_REQ_TOKEN_ID);

    let as_req: AsReq = parsed.decode(PKU2U_AS_REQ_TOKEN_ID).unwrap();
    let req_body = &as_req.0.req_body.0;
    assert_eq!(req_body.realm.0.0.as_utf8(), WELLKNOWN_PKU2U_REALM);

    let sname = req_body
        .sname
        .0
        .as_ref()
        .unwrap()
        .0
        .name_string
        .0
        .0
        .iter()
        .map(|component| component.0.as_utf8().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(sname, vec!["host".to_owned(), SERVICE_HOST.to_owned()]);
    assert!(as_req.0.padata.0.is_some());
}

#[test]
fn acceptor_tunnels_the_as_req() {
    let token = first_token();
    let as_req_body = parse_token(&token).unwrap().body.to_vec();

    let transport = Arc::new(CannedTransport::new(b"canned AS-REP".to_vec()));
    let config = Arc::new(ProcessConfig::new().with_kdc_transport(transport.clone()));

    let mut acceptor = None;
    let reply = accept_step(&mut acceptor, None, &config, Mechanism::Pku2u, &token, None).unwrap();
    assert_eq!(reply.status, StepStatus::ContinueNeeded);

    let reply = reply.token.unwrap();
    let parsed = parse_token(&reply).unwrap();
    assert_eq!(parsed.mechanism, Some(Mechanism::Pku2u.oid()));
    assert_eq!(parsed.token_id, PKU2U_AS_REP_TOKEN_ID);
    assert_eq!(parsed.body, b"canned AS-REP");

    let requests = transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].realm, WELLKNOWN_PKU2U_REALM);
    assert_eq!(requests[0].data, as_req_body);
}

#[test]
fn pku2u_needs_a_certificate() {
    let env = Environment::new();
    let config = env.isolated_initiator_config();
    let credential = CredentialHandle::acquire_with_password(
        &config,
        client_principal(),
        Secret::new(PASSWORD.to_owned()),
        CredentialUsage::Initiate,
    )
    .unwrap();

    let err = init_step(
        &mut None,
        Some(&credential),
        &config,
        Mechanism::Pku2u,
        TARGET,
        ContextFlags::MUTUAL,
        None,
        &[],
    )
    .unwrap_err();

    assert_eq!(err.error_type, ErrorKind::NoCredentials);
}

#[test]
fn handshake_through_the_pkinit_kdc() {
    let env = pku2u_environment();
    let config = env.isolated_initiator_config();
    let credential = certificate_credential();

    let established = establish(&env, &config, &credential, Mechanism::Pku2u, ContextFlags::MUTUAL);

    // AS-REQ, AS-REP, AP-REQ, AP-REP
    assert_eq!(established.tokens, 4);
    assert_eq!(env.transport.realms(), vec![WELLKNOWN_PKU2U_REALM.to_owned()]);

    let (certificate, _) = certificate();
    let client = principal_from_certificate(&certificate).unwrap();
    assert_eq!(established.initiator.source().unwrap(), Some(client.clone()));
    assert_eq!(established.acceptor.source().unwrap(), Some(client));

    let target = established.acceptor.target().unwrap().unwrap();
    assert_eq!(target.realm, WELLKNOWN_PKU2U_REALM);
    assert_eq!(target.components, vec!["host".to_owned(), SERVICE_HOST.to_owned()]);

    assert_eq!(established.acceptor.mechanism().unwrap(), Mechanism::Pku2u);
    assert_eq!(
        established.initiator.session_key().unwrap().unwrap().as_ref(),
        established.acceptor.session_key().unwrap().unwrap().as_ref()
    );
}

#[test]
fn pkinit_handshake_with_dce_style() {
    let env = pku2u_environment();
    let config = env.isolated_initiator_config();
    let credential = certificate_credential();

    let established = establish(
        &env,
        &config,
        &credential,
        Mechanism::Pku2u,
        ContextFlags::MUTUAL | ContextFlags::DCE_STYLE,
    );

    // AS-REQ, AS-REP, AP-REQ, AP-REP, AP-REP
    assert_eq!(established.tokens, 5);
    assert!(established.acceptor.flags().unwrap().contains(ContextFlags::DCE_STYLE));
}
