use std::sync::Arc;

use gss_krb5::ccache::CredentialCache;
use gss_krb5::credential::CredentialHandle;
use gss_krb5::flags::ContextFlags;
use gss_krb5::kerberos::messages::{parse_token, Mechanism, AP_REQ_TOKEN_ID, KRB_ERROR_TOKEN_ID};
use gss_krb5::keytab::MemoryKeytab;
use gss_krb5::{accept_step, init_step, ErrorKind, StepStatus};
use time::Duration;

use crate::{establish, establish_with, keytab_entry, random_service_key, Environment, SERVICE_HOST, TARGET};

fn service_name() -> String {
    format!("host/{}", SERVICE_HOST)
}

/// Acceptor that only knows a key the KDC has not issued tickets with.
fn rotated_acceptor(kvno: u32, key: &[u8]) -> CredentialHandle {
    CredentialHandle::with_keytab(
        Arc::new(MemoryKeytab::with_entries("MEMORY:rotated", vec![keytab_entry(kvno, key)])),
        None,
    )
}

#[test]
fn clock_skew_is_corrected_once() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let ccache = Arc::clone(credential.ccache().unwrap());
    ccache.set_time_offset(Duration::minutes(-10)).unwrap();

    let established = establish(&env, &config, &credential, Mechanism::Kerberos5, ContextFlags::MUTUAL);

    // AP-REQ, KRB-ERROR, AP-REQ, AP-REP
    assert_eq!(established.tokens, 4);
    assert!(ccache.time_offset().unwrap().abs() < Duration::minutes(1));
}

#[test]
fn repeated_clock_skew_is_fatal() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);
    credential
        .ccache()
        .unwrap()
        .set_time_offset(Duration::minutes(-10))
        .unwrap();

    let mut initiator = None;
    let mut acceptor = None;
    let mut step = |input: &[u8]| {
        init_step(
            &mut initiator,
            Some(&credential),
            &config,
            Mechanism::Kerberos5,
            TARGET,
            ContextFlags::MUTUAL,
            None,
            input,
        )
    };

    let ap_req = step(&[]).unwrap().token.unwrap();
    let reply = accept_step(&mut acceptor, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap();
    assert_eq!(reply.status, StepStatus::ContinueNeeded);
    let skew = reply.token.unwrap();
    assert_eq!(parse_token(&skew).unwrap().token_id, KRB_ERROR_TOKEN_ID);

    let retried = step(&skew).unwrap();
    assert_eq!(retried.status, StepStatus::ContinueNeeded);
    assert_eq!(parse_token(&retried.token.unwrap()).unwrap().token_id, AP_REQ_TOKEN_ID);

    assert_eq!(step(&skew).unwrap_err().error_type, ErrorKind::TimeSkew);
}

#[test]
fn stale_service_ticket_is_replaced() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    establish(&env, &config, &credential, Mechanism::Kerberos5, ContextFlags::MUTUAL);
    let requests = env.transport.request_count();

    let key = random_service_key();
    env.kdc.set_service_key(&service_name(), 2, key.clone());
    let acceptor_credential = rotated_acceptor(2, &key);

    let established = establish_with(
        &env,
        &config,
        &credential,
        Some(&acceptor_credential),
        Mechanism::Kerberos5,
        ContextFlags::MUTUAL,
    );

    // AP-REQ, KRB-ERROR, AP-REQ, AP-REP
    assert_eq!(established.tokens, 4);
    assert_eq!(env.transport.request_count(), requests + 1);
}

#[test]
fn second_stale_ticket_is_fatal() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);
    let acceptor_credential = rotated_acceptor(2, &random_service_key());

    let mut initiator = None;
    let mut acceptor = None;

    let mut input = Vec::new();
    for _ in 0..2 {
        let ap_req = init_step(
            &mut initiator,
            Some(&credential),
            &config,
            Mechanism::Kerberos5,
            TARGET,
            ContextFlags::MUTUAL,
            None,
            &input,
        )
        .unwrap()
        .token
        .unwrap();

        let reply = accept_step(
            &mut acceptor,
            Some(&acceptor_credential),
            &env.acceptor_config,
            Mechanism::Kerberos5,
            &ap_req,
            None,
        )
        .unwrap();
        input = reply.token.unwrap();
        assert_eq!(parse_token(&input).unwrap().token_id, KRB_ERROR_TOKEN_ID);
    }

    let err = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::MUTUAL,
        None,
        &input,
    )
    .unwrap_err();
    assert_eq!(err.error_type, ErrorKind::ContextExpired);
}

#[test]
fn acceptor_keeps_accepting_previous_keys() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    establish(&env, &config, &credential, Mechanism::Kerberos5, ContextFlags::MUTUAL);

    let key = random_service_key();
    env.kdc.set_service_key(&service_name(), 2, key.clone());
    env.keytab.add_entry(keytab_entry(2, &key)).unwrap();

    // the cached kvno 1 ticket
    let established = establish(&env, &config, &credential, Mechanism::Kerberos5, ContextFlags::MUTUAL);
    assert_eq!(established.tokens, 2);

    // a kvno 2 ticket
    let fresh = env.password_credential(&config);
    let established = establish(&env, &config, &fresh, Mechanism::Kerberos5, ContextFlags::MUTUAL);
    assert_eq!(established.tokens, 2);
}
