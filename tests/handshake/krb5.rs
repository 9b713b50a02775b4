use gss_krb5::flags::ContextFlags;
use gss_krb5::kerberos::messages::{parse_token, Mechanism, AP_REP_TOKEN_ID, AP_REQ_TOKEN_ID};
use gss_krb5::keytab::KeytabEntry;
use gss_krb5::principal::{Principal, NT_SRV_HST};
use gss_krb5::{accept_step, delete_context, init_step, ErrorKind, Secret, StepStatus};

use crate::{client_principal, establish, random_service_key, service_principal, Environment, REALM, TARGET};

#[test]
fn mutual_authentication() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let mut initiator = None;
    let mut acceptor = None;
    let flags = ContextFlags::MUTUAL | ContextFlags::SEQUENCE;

    let step = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        flags,
        None,
        &[],
    )
    .unwrap();
    assert_eq!(step.status, StepStatus::ContinueNeeded);
    let ap_req = step.token.unwrap();
    let token = parse_token(&ap_req).unwrap();
    assert!(token.is_framed());
    assert_eq!(token.token_id, AP_REQ_TOKEN_ID);

    let reply = accept_step(&mut acceptor, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap();
    assert_eq!(reply.status, StepStatus::Complete);
    let ap_rep = reply.token.unwrap();
    assert_eq!(parse_token(&ap_rep).unwrap().token_id, AP_REP_TOKEN_ID);

    let last = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        flags,
        None,
        &ap_rep,
    )
    .unwrap();
    assert_eq!(last.status, StepStatus::Complete);
    assert!(last.token.is_none());

    let initiator = initiator.unwrap();
    let acceptor = acceptor.unwrap();
    assert!(initiator.is_open());
    assert!(acceptor.is_open());

    assert!(initiator.flags().unwrap().contains(ContextFlags::MUTUAL | ContextFlags::SEQUENCE));
    assert!(acceptor.flags().unwrap().contains(ContextFlags::MUTUAL));
    assert_eq!(acceptor.source().unwrap(), Some(client_principal()));
    assert_eq!(initiator.target().unwrap(), Some(service_principal()));
    assert_eq!(
        initiator.session_key().unwrap().unwrap().as_ref(),
        acceptor.session_key().unwrap().unwrap().as_ref()
    );
}

#[test]
fn without_mutual_authentication() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let mut initiator = None;
    let mut acceptor = None;

    let step = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::empty(),
        None,
        &[],
    )
    .unwrap();
    assert_eq!(step.status, StepStatus::Complete);
    assert!(initiator.as_ref().unwrap().is_open());

    let reply = accept_step(
        &mut acceptor,
        None,
        &env.acceptor_config,
        Mechanism::Kerberos5,
        &step.token.unwrap(),
        None,
    )
    .unwrap();
    assert_eq!(reply.status, StepStatus::Complete);
    assert!(reply.token.is_none());

    let acceptor = acceptor.unwrap();
    assert!(acceptor.is_open());
    assert!(!acceptor.flags().unwrap().contains(ContextFlags::MUTUAL));
    assert!(acceptor.flags().unwrap().contains(ContextFlags::always_offered()));
}

#[test]
fn dce_style_takes_three_legs() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let established = establish(
        &env,
        &config,
        &credential,
        Mechanism::Kerberos5,
        ContextFlags::DCE_STYLE,
    );

    assert_eq!(established.tokens, 3);
    for context in [&established.initiator, &established.acceptor] {
        let flags = context.flags().unwrap();
        assert!(flags.contains(ContextFlags::DCE_STYLE | ContextFlags::MUTUAL));
    }
}

#[test]
fn dce_style_tokens_are_bare() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let mut initiator = None;
    let mut acceptor = None;

    let ap_req = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::DCE_STYLE,
        None,
        &[],
    )
    .unwrap()
    .token
    .unwrap();
    assert!(!parse_token(&ap_req).unwrap().is_framed());

    let reply = accept_step(&mut acceptor, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap();
    assert_eq!(reply.status, StepStatus::ContinueNeeded);
    let ap_rep = reply.token.unwrap();
    assert!(!parse_token(&ap_rep).unwrap().is_framed());
    assert!(!acceptor.as_ref().unwrap().is_open());

    let echo = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::DCE_STYLE,
        None,
        &ap_rep,
    )
    .unwrap();
    assert_eq!(echo.status, StepStatus::Complete);
    let echo = echo.token.unwrap();
    assert_eq!(parse_token(&echo).unwrap().token_id, AP_REP_TOKEN_ID);

    let last = accept_step(&mut acceptor, None, &env.acceptor_config, Mechanism::Kerberos5, &echo, None).unwrap();
    assert_eq!(last.status, StepStatus::Complete);
    assert!(last.token.is_none());
    assert!(acceptor.unwrap().is_open());
}

#[test]
fn service_ticket_is_reused() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    establish(&env, &config, &credential, Mechanism::Kerberos5, ContextFlags::MUTUAL);
    let requests = env.transport.request_count();

    establish(&env, &config, &credential, Mechanism::Kerberos5, ContextFlags::MUTUAL);

    assert_eq!(env.transport.request_count(), requests);
}

#[test]
fn completed_contexts_reject_more_tokens() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let mut initiator = None;
    let mut acceptor = None;

    let ap_req = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::empty(),
        None,
        &[],
    )
    .unwrap()
    .token
    .unwrap();
    accept_step(&mut acceptor, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap();

    let err = accept_step(&mut acceptor, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap_err();
    assert_eq!(err.error_type, ErrorKind::CallBadStructure);

    let err = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::empty(),
        None,
        &[],
    )
    .unwrap_err();
    assert_eq!(err.error_type, ErrorKind::CallBadStructure);
}

#[test]
fn target_without_host_is_rejected() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let err = init_step(
        &mut None,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        "host",
        ContextFlags::empty(),
        None,
        &[],
    )
    .unwrap_err();

    assert_eq!(err.error_type, ErrorKind::BadName);
}

#[test]
fn delete_context_is_idempotent() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let established = establish(&env, &config, &credential, Mechanism::Kerberos5, ContextFlags::MUTUAL);
    let shared = established.initiator.clone();

    let mut handle = Some(established.initiator);
    delete_context(&mut handle).unwrap();
    assert!(handle.is_none());
    delete_context(&mut handle).unwrap();

    assert!(!shared.is_open());
    assert_eq!(shared.flags().unwrap_err().error_type, ErrorKind::CallBadStructure);
}

#[test]
fn mutual_host_at_domain_statuses() {
    let env = Environment::new();
    let key = random_service_key();
    env.kdc.set_service_key("host/example.com", 1, key.clone());
    env.keytab
        .add_entry(KeytabEntry {
            principal: Principal::new(NT_SRV_HST, vec!["host".to_owned(), "example.com".to_owned()], REALM),
            kvno: 1,
            etype: 18,
            key: Secret::new(key),
            timestamp: 0,
        })
        .unwrap();

    let config = env.initiator_config();
    let credential = env.password_credential(&config);
    let mut initiator = None;
    let mut acceptor = None;

    let t1 = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        "host@example.com",
        ContextFlags::MUTUAL,
        None,
        &[],
    )
    .unwrap();
    assert_eq!(t1.status, StepStatus::ContinueNeeded);

    let t2 = accept_step(
        &mut acceptor,
        None,
        &env.acceptor_config,
        Mechanism::Kerberos5,
        &t1.token.unwrap(),
        None,
    )
    .unwrap();
    // the AP-REP is the acceptor's last token, nothing comes back for it to process
    assert_eq!(t2.status, StepStatus::Complete);
    assert!(acceptor.as_ref().unwrap().is_open());

    let last = init_step(
        &mut initiator,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        "host@example.com",
        ContextFlags::MUTUAL,
        None,
        &t2.token.unwrap(),
    )
    .unwrap();
    assert_eq!(last.status, StepStatus::Complete);
    assert!(last.token.is_none());

    let initiator = initiator.unwrap();
    let acceptor = acceptor.unwrap();
    assert!(initiator.is_open() && acceptor.is_open());
    assert_eq!(acceptor.source().unwrap(), Some(client_principal()));
    assert_eq!(acceptor.source().unwrap(), initiator.source().unwrap());
    assert_eq!(
        initiator.session_key().unwrap().unwrap().as_ref(),
        acceptor.session_key().unwrap().unwrap().as_ref()
    );
}

#[test]
fn replayed_ap_req_is_rejected() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let ap_req = init_step(
        &mut None,
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::empty(),
        None,
        &[],
    )
    .unwrap()
    .token
    .unwrap();

    accept_step(&mut None, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap();
    let err = accept_step(&mut None, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap_err();

    assert_eq!(err.error_type, ErrorKind::DuplicateToken);
}

#[test]
fn dce_echo_of_another_context_is_out_of_sequence() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let mut initiators = [None, None];
    let mut acceptors = [None, None];
    let mut replies = Vec::new();

    // both contexts use the same cached service ticket and therefore the same session key
    for (initiator, acceptor) in initiators.iter_mut().zip(acceptors.iter_mut()) {
        let ap_req = init_step(
            initiator,
            Some(&credential),
            &config,
            Mechanism::Kerberos5,
            TARGET,
            ContextFlags::DCE_STYLE,
            None,
            &[],
        )
        .unwrap()
        .token
        .unwrap();

        let reply = accept_step(acceptor, None, &env.acceptor_config, Mechanism::Kerberos5, &ap_req, None).unwrap();
        replies.push(reply.token.unwrap());
    }

    let echo = init_step(
        &mut initiators[0],
        Some(&credential),
        &config,
        Mechanism::Kerberos5,
        TARGET,
        ContextFlags::DCE_STYLE,
        None,
        &replies[0],
    )
    .unwrap()
    .token
    .unwrap();

    let err = accept_step(
        &mut acceptors[1],
        None,
        &env.acceptor_config,
        Mechanism::Kerberos5,
        &echo,
        None,
    )
    .unwrap_err();
    assert_eq!(err.error_type, ErrorKind::UnseqToken);
    assert!(!acceptors[1].as_ref().unwrap().is_open());
}
