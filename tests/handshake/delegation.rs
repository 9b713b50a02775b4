use gss_krb5::flags::ContextFlags;
use gss_krb5::kerberos::messages::Mechanism;

use crate::{client_principal, establish, Environment, SERVICE_HOST};

#[test]
fn forwarded_tgt_reaches_the_acceptor() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);

    let established = establish(
        &env,
        &config,
        &credential,
        Mechanism::Kerberos5,
        ContextFlags::MUTUAL | ContextFlags::DELEG,
    );

    assert!(established.initiator.flags().unwrap().contains(ContextFlags::DELEG));
    assert!(established.acceptor.flags().unwrap().contains(ContextFlags::DELEG));

    let delegated = established.acceptor.delegated_credentials().unwrap().unwrap();
    assert_eq!(delegated.principal().unwrap(), client_principal());

    let tickets = delegated.credentials().unwrap();
    assert_eq!(tickets.len(), 1);
    assert!(tickets[0].is_tgt());
    assert_eq!(tickets[0].client, client_principal());
}

#[test]
fn delegation_policy_follows_ok_as_delegate() {
    let env = Environment::new();
    let config = env.initiator_config();
    let credential = env.password_credential(&config);
    let flags = ContextFlags::MUTUAL | ContextFlags::DELEG_POLICY;

    let established = establish(&env, &config, &credential, Mechanism::Kerberos5, flags);
    assert!(!established.initiator.flags().unwrap().contains(ContextFlags::DELEG));
    assert!(!established.acceptor.flags().unwrap().contains(ContextFlags::DELEG));
    assert!(established.acceptor.delegated_credentials().unwrap().is_none());

    env.kdc.trust_for_delegation(&format!("host/{}", SERVICE_HOST));
    let trusted = env.password_credential(&config);

    let established = establish(&env, &config, &trusted, Mechanism::Kerberos5, flags);
    assert!(established.initiator.flags().unwrap().contains(ContextFlags::DELEG));
    assert!(established.acceptor.delegated_credentials().unwrap().is_some());
}

#[test]
fn delegation_failure_is_not_fatal() {
    let env = Environment::new();
    let config = env.isolated_initiator_config();
    let credential = env.password_credential(&config);

    let established = establish(
        &env,
        &config,
        &credential,
        Mechanism::Iakerb,
        ContextFlags::MUTUAL | ContextFlags::DELEG,
    );

    assert!(!established.initiator.flags().unwrap().contains(ContextFlags::DELEG));
    assert!(established.acceptor.delegated_credentials().unwrap().is_none());
}
