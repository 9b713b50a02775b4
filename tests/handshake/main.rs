mod delegation;
mod kdc;
mod krb5;
mod network_client;
mod pku2u;
mod retry;

use std::sync::Arc;

use gss_krb5::config::ProcessConfig;
use gss_krb5::context::ContextHandle;
use gss_krb5::credential::{CredentialHandle, CredentialUsage};
use gss_krb5::flags::ContextFlags;
use gss_krb5::kerberos::messages::Mechanism;
use gss_krb5::keytab::{KeyTable, KeytabEntry, MemoryKeytab};
use gss_krb5::principal::{Principal, NT_SRV_HST};
use gss_krb5::{accept_step, init_step, Secret, StepStatus};
use picky_krb::constants::types::NT_PRINCIPAL;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing_subscriber::EnvFilter;

use crate::kdc::KdcMock;
use crate::network_client::KdcTransportMock;

pub const REALM: &str = "EXAMPLE.COM";
pub const USER: &str = "alice";
pub const PASSWORD: &str = "Pa$$w0rd!";
pub const SERVICE_HOST: &str = "server.example.com";
pub const TARGET: &str = "host@server.example.com";

const AES256_ETYPE: i32 = 18;
pub const MAX_ROUNDS: usize = 16;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_service_key() -> Vec<u8> {
    let mut key = vec![0; 32];
    OsRng.fill_bytes(&mut key);

    key
}

pub fn client_principal() -> Principal {
    Principal::new(NT_PRINCIPAL, vec![USER.to_owned()], REALM)
}

pub fn service_principal() -> Principal {
    Principal::new(NT_SRV_HST, vec!["host".to_owned(), SERVICE_HOST.to_owned()], REALM)
}

pub fn keytab_entry(kvno: u32, key: &[u8]) -> KeytabEntry {
    KeytabEntry {
        principal: service_principal(),
        kvno,
        etype: AES256_ETYPE,
        key: Secret::new(key.to_vec()),
        timestamp: 0,
    }
}

/// KDC with one user and one service, and the acceptor side configured against it.
pub struct Environment {
    pub kdc: Arc<KdcMock>,
    pub transport: Arc<KdcTransportMock>,
    pub keytab: Arc<MemoryKeytab>,
    pub acceptor_config: Arc<ProcessConfig>,
}

impl Environment {
    pub fn new() -> Self {
        init_tracing();

        let mut kdc = KdcMock::new(REALM);
        kdc.add_user(USER, PASSWORD);

        let service_key = random_service_key();
        kdc.set_service_key(&format!("host/{}", SERVICE_HOST), 1, service_key.clone());

        let kdc = Arc::new(kdc);
        let transport = Arc::new(KdcTransportMock::new(Arc::clone(&kdc)));
        let keytab = Arc::new(MemoryKeytab::with_entries("MEMORY:acceptor", vec![keytab_entry(1, &service_key)]));

        let acceptor_config = Arc::new(
            ProcessConfig {
                default_realm: Some(REALM.to_owned()),
                ..ProcessConfig::new()
            }
            .with_kdc_transport(transport.clone())
            .with_default_keytab(keytab.clone() as Arc<dyn KeyTable>),
        );

        Self {
            kdc,
            transport,
            keytab,
            acceptor_config,
        }
    }

    /// Initiator configuration that reaches the KDC directly.
    pub fn initiator_config(&self) -> Arc<ProcessConfig> {
        Arc::new(
            ProcessConfig {
                default_realm: Some(REALM.to_owned()),
                ..ProcessConfig::new()
            }
            .with_kdc_transport(self.transport.clone()),
        )
    }

    /// Initiator configuration without any KDC access, as used by IAKERB clients.
    pub fn isolated_initiator_config(&self) -> Arc<ProcessConfig> {
        Arc::new(ProcessConfig {
            default_realm: Some(REALM.to_owned()),
            ..ProcessConfig::new()
        })
    }

    /// Password credential holding a fresh TGT.
    pub fn password_credential(&self, config: &ProcessConfig) -> CredentialHandle {
        CredentialHandle::acquire_with_password(
            config,
            client_principal(),
            Secret::new(PASSWORD.to_owned()),
            CredentialUsage::Initiate,
        )
        .unwrap()
    }
}

pub struct Established {
    pub initiator: ContextHandle,
    pub acceptor: ContextHandle,
    /// Tokens exchanged in both directions.
    pub tokens: usize,
}

pub fn establish(
    env: &Environment,
    initiator_config: &Arc<ProcessConfig>,
    credential: &CredentialHandle,
    mechanism: Mechanism,
    flags: ContextFlags,
) -> Established {
    establish_with(env, initiator_config, credential, None, mechanism, flags)
}

/// Passes tokens between both sides until neither has anything left to send.
pub fn establish_with(
    env: &Environment,
    initiator_config: &Arc<ProcessConfig>,
    credential: &CredentialHandle,
    acceptor_credential: Option<&CredentialHandle>,
    mechanism: Mechanism,
    flags: ContextFlags,
) -> Established {
    let mut initiator = None;
    let mut acceptor = None;
    let mut input = Vec::new();
    let mut tokens = 0;

    for _ in 0..MAX_ROUNDS {
        let step = init_step(
            &mut initiator,
            Some(credential),
            initiator_config,
            mechanism,
            TARGET,
            flags,
            None,
            &input,
        )
        .unwrap();
        let Some(token) = step.token else {
            assert_eq!(step.status, StepStatus::Complete);
            break;
        };
        tokens += 1;

        let reply = accept_step(
            &mut acceptor,
            acceptor_credential,
            &env.acceptor_config,
            mechanism,
            &token,
            None,
        )
        .unwrap();
        match reply.token {
            Some(token) => {
                tokens += 1;
                input = token;
            }
            None => {
                assert_eq!(reply.status, StepStatus::Complete);
                assert_eq!(step.status, StepStatus::Complete);
                break;
            }
        }
    }

    let initiator = initiator.unwrap();
    let acceptor = acceptor.unwrap();
    assert!(initiator.is_open());
    assert!(acceptor.is_open());

    Established {
        initiator,
        acceptor,
        tokens,
    }
}
