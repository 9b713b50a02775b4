//! Credential handles: who we are, and where our tickets and keys live.

use std::sync::Arc;

use picky::key::PrivateKey;
use picky_asn1_x509::Certificate;
use time::{Duration, OffsetDateTime};
use zeroize::Zeroize;

use crate::ccache::{CredentialCache, MemoryCcache};
use crate::config::ProcessConfig;
use crate::flags::CredentialFlags;
use crate::kerberos::acquire::{drive, Acquisition, AsExchange};
use crate::keytab::KeyTable;
use crate::pk_init::principal_from_certificate;
use crate::principal::Principal;
use crate::secret::SecretPrivateKey;
use crate::{Error, ErrorKind, Result, Secret};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialUsage {
    Initiate,
    Accept,
    Both,
}

impl CredentialUsage {
    pub fn can_initiate(self) -> bool {
        matches!(self, CredentialUsage::Initiate | CredentialUsage::Both)
    }

    pub fn can_accept(self) -> bool {
        matches!(self, CredentialUsage::Accept | CredentialUsage::Both)
    }
}

/// Ticket and key stores of a credential.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    pub ccache: Option<Arc<dyn CredentialCache>>,
    pub keytab: Option<Arc<dyn KeyTable>>,
}

#[derive(Debug, Clone)]
pub enum CredentialSecret {
    Password(Secret<String>),
    Certificate {
        certificate: Box<Certificate>,
        private_key: SecretPrivateKey,
    },
}

#[derive(Debug)]
pub struct CredentialHandle {
    principal: Option<Principal>,
    usage: CredentialUsage,
    store: CredentialStore,
    secret: Option<CredentialSecret>,
    expiration: Option<OffsetDateTime>,
    flags: CredentialFlags,
    released: bool,
}

impl CredentialHandle {
    fn new(principal: Option<Principal>, usage: CredentialUsage) -> Self {
        Self {
            principal,
            usage,
            store: CredentialStore::default(),
            secret: None,
            expiration: None,
            flags: CredentialFlags::empty(),
            released: false,
        }
    }

    /// Acquires the process default credentials: the default ccache to initiate, the default keytab
    /// to accept.
    ///
    /// An unnamed accepting credential accepts for any principal in the keytab.
    #[instrument(level = "debug", skip(config))]
    pub fn acquire(config: &ProcessConfig, name: Option<&Principal>, usage: CredentialUsage) -> Result<Self> {
        let mut handle = Self::new(name.cloned(), usage);

        if usage.can_initiate() {
            let ccache = config
                .default_ccache()?
                .ok_or_else(|| Error::new(ErrorKind::NoCredentials, "no default credential cache"))?;
            let cache_principal = ccache.principal()?;

            if let Some(name) = name {
                if !name.same_name(&cache_principal) {
                    return Err(Error::new(
                        ErrorKind::NoCredentials,
                        format!(
                            "credential cache {} holds tickets for {}, not {}",
                            ccache.name(),
                            cache_principal,
                            name
                        ),
                    ));
                }
            }

            handle.expiration = ccache
                .retrieve(&cache_principal, &Principal::tgs(&cache_principal.realm))?
                .map(|tgt| tgt.end_time);
            handle.principal = Some(cache_principal);
            handle.store.ccache = Some(ccache);
        }

        if usage.can_accept() {
            let keytab = config.resolve_default_keytab()?;

            let usable = match name {
                Some(name) => keytab.lookup(name, None, None)?.is_some(),
                None => keytab.has_usable_entry()?,
            };
            if !usable {
                return Err(Error::new(
                    ErrorKind::NoCredentials,
                    format!("keytab {} has no usable key", keytab.name()),
                ));
            }

            handle.store.keytab = Some(keytab);
        }

        Ok(handle)
    }

    /// Password credential.
    ///
    /// The password is kept for IAKERB. When a KDC transport is configured, a TGT is also requested
    /// right away and stored in a credential-owned memory ccache.
    #[instrument(level = "debug", skip(config, password), fields(%principal))]
    pub fn acquire_with_password(
        config: &ProcessConfig,
        principal: Principal,
        password: Secret<String>,
        usage: CredentialUsage,
    ) -> Result<Self> {
        let mut handle = Self::new(Some(principal.clone()), usage);

        if usage.can_initiate() {
            if let Some(transport) = config.kdc_transport.as_ref() {
                let mut acquisition =
                    Acquisition::As(AsExchange::new(principal.clone(), password.clone(), Duration::ZERO));
                let tgt = drive(&mut acquisition, transport.as_ref())?;

                let ccache = MemoryCcache::with_principal(principal.to_string(), &principal);
                handle.expiration = Some(tgt.end_time);
                ccache.store(tgt)?;

                handle.store.ccache = Some(Arc::new(ccache));
                handle.flags |= CredentialFlags::DESTROY_STORE_ON_RELEASE;
                config.negative_cache.notify_cache_changed();
            }
        }

        if !principal.realm.is_empty() {
            handle.flags |= CredentialFlags::IAKERB_RESOLVED;
        }
        handle.secret = Some(CredentialSecret::Password(password));

        Ok(handle)
    }

    /// Certificate credential for PKU2U. The principal is taken from the certificate.
    #[instrument(level = "debug", skip_all)]
    pub fn acquire_with_certificate(certificate: Certificate, private_key: PrivateKey) -> Result<Self> {
        let principal = principal_from_certificate(&certificate)?;
        debug!(%principal, "certificate credential");

        let mut handle = Self::new(Some(principal), CredentialUsage::Initiate);
        handle.secret = Some(CredentialSecret::Certificate {
            certificate: Box::new(certificate),
            private_key: SecretPrivateKey::new(private_key),
        });

        Ok(handle)
    }

    /// Initiator credential backed by a caller-owned ccache.
    pub fn with_ccache(ccache: Arc<dyn CredentialCache>) -> Result<Self> {
        let principal = ccache.principal()?;

        let mut handle = Self::new(Some(principal), CredentialUsage::Initiate);
        handle.store.ccache = Some(ccache);

        Ok(handle)
    }

    /// Acceptor credential backed by a caller-owned keytab. `None` accepts for any key in the table.
    pub fn with_keytab(keytab: Arc<dyn KeyTable>, principal: Option<Principal>) -> Self {
        let mut handle = Self::new(principal, CredentialUsage::Accept);
        handle.store.keytab = Some(keytab);

        handle
    }

    /// Contexts built from this credential do not advertise confidentiality and integrity.
    pub fn suppress_conf_int_flags(mut self) -> Self {
        self.flags |= CredentialFlags::SUPPRESS_CONF_INT_FLAGS;
        self
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn usage(&self) -> CredentialUsage {
        self.usage
    }

    pub fn ccache(&self) -> Option<&Arc<dyn CredentialCache>> {
        self.store.ccache.as_ref()
    }

    pub fn keytab(&self) -> Option<&Arc<dyn KeyTable>> {
        self.store.keytab.as_ref()
    }

    pub fn password(&self) -> Option<&Secret<String>> {
        match self.secret.as_ref() {
            Some(CredentialSecret::Password(password)) => Some(password),
            _ => None,
        }
    }

    pub fn certificate(&self) -> Option<(&Certificate, &SecretPrivateKey)> {
        match self.secret.as_ref() {
            Some(CredentialSecret::Certificate {
                certificate,
                private_key,
            }) => Some((certificate.as_ref(), private_key)),
            _ => None,
        }
    }

    pub fn expiration(&self) -> Option<OffsetDateTime> {
        self.expiration
    }

    pub fn flags(&self) -> CredentialFlags {
        self.flags
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Wipes the secret and destroys a credential-owned ccache. Calling it again does nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(CredentialSecret::Password(mut password)) = self.secret.take() {
            password.zeroize();
        }

        if let Some(ccache) = self.store.ccache.take() {
            let result = if self.flags.contains(CredentialFlags::DESTROY_STORE_ON_RELEASE) {
                ccache.destroy()
            } else {
                ccache.close()
            };

            if let Err(err) = result {
                warn!(ccache = %ccache.name(), %err, "failed to release credential cache");
            }
        }
        self.store.keytab = None;
    }
}

impl Drop for CredentialHandle {
    fn drop(&mut self) {
        self.release();
    }
}
