//! Process-wide configuration shared by every context.

use std::env;
use std::fmt::Debug;
use std::path::Path;
use std::sync::{Arc, Mutex};

use time::Duration;

use crate::ccache::CredentialCache;
use crate::kerberos::server::cache::ReplayCache;
use crate::keytab::{KeyTable, KeytabRegistry};
use crate::krb::Krb5Conf;
use crate::negative_cache::NegativeCache;
use crate::network_client::KdcTransport;
use crate::{Error, ErrorKind, Result};

pub const DEFAULT_KRB5_CONFIG: &str = "/etc/krb5.conf";
pub const DEFAULT_MAX_SKEW: Duration = Duration::seconds(300);

/// When the initiator asks DNS for the canonical name of the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsPolicy {
    /// Use the host name as given.
    Never,
    /// Try the given name first and retry with the canonical name when the KDC does not know it.
    #[default]
    Fallback,
    /// Canonicalize before the first attempt.
    Always,
}

impl DnsPolicy {
    /// Parses the `dns_canonicalize_hostname` relation.
    pub fn from_krb5_conf_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Self::Always),
            "false" | "no" | "0" => Some(Self::Never),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

/// Resolves a host name to its canonical DNS name.
pub trait HostnameCanonicalizer: Send + Sync + Debug {
    fn canonicalize(&self, host: &str) -> Result<String>;
}

#[derive(Debug)]
pub struct ProcessConfig {
    pub default_realm: Option<String>,
    /// `(domain, realm)` pairs. A leading dot matches subdomains only.
    pub domain_realm: Vec<(String, String)>,
    pub max_skew: Duration,
    pub dns_policy: DnsPolicy,
    pub default_ccache: Mutex<Option<Arc<dyn CredentialCache>>>,
    pub default_keytab_name: Option<String>,
    pub default_keytab: Option<Arc<dyn KeyTable>>,
    pub keytab_registry: KeytabRegistry,
    pub kdc_transport: Option<Arc<dyn KdcTransport>>,
    pub canonicalizer: Option<Arc<dyn HostnameCanonicalizer>>,
    pub replay_cache: ReplayCache,
    pub negative_cache: NegativeCache,
    /// Accept initiators that send a zero channel-binding hash when the acceptor has bindings.
    pub allow_legacy_checksum: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            default_realm: None,
            domain_realm: Vec::new(),
            max_skew: DEFAULT_MAX_SKEW,
            dns_policy: DnsPolicy::default(),
            default_ccache: Mutex::new(None),
            default_keytab_name: None,
            default_keytab: None,
            keytab_registry: KeytabRegistry::new(),
            kdc_transport: None,
            canonicalizer: None,
            replay_cache: ReplayCache::new(),
            negative_cache: NegativeCache::new(),
            allow_legacy_checksum: true,
        }
    }
}

impl ProcessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `[libdefaults]` and `[domain_realm]`.
    pub fn from_krb5_conf(data: &str) -> Self {
        Self::from_conf(&Krb5Conf::new_from_data(data))
    }

    /// Reads the file named by `KRB5_CONFIG`, or `/etc/krb5.conf`. A missing file yields the defaults.
    pub fn from_env() -> Self {
        let path = env::var("KRB5_CONFIG").unwrap_or_else(|_| DEFAULT_KRB5_CONFIG.to_owned());

        match Krb5Conf::new_from_file(Path::new(&path)) {
            Some(conf) => Self::from_conf(&conf),
            None => {
                debug!(%path, "krb5.conf not found, using defaults");

                Self::default()
            }
        }
    }

    fn from_conf(conf: &Krb5Conf) -> Self {
        let mut config = Self {
            default_realm: conf.get_value(&["libdefaults", "default_realm"]),
            default_keytab_name: conf.get_value(&["libdefaults", "default_keytab_name"]),
            ..Default::default()
        };

        if let Some(skew) = conf
            .get_value(&["libdefaults", "clockskew"])
            .and_then(|skew| skew.parse::<i64>().ok())
        {
            config.max_skew = Duration::seconds(skew);
        }

        if let Some(policy) = conf
            .get_value(&["libdefaults", "dns_canonicalize_hostname"])
            .and_then(|value| DnsPolicy::from_krb5_conf_value(&value))
        {
            config.dns_policy = policy;
        }

        config.domain_realm = conf
            .get_values_in_section(&["domain_realm"])
            .unwrap_or_default()
            .into_iter()
            .map(|(domain, realm)| (domain.to_ascii_lowercase(), realm.to_owned()))
            .collect();

        config
    }

    pub fn with_kdc_transport(mut self, transport: Arc<dyn KdcTransport>) -> Self {
        self.kdc_transport = Some(transport);
        self
    }

    pub fn with_default_keytab(mut self, keytab: Arc<dyn KeyTable>) -> Self {
        self.default_keytab = Some(keytab);
        self
    }

    pub fn with_canonicalizer(mut self, canonicalizer: Arc<dyn HostnameCanonicalizer>) -> Self {
        self.canonicalizer = Some(canonicalizer);
        self
    }

    pub fn default_ccache(&self) -> Result<Option<Arc<dyn CredentialCache>>> {
        Ok(self
            .default_ccache
            .lock()
            .map_err(|_| Error::new(ErrorKind::Failure, "default ccache lock is poisoned"))?
            .clone())
    }

    pub fn set_default_ccache(&self, ccache: Option<Arc<dyn CredentialCache>>) -> Result<()> {
        *self
            .default_ccache
            .lock()
            .map_err(|_| Error::new(ErrorKind::Failure, "default ccache lock is poisoned"))? = ccache;

        self.negative_cache.notify_cache_changed();

        Ok(())
    }

    /// Keytab used when the credential does not carry one: the default keytab, then the registry
    /// entry for `default_keytab_name`.
    pub fn resolve_default_keytab(&self) -> Result<Arc<dyn KeyTable>> {
        if let Some(keytab) = &self.default_keytab {
            return Ok(Arc::clone(keytab));
        }

        let name = self
            .default_keytab_name
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::Failure, "no default keytab is configured"))?;

        self.keytab_registry.resolve(name)
    }

    /// Maps a host to its realm through `[domain_realm]`, then `default_realm`, then the upper-cased
    /// parent domain.
    pub fn realm_for_host(&self, host: &str) -> Option<String> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Some((_, realm)) = self.domain_realm.iter().find(|(domain, _)| *domain == host) {
            return Some(realm.clone());
        }

        // the longest matching `.domain` wins
        let mut domain = host.as_str();
        while let Some(dot) = domain.find('.') {
            let suffix = &domain[dot..];
            if let Some((_, realm)) = self.domain_realm.iter().find(|(domain, _)| domain == suffix) {
                return Some(realm.clone());
            }
            domain = &domain[dot + 1..];
        }

        if let Some(realm) = &self.default_realm {
            return Some(realm.clone());
        }

        host.split_once('.').map(|(_, parent)| parent.to_ascii_uppercase())
    }
}

#[cfg(feature = "dns_resolver")]
pub use self::dns::DnsCanonicalizer;

#[cfg(feature = "dns_resolver")]
mod dns {
    use hickory_resolver::proto::rr::RecordType;
    use hickory_resolver::Resolver;

    use super::HostnameCanonicalizer;
    use crate::{Error, ErrorKind, Result};

    /// Canonicalizes host names with the system resolver configuration.
    pub struct DnsCanonicalizer {
        resolver: Resolver,
    }

    impl DnsCanonicalizer {
        pub fn from_system_conf() -> Result<Self> {
            Ok(Self {
                resolver: Resolver::from_system_conf()?,
            })
        }
    }

    impl std::fmt::Debug for DnsCanonicalizer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DnsCanonicalizer").finish_non_exhaustive()
        }
    }

    impl HostnameCanonicalizer for DnsCanonicalizer {
        fn canonicalize(&self, host: &str) -> Result<String> {
            let lookup = self.resolver.lookup_ip(host).map_err(|err| {
                Error::new(
                    ErrorKind::BadName,
                    format!("cannot resolve {}: {}", host, err),
                )
            })?;

            // the owner of the address record is the end of the CNAME chain
            let canonical = lookup
                .as_lookup()
                .records()
                .iter()
                .find(|record| matches!(record.record_type(), RecordType::A | RecordType::AAAA))
                .map(|record| record.name().to_utf8())
                .ok_or_else(|| Error::new(ErrorKind::BadName, format!("no address records for {}", host)))?;

            Ok(canonical.trim_end_matches('.').to_ascii_lowercase())
        }
    }
}
