//! Credential cache interface and the in-memory implementation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::Ticket;
use time::OffsetDateTime;

use crate::kerberos::flags::TicketFlags;
use crate::principal::Principal;
use crate::{Error, ErrorKind, Result, Secret};

/// Config key under which the KDC time offset (in seconds) is stored.
pub const TIME_OFFSET_CONFIG_KEY: &str = "time_offset";

/// A ticket together with the data needed to use it.
#[derive(Debug, Clone)]
pub struct TicketCredentials {
    pub client: Principal,
    pub server: Principal,
    pub ticket: Ticket,
    pub session_key: Secret<Vec<u8>>,
    pub session_etype: CipherSuite,
    pub flags: TicketFlags,
    pub auth_time: OffsetDateTime,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: OffsetDateTime,
    pub renew_till: Option<OffsetDateTime>,
}

impl TicketCredentials {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.end_time
    }

    pub fn is_tgt(&self) -> bool {
        self.server.is_tgs()
    }
}

/// Ticket store used by the initiator and filled with delegated credentials by the acceptor.
pub trait CredentialCache: Send + Sync + Debug {
    fn name(&self) -> String;

    /// Default client principal of the cache.
    fn principal(&self) -> Result<Principal>;

    /// Removes every ticket and sets the default client principal.
    fn initialize(&self, principal: &Principal) -> Result<()>;

    /// Stores the ticket, replacing any ticket for the same client and server.
    fn store(&self, credentials: TicketCredentials) -> Result<()>;

    fn retrieve(&self, client: &Principal, server: &Principal) -> Result<Option<TicketCredentials>>;

    fn remove(&self, client: &Principal, server: &Principal) -> Result<()>;

    fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set_config(&self, key: &str, value: &[u8]) -> Result<()>;

    fn credentials(&self) -> Result<Vec<TicketCredentials>>;

    /// Releases the handle. Tickets are kept.
    fn close(&self) -> Result<()>;

    /// Releases the handle and wipes every ticket.
    fn destroy(&self) -> Result<()>;

    /// Time offset to the KDC clock, as recorded by a previous clock-skew recovery.
    fn time_offset(&self) -> Result<time::Duration> {
        let Some(value) = self.get_config(TIME_OFFSET_CONFIG_KEY)? else {
            return Ok(time::Duration::ZERO);
        };

        let seconds = std::str::from_utf8(&value)?
            .parse::<i64>()
            .map_err(|err| Error::new(ErrorKind::Failure, format!("invalid stored time offset: {}", err)))?;

        Ok(time::Duration::seconds(seconds))
    }

    fn set_time_offset(&self, offset: time::Duration) -> Result<()> {
        self.set_config(TIME_OFFSET_CONFIG_KEY, offset.whole_seconds().to_string().as_bytes())
    }
}

#[derive(Debug, Default)]
struct MemoryCcacheInner {
    principal: Option<Principal>,
    credentials: Vec<TicketCredentials>,
    config: HashMap<String, Vec<u8>>,
    destroyed: bool,
}

/// Process-local credential cache.
#[derive(Debug)]
pub struct MemoryCcache {
    name: String,
    inner: Mutex<MemoryCcacheInner>,
}

impl MemoryCcache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(MemoryCcacheInner::default()),
        }
    }

    /// Creates a cache for `principal`.
    pub fn with_principal(name: impl Into<String>, principal: &Principal) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(MemoryCcacheInner {
                principal: Some(principal.clone()),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryCcacheInner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::new(ErrorKind::Failure, "credential cache lock is poisoned"))?;

        if inner.destroyed {
            return Err(Error::new(
                ErrorKind::NoCredentials,
                format!("credential cache {} has been destroyed", self.name),
            ));
        }

        Ok(inner)
    }
}

impl CredentialCache for MemoryCcache {
    fn name(&self) -> String {
        format!("MEMORY:{}", self.name)
    }

    fn principal(&self) -> Result<Principal> {
        self.lock()?.principal.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::NoCredentials,
                format!("credential cache {} is not initialized", self.name),
            )
        })
    }

    fn initialize(&self, principal: &Principal) -> Result<()> {
        let mut inner = self.lock()?;

        inner.principal = Some(principal.clone());
        inner.credentials.clear();
        inner.config.clear();

        Ok(())
    }

    fn store(&self, credentials: TicketCredentials) -> Result<()> {
        let mut inner = self.lock()?;

        inner
            .credentials
            .retain(|cached| !(cached.client == credentials.client && cached.server.same_name(&credentials.server)));
        trace!(client = %credentials.client, server = %credentials.server, "storing ticket");
        inner.credentials.push(credentials);

        Ok(())
    }

    fn retrieve(&self, client: &Principal, server: &Principal) -> Result<Option<TicketCredentials>> {
        Ok(self
            .lock()?
            .credentials
            .iter()
            .find(|cached| cached.client.same_name(client) && cached.server.same_name(server))
            .cloned())
    }

    fn remove(&self, client: &Principal, server: &Principal) -> Result<()> {
        self.lock()?
            .credentials
            .retain(|cached| !(cached.client.same_name(client) && cached.server.same_name(server)));

        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.config.get(key).cloned())
    }

    fn set_config(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock()?.config.insert(key.to_owned(), value.to_vec());

        Ok(())
    }

    fn credentials(&self) -> Result<Vec<TicketCredentials>> {
        Ok(self.lock()?.credentials.clone())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::new(ErrorKind::Failure, "credential cache lock is poisoned"))?;

        inner.principal = None;
        inner.credentials.clear();
        inner.config.clear();
        inner.destroyed = true;

        Ok(())
    }
}
