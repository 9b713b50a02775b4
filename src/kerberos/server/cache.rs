use std::collections::HashMap;
use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

use crate::principal::Principal;
use crate::{Error, ErrorKind, Result};

/// Identity of an accepted authenticator.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AuthenticatorCacheRecord {
    pub cname: Principal,
    pub sname: Principal,
    pub ctime: OffsetDateTime,
    pub microseconds: u32,
}

/// Acceptor replay cache.
///
/// An authenticator is remembered for twice the allowed clock skew: older ones are rejected by the
/// skew check anyway.
#[derive(Debug, Default)]
pub struct ReplayCache {
    records: Mutex<HashMap<AuthenticatorCacheRecord, OffsetDateTime>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the authenticator. Fails with `DuplicateToken` if it was already seen.
    pub fn check_and_store(&self, record: AuthenticatorCacheRecord, max_skew: Duration) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::new(ErrorKind::Failure, "replay cache lock is poisoned"))?;

        let now = OffsetDateTime::now_utc();
        records.retain(|_, expires_at| *expires_at > now);

        if records.contains_key(&record) {
            return Err(Error::new(
                ErrorKind::DuplicateToken,
                format!("replayed authenticator from {} for {}", record.cname, record.sname),
            ));
        }

        records.insert(record, now + max_skew * 2);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
