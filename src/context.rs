//! Security contexts and their lifecycle.

use std::sync::{Arc, Mutex, MutexGuard};

use picky_krb::data_types::{KerberosTime, Microseconds};
use time::{Duration, OffsetDateTime};

use crate::ccache::{CredentialCache, TicketCredentials};
use crate::channel_bindings::{ChannelBindings, HostAddress};
use crate::crypto::random_seq_number;
use crate::flags::{ContextFlags, InternalFlags};
use crate::kerberos::acquire::Acquisition;
use crate::kerberos::messages::Mechanism;
use crate::kerberos::{SessionMaterial, KEY_USAGE_IAKERB_FINISHED, KEY_USAGE_PKU2U_FINISHED};
use crate::principal::Principal;
use crate::sequence::SequenceWindow;
use crate::{Error, ErrorKind, Result, Secret};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Krb5Start,
    IakerbStart,
    Pku2uStart,
    /// Waiting for the initiator AP-REP of a DCE-style exchange.
    DceWait,
    Ready,
    Completed,
}

impl AcceptorState {
    pub fn initial(mechanism: Mechanism) -> Self {
        match mechanism {
            Mechanism::Kerberos5 => AcceptorState::Krb5Start,
            Mechanism::Iakerb => AcceptorState::IakerbStart,
            Mechanism::Pku2u => AcceptorState::Pku2uStart,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Krb5Start,
    IakerbStart,
    Pku2uStart,
    SetupKeys,
    AuthStep,
    WaitMutual,
    Completed,
}

impl InitiatorState {
    pub fn initial(mechanism: Mechanism) -> Self {
        match mechanism {
            Mechanism::Kerberos5 => InitiatorState::Krb5Start,
            Mechanism::Iakerb => InitiatorState::IakerbStart,
            Mechanism::Pku2u => InitiatorState::Pku2uStart,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Acceptor(AcceptorState),
    Initiator(InitiatorState),
}

/// Recoveries the initiator may still attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Retries after `KRB_AP_ERR_SKEW`.
    pub skew: u8,
    /// Retries with a fresh service ticket after `KRB_AP_ERR_MODIFIED` or `KRB_AP_ERR_TKT_EXPIRED`.
    pub new_ticket: u8,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self { skew: 1, new_ticket: 1 }
    }
}

impl RetryBudget {
    pub fn spend_skew(&mut self) -> bool {
        spend(&mut self.skew)
    }

    pub fn spend_new_ticket(&mut self) -> bool {
        spend(&mut self.new_ticket)
    }
}

fn spend(budget: &mut u8) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;

    true
}

/// Kerberos authentication context: addresses, clock offset and the authenticator being answered.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub local_address: Option<HostAddress>,
    pub remote_address: Option<HostAddress>,
    /// Offset to the KDC clock.
    pub time_offset: Duration,
    /// `ctime` and `cusec` of the authenticator sent (initiator) or accepted (acceptor).
    pub authenticator_time: Option<(KerberosTime, Microseconds)>,
}

#[derive(Debug)]
pub struct SecurityContext {
    pub(crate) mechanism: Mechanism,
    pub(crate) role_state: RoleState,
    pub(crate) flags: ContextFlags,
    pub(crate) internal_flags: InternalFlags,
    pub(crate) retry_budget: RetryBudget,
    /// Flags asked for by the initiator application.
    pub(crate) requested_flags: ContextFlags,
    /// Host-based service name the initiator was asked to authenticate to.
    pub(crate) target_name: Option<String>,
    pub(crate) source: Option<Principal>,
    pub(crate) target: Option<Principal>,
    pub(crate) ticket: Option<TicketCredentials>,
    /// End of the ticket lifetime; the context expires with it.
    pub(crate) expiration: Option<OffsetDateTime>,
    pub(crate) session: SessionMaterial,
    pub(crate) auth_context: AuthContext,
    pub(crate) channel_bindings: Option<ChannelBindings>,
    pub(crate) sequence_window: Option<SequenceWindow>,
    pub(crate) delegation_blob: Option<Vec<u8>>,
    pub(crate) delegated_ccache: Option<Arc<dyn CredentialCache>>,
    /// Every IAKERB or PKU2U token exchanged before the AP-REQ.
    pub(crate) transcript: Vec<u8>,
    pub(crate) acquisition: Option<Acquisition>,
    pub(crate) iakerb_cookie: Option<Vec<u8>>,
    pub(crate) ccache: Option<Arc<dyn CredentialCache>>,
}

impl SecurityContext {
    /// Creates a context in the initial state of `mechanism`.
    ///
    /// The initiator address of the bindings is the local one for an initiator and the remote one for
    /// an acceptor.
    #[instrument(level = "debug", skip(channel_bindings))]
    pub fn create(mechanism: Mechanism, role: Role, channel_bindings: Option<&ChannelBindings>) -> Result<Self> {
        let (initiator_address, acceptor_address) = match channel_bindings {
            Some(channel_bindings) => channel_bindings.addresses()?,
            None => (None, None),
        };

        let (role_state, mut session, internal_flags, local_address, remote_address) = match role {
            Role::Initiator => (
                RoleState::Initiator(InitiatorState::initial(mechanism)),
                SessionMaterial::for_initiator(),
                InternalFlags::LOCAL,
                initiator_address,
                acceptor_address,
            ),
            Role::Acceptor => (
                RoleState::Acceptor(AcceptorState::initial(mechanism)),
                SessionMaterial::for_acceptor(),
                InternalFlags::empty(),
                acceptor_address,
                initiator_address,
            ),
        };
        session.local_seq = random_seq_number();

        Ok(Self {
            mechanism,
            role_state,
            flags: ContextFlags::empty(),
            internal_flags,
            retry_budget: RetryBudget::default(),
            requested_flags: ContextFlags::empty(),
            target_name: None,
            source: None,
            target: None,
            ticket: None,
            expiration: None,
            session,
            auth_context: AuthContext {
                local_address,
                remote_address,
                ..Default::default()
            },
            channel_bindings: channel_bindings.cloned(),
            sequence_window: None,
            delegation_blob: None,
            delegated_ccache: None,
            transcript: Vec::new(),
            acquisition: None,
            iakerb_cookie: None,
            ccache: None,
        })
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    pub fn is_initiator(&self) -> bool {
        self.internal_flags.contains(InternalFlags::LOCAL)
    }

    pub fn is_open(&self) -> bool {
        self.internal_flags.contains(InternalFlags::OPEN)
    }

    pub(crate) fn acceptor_state(&self) -> Result<AcceptorState> {
        match self.role_state {
            RoleState::Acceptor(state) => Ok(state),
            RoleState::Initiator(_) => Err(Error::new(
                ErrorKind::CallBadStructure,
                "initiator context passed to the acceptor",
            )),
        }
    }

    pub(crate) fn initiator_state(&self) -> Result<InitiatorState> {
        match self.role_state {
            RoleState::Initiator(state) => Ok(state),
            RoleState::Acceptor(_) => Err(Error::new(
                ErrorKind::CallBadStructure,
                "acceptor context passed to the initiator",
            )),
        }
    }

    pub(crate) fn set_acceptor_state(&mut self, state: AcceptorState) {
        trace!(from = ?self.role_state, to = ?state, "acceptor state change");
        self.role_state = RoleState::Acceptor(state);
    }

    pub(crate) fn set_initiator_state(&mut self, state: InitiatorState) {
        trace!(from = ?self.role_state, to = ?state, "initiator state change");
        self.role_state = RoleState::Initiator(state);
    }

    /// Key usage of the KRB-FINISHED checksum for the mechanism of the context.
    pub(crate) fn finished_key_usage(&self) -> i32 {
        match self.mechanism {
            Mechanism::Pku2u => KEY_USAGE_PKU2U_FINISHED,
            _ => KEY_USAGE_IAKERB_FINISHED,
        }
    }

    /// Releases everything the context holds. Safe to call more than once.
    #[instrument(level = "debug", skip_all, fields(mechanism = %self.mechanism, open = self.is_open()))]
    pub fn destroy(&mut self) {
        if let Some(ccache) = self.ccache.take() {
            let result = if self.internal_flags.contains(InternalFlags::DESTROY_STORE_ON_DELETE) {
                ccache.destroy()
            } else if self.internal_flags.contains(InternalFlags::CLOSE_STORE_ON_DELETE) {
                ccache.close()
            } else {
                Ok(())
            };

            if let Err(err) = result {
                warn!(ccache = %ccache.name(), %err, "failed to release credential cache");
            }
        }
        self.internal_flags
            .remove(InternalFlags::DESTROY_STORE_ON_DELETE | InternalFlags::CLOSE_STORE_ON_DELETE);

        self.ticket = None;
        self.source = None;
        self.target = None;
        self.session.clear();
        self.sequence_window = None;
        self.delegation_blob = None;
        self.delegated_ccache = None;
        self.transcript.clear();
        self.acquisition = None;
        self.iakerb_cookie = None;
        self.channel_bindings = None;
        self.auth_context = AuthContext::default();
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Shared handle to a context. Steps on the same context serialize on the inner lock.
#[derive(Debug, Clone)]
pub struct ContextHandle(Arc<Mutex<Option<SecurityContext>>>);

impl ContextHandle {
    pub fn new(context: SecurityContext) -> Self {
        Self(Arc::new(Mutex::new(Some(context))))
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Option<SecurityContext>>> {
        self.0
            .lock()
            .map_err(|_| Error::new(ErrorKind::Failure, "security context lock is poisoned"))
    }

    fn with<T>(&self, f: impl FnOnce(&mut SecurityContext) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let context = guard
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "security context has been deleted"))?;

        f(context)
    }

    pub fn is_open(&self) -> bool {
        self.with(|context| Ok(context.is_open())).unwrap_or(false)
    }

    pub fn mechanism(&self) -> Result<Mechanism> {
        self.with(|context| Ok(context.mechanism))
    }

    pub fn flags(&self) -> Result<ContextFlags> {
        self.with(|context| Ok(context.flags))
    }

    pub fn internal_flags(&self) -> Result<InternalFlags> {
        self.with(|context| Ok(context.internal_flags))
    }

    pub fn source(&self) -> Result<Option<Principal>> {
        self.with(|context| Ok(context.source.clone()))
    }

    pub fn target(&self) -> Result<Option<Principal>> {
        self.with(|context| Ok(context.target.clone()))
    }

    /// Key protecting per-message tokens of the established context.
    pub fn session_key(&self) -> Result<Option<Secret<Vec<u8>>>> {
        self.with(|context| Ok(context.session.context_key(context.is_initiator()).cloned()))
    }

    pub fn delegated_credentials(&self) -> Result<Option<Arc<dyn CredentialCache>>> {
        self.with(|context| Ok(context.delegated_ccache.clone()))
    }

    /// Runs a received per-message sequence number through the replay and ordering window.
    pub fn check_sequence(&self, seq: u64) -> Result<()> {
        self.with(|context| {
            context
                .sequence_window
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::CallBadStructure, "security context is not established"))?
                .check(seq)
        })
    }

    /// Destroys the context. Later calls, and every other accessor, see a deleted context.
    pub fn delete(&self) {
        match self.lock() {
            Ok(mut guard) => {
                if let Some(mut context) = guard.take() {
                    context.destroy();
                }
            }
            Err(err) => error!(%err, "cannot delete security context"),
        }
    }
}
