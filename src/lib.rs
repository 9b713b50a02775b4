//! GSS-API Kerberos 5 security context establishment.
//!
//! Both sides of the handshake are driven one token at a time:
//!
//! * [init_step] runs the initiator over Kerberos 5 ([RFC 4121](https://www.rfc-editor.org/rfc/rfc4121)),
//!   IAKERB or PKU2U, acquiring tickets through the credential cache and the configured KDC transport;
//! * [accept_step] runs the acceptor, validating AP-REQs with the keytab and tunnelling IAKERB and
//!   PKU2U KDC traffic;
//! * [delete_context] tears a context down at any point.

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate lazy_static;

pub mod ccache;
pub mod channel_bindings;
pub mod checksum;
pub mod config;
pub mod context;
pub mod credential;
mod crypto;
mod error;
pub mod flags;
pub mod iakerb;
pub mod kerberos;
pub mod keytab;
pub mod krb;
pub mod krb_cred;
pub mod negative_cache;
pub mod network_client;
pub mod pac;
pub mod pk_init;
pub mod principal;
mod secret;
pub mod sequence;

use std::sync::Arc;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::secret::{Secret, SecretPrivateKey};

use crate::channel_bindings::ChannelBindings;
use crate::config::ProcessConfig;
use crate::context::{ContextHandle, Role, SecurityContext};
use crate::credential::CredentialHandle;
use crate::flags::{ContextFlags, InternalFlags};
use crate::kerberos::messages::Mechanism;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Complete,
    ContinueNeeded,
}

/// Result of one handshake step: the token to send to the peer, if any, and whether more
/// steps are expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub token: Option<Vec<u8>>,
    pub status: StepStatus,
}

impl StepOutput {
    pub fn is_complete(&self) -> bool {
        self.status == StepStatus::Complete
    }
}

/// Processes one initiator token.
///
/// A new context is created when `context` is `None`.
#[instrument(level = "debug", skip_all, fields(%mechanism, input_len = input_token.len()))]
pub fn accept_step(
    context: &mut Option<ContextHandle>,
    credential: Option<&CredentialHandle>,
    config: &Arc<ProcessConfig>,
    mechanism: Mechanism,
    input_token: &[u8],
    channel_bindings: Option<&ChannelBindings>,
) -> Result<StepOutput> {
    if context.is_none() {
        let mut created = SecurityContext::create(mechanism, Role::Acceptor, channel_bindings)?;
        if config.allow_legacy_checksum {
            created.internal_flags |= InternalFlags::LEGACY_CHECKSUM_COMPAT;
        }

        *context = Some(ContextHandle::new(created));
    }

    let Some(handle) = context.as_ref() else {
        return Err(Error::new(ErrorKind::Failure, "security context is missing"));
    };

    let mut guard = handle.lock()?;
    match guard.as_mut() {
        Some(context) => kerberos::server::accept_step(context, credential, config, input_token),
        None => Err(Error::new(ErrorKind::CallBadStructure, "security context has been deleted")),
    }
}

/// Produces the next initiator token.
///
/// `target_name` is a host-based service name (`service@host`). It and `requested_flags` are only
/// read when the context is created. An empty `input_token` means no input.
#[allow(clippy::too_many_arguments)]
#[instrument(level = "debug", skip_all, fields(%mechanism, %target_name, input_len = input_token.len()))]
pub fn init_step(
    context: &mut Option<ContextHandle>,
    credential: Option<&CredentialHandle>,
    config: &Arc<ProcessConfig>,
    mechanism: Mechanism,
    target_name: &str,
    requested_flags: ContextFlags,
    channel_bindings: Option<&ChannelBindings>,
    input_token: &[u8],
) -> Result<StepOutput> {
    if context.is_none() {
        let mut created = SecurityContext::create(mechanism, Role::Initiator, channel_bindings)?;
        created.target_name = Some(target_name.to_owned());
        created.requested_flags = requested_flags;

        *context = Some(ContextHandle::new(created));
    }

    let Some(handle) = context.as_ref() else {
        return Err(Error::new(ErrorKind::Failure, "security context is missing"));
    };

    let input = if input_token.is_empty() { None } else { Some(input_token) };

    let mut guard = handle.lock()?;
    match guard.as_mut() {
        Some(context) => kerberos::client::init_step(context, credential, config, input),
        None => Err(Error::new(ErrorKind::CallBadStructure, "security context has been deleted")),
    }
}

/// Destroys the context and clears the caller's handle. Calling it again is a no-op.
pub fn delete_context(context: &mut Option<ContextHandle>) -> Result<()> {
    if let Some(handle) = context.take() {
        handle.delete();
    }

    Ok(())
}
