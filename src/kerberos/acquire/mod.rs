//! Ticket acquisition sub-contexts.
//!
//! Each exchange is a sans-IO state machine: [Acquisition::step] takes the last KDC reply (nothing on the
//! first call) and yields the next KDC request or the acquired ticket. The initiator tunnels the requests
//! through IAKERB or PKU2U tokens, [drive] sends them through a [KdcTransport] directly.

mod as_exchange;
mod pkinit;
mod tgs_exchange;

use picky_krb::constants::error_codes::{
    KDC_ERR_CLIENT_REVOKED, KDC_ERR_C_PRINCIPAL_UNKNOWN, KDC_ERR_KEY_EXPIRED, KDC_ERR_PREAUTH_FAILED,
    KDC_ERR_S_PRINCIPAL_UNKNOWN, KDC_ERR_WRONG_REALM, KRB_AP_ERR_SKEW,
};
use picky_krb::messages::KrbError;

pub use self::as_exchange::AsExchange;
pub use self::pkinit::PkinitExchange;
pub use self::tgs_exchange::TgsExchange;
use crate::ccache::TicketCredentials;
use crate::kerberos::client::extractors::krb_error_code;
use crate::network_client::{KdcRequest, KdcTransport};
use crate::{Error, ErrorKind, Result};

/// Upper bound of KDC round trips a single exchange may take.
const MAX_KDC_ROUND_TRIPS: usize = 4;

/// Outcome of one acquisition step.
#[derive(Debug)]
pub enum AcquireStep {
    Send(KdcRequest),
    Done(TicketCredentials),
}

#[derive(Debug)]
pub enum Acquisition {
    As(AsExchange),
    Tgs(TgsExchange),
    Pkinit(PkinitExchange),
}

impl Acquisition {
    pub fn step(&mut self, reply: Option<&[u8]>) -> Result<AcquireStep> {
        match self {
            Acquisition::As(exchange) => exchange.step(reply),
            Acquisition::Tgs(exchange) => exchange.step(reply),
            Acquisition::Pkinit(exchange) => exchange.step(reply),
        }
    }

    /// Realm whose KDC receives the requests.
    pub fn realm(&self) -> &str {
        match self {
            Acquisition::As(exchange) => exchange.realm(),
            Acquisition::Tgs(exchange) => exchange.realm(),
            Acquisition::Pkinit(exchange) => exchange.realm(),
        }
    }
}

/// Runs the exchange to completion through `transport`.
#[instrument(level = "debug", skip_all, fields(realm = acquisition.realm()))]
pub fn drive(acquisition: &mut Acquisition, transport: &dyn KdcTransport) -> Result<TicketCredentials> {
    let mut reply: Option<Vec<u8>> = None;

    for _ in 0..=MAX_KDC_ROUND_TRIPS {
        match acquisition.step(reply.as_deref())? {
            AcquireStep::Send(request) => {
                debug!(realm = %request.realm, len = request.data.len(), "sending KDC request");

                reply = Some(transport.send(&request)?);
            }
            AcquireStep::Done(credentials) => return Ok(credentials),
        }
    }

    Err(Error::new(
        ErrorKind::Failure,
        "ticket acquisition did not complete in the allowed number of KDC round trips",
    ))
}

/// Maps a KDC error reply to the error reported to the caller.
pub fn kdc_error(error: &KrbError) -> Error {
    let code = krb_error_code(error);
    let text = error
        .0
        .e_text
        .0
        .as_ref()
        .map(|text| text.0.to_string())
        .unwrap_or_default();

    error!(code, %text, "KDC replied with an error");

    let kind = match code {
        KRB_AP_ERR_SKEW => ErrorKind::TimeSkew,
        KDC_ERR_C_PRINCIPAL_UNKNOWN | KDC_ERR_PREAUTH_FAILED | KDC_ERR_KEY_EXPIRED | KDC_ERR_CLIENT_REVOKED => {
            ErrorKind::NoCredentials
        }
        KDC_ERR_S_PRINCIPAL_UNKNOWN | KDC_ERR_WRONG_REALM => ErrorKind::BadName,
        _ => ErrorKind::Failure,
    };

    Error::new(kind, format!("KDC error {}: {}", code, text))
}

fn unexpected_step(exchange: &str) -> Error {
    Error::new(
        ErrorKind::CallBadStructure,
        format!("{} exchange stepped with an unexpected input", exchange),
    )
}
