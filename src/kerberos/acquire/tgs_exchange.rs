use picky_krb::constants::key_usages::TGS_REP_ENC_SESSION_KEY;
use picky_krb::data_types::{KrbResult, ResultExt};
use picky_krb::messages::TgsRep;
use time::Duration;

use super::{kdc_error, unexpected_step, AcquireStep};
use crate::ccache::TicketCredentials;
use crate::kerberos::client::extractors::{credentials_from_kdc_rep, extract_enc_kdc_rep_part};
use crate::kerberos::client::generators::{generate_nonce, generate_tgs_req, TgsReqOptions};
use crate::kerberos::flags::KdcOptions;
use crate::network_client::KdcRequest;
use crate::principal::Principal;
use crate::Result;

/// TGS exchange ([RFC 4120, section 3.3](https://www.rfc-editor.org/rfc/rfc4120#section-3.3)) with a TGT.
#[derive(Debug)]
pub struct TgsExchange {
    tgt: TicketCredentials,
    server: Principal,
    options: KdcOptions,
    time_offset: Duration,
    nonce: Option<Vec<u8>>,
    done: bool,
}

impl TgsExchange {
    pub fn new(tgt: TicketCredentials, server: Principal, options: KdcOptions, time_offset: Duration) -> Self {
        Self {
            tgt,
            server,
            options,
            time_offset,
            nonce: None,
            done: false,
        }
    }

    /// Requests a forwarded TGT to delegate to the acceptor.
    pub fn forwarded(tgt: TicketCredentials, time_offset: Duration) -> Self {
        let server = tgt.server.clone();

        Self::new(
            tgt,
            server,
            KdcOptions::FORWARDED | KdcOptions::FORWARDABLE,
            time_offset,
        )
    }

    pub fn realm(&self) -> &str {
        &self.tgt.server.realm
    }

    #[instrument(level = "debug", skip_all, fields(server = %self.server, waiting = self.nonce.is_some()))]
    pub fn step(&mut self, reply: Option<&[u8]>) -> Result<AcquireStep> {
        if self.done {
            return Err(unexpected_step("TGS"));
        }

        match (self.nonce.as_ref(), reply) {
            (None, None) => {
                let nonce = generate_nonce();

                let tgs_req = generate_tgs_req(TgsReqOptions {
                    tgt: &self.tgt,
                    server: &self.server,
                    options: self.options,
                    nonce: &nonce,
                    time_offset: self.time_offset,
                })?;

                self.nonce = Some(nonce);

                Ok(AcquireStep::Send(KdcRequest {
                    realm: self.realm().to_owned(),
                    data: picky_asn1_der::to_vec(&tgs_req)?,
                }))
            }
            (Some(nonce), Some(reply)) => {
                self.done = true;

                let mut d = picky_asn1_der::Deserializer::new_from_bytes(reply);
                let tgs_rep = KrbResult::<TgsRep>::deserialize(&mut d)?.map_err(|error| kdc_error(&error))?;

                let enc_part = extract_enc_kdc_rep_part(
                    &tgs_rep.0,
                    self.tgt.session_key.as_ref(),
                    TGS_REP_ENC_SESSION_KEY,
                )?;
                let credentials = credentials_from_kdc_rep(&tgs_rep.0, &enc_part, nonce)?;

                info!(server = %credentials.server, "TGS exchange completed");

                Ok(AcquireStep::Done(credentials))
            }
            _ => Err(unexpected_step("TGS")),
        }
    }
}
