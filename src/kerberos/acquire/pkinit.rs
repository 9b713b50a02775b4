use picky_asn1_x509::Certificate;
use picky_krb::constants::key_usages::AS_REP_ENC;
use picky_krb::data_types::{KrbResult, ResultExt};
use picky_krb::messages::AsRep;
use time::Duration;

use super::{kdc_error, unexpected_step, AcquireStep};
use crate::kerberos::client::extractors::{credentials_from_kdc_rep, extract_enc_kdc_rep_part};
use crate::kerberos::client::generators::{
    generate_as_req, generate_kdc_req_body, generate_nonce, KdcReqBodyOptions, DEFAULT_AS_REQ_OPTIONS,
};
use crate::kerberos::utils::cipher_suite_of;
use crate::network_client::KdcRequest;
use crate::pk_init::{
    extract_dh_rep_info, extract_kdc_dh_public_key, extract_server_nonce, generate_pa_pk_as_req, DhParameters,
    PaPkAsReqOptions,
};
use crate::principal::Principal;
use crate::secret::SecretPrivateKey;
use crate::{Result, Secret};

/// AS exchange pre-authenticated with a certificate and Diffie-Hellman key agreement
/// ([RFC 4556](https://www.rfc-editor.org/rfc/rfc4556.html)).
#[derive(Debug)]
pub struct PkinitExchange {
    certificate: Certificate,
    private_key: SecretPrivateKey,
    client: Principal,
    server: Principal,
    time_offset: Duration,
    /// Set once the AS-REQ is out.
    pending: Option<(DhParameters, Vec<u8>)>,
    done: bool,
}

impl PkinitExchange {
    pub fn new(
        certificate: Certificate,
        private_key: SecretPrivateKey,
        client: Principal,
        server: Principal,
        time_offset: Duration,
    ) -> Self {
        Self {
            certificate,
            private_key,
            client,
            server,
            time_offset,
            pending: None,
            done: false,
        }
    }

    pub fn realm(&self) -> &str {
        &self.client.realm
    }

    #[instrument(level = "debug", skip_all, fields(client = %self.client, server = %self.server))]
    pub fn step(&mut self, reply: Option<&[u8]>) -> Result<AcquireStep> {
        if self.done {
            return Err(unexpected_step("PKINIT"));
        }

        match (self.pending.take(), reply) {
            (None, None) => {
                let dh_parameters = DhParameters::generate_client();
                let nonce = generate_nonce();

                let kdc_req_body = generate_kdc_req_body(&KdcReqBodyOptions {
                    client: Some(&self.client),
                    server: &self.server,
                    realm: &self.client.realm,
                    options: DEFAULT_AS_REQ_OPTIONS,
                    nonce: &nonce,
                    additional_tickets: None,
                })?;

                let pa_pk_as_req = generate_pa_pk_as_req(&PaPkAsReqOptions {
                    certificate: &self.certificate,
                    private_key: self.private_key.as_ref(),
                    kdc_req_body: &kdc_req_body,
                    dh_parameters: &dh_parameters,
                    time_offset: self.time_offset,
                })?;

                let as_req = generate_as_req(vec![pa_pk_as_req], kdc_req_body);

                self.pending = Some((dh_parameters, nonce));

                Ok(AcquireStep::Send(KdcRequest {
                    realm: self.client.realm.clone(),
                    data: picky_asn1_der::to_vec(&as_req)?,
                }))
            }
            (Some((mut dh_parameters, nonce)), Some(reply)) => {
                self.done = true;

                let mut d = picky_asn1_der::Deserializer::new_from_bytes(reply);
                let as_rep = KrbResult::<AsRep>::deserialize(&mut d)?.map_err(|error| kdc_error(&error))?;

                let dh_rep_info = extract_dh_rep_info(&as_rep.0)?;
                dh_parameters.server_nonce = Some(extract_server_nonce(&dh_rep_info)?);
                dh_parameters.other_public_key = Some(extract_kdc_dh_public_key(&dh_rep_info)?);

                let cipher_suite = cipher_suite_of(&as_rep.0.enc_part.0)?;
                let reply_key = Secret::new(dh_parameters.derive_key(&cipher_suite)?);

                let enc_part = extract_enc_kdc_rep_part(&as_rep.0, reply_key.as_ref(), AS_REP_ENC)?;
                let credentials = credentials_from_kdc_rep(&as_rep.0, &enc_part, &nonce)?;

                info!(client = %credentials.client, server = %credentials.server, "PKINIT exchange completed");

                Ok(AcquireStep::Done(credentials))
            }
            (pending, _) => {
                self.pending = pending;

                Err(unexpected_step("PKINIT"))
            }
        }
    }
}
