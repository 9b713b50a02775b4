use picky_krb::constants::error_codes::KDC_ERR_PREAUTH_REQUIRED;
use picky_krb::constants::key_usages::AS_REP_ENC;
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::{KrbResult, PaData, ResultExt};
use picky_krb::messages::AsRep;
use time::Duration;

use super::{kdc_error, unexpected_step, AcquireStep};
use crate::kerberos::client::extractors::{
    credentials_from_kdc_rep, extract_enc_kdc_rep_part, extract_etype_info2, krb_error_code,
};
use crate::kerberos::client::generators::{
    default_salt, generate_as_req, generate_kdc_req_body, generate_nonce, generate_pa_enc_timestamp,
    generate_pa_pac_request, KdcReqBodyOptions, DEFAULT_AS_REQ_OPTIONS,
};
use crate::kerberos::utils::cipher_suite_of;
use crate::network_client::KdcRequest;
use crate::principal::Principal;
use crate::{Result, Secret};

#[derive(Debug)]
enum AsState {
    Start,
    /// The request without pre-authentication is out. A KDC_ERR_PREAUTH_REQUIRED is expected.
    WaitPreauthRequired,
    WaitAsRep {
        key: Secret<Vec<u8>>,
    },
    Done,
}

/// Password based AS exchange ([RFC 4120, section 3.1](https://www.rfc-editor.org/rfc/rfc4120#section-3.1)).
#[derive(Debug)]
pub struct AsExchange {
    client: Principal,
    server: Principal,
    password: Secret<String>,
    time_offset: Duration,
    nonce: Vec<u8>,
    state: AsState,
}

impl AsExchange {
    /// Requests a TGT for `client` in its own realm.
    pub fn new(client: Principal, password: Secret<String>, time_offset: Duration) -> Self {
        let server = Principal::tgs(&client.realm);

        Self::for_service(client, server, password, time_offset)
    }

    pub fn for_service(client: Principal, server: Principal, password: Secret<String>, time_offset: Duration) -> Self {
        Self {
            client,
            server,
            password,
            time_offset,
            nonce: Vec::new(),
            state: AsState::Start,
        }
    }

    pub fn realm(&self) -> &str {
        &self.client.realm
    }

    #[instrument(level = "debug", skip_all, fields(state = ?self.state, client = %self.client))]
    pub fn step(&mut self, reply: Option<&[u8]>) -> Result<AcquireStep> {
        match (std::mem::replace(&mut self.state, AsState::Done), reply) {
            (AsState::Start, None) => {
                let request = self.as_request(vec![generate_pa_pac_request()?])?;
                self.state = AsState::WaitPreauthRequired;

                Ok(AcquireStep::Send(request))
            }
            (AsState::WaitPreauthRequired, Some(reply)) => {
                let mut d = picky_asn1_der::Deserializer::new_from_bytes(reply);
                let as_rep: KrbResult<AsRep> = KrbResult::deserialize(&mut d)?;

                match as_rep {
                    Ok(as_rep) => {
                        // the client does not require pre-authentication
                        warn!("KDC answered the AS-REQ without pre-authentication");

                        let cipher_suite = cipher_suite_of(&as_rep.0.enc_part.0)?;
                        let key = self.long_term_key(&cipher_suite, &default_salt(&self.client))?;

                        self.finish(&as_rep, &key)
                    }
                    Err(error) if krb_error_code(&error) == KDC_ERR_PREAUTH_REQUIRED => {
                        let (cipher_suite, salt) = extract_etype_info2(&error)?
                            .unwrap_or((CipherSuite::Aes256CtsHmacSha196, None));
                        let salt = salt.unwrap_or_else(|| default_salt(&self.client));

                        debug!(?cipher_suite, "KDC requires pre-authentication");

                        let key = self.long_term_key(&cipher_suite, &salt)?;

                        let pa_datas = vec![
                            generate_pa_enc_timestamp(&cipher_suite, key.as_ref(), self.time_offset)?,
                            generate_pa_pac_request()?,
                        ];
                        let request = self.as_request(pa_datas)?;

                        self.state = AsState::WaitAsRep { key };

                        Ok(AcquireStep::Send(request))
                    }
                    Err(error) => Err(kdc_error(&error)),
                }
            }
            (AsState::WaitAsRep { key }, Some(reply)) => {
                let mut d = picky_asn1_der::Deserializer::new_from_bytes(reply);
                let as_rep = KrbResult::<AsRep>::deserialize(&mut d)?.map_err(|error| kdc_error(&error))?;

                self.finish(&as_rep, &key)
            }
            (state, _) => {
                self.state = state;

                Err(unexpected_step("AS"))
            }
        }
    }

    fn as_request(&mut self, pa_datas: Vec<PaData>) -> Result<KdcRequest> {
        self.nonce = generate_nonce();

        let kdc_req_body = generate_kdc_req_body(&KdcReqBodyOptions {
            client: Some(&self.client),
            server: &self.server,
            realm: &self.client.realm,
            options: DEFAULT_AS_REQ_OPTIONS,
            nonce: &self.nonce,
            additional_tickets: None,
        })?;

        Ok(KdcRequest {
            realm: self.client.realm.clone(),
            data: picky_asn1_der::to_vec(&generate_as_req(pa_datas, kdc_req_body))?,
        })
    }

    fn long_term_key(&self, cipher_suite: &CipherSuite, salt: &str) -> Result<Secret<Vec<u8>>> {
        Ok(Secret::new(
            cipher_suite
                .cipher()
                .generate_key_from_password(self.password.as_ref().as_bytes(), salt.as_bytes())?,
        ))
    }

    fn finish(&mut self, as_rep: &AsRep, key: &Secret<Vec<u8>>) -> Result<AcquireStep> {
        let enc_part = extract_enc_kdc_rep_part(&as_rep.0, key.as_ref(), AS_REP_ENC)?;
        let credentials = credentials_from_kdc_rep(&as_rep.0, &enc_part, &self.nonce)?;

        info!(client = %credentials.client, server = %credentials.server, "AS exchange completed");

        Ok(AcquireStep::Done(credentials))
    }
}
