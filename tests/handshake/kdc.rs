use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use picky_asn1::date::GeneralizedTime;
use picky_asn1::restricted_string::IA5String;
use picky::key::PrivateKey;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag10, ExplicitContextTag11,
    ExplicitContextTag12, ExplicitContextTag2, ExplicitContextTag3, ExplicitContextTag4, ExplicitContextTag5,
    ExplicitContextTag6, ExplicitContextTag7, ExplicitContextTag9, ImplicitContextTag0, IntegerAsn1, OctetStringAsn1,
    Optional,
};
use picky_asn1_der::application_tag::ApplicationTag;
use picky_asn1_der::Asn1DerError;
use picky_asn1_x509::Certificate;
use picky_krb::constants::error_codes::{
    KDC_ERR_C_PRINCIPAL_UNKNOWN, KDC_ERR_PREAUTH_FAILED, KDC_ERR_PREAUTH_REQUIRED,
    KDC_ERR_S_PRINCIPAL_UNKNOWN, KRB_AP_ERR_MODIFIED, KRB_ERR_GENERIC,
};
use picky_krb::constants::key_usages::{
    AS_REP_ENC, TGS_REP_ENC_SESSION_KEY, TGS_REP_ENC_SUB_KEY, TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR, TICKET_REP,
};
use picky_krb::constants::types::{
    AS_REP_MSG_TYPE, ENC_AS_REP_PART_TYPE, ENC_TGS_REP_PART_TYPE, KRB_ERROR_MSG_TYPE, PA_ENC_TIMESTAMP,
    PA_ENC_TIMESTAMP_KEY_USAGE, PA_ETYPE_INFO2_TYPE, PA_PK_AS_REP, PA_PK_AS_REQ, PA_TGS_REQ_TYPE, TGS_REP_MSG_TYPE,
};
use picky_krb::crypto::{CipherSuite, KerberosCryptoError};
use picky_krb::data_types::{
    Authenticator, EncTicketPart, EncTicketPartInner, EncryptedData, EncryptionKey, EtypeInfo2Entry, KerberosFlags,
    KerberosStringAsn1, KerberosTime, LastReq, LastReqInner, Microseconds, PaData, PaEncTsEnc, PrincipalName, Realm,
    Ticket, TicketInner, TransitedEncoding,
};
use picky_krb::messages::{
    ApReq, AsRep, AsReq, EncKdcRepPart, KdcRep, KdcReqBody, KrbError, KrbErrorInner, TgsRep, TgsReq,
};
use picky_krb::pkinit::{DhRepInfo, KdcDhKeyInfo, PaPkAsRep};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use gss_krb5::kerberos::flags::{kerberos_flags_to_u32, u32_to_kerberos_flags, KdcOptions, TicketFlags};
use gss_krb5::kerberos::{KERBEROS_VERSION, TGT_SERVICE_NAME};
use gss_krb5::pk_init::{
    decode_dh_public_key, encode_dh_public_key, extract_auth_pack, pkinit_dh_key_data_oid, sign_content,
    DhParameters, DH_NONCE_LEN,
};

/// `KDC_ERR_BADOPTION`
const KDC_ERR_BADOPTION: u32 = 13;

const AES256: CipherSuite = CipherSuite::Aes256CtsHmacSha196;
const MAX_TIME_SKEW: Duration = Duration::minutes(5);
const TICKET_LIFETIME: Duration = Duration::hours(10);

#[derive(Error, Debug)]
pub enum KdcError {
    #[error("KDC_ERR_C_PRINCIPAL_UNKNOWN: {0}")]
    ClientPrincipalUnknown(String),

    #[error("KDC_ERR_S_PRINCIPAL_UNKNOWN: {0}")]
    ServerPrincipalUnknown(String),

    #[error("KDC_ERR_PREAUTH_REQUIRED: {0}")]
    PreAuthRequired(&'static str),

    #[error("KDC_ERR_PREAUTH_FAILED: {0}")]
    PreAuthFailed(&'static str),

    #[error("KDC_ERR_BADOPTION: {0}")]
    BadOption(&'static str),

    #[error("KRB_AP_ERR_MODIFIED: {0} decryption failed")]
    Modified(&'static str),

    #[error("ASN1 DER encoding failed: {0:?}")]
    Asn1(#[from] Asn1DerError),

    #[error("encryption failed: {0:?}")]
    Crypto(#[from] KerberosCryptoError),
}

impl KdcError {
    fn error_code(&self) -> u32 {
        match self {
            KdcError::ClientPrincipalUnknown(_) => KDC_ERR_C_PRINCIPAL_UNKNOWN,
            KdcError::ServerPrincipalUnknown(_) => KDC_ERR_S_PRINCIPAL_UNKNOWN,
            KdcError::PreAuthRequired(_) => KDC_ERR_PREAUTH_REQUIRED,
            KdcError::PreAuthFailed(_) => KDC_ERR_PREAUTH_FAILED,
            KdcError::BadOption(_) => KDC_ERR_BADOPTION,
            KdcError::Modified(_) => KRB_AP_ERR_MODIFIED,
            KdcError::Asn1(_) | KdcError::Crypto(_) => KRB_ERR_GENERIC,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PasswordCreds {
    pub password: String,
    pub salt: String,
}

#[derive(Debug, Clone)]
pub struct ServiceKey {
    pub kvno: u32,
    pub key: Vec<u8>,
}

/// Certificate and key the KDC signs its PKINIT replies with.
#[derive(Clone)]
pub struct PkinitSigner {
    pub certificate: Certificate,
    pub private_key: PrivateKey,
}

impl fmt::Debug for PkinitSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkinitSigner")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Simple in-process KDC: AS with encrypted-timestamp or PKINIT pre-authentication and TGS, AES256 only.
#[derive(Debug)]
pub struct KdcMock {
    realm: String,
    krbtgt_key: Vec<u8>,
    users: HashMap<String, PasswordCreds>,
    services: Mutex<HashMap<String, ServiceKey>>,
    ok_as_delegate: Mutex<Vec<String>>,
    pkinit_signer: Mutex<Option<PkinitSigner>>,
}

fn random_key() -> Vec<u8> {
    let mut key = vec![0; AES256.cipher().key_size()];
    OsRng.fill_bytes(&mut key);

    key
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc().replace_nanosecond(0).unwrap()
}

fn kerberos_time(time: OffsetDateTime) -> KerberosTime {
    KerberosTime::from(GeneralizedTime::from(time))
}

fn kerberos_string(value: &str) -> KerberosStringAsn1 {
    KerberosStringAsn1::from(IA5String::from_string(value.to_owned()).unwrap())
}

/// `comp1/comp2`, the key of the KDC database.
fn principal_key(name: &PrincipalName) -> String {
    name.name_string
        .0
        .0
        .iter()
        .map(|component| component.0.as_utf8().to_owned())
        .collect::<Vec<_>>()
        .join("/")
}

struct IssuedTicket {
    ticket: Ticket,
    session_key: Vec<u8>,
    flags: KerberosFlags,
    auth_time: OffsetDateTime,
    end_time: OffsetDateTime,
}

impl KdcMock {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_owned(),
            krbtgt_key: random_key(),
            users: HashMap::new(),
            services: Mutex::new(HashMap::new()),
            ok_as_delegate: Mutex::new(Vec::new()),
            pkinit_signer: Mutex::new(None),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn add_user(&mut self, name: &str, password: &str) {
        let salt = format!("{}{}", self.realm, name.replace('/', ""));

        self.users.insert(
            name.to_owned(),
            PasswordCreds {
                password: password.to_owned(),
                salt,
            },
        );
    }

    /// Registers or rotates the long-term key of a service.
    pub fn set_service_key(&self, name: &str, kvno: u32, key: Vec<u8>) {
        self.services
            .lock()
            .unwrap()
            .insert(name.to_owned(), ServiceKey { kvno, key });
    }

    /// Service tickets for `name` will carry the `ok-as-delegate` flag.
    pub fn trust_for_delegation(&self, name: &str) {
        self.ok_as_delegate.lock().unwrap().push(name.to_owned());
    }

    /// Enables PKINIT: AS-REQs with `PA-PK-AS-REQ` are answered with a Diffie-Hellman reply signed by `signer`.
    pub fn enable_pkinit(&self, signer: PkinitSigner) {
        *self.pkinit_signer.lock().unwrap() = Some(signer);
    }

    /// Answers one DER encoded KDC request with a DER encoded reply or KRB-ERROR.
    pub fn handle(&self, data: &[u8]) -> Vec<u8> {
        if let Ok(as_req) = picky_asn1_der::from_bytes::<AsReq>(data) {
            return match self.as_exchange(&as_req) {
                Ok(as_rep) => picky_asn1_der::to_vec(&as_rep).unwrap(),
                Err(err) => picky_asn1_der::to_vec(&self.krb_error(&err, &as_req.0.req_body.0)).unwrap(),
            };
        }

        if let Ok(tgs_req) = picky_asn1_der::from_bytes::<TgsReq>(data) {
            return match self.tgs_exchange(&tgs_req) {
                Ok(tgs_rep) => picky_asn1_der::to_vec(&tgs_rep).unwrap(),
                Err(err) => picky_asn1_der::to_vec(&self.krb_error(&err, &tgs_req.0.req_body.0)).unwrap(),
            };
        }

        panic!("invalid Kerberos message: {:?}", data);
    }

    fn realm_asn1(&self) -> Realm {
        Realm::from(IA5String::from_string(self.realm.clone()).unwrap())
    }

    fn validate_timestamp(creds: &PasswordCreds, pa_datas: &[PaData]) -> Result<(), KdcError> {
        let encrypted_timestamp = pa_datas
            .iter()
            .find(|pa_data| pa_data.padata_type.0.0 == PA_ENC_TIMESTAMP)
            .ok_or(KdcError::PreAuthRequired("missing PA-ENC-TIMESTAMP"))?;
        let enc_data: EncryptedData = picky_asn1_der::from_bytes(&encrypted_timestamp.padata_data.0.0)
            .map_err(|_| KdcError::PreAuthFailed("cannot decode PA-ENC-TIMESTAMP"))?;

        let cipher = AES256.cipher();
        let key = cipher.generate_key_from_password(creds.password.as_bytes(), creds.salt.as_bytes())?;
        let timestamp: PaEncTsEnc = picky_asn1_der::from_bytes(
            &cipher
                .decrypt(&key, PA_ENC_TIMESTAMP_KEY_USAGE, &enc_data.cipher.0.0)
                .map_err(|_| KdcError::PreAuthFailed("wrong password"))?,
        )?;

        let client_time = OffsetDateTime::try_from(timestamp.patimestamp.0.0)
            .map_err(|_| KdcError::PreAuthFailed("invalid timestamp"))?;
        if (now() - client_time).abs() > MAX_TIME_SKEW {
            return Err(KdcError::PreAuthFailed("timestamp is outside the allowed skew"));
        }

        Ok(())
    }

    fn make_ticket(
        &self,
        realm: &Realm,
        cname: &PrincipalName,
        sname: &PrincipalName,
        ticket_key: &ServiceKey,
        flags: TicketFlags,
    ) -> Result<IssuedTicket, KdcError> {
        let session_key = random_key();
        let auth_time = now();
        let end_time = auth_time + TICKET_LIFETIME;
        let flags = u32_to_kerberos_flags(flags.bits());

        let ticket_enc_part = EncTicketPart::from(EncTicketPartInner {
            flags: ExplicitContextTag0::from(flags.clone()),
            key: ExplicitContextTag1::from(EncryptionKey {
                key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(AES256)])),
                key_value: ExplicitContextTag1::from(OctetStringAsn1::from(session_key.clone())),
            }),
            crealm: ExplicitContextTag2::from(realm.clone()),
            cname: ExplicitContextTag3::from(cname.clone()),
            transited: ExplicitContextTag4::from(TransitedEncoding {
                tr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![0])),
                contents: ExplicitContextTag1::from(OctetStringAsn1::from(vec![1])),
            }),
            auth_time: ExplicitContextTag5::from(kerberos_time(auth_time)),
            starttime: Optional::from(None),
            endtime: ExplicitContextTag7::from(kerberos_time(end_time)),
            renew_till: Optional::from(None),
            caddr: Optional::from(None),
            authorization_data: Optional::from(None),
        });
        let ticket_enc_data =
            AES256
                .cipher()
                .encrypt(&ticket_key.key, TICKET_REP, &picky_asn1_der::to_vec(&ticket_enc_part)?)?;

        let kvno = u8::try_from(ticket_key.kvno).unwrap();
        let ticket = Ticket::from(TicketInner {
            tkt_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            realm: ExplicitContextTag1::from(realm.clone()),
            sname: ExplicitContextTag2::from(sname.clone()),
            enc_part: ExplicitContextTag3::from(EncryptedData {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(AES256)])),
                kvno: Optional::from(Some(ExplicitContextTag1::from(IntegerAsn1::from(vec![kvno])))),
                cipher: ExplicitContextTag2::from(OctetStringAsn1::from(ticket_enc_data)),
            }),
        });

        Ok(IssuedTicket {
            ticket,
            session_key,
            flags,
            auth_time,
            end_time,
        })
    }

    fn make_rep_enc_part<const TAG: u8>(
        &self,
        realm: &Realm,
        issued: &IssuedTicket,
        nonce: Vec<u8>,
        sname: &PrincipalName,
        key: &[u8],
        key_usage: i32,
    ) -> Result<EncryptedData, KdcError> {
        let enc_part = ApplicationTag::<_, TAG>::from(EncKdcRepPart {
            key: ExplicitContextTag0::from(EncryptionKey {
                key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(AES256)])),
                key_value: ExplicitContextTag1::from(OctetStringAsn1::from(issued.session_key.clone())),
            }),
            last_req: ExplicitContextTag1::from(LastReq::from(vec![LastReqInner {
                lr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![0])),
                lr_value: ExplicitContextTag1::from(kerberos_time(issued.auth_time - Duration::minutes(1))),
            }])),
            nonce: ExplicitContextTag2::from(IntegerAsn1::from(nonce)),
            key_expiration: Optional::from(None),
            flags: ExplicitContextTag4::from(issued.flags.clone()),
            auth_time: ExplicitContextTag5::from(kerberos_time(issued.auth_time)),
            start_time: Optional::from(Some(ExplicitContextTag6::from(kerberos_time(issued.auth_time)))),
            end_time: ExplicitContextTag7::from(kerberos_time(issued.end_time)),
            renew_till: Optional::from(None),
            srealm: ExplicitContextTag9::from(realm.clone()),
            sname: ExplicitContextTag10::from(sname.clone()),
            caadr: Optional::from(None),
            encrypted_pa_data: Optional::from(None),
        });

        Ok(EncryptedData {
            etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(AES256)])),
            kvno: Optional::from(None),
            cipher: ExplicitContextTag2::from(OctetStringAsn1::from(AES256.cipher().encrypt(
                key,
                key_usage,
                &picky_asn1_der::to_vec(&enc_part)?,
            )?)),
        })
    }

    fn krbtgt(&self) -> ServiceKey {
        ServiceKey {
            kvno: 1,
            key: self.krbtgt_key.clone(),
        }
    }

    /// [The Authentication Service Exchange](https://www.rfc-editor.org/rfc/rfc4120#section-3.1).
    fn as_exchange(&self, as_req: &AsReq) -> Result<AsRep, KdcError> {
        let req_body = &as_req.0.req_body.0;

        let cname = &req_body
            .cname
            .0
            .as_ref()
            .ok_or_else(|| KdcError::ClientPrincipalUnknown("cname is missing".to_owned()))?
            .0;
        let sname = &req_body
            .sname
            .0
            .as_ref()
            .ok_or_else(|| KdcError::ServerPrincipalUnknown("sname is missing".to_owned()))?
            .0;

        let pa_datas = as_req
            .0
            .padata
            .0
            .as_ref()
            .map(|pa_datas| pa_datas.0.0.as_slice())
            .unwrap_or_default();
        if let Some(pa_pk_as_req) = pa_datas.iter().find(|pa_data| pa_data.padata_type.0.0 == PA_PK_AS_REQ) {
            return self.pkinit_exchange(req_body, cname, sname, pa_pk_as_req);
        }

        let creds = self
            .users
            .get(&principal_key(cname))
            .ok_or_else(|| KdcError::ClientPrincipalUnknown(principal_key(cname)))?;
        if principal_key(sname) != format!("{}/{}", TGT_SERVICE_NAME, self.realm) {
            return Err(KdcError::ServerPrincipalUnknown(principal_key(sname)));
        }

        Self::validate_timestamp(creds, pa_datas)?;

        let requested = KdcOptions::from_bits_truncate(kerberos_flags_to_u32(&req_body.kdc_options.0));
        let mut flags = TicketFlags::INITIAL | TicketFlags::PRE_AUTHENT;
        if requested.contains(KdcOptions::FORWARDABLE) {
            flags |= TicketFlags::FORWARDABLE;
        }

        let realm = self.realm_asn1();
        let issued = self.make_ticket(&realm, cname, sname, &self.krbtgt(), flags)?;

        let user_key = AES256
            .cipher()
            .generate_key_from_password(creds.password.as_bytes(), creds.salt.as_bytes())?;
        let enc_part = self.make_rep_enc_part::<ENC_AS_REP_PART_TYPE>(
            &realm,
            &issued,
            req_body.nonce.0.0.clone(),
            sname,
            &user_key,
            AS_REP_ENC,
        )?;

        Ok(AsRep::from(KdcRep {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AS_REP_MSG_TYPE])),
            padata: Optional::from(None),
            crealm: ExplicitContextTag3::from(self.realm_asn1()),
            cname: ExplicitContextTag4::from(cname.clone()),
            ticket: ExplicitContextTag5::from(issued.ticket.clone()),
            enc_part: ExplicitContextTag6::from(enc_part),
        }))
    }

    /// PKINIT AS exchange with Diffie-Hellman key agreement
    /// ([RFC 4556, section 3.2.3](https://www.rfc-editor.org/rfc/rfc4556.html#section-3.2.3)).
    ///
    /// The ticket is issued directly for `sname` in the realm of the request, as PKU2U peers expect.
    fn pkinit_exchange(
        &self,
        req_body: &KdcReqBody,
        cname: &PrincipalName,
        sname: &PrincipalName,
        pa_pk_as_req: &PaData,
    ) -> Result<AsRep, KdcError> {
        let signer = self
            .pkinit_signer
            .lock()
            .unwrap()
            .clone()
            .ok_or(KdcError::PreAuthFailed("PKINIT is not enabled"))?;

        let auth_pack =
            extract_auth_pack(pa_pk_as_req).map_err(|_| KdcError::PreAuthFailed("invalid signed AuthPack"))?;
        let pk_authenticator = &auth_pack.pk_authenticator.0;
        if pk_authenticator.nonce.0.as_unsigned_bytes_be() != req_body.nonce.0.as_unsigned_bytes_be() {
            return Err(KdcError::PreAuthFailed("PKAuthenticator nonce does not match the request"));
        }

        let client_public_value = &auth_pack
            .client_public_value
            .0
            .as_ref()
            .ok_or(KdcError::PreAuthFailed("only Diffie-Hellman key agreement is supported"))?
            .0;
        let domain = &client_public_value.key_info.key_info;
        let client_nonce: [u8; DH_NONCE_LEN] = auth_pack
            .client_dh_nonce
            .0
            .as_ref()
            .and_then(|nonce| nonce.0.0.as_slice().try_into().ok())
            .ok_or(KdcError::PreAuthFailed("client DH nonce is missing"))?;

        let mut dh_parameters = DhParameters::generate_server(
            domain.g.0.clone(),
            domain.p.0.clone(),
            domain.q.0.clone(),
        );
        dh_parameters.client_nonce = Some(client_nonce);
        dh_parameters.other_public_key = Some(
            decode_dh_public_key(&client_public_value.key_value)
                .map_err(|_| KdcError::PreAuthFailed("invalid client DH public value"))?,
        );
        let reply_key = dh_parameters
            .derive_key(&AES256)
            .map_err(|_| KdcError::PreAuthFailed("DH key agreement failed"))?;

        let dh_key_info = KdcDhKeyInfo {
            subject_public_key: ExplicitContextTag0::from(
                encode_dh_public_key(dh_parameters.public_key())
                    .map_err(|_| KdcError::PreAuthFailed("cannot encode the KDC DH public value"))?,
            ),
            nonce: ExplicitContextTag1::from(pk_authenticator.nonce.0.clone()),
            dh_key_expiration: Optional::from(None),
        };
        let dh_signed_data = sign_content(
            &signer.certificate,
            &signer.private_key,
            pkinit_dh_key_data_oid(),
            picky_asn1_der::to_vec(&dh_key_info)?,
        )
        .map_err(|_| KdcError::PreAuthFailed("cannot sign KDCDHKeyInfo"))?;

        let server_nonce = dh_parameters.server_nonce.unwrap_or_default();
        let pa_pk_as_rep = PaPkAsRep::DhInfo(ExplicitContextTag0::from(DhRepInfo {
            dh_signed_data: ImplicitContextTag0::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&dh_signed_data)?)),
            server_dh_nonce: Optional::from(Some(ExplicitContextTag1::from(OctetStringAsn1::from(
                server_nonce.to_vec(),
            )))),
        }));

        let service = principal_key(sname);
        let ticket_key = self
            .services
            .lock()
            .unwrap()
            .get(&service)
            .cloned()
            .ok_or_else(|| KdcError::ServerPrincipalUnknown(service.clone()))?;

        let realm = req_body.realm.0.clone();
        let issued = self.make_ticket(
            &realm,
            cname,
            sname,
            &ticket_key,
            TicketFlags::INITIAL | TicketFlags::PRE_AUTHENT,
        )?;
        let enc_part = self.make_rep_enc_part::<ENC_AS_REP_PART_TYPE>(
            &realm,
            &issued,
            req_body.nonce.0.0.clone(),
            sname,
            &reply_key,
            AS_REP_ENC,
        )?;

        Ok(AsRep::from(KdcRep {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AS_REP_MSG_TYPE])),
            padata: Optional::from(Some(ExplicitContextTag2::from(Asn1SequenceOf::from(vec![PaData {
                padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_PK_AS_REP.to_vec())),
                padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&pa_pk_as_rep)?)),
            }])))),
            crealm: ExplicitContextTag3::from(realm),
            cname: ExplicitContextTag4::from(cname.clone()),
            ticket: ExplicitContextTag5::from(issued.ticket.clone()),
            enc_part: ExplicitContextTag6::from(enc_part),
        }))
    }

    /// [The Ticket-Granting Service (TGS) Exchange](https://www.rfc-editor.org/rfc/rfc4120#section-3.3).
    fn tgs_exchange(&self, tgs_req: &TgsReq) -> Result<TgsRep, KdcError> {
        let req_body = &tgs_req.0.req_body.0;
        let sname = &req_body
            .sname
            .0
            .as_ref()
            .ok_or_else(|| KdcError::ServerPrincipalUnknown("sname is missing".to_owned()))?
            .0;

        let pa_datas = &tgs_req
            .0
            .padata
            .0
            .as_ref()
            .ok_or(KdcError::PreAuthRequired("TGS_REQ PA-DATA is missing"))?
            .0
            .0;
        let ap_req: ApReq = picky_asn1_der::from_bytes(
            &pa_datas
                .iter()
                .find(|pa_data| pa_data.padata_type.0.0 == PA_TGS_REQ_TYPE)
                .ok_or(KdcError::PreAuthRequired("missing PA-TGS-REQ"))?
                .padata_data
                .0
                .0,
        )?;

        let tgt: EncTicketPart = picky_asn1_der::from_bytes(
            &AES256
                .cipher()
                .decrypt(&self.krbtgt_key, TICKET_REP, &ap_req.0.ticket.0.0.enc_part.0.cipher.0.0)
                .map_err(|_| KdcError::Modified("TGT"))?,
        )?;
        let tgt_session_key = &tgt.0.key.0.key_value.0.0;
        let tgt_flags = TicketFlags::from_bits_truncate(kerberos_flags_to_u32(&tgt.0.flags.0));

        let authenticator: Authenticator = picky_asn1_der::from_bytes(
            &AES256
                .cipher()
                .decrypt(
                    tgt_session_key,
                    TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR,
                    &ap_req.0.authenticator.0.cipher.0.0,
                )
                .map_err(|_| KdcError::Modified("PA-TGS-REQ authenticator"))?,
        )?;
        let (reply_key, reply_key_usage) = match authenticator.0.subkey.0.as_ref() {
            Some(subkey) => (subkey.0.key_value.0.0.clone(), TGS_REP_ENC_SUB_KEY),
            None => (tgt_session_key.clone(), TGS_REP_ENC_SESSION_KEY),
        };

        let service = principal_key(sname);
        let ticket_key = if service == format!("{}/{}", TGT_SERVICE_NAME, self.realm) {
            self.krbtgt()
        } else {
            self.services
                .lock()
                .unwrap()
                .get(&service)
                .cloned()
                .ok_or_else(|| KdcError::ServerPrincipalUnknown(service.clone()))?
        };

        let requested = KdcOptions::from_bits_truncate(kerberos_flags_to_u32(&req_body.kdc_options.0));
        let mut flags = TicketFlags::empty();
        if tgt_flags.contains(TicketFlags::FORWARDABLE) {
            flags |= TicketFlags::FORWARDABLE;
        }
        if requested.contains(KdcOptions::FORWARDED) {
            if !tgt_flags.contains(TicketFlags::FORWARDABLE) {
                return Err(KdcError::BadOption("TGT is not forwardable"));
            }
            flags |= TicketFlags::FORWARDED;
        }
        if self.ok_as_delegate.lock().unwrap().contains(&service) {
            flags |= TicketFlags::OK_AS_DELEGATE;
        }

        let cname = tgt.0.cname.0.clone();
        let realm = self.realm_asn1();
        let issued = self.make_ticket(&realm, &cname, sname, &ticket_key, flags)?;
        let enc_part = self.make_rep_enc_part::<ENC_TGS_REP_PART_TYPE>(
            &realm,
            &issued,
            req_body.nonce.0.0.clone(),
            sname,
            &reply_key,
            reply_key_usage,
        )?;

        Ok(TgsRep::from(KdcRep {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![TGS_REP_MSG_TYPE])),
            padata: Optional::from(None),
            crealm: ExplicitContextTag3::from(self.realm_asn1()),
            cname: ExplicitContextTag4::from(cname),
            ticket: ExplicitContextTag5::from(issued.ticket.clone()),
            enc_part: ExplicitContextTag6::from(enc_part),
        }))
    }

    fn krb_error(&self, err: &KdcError, req_body: &KdcReqBody) -> KrbError {
        let current_date = now();
        let microseconds = current_date.microsecond().min(999_999);

        let sname = req_body.sname.0.as_ref().map(|sname| sname.0.clone()).unwrap_or_else(|| PrincipalName {
            name_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![2])),
            name_string: ExplicitContextTag1::from(Asn1SequenceOf::from(vec![
                kerberos_string(TGT_SERVICE_NAME),
                kerberos_string(&self.realm),
            ])),
        });

        let salt = req_body
            .cname
            .0
            .as_ref()
            .and_then(|cname| self.users.get(&principal_key(&cname.0)))
            .map(|creds| creds.salt.clone());
        let e_data = match (err, salt) {
            (KdcError::PreAuthRequired(_), Some(salt)) => Some(ExplicitContextTag12::from(OctetStringAsn1::from(
                picky_asn1_der::to_vec(&Asn1SequenceOf::from(vec![
                    PaData {
                        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ETYPE_INFO2_TYPE.to_vec())),
                        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(
                            picky_asn1_der::to_vec(&Asn1SequenceOf::from(vec![EtypeInfo2Entry {
                                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(AES256)])),
                                salt: Optional::from(Some(ExplicitContextTag1::from(kerberos_string(&salt)))),
                                s2kparams: Optional::from(None),
                            }]))
                            .unwrap(),
                        )),
                    },
                    PaData {
                        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ENC_TIMESTAMP.to_vec())),
                        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(Vec::new())),
                    },
                ]))
                .unwrap(),
            ))),
            _ => None,
        };

        KrbError::from(KrbErrorInner {
            pvno: ExplicitContextTag0::from(IntegerAsn1(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_ERROR_MSG_TYPE])),
            ctime: Optional::from(None),
            cusec: Optional::from(None),
            stime: ExplicitContextTag4::from(kerberos_time(current_date)),
            susec: ExplicitContextTag5::from(Microseconds::from(microseconds.to_be_bytes().to_vec())),
            error_code: ExplicitContextTag6::from(err.error_code()),
            crealm: Optional::from(None),
            cname: Optional::from(None),
            realm: ExplicitContextTag9::from(self.realm_asn1()),
            sname: ExplicitContextTag10::from(sname),
            e_text: Optional::from(Some(ExplicitContextTag11::from(kerberos_string(&err.to_string())))),
            e_data: Optional::from(e_data),
        })
    }
}
