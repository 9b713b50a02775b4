//! PKINIT ([RFC 4556](https://www.rfc-editor.org/rfc/rfc4556.html)) pieces used by PKU2U: Diffie-Hellman key
//! agreement, the signed `AuthPack` and the KDC `KDCDHKeyInfo`.

use num_bigint_dig::BigUint;
use oid::ObjectIdentifier;
use picky::hash::HashAlgorithm;
use picky::key::{PrivateKey, PublicKey as RsaPublicKey};
use picky::signature::SignatureAlgorithm;
use picky_asn1::bit_string::BitString;
use picky_asn1::wrapper::{
    Asn1SequenceOf, Asn1SetOf, BitStringAsn1, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2,
    ExplicitContextTag3, ImplicitContextTag0, IntegerAsn1, ObjectIdentifierAsn1, OctetStringAsn1, Optional,
    Utf8StringAsn1,
};
use picky_asn1_der::Asn1RawDer;
use picky_asn1_x509::cmsversion::CmsVersion;
use picky_asn1_x509::content_info::{ContentValue, EncapsulatedContentInfo};
use picky_asn1_x509::signed_data::{
    CertificateChoices, CertificateSet, DigestAlgorithmIdentifiers, SignedData, SignersInfos,
};
use picky_asn1_x509::signer_info::{
    Attributes, CertificateSerialNumber, DigestAlgorithmIdentifier, IssuerAndSerialNumber, SignatureAlgorithmIdentifier,
    SignatureValue, SignerIdentifier, SignerInfo, UnsignedAttributes,
};
use picky_asn1_x509::{
    oids, AlgorithmIdentifier, Attribute, AttributeTypeAndValueParameters, AttributeValues, Certificate,
    ExtensionView, GeneralName, PublicKey, ShaVariant,
};
use picky_krb::constants::types::{PA_PK_AS_REP, PA_PK_AS_REQ};
use picky_krb::crypto::diffie_hellman::{compute_public_key, generate_key, generate_private_key, DhNonce};
use picky_krb::crypto::CipherSuite;
use picky_krb::data_types::PaData;
use picky_krb::messages::{KdcRep, KdcReqBody};
use picky_krb::pkinit::{
    AuthPack, DhDomainParameters, DhRepInfo, DhReqInfo, DhReqKeyInfo, KdcDhKeyInfo, PaPkAsRep, PaPkAsReq,
    PkAuthenticator,
};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::Duration;

use crate::crypto::compute_sha1;
use crate::kerberos::utils::kerberos_time_now;
use crate::principal::{Principal, NT_X500_PRINCIPAL};
use crate::{Error, ErrorKind, Result, Secret};

/// [Generation of Client Request](https://www.rfc-editor.org/rfc/rfc4556.html#section-3.2.1)
/// 9. This nonce string MUST be as long as the longest key length of the symmetric key types that the client supports.
/// Key length of Aes256 is equal to 32
pub const DH_NONCE_LEN: usize = 32;

/// [The PKU2U Realm Name](https://datatracker.ietf.org/doc/html/draft-zhu-pku2u-09#section-3)
pub const WELLKNOWN_PKU2U_REALM: &str = "WELLKNOWN:PKU2U";

lazy_static! {
    static ref PKINIT_DH_KEY_DATA: ObjectIdentifier =
        ObjectIdentifier::try_from(picky_asn1_x509::oids::PKINIT_DH_KEY_DATA).expect("PKINIT DH key data OID is valid");
}

/// Oakley group 2 (`p`, `g`, `q`).
///
/// [RFC 2412, appendix E.2](https://www.rfc-editor.org/rfc/rfc2412#appendix-E.2)
pub fn default_dh_group() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    (
        vec![
            0, 255, 255, 255, 255, 255, 255, 255, 255, 201, 15, 218, 162, 33, 104, 194, 52, 196, 198, 98, 139, 128,
            220, 28, 209, 41, 2, 78, 8, 138, 103, 204, 116, 2, 11, 190, 166, 59, 19, 155, 34, 81, 74, 8, 121, 142, 52,
            4, 221, 239, 149, 25, 179, 205, 58, 67, 27, 48, 43, 10, 109, 242, 95, 20, 55, 79, 225, 53, 109, 109, 81,
            194, 69, 228, 133, 181, 118, 98, 94, 126, 198, 244, 76, 66, 233, 166, 55, 237, 107, 11, 255, 92, 182, 244,
            6, 183, 237, 238, 56, 107, 251, 90, 137, 159, 165, 174, 159, 36, 17, 124, 75, 31, 230, 73, 40, 102, 81,
            236, 230, 83, 129, 255, 255, 255, 255, 255, 255, 255, 255,
        ],
        vec![2],
        vec![
            127, 255, 255, 255, 255, 255, 255, 255, 228, 135, 237, 81, 16, 180, 97, 26, 98, 99, 49, 69, 192, 110, 14,
            104, 148, 129, 39, 4, 69, 51, 230, 58, 1, 5, 223, 83, 29, 137, 205, 145, 40, 165, 4, 60, 199, 26, 2, 110,
            247, 202, 140, 217, 230, 157, 33, 141, 152, 21, 133, 54, 249, 47, 138, 27, 167, 240, 154, 182, 182, 168,
            225, 34, 242, 66, 218, 187, 49, 47, 63, 99, 122, 38, 33, 116, 211, 27, 246, 181, 133, 255, 174, 91, 122, 3,
            91, 246, 247, 28, 53, 253, 173, 68, 207, 210, 215, 79, 146, 8, 190, 37, 143, 243, 36, 148, 51, 40, 246,
            115, 41, 192, 255, 255, 255, 255, 255, 255, 255, 255,
        ],
    )
}

#[derive(Debug, Clone)]
pub struct DhParameters {
    // g
    pub base: Vec<u8>,
    // p
    pub modulus: Vec<u8>,
    pub q: Vec<u8>,
    pub private_key: Secret<Vec<u8>>,
    pub other_public_key: Option<Vec<u8>>,
    pub client_nonce: Option<[u8; DH_NONCE_LEN]>,
    pub server_nonce: Option<[u8; DH_NONCE_LEN]>,
}

impl DhParameters {
    /// Fresh private key in the default group and a random client nonce.
    pub fn generate_client() -> Self {
        let (modulus, base, q) = default_dh_group();
        let mut rng = OsRng;

        let private_key = Secret::new(generate_private_key(&q, &mut rng));

        Self {
            base,
            modulus,
            q,
            private_key,
            other_public_key: None,
            client_nonce: Some(rng.gen::<[u8; DH_NONCE_LEN]>()),
            server_nonce: None,
        }
    }

    /// Fresh private key in the group chosen by the client, with a random server nonce.
    pub fn generate_server(base: Vec<u8>, modulus: Vec<u8>, q: Vec<u8>) -> Self {
        let mut rng = OsRng;
        let private_key = Secret::new(generate_private_key(&q, &mut rng));

        Self {
            base,
            modulus,
            q,
            private_key,
            other_public_key: None,
            client_nonce: None,
            server_nonce: Some(rng.gen::<[u8; DH_NONCE_LEN]>()),
        }
    }

    pub fn public_key(&self) -> Vec<u8> {
        compute_public_key(self.private_key.as_ref(), &self.modulus, &self.base)
    }

    /// Reply key from the shared secret and both nonces.
    ///
    /// [RFC 4556, section 3.2.3.1](https://www.rfc-editor.org/rfc/rfc4556.html#section-3.2.3.1)
    pub fn derive_key(&self, cipher_suite: &CipherSuite) -> Result<Vec<u8>> {
        let other_public_key = self
            .other_public_key
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Failure, "the peer DH public key is not set"))?;
        let client_nonce = self
            .client_nonce
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Failure, "the DH client nonce is not set"))?;
        let server_nonce = self
            .server_nonce
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Failure, "the DH server nonce is not set"))?;

        Ok(generate_key(
            other_public_key,
            self.private_key.as_ref(),
            &self.modulus,
            Some(DhNonce {
                client_nonce,
                server_nonce,
            }),
            cipher_suite.cipher().as_ref(),
        )?)
    }
}

/// CMS `ContentInfo` carrying signed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentInfoWrapper<T> {
    pub content_type: ObjectIdentifierAsn1,
    pub content: ExplicitContextTag0<T>,
}

/// Signs `content` with the certificate key: SHA-1 digest, RSA PKCS#1 v1.5 signature over the signed attributes.
#[instrument(level = "trace", skip_all)]
pub fn sign_content(
    certificate: &Certificate,
    private_key: &PrivateKey,
    content_type: ObjectIdentifier,
    content: Vec<u8>,
) -> Result<ContentInfoWrapper<SignedData>> {
    let digest = compute_sha1(&content).to_vec();

    let signed_data = SignedData {
        version: CmsVersion::V3,
        digest_algorithms: DigestAlgorithmIdentifiers(Asn1SetOf::from(vec![AlgorithmIdentifier::new_sha1()])),
        content_info: EncapsulatedContentInfo::new(content_type.clone(), Some(content)),
        certificates: Optional::from(CertificateSet(vec![CertificateChoices::Certificate(Asn1RawDer(
            picky_asn1_der::to_vec(certificate)?,
        ))])),
        crls: None,
        signers_infos: SignersInfos(Asn1SetOf::from(vec![generate_signer_info(
            certificate,
            content_type,
            digest,
            private_key,
        )?])),
    };

    Ok(ContentInfoWrapper {
        content_type: ObjectIdentifierAsn1::from(oids::signed_data()),
        content: ExplicitContextTag0::from(signed_data),
    })
}

fn generate_signer_info(
    certificate: &Certificate,
    content_type: ObjectIdentifier,
    digest: Vec<u8>,
    private_key: &PrivateKey,
) -> Result<SignerInfo> {
    let signed_attributes = Asn1SetOf::from(vec![
        Attribute {
            ty: ObjectIdentifierAsn1::from(oids::content_type()),
            value: AttributeValues::ContentType(Asn1SetOf::from(vec![ObjectIdentifierAsn1::from(content_type)])),
        },
        Attribute {
            ty: ObjectIdentifierAsn1::from(oids::message_digest()),
            value: AttributeValues::MessageDigest(Asn1SetOf::from(vec![OctetStringAsn1::from(digest)])),
        },
    ]);

    let encoded_signed_attributes = picky_asn1_der::to_vec(&signed_attributes)?;

    let signature = SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA1).sign(&encoded_signed_attributes, private_key)?;

    Ok(SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: certificate.tbs_certificate.issuer.clone(),
            serial_number: CertificateSerialNumber(certificate.tbs_certificate.serial_number.clone()),
        }),
        digest_algorithm: DigestAlgorithmIdentifier(AlgorithmIdentifier::new_sha(ShaVariant::SHA1)),
        signed_attrs: Optional::from(Attributes(Asn1SequenceOf::from(signed_attributes.0))),
        signature_algorithm: SignatureAlgorithmIdentifier(AlgorithmIdentifier::new_rsa_encryption()),
        signature: SignatureValue(OctetStringAsn1::from(signature)),
        unsigned_attrs: Optional::from(UnsignedAttributes(Vec::new())),
    })
}

/// RSA public key of the first certificate in the signed data.
fn signer_public_key(signed_data: &SignedData) -> Result<RsaPublicKey> {
    let certificate = match signed_data.certificates.0.0.first() {
        Some(CertificateChoices::Certificate(certificate)) => {
            picky_asn1_der::from_bytes::<Certificate>(&certificate.0)?
        }
        Some(_) => {
            return Err(Error::new(
                ErrorKind::BadSignature,
                "signed data carries an unsupported certificate format",
            ))
        }
        None => return Err(Error::new(ErrorKind::BadSignature, "signed data carries no certificate")),
    };

    let PublicKey::Rsa(rsa) = certificate.tbs_certificate.subject_public_key_info.subject_public_key else {
        return Err(Error::new(
            ErrorKind::BadSignature,
            "only RSA certificates are supported for PKINIT",
        ));
    };

    Ok(RsaPublicKey::from_rsa_components(
        &BigUint::from_bytes_be(&rsa.0.modulus.0),
        &BigUint::from_bytes_be(&rsa.0.public_exponent.0),
    ))
}

/// Checks the signature and digest of signed data and returns the encapsulated content.
#[instrument(level = "trace", skip_all, fields(content_type = ?expected_content_type))]
pub fn verify_signed_content(signed_data: &SignedData, expected_content_type: &ObjectIdentifier) -> Result<Vec<u8>> {
    if &signed_data.content_info.content_type.0 != expected_content_type {
        return Err(Error::new(
            ErrorKind::DefectiveToken,
            format!(
                "invalid content info identifier: {:?}, expected: {:?}",
                signed_data.content_info.content_type.0, expected_content_type
            ),
        ));
    }

    let content = match signed_data
        .content_info
        .content
        .as_ref()
        .map(|content| &content.0)
    {
        Some(ContentValue::OctetString(data)) => data.0.clone(),
        Some(content_value) => {
            error!(?content_value, "only octet string content is supported");

            return Err(Error::new(ErrorKind::DefectiveToken, "unexpected signed content"));
        }
        None => return Err(Error::new(ErrorKind::DefectiveToken, "signed data has no content")),
    };

    let signer_info = signed_data
        .signers_infos
        .0
        .0
        .first()
        .ok_or_else(|| Error::new(ErrorKind::BadSignature, "missing signer info in signed data"))?;

    let digest = signer_info
        .signed_attrs
        .0
        .0
        .0
        .iter()
        .find_map(|attribute| match &attribute.value {
            AttributeValues::MessageDigest(digest) => digest.0.first().map(|digest| digest.0.clone()),
            _ => None,
        })
        .ok_or_else(|| Error::new(ErrorKind::BadSignature, "missing message digest attribute"))?;

    if digest != compute_sha1(&content) {
        return Err(Error::new(ErrorKind::BadSignature, "signed content digest mismatch"));
    }

    let signed_attributes = Asn1SetOf::from(signer_info.signed_attrs.0.0.0.clone());
    let encoded_signed_attributes = picky_asn1_der::to_vec(&signed_attributes)?;

    SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA1)
        .verify(
            &signer_public_key(signed_data)?,
            &encoded_signed_attributes,
            &signer_info.signature.0.0,
        )
        .map_err(|err| Error::new(ErrorKind::BadSignature, format!("invalid signed data signature: {:?}", err)))?;

    Ok(content)
}

/// Parameters for generating `PA-PK-AS-REQ`.
#[derive(Debug)]
pub struct PaPkAsReqOptions<'a> {
    pub certificate: &'a Certificate,
    pub private_key: &'a PrivateKey,
    pub kdc_req_body: &'a KdcReqBody,
    pub dh_parameters: &'a DhParameters,
    pub time_offset: Duration,
}

/// [Generation of Client Request](https://www.rfc-editor.org/rfc/rfc4556.html#section-3.2.1)
#[instrument(level = "trace", skip_all)]
pub fn generate_pa_pk_as_req(options: &PaPkAsReqOptions<'_>) -> Result<PaData> {
    let PaPkAsReqOptions {
        certificate,
        private_key,
        kdc_req_body,
        dh_parameters,
        time_offset,
    } = options;

    let (_, ctime, cusec) = kerberos_time_now(*time_offset);

    // paChecksum: SHA-1 over the encoded KDC-REQ-BODY
    let pa_checksum = compute_sha1(&picky_asn1_der::to_vec(kdc_req_body)?).to_vec();

    let auth_pack = AuthPack {
        pk_authenticator: ExplicitContextTag0::from(PkAuthenticator {
            cusec: ExplicitContextTag0::from(cusec),
            ctime: ExplicitContextTag1::from(ctime),
            nonce: ExplicitContextTag2::from(IntegerAsn1::from(kdc_req_body.nonce.0.0.clone())),
            pa_checksum: Optional::from(Some(ExplicitContextTag3::from(OctetStringAsn1::from(pa_checksum)))),
        }),
        client_public_value: Optional::from(Some(ExplicitContextTag1::from(DhReqInfo {
            key_info: DhReqKeyInfo {
                identifier: ObjectIdentifierAsn1::from(oids::diffie_hellman()),
                key_info: DhDomainParameters {
                    p: IntegerAsn1::from(dh_parameters.modulus.clone()),
                    g: IntegerAsn1::from(dh_parameters.base.clone()),
                    q: IntegerAsn1::from(dh_parameters.q.clone()),
                    j: Optional::from(None),
                    validation_params: Optional::from(None),
                },
            },
            key_value: BitStringAsn1::from(BitString::with_bytes(picky_asn1_der::to_vec(
                &IntegerAsn1::from_bytes_be_unsigned(dh_parameters.public_key()),
            )?)),
        }))),
        supported_cms_types: Optional::from(Some(ExplicitContextTag2::from(Asn1SequenceOf::from(Vec::new())))),
        client_dh_nonce: Optional::from(
            dh_parameters
                .client_nonce
                .as_ref()
                .map(|nonce| ExplicitContextTag3::from(OctetStringAsn1::from(nonce.to_vec()))),
        ),
    };

    let signed_auth_pack = sign_content(
        certificate,
        private_key,
        oids::pkinit_auth_data(),
        picky_asn1_der::to_vec(&auth_pack)?,
    )?;

    let pa_pk_as_req = PaPkAsReq {
        signed_auth_pack: ImplicitContextTag0::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&signed_auth_pack)?)),
        trusted_certifiers: Optional::from(None),
        kdc_pk_id: Optional::from(None),
    };

    Ok(PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_PK_AS_REQ.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&pa_pk_as_req)?)),
    })
}

/// Verifies the signed `AuthPack` of a `PA-PK-AS-REQ` and decodes it.
pub fn extract_auth_pack(pa_pk_as_req: &PaData) -> Result<AuthPack> {
    let pa_pk_as_req: PaPkAsReq = picky_asn1_der::from_bytes(&pa_pk_as_req.padata_data.0.0)?;
    let signed_auth_pack: ContentInfoWrapper<SignedData> =
        picky_asn1_der::from_bytes(&pa_pk_as_req.signed_auth_pack.0.0)?;

    let auth_pack = verify_signed_content(&signed_auth_pack.content.0, &oids::pkinit_auth_data())?;

    Ok(picky_asn1_der::from_bytes(&auth_pack)?)
}

/// Reads an encoded DH public value (`INTEGER` inside a `BIT STRING`).
pub fn decode_dh_public_key(key_value: &BitStringAsn1) -> Result<Vec<u8>> {
    let key: IntegerAsn1 = picky_asn1_der::from_bytes(key_value.0.payload_view())?;

    Ok(key.as_unsigned_bytes_be().to_vec())
}

pub fn encode_dh_public_key(public_key: Vec<u8>) -> Result<BitStringAsn1> {
    Ok(BitStringAsn1::from(BitString::with_bytes(picky_asn1_der::to_vec(
        &IntegerAsn1::from_bytes_be_unsigned(public_key),
    )?)))
}

/// Finds the `PA-PK-AS-REP` of the AS-REP. Only the Diffie-Hellman variant is supported.
#[instrument(level = "trace", skip_all)]
pub fn extract_dh_rep_info(as_rep: &KdcRep) -> Result<DhRepInfo> {
    let pa_pk_as_rep = as_rep
        .padata
        .0
        .as_ref()
        .and_then(|pa_datas| {
            pa_datas
                .0
                .0
                .iter()
                .find(|pa_data| pa_data.padata_type.0.0 == PA_PK_AS_REP)
        })
        .ok_or_else(|| Error::new(ErrorKind::DefectiveToken, "PA-PK-AS-REP is not present in the AS-REP"))?;

    match picky_asn1_der::from_bytes::<PaPkAsRep>(&pa_pk_as_rep.padata_data.0.0)? {
        PaPkAsRep::DhInfo(dh_rep_info) => Ok(dh_rep_info.0),
        PaPkAsRep::EncKeyPack(_) => Err(Error::new(
            ErrorKind::DefectiveToken,
            "encKeyPack is not supported for the PA-PK-AS-REP",
        )),
    }
}

pub fn extract_server_nonce(dh_rep_info: &DhRepInfo) -> Result<[u8; DH_NONCE_LEN]> {
    let nonce = dh_rep_info
        .server_dh_nonce
        .0
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::DefectiveToken, "DH server nonce is not present"))?;

    nonce.0.0.as_slice().try_into().map_err(|_| {
        Error::new(
            ErrorKind::DefectiveToken,
            format!(
                "invalid server DH nonce length: {}, expected: {}",
                nonce.0.0.len(),
                DH_NONCE_LEN
            ),
        )
    })
}

/// Verifies the KDC signature over `KDCDHKeyInfo` and returns the KDC DH public value.
#[instrument(level = "trace", skip_all)]
pub fn extract_kdc_dh_public_key(dh_rep_info: &DhRepInfo) -> Result<Vec<u8>> {
    let signed_data: ContentInfoWrapper<SignedData> = picky_asn1_der::from_bytes(&dh_rep_info.dh_signed_data.0.0)?;

    let dh_key_info = verify_signed_content(&signed_data.content.0, &PKINIT_DH_KEY_DATA)?;
    let dh_key_info: KdcDhKeyInfo = picky_asn1_der::from_bytes(&dh_key_info)?;

    decode_dh_public_key(&dh_key_info.subject_public_key.0)
}

pub fn pkinit_dh_key_data_oid() -> ObjectIdentifier {
    PKINIT_DH_KEY_DATA.clone()
}

/// Client principal of a PKU2U certificate: the UPN of the subject alternative name, or the
/// subject common name as an X.500 name.
#[instrument(level = "trace", ret, skip_all)]
pub fn principal_from_certificate(certificate: &Certificate) -> Result<Principal> {
    if let Some(upn) = upn_from_alt_name(certificate)? {
        return Ok(Principal::enterprise(&upn, WELLKNOWN_PKU2U_REALM));
    }

    let common_name = certificate
        .tbs_certificate
        .subject
        .0
        .0
        .iter()
        .flat_map(|attributes| attributes.0.iter())
        .find_map(|attribute| match &attribute.value {
            AttributeTypeAndValueParameters::CommonName(name) => Some(name.to_utf8_lossy()),
            _ => None,
        })
        .ok_or_else(|| {
            Error::new(
                ErrorKind::NoCredentials,
                "the certificate has neither a UPN nor a subject common name",
            )
        })?;

    Ok(Principal::new(NT_X500_PRINCIPAL, vec![common_name.into_owned()], WELLKNOWN_PKU2U_REALM))
}

fn upn_from_alt_name(certificate: &Certificate) -> Result<Option<String>> {
    let Some(extension) = certificate
        .tbs_certificate
        .extensions
        .0
        .0
        .iter()
        .find(|extension| extension.extn_id().0 == oids::subject_alternative_name())
    else {
        return Ok(None);
    };

    let ExtensionView::SubjectAltName(alternate_name) = extension.extn_value() else {
        return Ok(None);
    };

    for name in alternate_name.0.iter() {
        if let GeneralName::OtherName(other_name) = name {
            if other_name.type_id.0 == oids::user_principal_name() {
                let upn: Utf8StringAsn1 = picky_asn1_der::from_bytes(&other_name.value.0.0)?;

                return Ok(Some(upn.to_string()));
            }
        }
    }

    Ok(None)
}
