use std::fmt;

use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, IntegerAsn1};
use picky_krb::constants::types::{NT_ENTERPRISE, NT_PRINCIPAL, NT_SRV_INST};
use picky_krb::data_types::{KerberosStringAsn1, PrincipalName, Realm};

use crate::{Error, ErrorKind, Result};

/// `NT-UNKNOWN` name type.
pub const NT_UNKNOWN: u8 = 0;
/// `NT-SRV-HST` name type: service and host name.
pub const NT_SRV_HST: u8 = 3;
/// `NT-X500-PRINCIPAL` name type: the name is an encoded X.509 distinguished name.
pub const NT_X500_PRINCIPAL: u8 = 6;
/// `NT-WELLKNOWN` name type.
pub const NT_WELLKNOWN: u8 = 11;

/// Kerberos principal: name type, name components and realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub name_type: u8,
    pub components: Vec<String>,
    pub realm: String,
}

impl Principal {
    pub fn new(name_type: u8, components: Vec<String>, realm: impl Into<String>) -> Self {
        Self {
            name_type,
            components,
            realm: realm.into(),
        }
    }

    /// Parses `comp1/comp2@REALM`. The realm falls back to `default_realm` when absent.
    ///
    /// `\` escapes the next character, so `a\/b@R` is a single component.
    pub fn parse(name: &str, default_realm: Option<&str>) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::BadName, "empty principal name"));
        }

        let mut components = Vec::new();
        let mut realm = None;
        let mut current = String::new();
        let mut chars = name.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let escaped = chars
                        .next()
                        .ok_or_else(|| Error::new(ErrorKind::BadName, "dangling escape in principal name"))?;
                    current.push(escaped);
                }
                '/' if realm.is_none() => components.push(std::mem::take(&mut current)),
                '@' if realm.is_none() => {
                    components.push(std::mem::take(&mut current));
                    realm = Some(String::new());
                }
                '@' | '/' => {
                    return Err(Error::new(
                        ErrorKind::BadName,
                        format!("unexpected `{}` in principal realm: {}", c, name),
                    ))
                }
                c => {
                    if let Some(realm) = realm.as_mut() {
                        realm.push(c);
                    } else {
                        current.push(c);
                    }
                }
            }
        }

        if realm.is_none() {
            components.push(current);
        }

        if components.iter().any(|c| c.is_empty()) {
            return Err(Error::new(
                ErrorKind::BadName,
                format!("empty principal component: {}", name),
            ));
        }

        let realm = match realm {
            Some(realm) if !realm.is_empty() => realm,
            Some(_) => return Err(Error::new(ErrorKind::BadName, format!("empty realm: {}", name))),
            None => default_realm
                .map(str::to_owned)
                .ok_or_else(|| Error::new(ErrorKind::BadName, format!("no realm for principal: {}", name)))?,
        };

        let name_type = if components.len() > 1 { NT_SRV_INST } else { NT_PRINCIPAL };

        Ok(Self {
            name_type,
            components,
            realm,
        })
    }

    /// Enterprise name (`user@upn.suffix` as a single component).
    pub fn enterprise(upn: &str, realm: impl Into<String>) -> Self {
        Self::new(NT_ENTERPRISE, vec![upn.to_owned()], realm)
    }

    /// `krbtgt/REALM@REALM`.
    pub fn tgs(realm: &str) -> Self {
        Self::new(
            NT_SRV_INST,
            vec![crate::kerberos::TGT_SERVICE_NAME.to_owned(), realm.to_owned()],
            realm,
        )
    }

    pub fn is_tgs(&self) -> bool {
        self.components.len() == 2 && self.components[0] == crate::kerberos::TGT_SERVICE_NAME
    }

    pub fn is_host_based(&self) -> bool {
        self.name_type == NT_SRV_HST || (self.name_type == NT_SRV_INST && self.components.len() == 2)
    }

    /// The name without the realm.
    pub fn name(&self) -> String {
        self.components
            .iter()
            .map(|c| escape(c))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Compares names ignoring the name type, like `krb5_principal_compare`.
    pub fn same_name(&self, other: &Principal) -> bool {
        self.realm == other.realm && self.components == other.components
    }

    pub fn to_principal_name(&self) -> Result<PrincipalName> {
        let mut name_string = Vec::with_capacity(self.components.len());
        for component in &self.components {
            name_string.push(KerberosStringAsn1::from(IA5String::from_string(component.clone())?));
        }

        Ok(PrincipalName {
            name_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![self.name_type])),
            name_string: ExplicitContextTag1::from(Asn1SequenceOf::from(name_string)),
        })
    }

    pub fn to_realm(&self) -> Result<Realm> {
        Ok(Realm::from(IA5String::from_string(self.realm.clone())?))
    }

    pub fn from_principal_name(name: &PrincipalName, realm: &Realm) -> Result<Self> {
        let name_type = name.name_type.0.0.last().copied().unwrap_or(NT_UNKNOWN);

        let components = name
            .name_string
            .0
            .0
            .iter()
            .map(|component| component.0.as_utf8().to_owned())
            .collect::<Vec<_>>();

        if components.is_empty() {
            return Err(Error::new(ErrorKind::BadName, "principal name without components"));
        }

        Ok(Self {
            name_type,
            components,
            realm: realm.0.as_utf8().to_owned(),
        })
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name(), escape(&self.realm))
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '/' | '@' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

/// Splits a GSS host-based service name (`service@host`, or just `service`).
///
/// [RFC 2743, section 4.1](https://www.rfc-editor.org/rfc/rfc2743#section-4.1)
pub fn parse_host_based_service(name: &str) -> Result<(String, Option<String>)> {
    let (service, host) = match name.split_once('@') {
        Some((service, host)) => (service, Some(host)),
        None => (name, None),
    };

    if service.is_empty() || host.map(str::is_empty).unwrap_or(false) {
        return Err(Error::new(
            ErrorKind::BadName,
            format!("invalid host-based service name: {}", name),
        ));
    }

    // `HTTP/host` is accepted in place of `HTTP@host`.
    if host.is_none() {
        if let Some((service, host)) = service.split_once('/') {
            if !service.is_empty() && !host.is_empty() {
                return Ok((service.to_owned(), Some(host.to_ascii_lowercase())));
            }
        }
    }

    Ok((service.to_owned(), host.map(|host| host.to_ascii_lowercase())))
}
