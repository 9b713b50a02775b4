use byteorder::{LittleEndian, ReadBytesExt};

use crate::{Error, ErrorKind, Result};

// size of SEC_CHANNEL_BINDINGS structure
const SEC_CHANNEL_BINDINGS_SIZE: usize = 32;

/// GSS-API address families ([RFC 2744, section 3.11](https://www.rfc-editor.org/rfc/rfc2744#section-3.11)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unspecified,
    Local,
    Inet,
    NetBios,
    Inet6,
    NullAddress,
}

impl AddressFamily {
    pub const GSS_C_AF_UNSPEC: u32 = 0;
    pub const GSS_C_AF_LOCAL: u32 = 1;
    pub const GSS_C_AF_INET: u32 = 2;
    pub const GSS_C_AF_NETBIOS: u32 = 20;
    pub const GSS_C_AF_INET6: u32 = 24;
    pub const GSS_C_AF_NULLADDR: u32 = 255;

    pub fn from_gss(addr_type: u32) -> Option<Self> {
        match addr_type {
            Self::GSS_C_AF_UNSPEC => Some(Self::Unspecified),
            Self::GSS_C_AF_LOCAL => Some(Self::Local),
            Self::GSS_C_AF_INET => Some(Self::Inet),
            Self::GSS_C_AF_NETBIOS => Some(Self::NetBios),
            Self::GSS_C_AF_INET6 => Some(Self::Inet6),
            Self::GSS_C_AF_NULLADDR => Some(Self::NullAddress),
            _ => None,
        }
    }

    /// Kerberos `HostAddress` type ([RFC 4120, section 7.5.3](https://www.rfc-editor.org/rfc/rfc4120#section-7.5.3)).
    pub fn kerberos_addr_type(self) -> Option<u8> {
        match self {
            Self::Inet => Some(2),
            Self::NetBios => Some(20),
            Self::Inet6 => Some(24),
            _ => None,
        }
    }
}

/// Network address taken from the channel bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub family: AddressFamily,
    pub address: Vec<u8>,
}

/// GSS-API channel bindings.
///
/// Also constructible from a [SEC_CHANNEL_BINDINGS](https://docs.microsoft.com/en-us/windows/win32/api/sspi/ns-sspi-sec_channel_bindings)
/// buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelBindings {
    pub initiator_addr_type: u32,
    pub initiator: Vec<u8>,
    pub acceptor_addr_type: u32,
    pub acceptor: Vec<u8>,
    pub application_data: Vec<u8>,
}

impl ChannelBindings {
    /// Bindings that carry only application data (e.g. TLS `tls-server-end-point`).
    pub fn from_application_data(application_data: impl Into<Vec<u8>>) -> Self {
        Self {
            application_data: application_data.into(),
            ..Default::default()
        }
    }

    pub fn from_bytes<T: AsRef<[u8]>>(data: T) -> Result<Self> {
        let data = data.as_ref();

        if data.len() < SEC_CHANNEL_BINDINGS_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!(
                    "Invalid SEC_CHANNEL_BINDINGS buffer: buffer is too short: {}. Minimum len: {}",
                    data.len(),
                    SEC_CHANNEL_BINDINGS_SIZE,
                ),
            ));
        }

        let mut header = &data[0..SEC_CHANNEL_BINDINGS_SIZE];

        let initiator_addr_type = header.read_u32::<LittleEndian>()?;
        let initiator = read_field(data, &mut header, "initiator")?;

        let acceptor_addr_type = header.read_u32::<LittleEndian>()?;
        let acceptor = read_field(data, &mut header, "acceptor")?;

        let application_data = read_field(data, &mut header, "application")?;

        Ok(Self {
            initiator_addr_type,
            initiator,
            acceptor_addr_type,
            acceptor,
            application_data,
        })
    }

    /// Validates the initiator and acceptor address fields.
    pub fn addresses(&self) -> Result<(Option<HostAddress>, Option<HostAddress>)> {
        Ok((
            parse_address(self.initiator_addr_type, &self.initiator)?,
            parse_address(self.acceptor_addr_type, &self.acceptor)?,
        ))
    }
}

fn read_field(data: &[u8], header: &mut &[u8], name: &str) -> Result<Vec<u8>> {
    let len = header.read_u32::<LittleEndian>()? as usize;
    let offset = header.read_u32::<LittleEndian>()? as usize;

    let end = offset.checked_add(len).unwrap_or(usize::MAX);
    if end > data.len() {
        return Err(Error::new(
            ErrorKind::InvalidParameter,
            format!(
                "Invalid SEC_CHANNEL_BINDINGS buffer: {} offset + len ({}) goes outside the buffer ({})",
                name,
                end,
                data.len()
            ),
        ));
    }

    Ok(data[offset..end].to_vec())
}

fn parse_address(addr_type: u32, address: &[u8]) -> Result<Option<HostAddress>> {
    let family = AddressFamily::from_gss(addr_type)
        .ok_or_else(|| Error::new(ErrorKind::BadBindings, format!("unknown address type: {}", addr_type)))?;

    let expected_len = match family {
        AddressFamily::Inet => Some(4),
        AddressFamily::Inet6 => Some(16),
        AddressFamily::NullAddress => Some(0),
        _ => None,
    };

    if let Some(expected_len) = expected_len {
        if address.len() != expected_len {
            return Err(Error::new(
                ErrorKind::BadBindings,
                format!(
                    "invalid {:?} address length: expected {} but got {}",
                    family,
                    expected_len,
                    address.len()
                ),
            ));
        }
    }

    if address.is_empty() {
        return Ok(None);
    }

    Ok(Some(HostAddress {
        family,
        address: address.to_vec(),
    }))
}
