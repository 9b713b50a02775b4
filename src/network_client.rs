use std::collections::HashMap;
use std::fmt::Debug;
use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::str::FromStr;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use url::Url;

use crate::krb::Krb5Conf;
use crate::{Error, ErrorKind, Result};

const DEFAULT_KDC_PORT: u16 = 88;
// 48 000 bytes: default maximum token len in Windows
const MAX_UDP_REPLY_LEN: usize = 0xbb80;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A KDC message (AS-REQ or TGS-REQ, DER encoded, without the TCP length prefix) and the realm
/// whose KDC must receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcRequest {
    pub realm: String,
    pub data: Vec<u8>,
}

/// Carries KDC requests. The acceptor uses it to tunnel IAKERB and PKU2U exchanges, the initiator
/// for AS and TGS exchanges.
///
/// The reply is the DER encoded KDC reply (or KRB-ERROR) without any length prefix.
/// Implementations own connection handling and timeouts.
pub trait KdcTransport: Send + Sync + Debug {
    fn send(&self, request: &KdcRequest) -> Result<Vec<u8>>;
}

pub fn parse_kdc_url(mut kdc: String) -> Option<Url> {
    if !kdc.contains("://") {
        kdc = format!("tcp://{}", kdc);
    }
    Url::from_str(&kdc).ok()
}

/// Talks to the KDCs listed in `[realms]` over TCP (`tcp://`, the default) or UDP (`udp://`).
#[derive(Debug, Clone, Default)]
pub struct NetworkKdcTransport {
    kdcs: HashMap<String, Vec<Url>>,
    timeout: Option<Duration>,
}

impl NetworkKdcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_krb5_conf(conf: &Krb5Conf) -> Self {
        let mut transport = Self::new();

        for (key, value) in conf.get_values_in_section(&["realms"]).unwrap_or_default() {
            if let Some((realm, "kdc")) = key.split_once('|') {
                if let Some(url) = parse_kdc_url(value.to_owned()) {
                    transport
                        .kdcs
                        .entry(realm.to_ascii_uppercase())
                        .or_default()
                        .push(url);
                }
            }
        }

        transport
    }

    pub fn with_kdc(mut self, realm: &str, url: &str) -> Result<Self> {
        let url = parse_kdc_url(url.to_owned())
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, format!("invalid KDC address: {}", url)))?;

        self.kdcs.entry(realm.to_ascii_uppercase()).or_default().push(url);

        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn kdc_urls(&self, realm: &str) -> &[Url] {
        self.kdcs
            .get(&realm.to_ascii_uppercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn send_tcp(&self, url: &Url, data: &[u8]) -> Result<Vec<u8>> {
        let addr = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port().unwrap_or(DEFAULT_KDC_PORT)
        );
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT)))?;

        let mut message = Vec::with_capacity(data.len() + 4);
        message.write_u32::<BigEndian>(data.len() as u32)?;
        message.extend_from_slice(data);
        stream.write_all(&message)?;

        let len = stream.read_u32::<BigEndian>()?;
        let mut buf = vec![0; len as usize];
        stream.read_exact(&mut buf)?;

        Ok(buf)
    }

    fn send_udp(&self, url: &Url, data: &[u8]) -> Result<Vec<u8>> {
        let udp_socket = UdpSocket::bind(("0.0.0.0", 0))?;
        udp_socket.set_read_timeout(Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT)))?;

        let addr = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port().unwrap_or(DEFAULT_KDC_PORT)
        );
        udp_socket.send_to(data, addr)?;

        let mut buf = vec![0; MAX_UDP_REPLY_LEN];
        let n = udp_socket.recv(&mut buf)?;
        buf.truncate(n);

        Ok(buf)
    }
}

impl KdcTransport for NetworkKdcTransport {
    #[instrument(level = "debug", skip_all, fields(realm = %request.realm))]
    fn send(&self, request: &KdcRequest) -> Result<Vec<u8>> {
        let urls = self.kdc_urls(&request.realm);
        if urls.is_empty() {
            return Err(Error::new(
                ErrorKind::Failure,
                format!("no KDC is known for realm {}", request.realm),
            ));
        }

        let mut last_error = None;
        for url in urls {
            let result = match url.scheme() {
                "tcp" => self.send_tcp(url, &request.data),
                "udp" => self.send_udp(url, &request.data),
                scheme => Err(Error::new(
                    ErrorKind::InvalidParameter,
                    format!("unsupported KDC protocol: {}", scheme),
                )),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    warn!(%url, ?err, "KDC request failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::new(ErrorKind::Failure, "KDC request failed")))
    }
}
