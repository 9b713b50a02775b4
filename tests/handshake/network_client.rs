use std::sync::{Arc, Mutex};

use gss_krb5::network_client::{KdcRequest, KdcTransport};
use gss_krb5::Result;

use crate::kdc::KdcMock;

/// [KdcTransport] mock implementation.
///
/// Instead of sending Kerberos messages to a KDC service, it hands them to the KDC mock and
/// remembers the realm of every request.
#[derive(Debug)]
pub struct KdcTransportMock {
    pub kdc: Arc<KdcMock>,
    realms: Mutex<Vec<String>>,
}

impl KdcTransportMock {
    pub fn new(kdc: Arc<KdcMock>) -> Self {
        Self {
            kdc,
            realms: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.realms.lock().unwrap().len()
    }

    pub fn realms(&self) -> Vec<String> {
        self.realms.lock().unwrap().clone()
    }
}

impl KdcTransport for KdcTransportMock {
    fn send(&self, request: &KdcRequest) -> Result<Vec<u8>> {
        self.realms.lock().unwrap().push(request.realm.clone());

        Ok(self.kdc.handle(&request.data))
    }
}

/// Replies with the same bytes to every request.
#[derive(Debug)]
pub struct CannedTransport {
    pub reply: Vec<u8>,
    pub requests: Mutex<Vec<KdcRequest>>,
}

impl CannedTransport {
    pub fn new(reply: Vec<u8>) -> Self {
        Self {
            reply,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl KdcTransport for CannedTransport {
    fn send(&self, request: &KdcRequest) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(request.clone());

        Ok(self.reply.clone())
    }
}
