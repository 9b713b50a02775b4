use bitflags::bitflags;

bitflags! {
    /// Externally visible context flags.
    ///
    /// The bit values are the ones carried in the checksum "Flags" field:
    /// * [RFC 4121: Checksum Flags Field](https://datatracker.ietf.org/doc/html/rfc4121#section-4.1.1.1)
    /// * [MS-KILE 3.2.5.2 Authenticator Checksum Flags](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-kile/387806fc-ed78-445e-afd8-c5639fe4a90a)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        const DELEG = 1;
        const MUTUAL = 2;
        const REPLAY = 4;
        const SEQUENCE = 8;
        const CONF = 16;
        const INTEG = 32;
        const ANON = 64;
        const TRANS = 256;
        /// Three-leg mutual authentication used by DCE RPC.
        const DCE_STYLE = 0x1000;
        /// The acceptor may identify the initiator but not impersonate it.
        const IDENTIFY = 0x2000;
        /// The initiator wants Windows status codes in KRB-ERROR e-data.
        const EXTENDED_ERROR = 0x4000;
        const DELEG_POLICY = 0x8000;
    }
}

bitflags! {
    /// Context flags that never leave the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InternalFlags: u32 {
        /// The context was created by the local initiator.
        const LOCAL = 0x0001;
        /// The handshake reached its terminal success state.
        const OPEN = 0x0002;
        /// Accept a zero channel-binding hash from peers that do not send bindings.
        const LEGACY_CHECKSUM_COMPAT = 0x0004;
        /// The peer was accepted through the zero-hash exception.
        const LEGACY_CHECKSUM_SELECTED = 0x0008;
        const CLOSE_STORE_ON_DELETE = 0x0010;
        const DESTROY_STORE_ON_DELETE = 0x0020;
        const CFX_MODE = 0x0040;
        const PAC_VALIDATED = 0x0080;
    }
}

bitflags! {
    /// Credential handle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CredentialFlags: u32 {
        /// The credential owns its ticket store and destroys it on release.
        const DESTROY_STORE_ON_RELEASE = 0x01;
        /// Do not advertise confidentiality and integrity on contexts built from this credential.
        const SUPPRESS_CONF_INT_FLAGS = 0x02;
        /// The IAKERB realm of the credential has been resolved.
        const IAKERB_RESOLVED = 0x04;
    }
}

impl ContextFlags {
    /// Flags an established context always offers, whatever the peer asked for.
    pub fn always_offered() -> Self {
        ContextFlags::CONF | ContextFlags::INTEG | ContextFlags::TRANS
    }
}
