use core::fmt;

/// A local port forward: `127.0.0.1:local_port` on this machine reaches `host:port` as
/// resolved by the relay.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LocalForward {
    /// Port bound on the loopback interface.
    pub local_port: u16,
    /// Destination host, as seen from the relay.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

impl LocalForward {
    /// Forward `127.0.0.1:local_port` to `host:port`.
    pub fn new(local_port: u16, host: impl Into<String>, port: u16) -> Self {
        Self {
            local_port,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for LocalForward {
    /// Formats in the shape `ssh -L` expects.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "127.0.0.1:{}:{}:{}", self.local_port, self.host, self.port)
    }
}

#[test]
fn display() {
    let fwd = LocalForward::new(65535, "10.0.0.7", 22);
    assert_eq!(fwd.to_string(), "127.0.0.1:65535:10.0.0.7:22");
}
