use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;


/// Application-level identity of a peer, i.e. the name a chat participant announces when
///  connecting. The relay server uses it for addressing, so it must be unique among the peers
///  that are connected at any given time.
///
/// NB: This is *not* authenticated in any way - a peer can claim any name that is not taken.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub const MAX_LEN: usize = 64;

    /// The identity the relay server uses for messages it originates itself (join / leave notices,
    ///  the welcome message). Clients can not register it.
    pub const SERVER: &'static str = "server";

    pub fn new(name: impl Into<String>) -> anyhow::Result<PeerId> {
        let name = name.into();
        if name.is_empty() {
            bail!("peer id must not be empty");
        }
        if name.len() > Self::MAX_LEN {
            bail!("peer id must have at most {} bytes, was {}", Self::MAX_LEN, name.len());
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            bail!("peer id {:?} contains whitespace or control characters", name);
        }
        Ok(PeerId(name))
    }

    pub fn server() -> PeerId {
        PeerId(Self::SERVER.to_string())
    }

    pub fn is_server(&self) -> bool {
        self.0 == Self::SERVER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for PeerId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        PeerId::new(value)
    }
}
