use url::Url;

use crate::error::{PeerError, PeerResult};

const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8088";
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_CHANNEL_LABEL: &str = "datachannel";

/// Endpoint configuration.
///
/// Channel defaults favour latency over delivery: unordered, no
/// retransmissions. Use [`PeerConfigBuilder::reliable`] for ordered, fully
/// retransmitted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Relay WebSocket URL
    pub signaling_url: String,
    /// STUN server URLs used while gathering candidates
    pub ice_servers: Vec<String>,
    /// Label of the data channel each side opens
    pub data_channel_label: String,
    /// Whether the data channel preserves send order
    pub ordered: bool,
    /// Retransmission budget; `None` means retransmit until delivered
    pub max_retransmits: Option<u16>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: false,
            max_retransmits: Some(0),
        }
    }
}

impl PeerConfig {
    /// Defaults, with `HARBOR_SIGNALING_URL` and `HARBOR_LOCALHOST_ONLY` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = std::env::var("HARBOR_SIGNALING_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
        {
            config.signaling_url = url;
        }
        if std::env::var("HARBOR_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        }
        config
    }

    /// No STUN servers; only host candidates are gathered.
    pub fn localhost(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::default()
    }
}

/// Builder for [`PeerConfig`]
#[derive(Debug, Default)]
pub struct PeerConfigBuilder {
    config: PeerConfig,
}

impl PeerConfigBuilder {
    pub fn signaling_url(mut self, url: impl Into<String>) -> Self {
        self.config.signaling_url = url.into();
        self
    }

    pub fn ice_server(mut self, url: impl Into<String>) -> Self {
        self.config.ice_servers.push(url.into());
        self
    }

    pub fn no_ice_servers(mut self) -> Self {
        self.config.ice_servers.clear();
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.config.data_channel_label = label.into();
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.config.ordered = ordered;
        self
    }

    pub fn max_retransmits(mut self, max_retransmits: Option<u16>) -> Self {
        self.config.max_retransmits = max_retransmits;
        self
    }

    /// Reliable channels are ordered and retransmit without limit.
    pub fn reliable(mut self, reliable: bool) -> Self {
        if reliable {
            self.config.ordered = true;
            self.config.max_retransmits = None;
        } else {
            self.config.ordered = false;
            self.config.max_retransmits = Some(0);
        }
        self
    }

    pub fn build(self) -> PeerResult<PeerConfig> {
        let url = Url::parse(&self.config.signaling_url).map_err(|err| {
            PeerError::Config(format!(
                "invalid signaling url {}: {err}",
                self.config.signaling_url
            ))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PeerError::Config(format!(
                "signaling url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.config.data_channel_label.trim().is_empty() {
            return Err(PeerError::Config("data channel label is empty".into()));
        }
        Ok(self.config)
    }
}
