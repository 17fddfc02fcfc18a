use url::Url;

use crate::Result;
use crate::error::Error;

/// Path of the dashboard event socket.
pub const DASHBOARD_PATH: &str = "/ws/dashboard";
/// Path of the PCBA stage-tracking socket.
pub const PCBA_PATH: &str = "/ws/pcba";

const TOKEN_PARAM: &str = "token";

/// Location of a real-time socket, without credentials.
///
/// The token is attached per connection attempt via [`Endpoint::with_token`], so the URL
/// stored here never contains a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Uses an explicit `ws://` or `wss://` URL.
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(Error::validation(format!(
                "socket endpoint must use ws or wss, got {other}"
            ))),
        }
    }

    /// Derives the socket URL from the origin of the page that hosts the client.
    ///
    /// A secure origin (`https`) yields a secure socket (`wss`), anything served over `http`
    /// yields `ws`. Origins that already use a socket scheme are kept as they are.
    pub fn from_origin(origin: &str, path: &str) -> Result<Self> {
        let origin = Url::parse(origin)?;
        let scheme = match origin.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(Error::validation(format!(
                    "cannot derive a socket scheme from {other}"
                )));
            }
        };
        let host = origin
            .host_str()
            .ok_or(Error::validation("origin has no host"))?;

        let authority = match origin.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Self::new(&format!(
            "{scheme}://{authority}/{}",
            path.trim_start_matches('/')
        ))
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    /// The URL to dial, carrying `token` as a URL-encoded query credential.
    #[must_use]
    pub fn with_token(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair(TOKEN_PARAM, token);
        url
    }
}
