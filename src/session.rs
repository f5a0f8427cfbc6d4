//! Session handles and the provider the transport client acquires them from.
//!
//! Issuing and refreshing sessions is owned by the dashboard's auth layer;
//! the transport client only asks a [`SessionProvider`] for a usable session
//! before every channel open and every catch-up poll.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
/// Secret string types that redact values in debug output.
pub use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::Result;
use crate::error::Error;

pub const SESSION_ID_HEADER: &str = "X-Session-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";

/// Opaque session identifier plus the user it belongs to.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Session {
    pub(crate) session_id: SecretString,
    pub(crate) user_id: Option<String>,
}

impl Session {
    #[must_use]
    pub fn new<S: Into<String>>(session_id: S) -> Self {
        Self {
            session_id: SecretString::from(session_id.into()),
            user_id: None,
        }
    }

    #[must_use]
    pub fn with_user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &SecretString {
        &self.session_id
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// `X-Session-ID` / `X-User-ID` headers for HTTP calls made on behalf of this session.
    pub(crate) fn headers(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();

        let mut session_id: reqwest::header::HeaderValue =
            self.session_id.expose_secret().parse()?;
        session_id.set_sensitive(true);
        map.insert(SESSION_ID_HEADER, session_id);

        if let Some(user_id) = &self.user_id {
            map.insert(USER_ID_HEADER, user_id.parse()?);
        }

        Ok(map)
    }
}

/// Source of session handles.
///
/// Implementations are shared with the transport client's background task,
/// so they must be cheap to call and safe to call concurrently.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    /// The current session, without contacting the issuer.
    async fn session(&self) -> Result<Session>;

    /// Whether the current session can still be used.
    fn is_valid(&self) -> bool;

    /// Re-acquire a session after expiry or sign-out.
    async fn refresh(&self) -> Result<Session>;
}

/// A fixed session, e.g. one handed over by the upload flow.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct StaticSession {
    session: Session,
}

impl StaticSession {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn session(&self) -> Result<Session> {
        Ok(self.session.clone())
    }

    fn is_valid(&self) -> bool {
        true
    }

    async fn refresh(&self) -> Result<Session> {
        Ok(self.session.clone())
    }
}

/// Current session, refreshed first if the provider reports it invalid.
pub(crate) async fn acquire(provider: &dyn SessionProvider) -> Result<Session> {
    if provider.is_valid() {
        provider.session().await
    } else {
        #[cfg(feature = "tracing")]
        tracing::debug!("Session invalid, refreshing before use");
        provider.refresh().await
    }
}

/// WebSocket scheme matching the host's: `wss` for secure origins, `ws` otherwise.
pub(crate) fn channel_scheme(host: &Url) -> Result<&'static str> {
    match host.scheme() {
        "https" | "wss" => Ok("wss"),
        "http" | "ws" => Ok("ws"),
        other => Err(Error::validation(format!(
            "unsupported scheme `{other}` for the real-time channel"
        ))),
    }
}

/// `ws://host/ws/{sessionId}`, or `wss://` when the host is served securely.
pub(crate) fn channel_url(host: &Url, session: &Session) -> Result<Url> {
    let scheme = channel_scheme(host)?;

    let mut url = host.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::validation(format!("unable to use scheme `{scheme}` for {host}")))?;
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| Error::validation(format!("{host} cannot be used as a base URL")))?
        .clear()
        .push("ws")
        .push(session.session_id.expose_secret());

    Ok(url)
}

/// Catch-up endpoint used by the fallback poller.
pub(crate) fn poll_url(host: &Url) -> Result<Url> {
    Ok(host.join("/api/events/poll")?)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn secure_origin_uses_wss() {
        let host = Url::parse("https://analysis.example.com/dashboard?tab=1").unwrap();
        let url = channel_url(&host, &Session::new("abc-123")).unwrap();
        assert_eq!(url.as_str(), "wss://analysis.example.com/ws/abc-123");
    }

    #[test]
    fn plain_origin_uses_ws_and_keeps_port() {
        let host = Url::parse("http://127.0.0.1:8080").unwrap();
        let url = channel_url(&host, &Session::new("s/1")).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws/s%2F1");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let host = Url::parse("ftp://example.com").unwrap();
        let err = channel_url(&host, &Session::new("abc")).unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Validation);
    }

    #[test]
    fn poll_url_is_rooted() {
        let host = Url::parse("https://analysis.example.com/app/").unwrap();
        assert_eq!(
            poll_url(&host).unwrap().as_str(),
            "https://analysis.example.com/api/events/poll"
        );
    }

    #[test]
    fn headers_carry_session_and_user() {
        let headers = Session::new("abc").with_user_id("u-7").headers().unwrap();
        assert_eq!(headers[SESSION_ID_HEADER], "abc");
        assert!(headers[SESSION_ID_HEADER].is_sensitive());
        assert_eq!(headers[USER_ID_HEADER], "u-7");

        let anonymous = Session::new("abc").headers().unwrap();
        assert!(anonymous.get(USER_ID_HEADER).is_none());
    }

    #[test]
    fn debug_output_redacts_session_id() {
        let rendered = format!("{:?}", Session::new("super-secret"));
        assert!(!rendered.contains("super-secret"), "{rendered}");
    }

    struct ExpiringSession {
        valid: AtomicBool,
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl SessionProvider for ExpiringSession {
        async fn session(&self) -> Result<Session> {
            Ok(Session::new("stale"))
        }

        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::Acquire)
        }

        async fn refresh(&self) -> Result<Session> {
            self.refreshes.fetch_add(1, Ordering::AcqRel);
            self.valid.store(true, Ordering::Release);
            Ok(Session::new("fresh"))
        }
    }

    #[tokio::test]
    async fn invalid_session_is_refreshed_before_use() {
        let provider = ExpiringSession {
            valid: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
        };

        let first = acquire(&provider).await.unwrap();
        let second = acquire(&provider).await.unwrap();

        assert_eq!(first.session_id().expose_secret(), "fresh");
        assert_eq!(second.session_id().expose_secret(), "stale");
        assert_eq!(provider.refreshes.load(Ordering::Acquire), 1);
    }
}
