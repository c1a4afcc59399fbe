use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{BrowserError, BrowserResult};
use super::locator::{Action, Key, Locator};

/// A cookie injected ahead of interactive login, in the shape browsers export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default, rename = "httpOnly")]
    pub http_only: Option<bool>,
}

impl SessionCookie {
    /// Parses a JSON array of cookies as exported from a logged-in browser.
    pub fn parse_list(raw: &str) -> BrowserResult<Vec<SessionCookie>> {
        serde_json::from_str(raw)
            .map_err(|err| BrowserError::Configuration(format!("invalid cookie list: {err}")))
    }
}

/// A live browser context bound to one account for one publish attempt.
///
/// All element addressing goes through [`Locator`]s resolved against the
/// current document root, which is the top-level document until
/// [`BrowserSession::enter_frame`] succeeds. `scope` restricts the search to
/// descendants of the first visible element matching it.
#[async_trait(?Send)]
pub trait BrowserSession {
    async fn goto(&mut self, url: &str) -> BrowserResult<()>;

    async fn current_url(&mut self) -> BrowserResult<String>;

    /// Markup of the current document root.
    async fn page_source(&mut self) -> BrowserResult<String>;

    async fn add_cookies(&mut self, cookies: &[SessionCookie]) -> BrowserResult<()>;

    /// Switches the document root into the named nested frame. Returns
    /// `false` when the page renders without that frame.
    async fn enter_frame(&mut self, name: &str) -> BrowserResult<bool>;

    async fn is_visible(&mut self, target: &Locator, scope: Option<&Locator>)
        -> BrowserResult<bool>;

    /// Applies `action` to the first visible match, failing with
    /// [`BrowserError::NotFound`] when nothing matches.
    async fn interact(
        &mut self,
        target: &Locator,
        scope: Option<&Locator>,
        action: Action<'_>,
    ) -> BrowserResult<()>;

    async fn press_key(&mut self, key: Key) -> BrowserResult<()>;

    /// Answer given to native dialogs raised while an interaction is in
    /// flight. Sessions start out dismissing them.
    fn arm_dialog(&mut self, accept: bool);

    /// Answers an open native dialog. Returns `false` when none was open or
    /// answered since the last call.
    async fn handle_dialog(&mut self, accept: bool) -> BrowserResult<bool>;

    /// PNG snapshot of the visible page.
    async fn snapshot(&mut self) -> BrowserResult<Vec<u8>>;

    /// Releases the underlying browser. Called exactly once by the driver.
    async fn close(&mut self) -> BrowserResult<()>;
}

/// Produces sessions configured to resemble an ordinary user agent.
#[async_trait(?Send)]
pub trait SessionProvider {
    async fn acquire(&self) -> BrowserResult<Box<dyn BrowserSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exported_cookie_list() {
        let cookies = SessionCookie::parse_list(
            r#"[{"name":"NID_AUT","value":"abc","domain":".naver.com","path":"/","httpOnly":true},
                {"name":"NID_SES","value":"def"}]"#,
        )
        .unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].domain.as_deref(), Some(".naver.com"));
        assert_eq!(cookies[0].http_only, Some(true));
        assert_eq!(cookies[1].path, None);
        assert!(SessionCookie::parse_list("{not json").is_err());
    }
}
