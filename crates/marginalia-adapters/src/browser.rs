//! Headless Chrome session for the live notebook.

use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Context;
use headless_chrome::protocol::cdp::Network::{Cookie, CookieParam};
use headless_chrome::{Browser, LaunchOptions, Tab};
use marginalia_storage::{StorageState, StoredCookie};
use tracing::{info, warn};

use crate::{is_sign_in_url, AdapterError, BookEntry, BookLocator, NotebookSource, LIBRARY_READY_SELECTOR};

#[derive(Debug, Clone)]
pub struct ChromeSourceConfig {
    pub notebook_url: String,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub settle_delay: Duration,
    pub click_delay: Duration,
    pub ready_timeout: Duration,
}

impl ChromeSourceConfig {
    pub fn new(notebook_url: impl Into<String>) -> Self {
        Self {
            notebook_url: notebook_url.into(),
            headless: true,
            user_agent: None,
            settle_delay: Duration::from_secs(3),
            click_delay: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

fn launch(headless: bool, idle_timeout: Duration) -> Result<Browser, AdapterError> {
    let options = LaunchOptions::default_builder()
        .headless(headless)
        .window_size(Some((1280, 2000)))
        .idle_browser_timeout(idle_timeout)
        .build()
        .map_err(|e| AdapterError::Message(format!("browser launch options: {e}")))?;
    Ok(Browser::new(options)?)
}

/// A logged-in notebook tab. Book pages are loaded by clicking the book in
/// the library column, the same way a reader would.
pub struct ChromeNotebookSource {
    _browser: Browser,
    tab: Arc<Tab>,
    config: ChromeSourceConfig,
}

impl ChromeNotebookSource {
    pub fn open(config: ChromeSourceConfig, auth: &StorageState) -> Result<Self, AdapterError> {
        let browser = launch(config.headless, Duration::from_secs(120))?;
        let tab = browser.new_tab()?;

        if let Some(user_agent) = &config.user_agent {
            tab.set_user_agent(user_agent, None, None)?;
        }
        let cookies = auth
            .cookies
            .iter()
            .map(to_cookie_param)
            .collect::<Result<Vec<_>, _>>()?;
        info!(count = cookies.len(), "restoring session cookies");
        tab.set_cookies(cookies)?;

        info!(url = %config.notebook_url, "navigating to notebook");
        tab.navigate_to(&config.notebook_url)?;
        tab.wait_until_navigated()?;
        sleep(config.settle_delay);

        let url = tab.get_url();
        if is_sign_in_url(&url) {
            return Err(AdapterError::AuthExpired(url));
        }

        if tab
            .wait_for_element_with_custom_timeout(LIBRARY_READY_SELECTOR, config.ready_timeout)
            .is_err()
        {
            warn!("could not find notebook library selector, continuing anyway");
        }

        Ok(Self {
            _browser: browser,
            tab,
            config,
        })
    }
}

impl NotebookSource for ChromeNotebookSource {
    fn library_html(&self) -> Result<String, AdapterError> {
        Ok(self.tab.get_content()?)
    }

    fn book_html(&self, book: &BookEntry) -> Result<String, AdapterError> {
        let element = match (&book.locator, book.locator.css()) {
            (_, Some(css)) => self.tab.find_element(&css)?,
            (BookLocator::Nth { selector, index }, None) => self
                .tab
                .find_elements(selector)?
                .into_iter()
                .nth(*index)
                .ok_or_else(|| AdapterError::Message(format!("book element {selector}[{index}] is gone")))?,
            (BookLocator::Attribute { name, .. }, None) => {
                return Err(AdapterError::Message(format!("no selector for book attribute {name}")))
            }
        };
        element.click()?;
        sleep(self.config.click_delay);
        Ok(self.tab.get_content()?)
    }
}

fn to_cookie_param(cookie: &StoredCookie) -> Result<CookieParam, AdapterError> {
    let mut value = serde_json::json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path,
        "secure": cookie.secure,
        "httpOnly": cookie.http_only,
    });
    // A non-positive expiry means a session cookie; CDP expects the field absent.
    if cookie.expires > 0.0 {
        value["expires"] = serde_json::json!(cookie.expires);
    }
    if let Some(same_site) = &cookie.same_site {
        value["sameSite"] = serde_json::json!(same_site);
    }
    serde_json::from_value(value)
        .map_err(|e| AdapterError::Message(format!("cookie {}: {e}", cookie.name)))
}

fn from_browser_cookie(cookie: &Cookie) -> anyhow::Result<StoredCookie> {
    let value = serde_json::to_value(cookie).context("serializing browser cookie")?;
    serde_json::from_value(value).context("converting browser cookie")
}

/// Opens a visible browser on the notebook, lets the user sign in, then
/// saves the session cookies to `auth_path`. `wait_for_user` returns once
/// the user confirms they are logged in.
pub fn interactive_login(
    notebook_url: &str,
    auth_path: &Path,
    wait_for_user: impl FnOnce() -> std::io::Result<()>,
) -> Result<StorageState, AdapterError> {
    let browser = launch(false, Duration::from_secs(30 * 60))?;
    let tab = browser.new_tab()?;

    info!(url = notebook_url, "opening notebook for sign-in");
    tab.navigate_to(notebook_url)?;

    wait_for_user()?;

    let cookies = tab
        .get_cookies()?
        .iter()
        .map(from_browser_cookie)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let state = StorageState {
        cookies,
        origins: Vec::new(),
    };
    state.save(auth_path)?;
    info!(path = %auth_path.display(), cookies = state.cookies.len(), "auth state saved");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_drops_expiry_for_cdp() {
        let cookie = StoredCookie {
            name: "session-id".into(),
            value: "123-456".into(),
            domain: ".amazon.com".into(),
            path: "/".into(),
            expires: -1.0,
            http_only: true,
            secure: true,
            same_site: None,
        };
        let param = to_cookie_param(&cookie).unwrap();
        assert_eq!(param.name, "session-id");
        assert_eq!(param.domain.as_deref(), Some(".amazon.com"));
        assert!(param.expires.is_none());
    }
}
