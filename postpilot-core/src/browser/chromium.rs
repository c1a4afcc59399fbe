use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams, NavigateParams,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::{BrowserError, BrowserResult};
use super::locator::{Action, Key, Locator};
use super::session::{BrowserSession, SessionCookie};

/// Shared page-side helpers. `args.frame` selects the document root,
/// `args.scope` narrows the search and `args.target` is the element sought.
const PRELUDE: &str = r#"
const rootDoc = () => {
    if (!args.frame) return document;
    const frame = document.querySelector(`iframe[name="${args.frame}"]`)
        || document.getElementById(args.frame);
    return (frame && frame.contentDocument) || null;
};
const visible = (el) => {
    if (!el || !el.isConnected) return false;
    const style = el.ownerDocument.defaultView.getComputedStyle(el);
    if (style.visibility === 'hidden' || style.display === 'none') return false;
    return el.getClientRects().length > 0;
};
const all = (loc, ctx) => {
    const doc = ctx.ownerDocument || ctx;
    if (loc.by === 'active') {
        const active = doc.activeElement;
        return active && active !== doc.body ? [active] : [];
    }
    if (loc.by === 'css') return Array.from(ctx.querySelectorAll(loc.value));
    const snap = doc.evaluate(loc.value, ctx, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
    const out = [];
    for (let i = 0; i < snap.snapshotLength; i++) out.push(snap.snapshotItem(i));
    return out;
};
const resolve = (strict) => {
    const root = rootDoc();
    if (!root) return null;
    let ctx = root;
    if (args.scope) {
        const scope = all(args.scope, root).find(visible);
        if (!scope) return null;
        ctx = scope;
    }
    const found = all(args.target, ctx);
    const shown = found.find(visible);
    if (shown || strict) return shown || null;
    return found[0] || null;
};
"#;

/// Serialized form of a [`Locator`] handed to the page helpers.
#[derive(Debug, Serialize)]
struct LocatorArg<'a> {
    by: &'static str,
    value: &'a str,
}

impl<'a> From<&'a Locator> for LocatorArg<'a> {
    fn from(locator: &'a Locator) -> Self {
        match locator {
            Locator::Css(selector) => LocatorArg {
                by: "css",
                value: selector,
            },
            Locator::XPath(expression) => LocatorArg {
                by: "xpath",
                value: expression,
            },
            Locator::Active => LocatorArg {
                by: "active",
                value: "",
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClickPoint {
    x: f64,
    y: f64,
}

/// Native dialogs block page scripts until answered, so they are answered
/// from a side task with the currently armed choice.
#[derive(Debug, Default)]
struct DialogState {
    accept: AtomicBool,
    answered: AtomicUsize,
}

/// [`BrowserSession`] over a Chromium page driven through CDP.
#[derive(Debug)]
pub struct ChromiumSession {
    browser: Option<Browser>,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    dialog_task: Option<JoinHandle<()>>,
    dialogs: Arc<DialogState>,
    frame: Option<String>,
    label: String,
}

impl ChromiumSession {
    pub(crate) async fn attach(
        browser: Browser,
        page: Page,
        handler_task: JoinHandle<()>,
        label: impl Into<String>,
    ) -> Self {
        let label = label.into();
        let dialogs = Arc::new(DialogState::default());
        let dialog_task = match page.event_listener::<EventJavascriptDialogOpening>().await {
            Ok(mut events) => {
                let page = page.clone();
                let state = Arc::clone(&dialogs);
                let label = label.clone();
                Some(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        let accept = state.accept.load(Ordering::SeqCst);
                        debug!(
                            session = %label,
                            message = %event.message,
                            accept,
                            "answering native dialog"
                        );
                        match page.execute(HandleJavaScriptDialogParams::new(accept)).await {
                            Ok(_) => {
                                state.answered.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(err) => debug!(
                                session = %label,
                                error = %err,
                                "dialog already closed"
                            ),
                        }
                    }
                }))
            }
            Err(err) => {
                warn!(session = %label, error = %err, "dialog watcher unavailable");
                None
            }
        };
        Self {
            browser: Some(browser),
            page,
            handler_task: Some(handler_task),
            dialog_task,
            dialogs,
            frame: None,
            label,
        }
    }

    fn ensure_open(&self) -> BrowserResult<()> {
        if self.browser.is_none() {
            return Err(BrowserError::Closed);
        }
        Ok(())
    }

    fn script(&self, args: Value, body: &str) -> String {
        format!("(() => {{\nconst args = {args};\n{PRELUDE}\n{body}\n}})()")
    }

    fn element_args(&self, target: &Locator, scope: Option<&Locator>, text: Option<&str>) -> Value {
        json!({
            "frame": self.frame,
            "target": LocatorArg::from(target),
            "scope": scope.map(LocatorArg::from),
            "text": text,
        })
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> BrowserResult<T> {
        self.ensure_open()?;
        let value = self
            .page
            .evaluate(script.as_str())
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?
            .into_value::<T>()
            .map_err(|err| BrowserError::Script(format!("unexpected script result: {err}")))?;
        Ok(value)
    }

    async fn dispatch_key(&self, key: Key) -> BrowserResult<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(kind.clone())
                .key(key.name())
                .code(key.name())
                .windows_virtual_key_code(key.virtual_key_code())
                .native_virtual_key_code(key.virtual_key_code());
            if let (DispatchKeyEventType::KeyDown, Some(text)) = (&kind, key.text()) {
                builder = builder.text(text);
            }
            let params = builder.build().map_err(BrowserError::Configuration)?;
            self.page.execute(params).await?;
        }
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> BrowserResult<()> {
        let mut lines = text.split('\n').peekable();
        while let Some(line) = lines.next() {
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                self.page.execute(InsertTextParams::new(line)).await?;
            }
            if lines.peek().is_some() {
                self.dispatch_key(Key::Enter).await?;
            }
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl BrowserSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> BrowserResult<()> {
        self.ensure_open()?;
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        self.frame = None;
        debug!(session = %self.label, url, "navigated");
        Ok(())
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        self.ensure_open()?;
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn page_source(&mut self) -> BrowserResult<String> {
        let script = self.script(
            json!({ "frame": self.frame }),
            "const root = rootDoc() || document; return root.documentElement.outerHTML;",
        );
        self.eval(script).await
    }

    async fn add_cookies(&mut self, cookies: &[SessionCookie]) -> BrowserResult<()> {
        self.ensure_open()?;
        let url = self.current_url().await?;
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone());
            match &cookie.domain {
                Some(domain) => builder = builder.domain(domain.clone()),
                None => builder = builder.url(url.clone()),
            }
            if let Some(path) = &cookie.path {
                builder = builder.path(path.clone());
            }
            if let Some(secure) = cookie.secure {
                builder = builder.secure(secure);
            }
            if let Some(http_only) = cookie.http_only {
                builder = builder.http_only(http_only);
            }
            params.push(builder.build().map_err(BrowserError::Configuration)?);
        }
        self.page.set_cookies(params).await?;
        Ok(())
    }

    async fn enter_frame(&mut self, name: &str) -> BrowserResult<bool> {
        let script = self.script(json!({ "frame": name }), "return rootDoc() !== null;");
        let found: bool = self.eval(script).await?;
        if found {
            self.frame = Some(name.to_string());
        }
        Ok(found)
    }

    async fn is_visible(
        &mut self,
        target: &Locator,
        scope: Option<&Locator>,
    ) -> BrowserResult<bool> {
        let script = self.script(
            self.element_args(target, scope, None),
            "return resolve(true) !== null;",
        );
        self.eval(script).await
    }

    async fn interact(
        &mut self,
        target: &Locator,
        scope: Option<&Locator>,
        action: Action<'_>,
    ) -> BrowserResult<()> {
        let missing = || BrowserError::NotFound(target.to_string());
        match action {
            Action::Click => {
                let script = self.script(
                    self.element_args(target, scope, None),
                    r#"const el = resolve(false);
if (!el) return null;
el.scrollIntoView({ block: 'center' });
const rect = el.getBoundingClientRect();
let x = rect.left + rect.width / 2;
let y = rect.top + rect.height / 2;
const frame = el.ownerDocument.defaultView.frameElement;
if (frame) {
    const outer = frame.getBoundingClientRect();
    x += outer.left;
    y += outer.top;
}
return { x, y };"#,
                );
                let point: Option<ClickPoint> = self.eval(script).await?;
                let point = point.ok_or_else(missing)?;
                self.page.click(Point::new(point.x, point.y)).await?;
            }
            Action::ScriptClick => {
                let script = self.script(
                    self.element_args(target, scope, None),
                    r#"const el = resolve(false);
if (!el) return false;
el.scrollIntoView({ block: 'center' });
el.click();
return true;"#,
                );
                let done: bool = self.eval(script).await?;
                if !done {
                    return Err(missing());
                }
            }
            Action::SetValue(text) => {
                let script = self.script(
                    self.element_args(target, scope, Some(text)),
                    r#"const el = resolve(false);
if (!el) return false;
el.focus();
const proto = Object.getPrototypeOf(el);
const descriptor = Object.getOwnPropertyDescriptor(proto, 'value');
if (descriptor && descriptor.set) descriptor.set.call(el, args.text);
else el.value = args.text;
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return true;"#,
                );
                let done: bool = self.eval(script).await?;
                if !done {
                    return Err(missing());
                }
            }
            Action::Type(text) => {
                let script = self.script(
                    self.element_args(target, scope, None),
                    r#"const el = resolve(false);
if (!el) return false;
el.scrollIntoView({ block: 'center' });
el.click();
el.focus();
return true;"#,
                );
                let focused: bool = self.eval(script).await?;
                if !focused {
                    return Err(missing());
                }
                self.insert_text(text).await?;
            }
        }
        debug!(session = %self.label, target = %target, action = action.name(), "interacted");
        Ok(())
    }

    async fn press_key(&mut self, key: Key) -> BrowserResult<()> {
        self.ensure_open()?;
        self.dispatch_key(key).await
    }

    fn arm_dialog(&mut self, accept: bool) {
        self.dialogs.accept.store(accept, Ordering::SeqCst);
    }

    async fn handle_dialog(&mut self, accept: bool) -> BrowserResult<bool> {
        self.ensure_open()?;
        let answered = self.dialogs.answered.swap(0, Ordering::SeqCst) > 0;
        match self
            .page
            .execute(HandleJavaScriptDialogParams::new(accept))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                debug!(session = %self.label, error = %err, "no dialog open");
                Ok(answered)
            }
        }
    }

    async fn snapshot(&mut self) -> BrowserResult<Vec<u8>> {
        self.ensure_open()?;
        let bytes = self
            .page
            .screenshot(ScreenshotParams::builder().build())
            .await?;
        Ok(bytes)
    }

    async fn close(&mut self) -> BrowserResult<()> {
        let Some(mut browser) = self.browser.take() else {
            return Ok(());
        };
        debug!(session = %self.label, "closing chromium session");
        if let Some(watcher) = self.dialog_task.take() {
            watcher.abort();
        }
        if let Err(err) = browser.close().await {
            warn!(session = %self.label, error = %err, "failed to close browser gracefully");
        }
        if let Err(err) = browser.wait().await {
            debug!(session = %self.label, error = %err, "browser process wait failed");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(session = %self.label, error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!(
                session = %self.label,
                "ChromiumSession dropped without explicit close"
            );
            for handle in [self.handler_task.take(), self.dialog_task.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
        }
    }
}
