mod chromium;
mod error;
mod launcher;
mod locator;
mod pacing;
mod retry;
mod session;

pub use chromium::ChromiumSession;
pub use error::{BrowserError, BrowserResult};
pub use launcher::{
    parse_chrome_major, render_user_agent, resolve_headless, ChromiumSessionProvider, LaunchPlan,
};
pub use locator::{Action, Interaction, Key, Locator, Strategy, StrategyList};
pub use pacing::{PacePoint, Pacer};
pub use retry::{RetryOutcome, RetryPolicy};
pub use session::{BrowserSession, SessionCookie, SessionProvider};
