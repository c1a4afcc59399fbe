use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::{
    Action, BrowserError, BrowserResult, BrowserSession, Locator, PacePoint, RetryPolicy, Strategy,
    StrategyList,
};
use crate::formatter::ContentPayload;
use crate::job::{Failure, FailureKind, Job};

use super::{AmbiguousVerification, DriverState, Interstitial, PublishDriver};

type StepResult<T> = Result<T, Failure>;

/// One run of the state machine over a borrowed session.
pub(super) struct Attempt<'a> {
    driver: &'a PublishDriver,
    session: &'a mut dyn BrowserSession,
    job: &'a Job,
    state: DriverState,
    failed_at: Option<DriverState>,
}

impl<'a> Attempt<'a> {
    pub(super) fn new(
        driver: &'a PublishDriver,
        session: &'a mut dyn BrowserSession,
        job: &'a Job,
    ) -> Self {
        Self {
            driver,
            session,
            job,
            state: DriverState::SessionAcquired,
            failed_at: None,
        }
    }

    /// The state a failure happened in, or the current state.
    pub(super) fn state(&self) -> DriverState {
        self.failed_at.unwrap_or(self.state)
    }

    pub(super) async fn run(&mut self) -> StepResult<()> {
        match self.steps().await {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.failed_at = Some(self.state);
                self.state = DriverState::Failed;
                Err(failure)
            }
        }
    }

    async fn steps(&mut self) -> StepResult<()> {
        let driver = self.driver;
        self.login().await?;
        self.advance(DriverState::LoggedIn);

        self.open_compose().await?;
        self.advance(DriverState::OnComposeSurface);
        self.dismiss_interstitials().await;
        self.prepare_editor().await;

        let payload = self
            .driver
            .formatter
            .payload(self.job, driver.profile.compose.body_format);
        self.fill_title(&payload).await;
        self.advance(DriverState::TitleSet);
        self.fill_body(&payload).await;
        self.advance(DriverState::BodySet);
        if self.select_category().await {
            self.advance(DriverState::CategorySet);
        }

        self.request_publish().await?;
        self.advance(DriverState::PublishRequested);
        self.confirm_publish().await?;
        self.verify().await?;
        self.advance(DriverState::PublishConfirmed);
        Ok(())
    }

    fn advance(&mut self, state: DriverState) {
        let driver = self.driver;
        debug!(
            provider = %driver.provider,
            job_id = self.job.id,
            from = %self.state,
            to = %state,
            "driver transition"
        );
        self.state = state;
    }

    async fn pause(&self, point: PacePoint) {
        let driver = self.driver;
        driver.pacer.pause(point).await;
    }

    // ---- login -------------------------------------------------------------

    async fn login(&mut self) -> StepResult<()> {
        let driver = self.driver;
        let login = &driver.profile.login;
        self.session
            .goto(&login.home_url)
            .await
            .map_err(|err| Failure::new(FailureKind::LoginFailed, format!("home page: {err}")))?;
        self.pause(PacePoint::Settle).await;

        if let Some(cookies) = &driver.cookies {
            match self.session.add_cookies(cookies).await {
                Ok(()) => {
                    debug!(
                        provider = %driver.provider,
                        count = cookies.len(),
                        "injected session cookies"
                    );
                    self.session.goto(login.verify_url()).await.map_err(|err| {
                        Failure::new(
                            FailureKind::LoginFailed,
                            format!("reload after cookies: {err}"),
                        )
                    })?;
                    self.pause(PacePoint::Settle).await;
                }
                Err(err) => warn!(
                    provider = %driver.provider,
                    error = %err,
                    "cookie injection failed"
                ),
            }
        }
        if self.has_logout_control().await {
            info!(provider = %driver.provider, job_id = self.job.id, "already signed in");
            return Ok(());
        }

        self.session
            .goto(&login.login_url)
            .await
            .map_err(|err| Failure::new(FailureKind::LoginFailed, format!("login page: {err}")))?;
        self.pause(PacePoint::Settle).await;

        if !login.entry.is_empty() {
            if let Err(err) = self.apply(&login.entry, None, "", Duration::ZERO).await {
                debug!(provider = %driver.provider, error = %err, "no login entry control");
            }
            self.pause(PacePoint::Settle).await;
        }

        let job = self.job;
        let account = &job.account;
        for (name, strategies, value) in [
            ("username", &login.username, account.login.as_str()),
            ("password", &login.password, account.secret.as_str()),
        ] {
            if let Err(err) = self
                .apply(strategies, None, value, driver.timeouts.element_wait)
                .await
            {
                self.check_challenge("credential form").await?;
                return Err(Failure::new(FailureKind::LoginFailed, format!("{name} field: {err}")));
            }
            self.pause(PacePoint::Field).await;
        }

        if let Err(err) = self.apply(&login.submit, None, "", driver.timeouts.element_wait).await {
            return Err(Failure::new(FailureKind::LoginFailed, format!("submit control: {err}")));
        }
        self.pause(PacePoint::Settle).await;
        self.check_challenge("after submit").await?;

        if self.wait_for_login().await {
            return Ok(());
        }
        self.session.goto(login.verify_url()).await.map_err(|err| {
            Failure::new(FailureKind::LoginFailed, format!("verification page: {err}"))
        })?;
        self.pause(PacePoint::Settle).await;
        if self.wait_for_login().await {
            return Ok(());
        }
        self.check_challenge("verification page").await?;
        Err(Failure::new(
            FailureKind::LoginFailed,
            "no signed-in marker after submitting credentials",
        ))
    }

    async fn wait_for_login(&mut self) -> bool {
        let driver = self.driver;
        let deadline = Instant::now() + driver.timeouts.login_verify;
        loop {
            if self.is_logged_in().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(driver.timeouts.poll_interval).await;
        }
    }

    async fn has_logout_control(&mut self) -> bool {
        let driver = self.driver;
        for marker in &driver.profile.login.logged_in {
            if self.session.is_visible(marker, None).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// After submitting credentials the signed-in text also counts.
    async fn is_logged_in(&mut self) -> bool {
        if self.has_logout_control().await {
            return true;
        }
        let driver = self.driver;
        let login = &driver.profile.login;
        if login.logged_in_text.is_empty() {
            return false;
        }
        match self.session.page_source().await {
            Ok(source) => login.logged_in_text.iter().any(|text| source.contains(text)),
            Err(_) => false,
        }
    }

    /// Fails with `CHALLENGE_DETECTED` when the page shows a bot check.
    /// Markers match case-sensitively.
    async fn check_challenge(&mut self, stage: &str) -> StepResult<()> {
        let driver = self.driver;
        let login = &driver.profile.login;
        if !login.challenge_url.is_empty() {
            if let Ok(url) = self.session.current_url().await {
                let found = login.challenge_url.iter().find(|m| url.contains(m.as_str()));
                if let Some(marker) = found {
                    return Err(Failure::new(
                        FailureKind::ChallengeDetected,
                        format!("{stage}: url matches {marker:?}"),
                    ));
                }
            }
        }
        if !login.challenge_text.is_empty() {
            if let Ok(source) = self.session.page_source().await {
                if let Some(marker) = login
                    .challenge_text
                    .iter()
                    .find(|m| source.contains(m.as_str()))
                {
                    return Err(Failure::new(
                        FailureKind::ChallengeDetected,
                        format!("{stage}: page contains {marker:?}"),
                    ));
                }
            }
        }
        Ok(())
    }

    // ---- compose -----------------------------------------------------------

    async fn open_compose(&mut self) -> StepResult<()> {
        let driver = self.driver;
        let compose = &driver.profile.compose;
        let url = driver.profile.compose_url(self.job);
        debug!(
            provider = %driver.provider,
            job_id = self.job.id,
            url = %url,
            "opening compose surface"
        );
        self.session
            .goto(&url)
            .await
            .map_err(|err| {
                Failure::new(FailureKind::ComposeFailed, format!("compose page: {err}"))
            })?;
        self.pause(PacePoint::ComposeSettle).await;

        if let Some(frame) = &compose.frame {
            let deadline = Instant::now() + driver.timeouts.element_wait;
            loop {
                match self.session.enter_frame(frame).await {
                    Ok(true) => {
                        debug!(provider = %driver.provider, frame = %frame, "entered editor frame");
                        break;
                    }
                    Ok(false) if Instant::now() < deadline => {
                        sleep(driver.timeouts.poll_interval).await;
                    }
                    Ok(false) => {
                        info!(
                            provider = %driver.provider,
                            frame = %frame,
                            "editor rendered without frame"
                        );
                        break;
                    }
                    Err(err) => {
                        return Err(Failure::new(
                            FailureKind::ComposeFailed,
                            format!("frame {frame}: {err}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Tries each known dismissal once; absence is never an error.
    async fn dismiss_interstitials(&mut self) {
        let driver = self.driver;
        for interstitial in &driver.profile.compose.interstitials {
            match interstitial {
                Interstitial::Dialog { accept } => {
                    self.session.arm_dialog(*accept);
                    match self.session.handle_dialog(*accept).await {
                        Ok(true) => info!(
                            provider = %driver.provider,
                            accept,
                            "answered native dialog"
                        ),
                        Ok(false) => {}
                        Err(err) => debug!(error = %err, "dialog check failed"),
                    }
                }
                Interstitial::Key { key } => {
                    if let Err(err) = self.session.press_key(*key).await {
                        debug!(key = key.name(), error = %err, "key press failed");
                    }
                }
                Interstitial::Click { locate } => {
                    for locator in locate {
                        if !self.session.is_visible(locator, None).await.unwrap_or(false) {
                            continue;
                        }
                        match self
                            .session
                            .interact(locator, None, Action::ScriptClick)
                            .await
                        {
                            Ok(()) => {
                                info!(
                                    provider = %driver.provider,
                                    target = %locator,
                                    "dismissed interstitial"
                                );
                                break;
                            }
                            Err(err) => debug!(target = %locator, error = %err, "dismissal failed"),
                        }
                    }
                }
            }
        }
        self.session.arm_dialog(false);
    }

    async fn prepare_editor(&mut self) {
        let driver = self.driver;
        for step in &driver.profile.compose.prepare {
            self.session.arm_dialog(step.accept_dialog);
            match self
                .apply(&step.strategies, None, "", driver.timeouts.element_wait)
                .await
            {
                Ok(_) => debug!(provider = %driver.provider, step = %step.name, "editor step done"),
                Err(err) => warn!(
                    provider = %driver.provider,
                    step = %step.name,
                    error = %err,
                    "editor step skipped"
                ),
            }
            self.pause(PacePoint::Field).await;
            if step.accept_dialog {
                if let Err(err) = self.session.handle_dialog(true).await {
                    debug!(error = %err, "dialog check failed");
                }
            }
        }
        self.session.arm_dialog(false);
    }

    async fn fill_title(&mut self, payload: &ContentPayload) {
        let driver = self.driver;
        let strategies = &driver.profile.compose.title;
        if let Err(err) = self
            .apply(strategies, None, &payload.title, driver.timeouts.element_wait)
            .await
        {
            warn!(provider = %driver.provider, job_id = self.job.id, error = %err, "title not set");
        }
        self.pause(PacePoint::Field).await;
    }

    async fn fill_body(&mut self, payload: &ContentPayload) {
        let driver = self.driver;
        let strategies = &driver.profile.compose.body;
        if let Err(err) = self
            .apply(strategies, None, &payload.body, driver.timeouts.element_wait)
            .await
        {
            warn!(provider = %driver.provider, job_id = self.job.id, error = %err, "body not set");
        }
        self.pause(PacePoint::Field).await;
    }

    /// Returns whether a category was picked. Failure only logs.
    async fn select_category(&mut self) -> bool {
        let driver = self.driver;
        let job = self.job;
        let Some(category) = job.effective_category() else {
            return false;
        };
        let Some(picker) = &driver.profile.compose.category else {
            debug!(provider = %driver.provider, category, "category carried by compose url");
            return false;
        };
        if let Err(err) = self
            .apply(&picker.open, None, "", driver.timeouts.element_wait)
            .await
        {
            warn!(provider = %driver.provider, category, error = %err, "category picker not found");
            return false;
        }
        if self.wait_visible(&picker.list, None, driver.timeouts.element_wait).await.is_none() {
            warn!(provider = %driver.provider, category, "category list never rendered");
            return false;
        }
        let item = picker.item.render(&[("category", category)]);
        match self
            .session
            .interact(&item, None, Action::ScriptClick)
            .await
        {
            Ok(()) => {
                info!(provider = %driver.provider, category, "category selected");
                self.pause(PacePoint::Field).await;
                true
            }
            Err(err) => {
                warn!(provider = %driver.provider, category, error = %err, "category not selected");
                false
            }
        }
    }

    // ---- publish -----------------------------------------------------------

    /// First stage: each candidate gets a few tries with a short backoff.
    async fn request_publish(&mut self) -> StepResult<()> {
        let driver = self.driver;
        let publish = &driver.profile.publish;
        let policy = RetryPolicy::new(
            publish.open_attempts,
            Duration::from_millis(publish.open_backoff_ms),
        );
        let mut last_error = None;
        for strategy in publish.open.iter() {
            let outcome = policy
                .run("publish_open", &mut *self.session, |session, _| {
                    let strategy = strategy.clone();
                    Box::pin(async move { try_strategy(session, &strategy, None, "").await })
                })
                .await;
            match outcome {
                Ok(done) => {
                    info!(
                        provider = %driver.provider,
                        job_id = self.job.id,
                        target = %strategy.locate,
                        attempts = done.attempts,
                        "publish requested"
                    );
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }
        let detail = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no publish control configured".into());
        Err(Failure::new(FailureKind::PublishFailed, format!("publish control: {detail}")))
    }

    /// Second stage: wait for the confirmation surface, then confirm inside it.
    async fn confirm_publish(&mut self) -> StepResult<()> {
        let driver = self.driver;
        let publish = &driver.profile.publish;
        let Some(surface) = self
            .wait_visible(&publish.surface, None, driver.timeouts.surface_wait)
            .await
        else {
            return Err(Failure::new(
                FailureKind::PublishFailed,
                "confirmation surface never became visible",
            ));
        };
        debug!(provider = %driver.provider, surface = %surface, "confirmation surface visible");

        if !publish.surface_steps.is_empty() {
            if let Err(err) = self
                .apply(&publish.surface_steps, Some(&surface), "", Duration::ZERO)
                .await
            {
                debug!(provider = %driver.provider, error = %err, "surface step skipped");
            }
            self.pause(PacePoint::Field).await;
        }

        self.apply(&publish.confirm, Some(&surface), "", driver.timeouts.element_wait)
            .await
            .map_err(|err| {
                Failure::new(
                    FailureKind::PublishFailed,
                    format!("confirm control in surface: {err}"),
                )
            })?;
        Ok(())
    }

    async fn verify(&mut self) -> StepResult<()> {
        let driver = self.driver;
        self.pause(PacePoint::PostPublish).await;
        let rules = &driver.profile.verify;
        let deadline = Instant::now() + driver.timeouts.element_wait;
        let mut url = String::new();
        loop {
            if let Ok(current) = self.session.current_url().await {
                url = current;
            }
            if rules.success_url.iter().any(|marker| url.contains(marker.as_str())) {
                info!(
                    provider = %driver.provider,
                    job_id = self.job.id,
                    url = %url,
                    "success marker seen"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(driver.timeouts.poll_interval).await;
        }

        if let Some(marker) = rules.failure_url.iter().find(|m| url.contains(m.as_str())) {
            return Err(Failure::new(
                FailureKind::PublishFailed,
                format!("still on {marker:?} after confirming"),
            ));
        }
        if !rules.error_text.is_empty() {
            if let Ok(source) = self.session.page_source().await {
                if let Some(text) = rules.error_text.iter().find(|t| source.contains(t.as_str())) {
                    return Err(Failure::new(
                        FailureKind::PublishFailed,
                        format!("error message {text:?} on result page"),
                    ));
                }
            }
        }
        match rules.ambiguous {
            AmbiguousVerification::AssumeSuccess => {
                warn!(
                    provider = %driver.provider,
                    job_id = self.job.id,
                    url = %url,
                    "no success marker; assuming published"
                );
                Ok(())
            }
            AmbiguousVerification::Fail => Err(Failure::new(
                FailureKind::PublishFailed,
                format!("no success marker at {url}"),
            )),
        }
    }

    // ---- element helpers ---------------------------------------------------

    /// Applies the first strategy whose element is visible, re-scanning the
    /// list until `wait` elapses. A zero wait makes a single pass.
    async fn apply(
        &mut self,
        strategies: &StrategyList,
        scope: Option<&Locator>,
        text: &str,
        wait: Duration,
    ) -> BrowserResult<Strategy> {
        let driver = self.driver;
        if strategies.is_empty() {
            return Err(BrowserError::Configuration("empty strategy list".into()));
        }
        let deadline = Instant::now() + wait;
        loop {
            let mut last_error = None;
            for strategy in strategies.iter() {
                match try_strategy(&mut *self.session, strategy, scope, text).await {
                    Ok(()) => return Ok(strategy.clone()),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => last_error = Some(err),
                }
            }
            if Instant::now() >= deadline {
                return Err(last_error.unwrap_or_else(|| {
                    BrowserError::NotFound(
                        strategies
                            .locators()
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(" | "),
                    )
                }));
            }
            sleep(driver.timeouts.poll_interval).await;
        }
    }

    /// Waits until any of `targets` is visible and returns it.
    async fn wait_visible(
        &mut self,
        targets: &[Locator],
        scope: Option<&Locator>,
        wait: Duration,
    ) -> Option<Locator> {
        let driver = self.driver;
        let deadline = Instant::now() + wait;
        loop {
            for target in targets {
                if self.session.is_visible(target, scope).await.unwrap_or(false) {
                    return Some(target.clone());
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(driver.timeouts.poll_interval).await;
        }
    }
}

async fn try_strategy(
    session: &mut dyn BrowserSession,
    strategy: &Strategy,
    scope: Option<&Locator>,
    text: &str,
) -> BrowserResult<()> {
    if !session.is_visible(&strategy.locate, scope).await? {
        return Err(BrowserError::NotFound(strategy.locate.to_string()));
    }
    session
        .interact(&strategy.locate, scope, strategy.interact.action(text))
        .await
}
