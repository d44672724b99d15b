//! Verification gate.
//!
//! When a keyword comes back not-found, the platform may have put a
//! human-verification challenge in front of the account. The gate pauses the
//! workers that share the account's challenge surface, refreshes the surface,
//! polls until the challenge clears and then lets every queued worker resume.
//!
//! ```text
//! IDLE -> REFRESHING -> POLLING -> CLEARED
//!             ^            |
//!             +--(timeout)-+
//! ```
//!
//! Gates are keyed by [`SurfaceSelector`]; accounts bound to different browser
//! surfaces never block each other.

mod browser;
mod resolver;

pub use browser::PlatformResolver;
pub use resolver::{ChallengeResolver, ChallengeState, ResolverError};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::shutdown::ShutdownSignal;
use crate::models::{Account, RefreshMethod};

/// Location fragment present while the challenge page is shown.
pub const CHALLENGE_URL_MARKER: &str = "/captcha/show";

pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const MIN_CYCLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Global gate configuration. Surface fields are defaults that accounts may override.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub method: RefreshMethod,
    /// Tab URL must contain this to be the challenge surface.
    pub url_keyword: String,
    /// Window title keyword (windows method).
    pub window_keyword: String,
    /// 1-based browser window; 0 means any.
    pub window_index: u32,
    /// `window.name` the surface tab carries; empty means unbound.
    pub window_tag: String,
    /// Pause after clearance before work resumes.
    pub refresh_wait: Duration,
    pub poll_interval: Duration,
    /// Longest single polling cycle before the surface is refreshed again.
    pub cycle_timeout: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            method: RefreshMethod::Auto,
            url_keyword: "weibo".to_string(),
            window_keyword: "Chrome".to_string(),
            window_index: 0,
            window_tag: String::new(),
            refresh_wait: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            cycle_timeout: Duration::from_secs(45),
        }
    }
}

impl GateSettings {
    /// Apply the lower bounds on polling.
    pub fn clamped(mut self) -> Self {
        self.poll_interval = self.poll_interval.max(MIN_POLL_INTERVAL);
        self.cycle_timeout = self.cycle_timeout.max(MIN_CYCLE_TIMEOUT);
        self
    }
}

/// Resolved challenge surface of an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceSelector {
    pub method: RefreshMethod,
    pub url_keyword: String,
    pub window_keyword: String,
    pub window_index: u32,
    pub window_tag: String,
}

fn override_text(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl SurfaceSelector {
    /// Account overrides on top of the global defaults. No account selects the defaults.
    pub fn resolve(settings: &GateSettings, account: Option<&Account>) -> Self {
        let mut selector = Self {
            method: settings.method,
            url_keyword: settings.url_keyword.clone(),
            window_keyword: settings.window_keyword.clone(),
            window_index: settings.window_index,
            window_tag: settings.window_tag.trim().to_string(),
        };
        let Some(account) = account else {
            return selector;
        };

        let overrides = &account.refresh;
        if let Some(method) = overrides.method {
            selector.method = method;
        }
        if let Some(v) = override_text(&overrides.url_keyword) {
            selector.url_keyword = v.to_string();
        }
        if let Some(v) = override_text(&overrides.window_keyword) {
            selector.window_keyword = v.to_string();
        }
        if let Some(index) = overrides.window_index.filter(|i| *i > 0) {
            selector.window_index = index;
        }
        if let Some(v) = override_text(&overrides.window_tag) {
            selector.window_tag = v.to_string();
        }
        selector
    }

    /// Bound to a tagged surface, which can only be found by running script in it.
    pub fn requires_scripting(&self) -> bool {
        !self.window_tag.is_empty()
    }
}

impl fmt::Display for SurfaceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.method.as_str(),
            self.url_keyword,
            self.window_keyword,
            self.window_index,
            if self.window_tag.is_empty() {
                "-"
            } else {
                self.window_tag.as_str()
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Refreshing,
    Polling,
    Cleared,
}

/// What one pass through the gate did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    /// Refresh cycles driven by this caller.
    pub cycles: u32,
    /// States entered, in order, starting at `Idle`.
    pub transitions: Vec<GateState>,
    /// Cleared by a cycle another worker drove while this one was queued.
    pub shared: bool,
    /// Left early because shutdown was requested.
    pub aborted: bool,
}

impl GateReport {
    fn new() -> Self {
        Self {
            cycles: 0,
            transitions: vec![GateState::Idle],
            shared: false,
            aborted: false,
        }
    }

    fn enter(&mut self, state: GateState) {
        self.transitions.push(state);
    }

    pub fn cleared(&self) -> bool {
        self.transitions.last() == Some(&GateState::Cleared)
    }
}

enum PollOutcome {
    Cleared,
    TimedOut,
    Abandoned,
    Shutdown,
}

/// One gate per challenge surface.
pub struct VerifyGate {
    selector: SurfaceSelector,
    settings: Arc<GateSettings>,
    resolver: Arc<dyn ChallengeResolver>,
    lock: Mutex<()>,
    clearances: AtomicU64,
}

impl VerifyGate {
    pub fn new(
        selector: SurfaceSelector,
        settings: Arc<GateSettings>,
        resolver: Arc<dyn ChallengeResolver>,
    ) -> Self {
        Self {
            selector,
            settings,
            resolver,
            lock: Mutex::new(()),
            clearances: AtomicU64::new(0),
        }
    }

    pub fn selector(&self) -> &SurfaceSelector {
        &self.selector
    }

    /// Number of cycles that reached `Cleared`.
    pub fn clearances(&self) -> u64 {
        self.clearances.load(Ordering::SeqCst)
    }

    /// Wait until the surface is clear.
    ///
    /// Only one caller drives the refresh/poll cycle at a time. Callers that
    /// queued while a cycle was running resume as soon as it clears.
    pub async fn run(&self, keyword: &str, account: &str, shutdown: &ShutdownSignal) -> GateReport {
        let seen = self.clearances.load(Ordering::SeqCst);
        let _guard = self.lock.lock().await;

        if self.clearances.load(Ordering::SeqCst) != seen {
            info!(
                "account={} keyword={} surface {} cleared while queued, resuming",
                account, keyword, self.selector
            );
            let mut report = GateReport::new();
            report.shared = true;
            report.enter(GateState::Cleared);
            return report;
        }

        let report = self.drive(keyword, account, shutdown.clone()).await;
        if report.cleared() {
            self.clearances.fetch_add(1, Ordering::SeqCst);
        }
        report
    }

    async fn drive(&self, keyword: &str, account: &str, mut shutdown: ShutdownSignal) -> GateReport {
        let mut report = GateReport::new();
        let settings = &self.settings;

        if !self.resolver.supports_inspection(&self.selector) {
            warn!(
                "account={} keyword={} found=false, refreshing {} then pausing {:?}",
                account, keyword, self.selector, settings.refresh_wait
            );
            report.cycles = 1;
            report.enter(GateState::Refreshing);
            self.refresh(account).await;
            if shutdown.sleep(settings.refresh_wait).await {
                report.aborted = true;
                return report;
            }
            report.enter(GateState::Cleared);
            return report;
        }

        loop {
            report.cycles += 1;
            report.enter(GateState::Refreshing);
            warn!(
                "account={} keyword={} found=false, verify gate cycle={}: refreshing {}",
                account, keyword, report.cycles, self.selector
            );

            if !self.refresh(account).await {
                if shutdown.sleep(settings.poll_interval).await {
                    report.aborted = true;
                    return report;
                }
                continue;
            }

            report.enter(GateState::Polling);
            match self.poll_cycle(account, &mut shutdown).await {
                PollOutcome::Cleared => {
                    info!(
                        "account={} verification cleared, pausing {:?} before resuming",
                        account, settings.refresh_wait
                    );
                    if shutdown.sleep(settings.refresh_wait).await {
                        report.aborted = true;
                        return report;
                    }
                    report.enter(GateState::Cleared);
                    return report;
                }
                PollOutcome::TimedOut => {
                    warn!(
                        "verification not finished within {:?}, reloading challenge",
                        settings.cycle_timeout
                    );
                }
                PollOutcome::Abandoned => {}
                PollOutcome::Shutdown => {
                    report.aborted = true;
                    return report;
                }
            }
        }
    }

    async fn refresh(&self, account: &str) -> bool {
        match self.resolver.refresh(&self.selector).await {
            Ok(()) => {
                info!("account={} refreshed surface {}", account, self.selector);
                true
            }
            Err(e) => {
                warn!("account={} surface refresh skipped/failed: {}", account, e);
                false
            }
        }
    }

    async fn poll_cycle(&self, account: &str, shutdown: &mut ShutdownSignal) -> PollOutcome {
        let settings = &self.settings;
        let begin = Instant::now();
        let mut degraded_warned = false;

        loop {
            match self.resolver.poll_state(&self.selector).await {
                Ok(ChallengeState::Cleared) => return PollOutcome::Cleared,
                Ok(ChallengeState::Pending) => {}
                Ok(ChallengeState::CheckError(detail)) => {
                    warn!("account={} verify check error: {}", account, detail);
                }
                Err(ResolverError::ScriptingDisabled(detail)) => {
                    if self.selector.requires_scripting() {
                        warn!(
                            "account={} surface tag '{}' needs scripting, cannot fall back to URL check: {}",
                            account, self.selector.window_tag, detail
                        );
                        return PollOutcome::Abandoned;
                    }
                    if !degraded_warned {
                        warn!(
                            "scripting disabled on surface, falling back to URL check (leaving {} counts as cleared)",
                            CHALLENGE_URL_MARKER
                        );
                        degraded_warned = true;
                    }
                    match self.resolver.current_location(&self.selector).await {
                        Ok(location) if !location.contains(CHALLENGE_URL_MARKER) => {
                            info!("account={} verification cleared by URL {}", account, location);
                            return PollOutcome::Cleared;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("account={} verify URL check failed: {}", account, e);
                            return PollOutcome::Abandoned;
                        }
                    }
                }
                Err(e) => {
                    warn!("account={} verify state check failed: {}", account, e);
                    return PollOutcome::Abandoned;
                }
            }

            if begin.elapsed() >= settings.cycle_timeout {
                return PollOutcome::TimedOut;
            }
            if shutdown.sleep(settings.poll_interval).await {
                return PollOutcome::Shutdown;
            }
        }
    }
}

/// Hands out the gate of each account's challenge surface.
pub struct GateRegistry {
    settings: Arc<GateSettings>,
    resolver: Arc<dyn ChallengeResolver>,
    gates: Mutex<HashMap<SurfaceSelector, Arc<VerifyGate>>>,
}

impl GateRegistry {
    pub fn new(settings: GateSettings, resolver: Arc<dyn ChallengeResolver>) -> Self {
        Self {
            settings: Arc::new(settings.clamped()),
            resolver,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// The gate for `account`'s surface, created on first use.
    pub async fn gate_for(&self, account: Option<&Account>) -> Arc<VerifyGate> {
        let selector = SurfaceSelector::resolve(&self.settings, account);
        let mut gates = self.gates.lock().await;
        gates
            .entry(selector.clone())
            .or_insert_with(|| {
                Arc::new(VerifyGate::new(
                    selector,
                    self.settings.clone(),
                    self.resolver.clone(),
                ))
            })
            .clone()
    }

    pub async fn gate_count(&self) -> usize {
        self.gates.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    /// Replays scripted poll results; `Pending` once the script runs out.
    struct Scripted {
        inspect: bool,
        polls: StdMutex<VecDeque<Result<ChallengeState, ResolverError>>>,
        locations: StdMutex<VecDeque<Result<String, ResolverError>>>,
        refresh_failures: AtomicU32,
        refreshes: AtomicU32,
    }

    impl Scripted {
        fn new(inspect: bool, polls: Vec<Result<ChallengeState, ResolverError>>) -> Self {
            Self {
                inspect,
                polls: StdMutex::new(polls.into()),
                locations: StdMutex::new(VecDeque::new()),
                refresh_failures: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChallengeResolver for Scripted {
        fn supports_inspection(&self, _selector: &SurfaceSelector) -> bool {
            self.inspect
        }

        async fn refresh(&self, _selector: &SurfaceSelector) -> Result<(), ResolverError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let pending = self.refresh_failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.refresh_failures.store(pending - 1, Ordering::SeqCst);
                return Err(ResolverError::Failed("NO_TAB".to_string()));
            }
            Ok(())
        }

        async fn poll_state(&self, _selector: &SurfaceSelector) -> Result<ChallengeState, ResolverError> {
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ChallengeState::Pending))
        }

        async fn current_location(&self, _selector: &SurfaceSelector) -> Result<String, ResolverError> {
            self.locations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("https://m.weibo.cn/captcha/show".to_string()))
        }
    }

    fn gate(resolver: Arc<Scripted>, settings: GateSettings) -> VerifyGate {
        let selector = SurfaceSelector::resolve(&settings, None);
        VerifyGate::new(selector, Arc::new(settings.clamped()), resolver)
    }

    use GateState::*;

    #[test]
    fn test_selector_overrides() {
        let settings = GateSettings::default();
        let mut account = Account::new("acc1", "SUB=x", 1.0);
        account.refresh.method = Some(RefreshMethod::Mac);
        account.refresh.window_index = Some(2);
        account.refresh.window_tag = Some("  tagA ".to_string());
        account.refresh.url_keyword = Some("   ".to_string());

        let selector = SurfaceSelector::resolve(&settings, Some(&account));
        assert_eq!(selector.method, RefreshMethod::Mac);
        assert_eq!(selector.window_index, 2);
        assert_eq!(selector.window_tag, "tagA");
        assert_eq!(selector.url_keyword, "weibo");
        assert!(selector.requires_scripting());
        assert_eq!(selector.to_string(), "mac|weibo|Chrome|2|tagA");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_cleared_is_one_cycle() {
        let resolver = Arc::new(Scripted::new(
            true,
            vec![Ok(ChallengeState::Pending), Ok(ChallengeState::Cleared)],
        ));
        let gate = gate(resolver.clone(), GateSettings::default());
        let report = gate.run("tea", "acc1", &ShutdownSignal::never()).await;

        assert_eq!(report.cycles, 1);
        assert_eq!(report.transitions, vec![Idle, Refreshing, Polling, Cleared]);
        assert_eq!(resolver.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(gate.clearances(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_timeout_refreshes_again() {
        let settings = GateSettings {
            poll_interval: Duration::from_secs(1),
            cycle_timeout: Duration::from_secs(5),
            ..GateSettings::default()
        };
        let mut polls: Vec<_> = (0..6).map(|_| Ok(ChallengeState::Pending)).collect();
        polls.push(Ok(ChallengeState::Cleared));
        let resolver = Arc::new(Scripted::new(true, polls));
        let report = gate(resolver.clone(), settings)
            .run("tea", "acc1", &ShutdownSignal::never())
            .await;

        assert_eq!(report.cycles, 2);
        assert_eq!(
            report.transitions,
            vec![Idle, Refreshing, Polling, Refreshing, Polling, Cleared]
        );
        assert_eq!(resolver.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_retries() {
        let resolver = Arc::new(Scripted::new(true, vec![Ok(ChallengeState::Cleared)]));
        resolver.refresh_failures.store(2, Ordering::SeqCst);
        let report = gate(resolver.clone(), GateSettings::default())
            .run("tea", "acc1", &ShutdownSignal::never())
            .await;
        assert_eq!(report.cycles, 3);
        assert!(report.cleared());
        assert_eq!(resolver.refreshes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_inspection_pauses_and_clears() {
        let resolver = Arc::new(Scripted::new(false, vec![]));
        let settings = GateSettings {
            refresh_wait: Duration::from_secs(7),
            ..GateSettings::default()
        };
        let start = Instant::now();
        let report = gate(resolver, settings)
            .run("tea", "acc1", &ShutdownSignal::never())
            .await;
        assert_eq!(report.transitions, vec![Idle, Refreshing, Cleared]);
        assert!(Instant::now() - start >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripting_disabled_falls_back_to_url() {
        let disabled = || Err(ResolverError::ScriptingDisabled("Apple events JavaScript".into()));
        let resolver = Arc::new(Scripted::new(true, vec![disabled(), disabled()]));
        resolver.locations.lock().unwrap().extend([
            Ok("https://m.weibo.cn/captcha/show?x=1".to_string()),
            Ok("https://m.weibo.cn/".to_string()),
        ]);
        let report = gate(resolver.clone(), GateSettings::default())
            .run("tea", "acc1", &ShutdownSignal::never())
            .await;
        assert_eq!(report.cycles, 1);
        assert!(report.cleared());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tagged_surface_cannot_degrade() {
        let disabled = || Err(ResolverError::ScriptingDisabled("Apple events JavaScript".into()));
        let resolver = Arc::new(Scripted::new(
            true,
            vec![disabled(), Ok(ChallengeState::Cleared)],
        ));
        resolver
            .locations
            .lock()
            .unwrap()
            .push_back(Ok("https://m.weibo.cn/".to_string()));
        let settings = GateSettings {
            window_tag: "bound".to_string(),
            ..GateSettings::default()
        };
        let report = gate(resolver.clone(), settings)
            .run("tea", "acc1", &ShutdownSignal::never())
            .await;
        // The first cycle is abandoned; the second one clears through the page check.
        assert_eq!(report.cycles, 2);
        assert!(report.cleared());
        assert_eq!(resolver.locations.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_waiters_resume_together() {
        let resolver = Arc::new(Scripted::new(
            true,
            vec![Ok(ChallengeState::Pending), Ok(ChallengeState::Cleared)],
        ));
        let gate = Arc::new(gate(resolver.clone(), GateSettings::default()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.run("tea", &format!("acc{}", i), &ShutdownSignal::never())
                    .await
            }));
        }
        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.await.unwrap());
        }

        assert_eq!(reports.iter().filter(|r| !r.shared).count(), 1);
        assert_eq!(reports.iter().filter(|r| r.shared).count(), 2);
        assert!(reports.iter().all(GateReport::cleared));
        assert_eq!(resolver.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_gate() {
        let resolver = Arc::new(Scripted::new(true, vec![]));
        let gate = gate(resolver, GateSettings::default());
        let (tx, signal) = ShutdownSignal::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let _ = tx.send(true);
        });
        let report = gate.run("tea", "acc1", &signal).await;
        assert!(report.aborted);
        assert!(!report.cleared());
    }

    #[tokio::test]
    async fn test_registry_keys_by_surface() {
        let registry = GateRegistry::new(
            GateSettings::default(),
            Arc::new(Scripted::new(false, vec![])),
        );
        let plain = Account::new("a", "SUB=x", 1.0);
        let mut tagged = Account::new("b", "SUB=y", 1.0);
        tagged.refresh.window_tag = Some("second".to_string());

        let g1 = registry.gate_for(Some(&plain)).await;
        let g2 = registry.gate_for(None).await;
        let g3 = registry.gate_for(Some(&tagged)).await;
        assert!(Arc::ptr_eq(&g1, &g2));
        assert!(!Arc::ptr_eq(&g1, &g3));
        assert_eq!(registry.gate_count().await, 2);
    }
}
