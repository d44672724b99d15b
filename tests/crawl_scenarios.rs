//! End-to-end crawl scenarios against stub API and challenge surfaces.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use kwcrawl::config::{FileConfig, RunArgs, Settings};
use kwcrawl::context::CrawlContext;
use kwcrawl::models::{Account, KeywordStatus};
use kwcrawl::scrapers::{JsonResponse, Transport};
use kwcrawl::services::{
    ChallengeResolver, ChallengeState, CrawlEvent, ResolverError, ShutdownSignal, StopReason,
    SurfaceSelector,
};
use kwcrawl::{CrawlError, Result};

/// Fake container API.
///
/// Page 1 of the media endpoint returns one user whose name is
/// `<keyword>-host`; page 1 of the contributors endpoint returns one
/// contributor unless the keyword is listed in `no_contributors`. Later pages
/// are empty. The first `blocked_calls` requests hit the risk-control block.
#[derive(Default)]
struct FakeApi {
    blocked_calls: usize,
    no_contributors: HashSet<String>,
    calls: Mutex<Vec<(Instant, String)>>,
}

impl FakeApi {
    fn blocked_for(calls: usize) -> Self {
        Self {
            blocked_calls: calls,
            ..Self::default()
        }
    }

    fn without_contributors(keywords: &[&str]) -> Self {
        Self {
            no_contributors: keywords.iter().map(|k| k.to_string()).collect(),
            ..Self::default()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

/// (containerid, keyword, page) of a request URL.
fn decode_request(url: &str) -> (String, String, u32) {
    let parsed = url::Url::parse(url).unwrap();
    let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
    let containerid = params["containerid"].clone();
    let page = params["page"].parse().unwrap();
    let query = containerid
        .split('&')
        .find_map(|part| part.strip_prefix("q="))
        .map(|q| urlencoding::decode(q).unwrap().into_owned())
        .unwrap_or_default();
    let keyword = query.trim_matches('#').to_string();
    (containerid, keyword, page)
}

fn user_page(user: Value) -> Value {
    json!({
        "ok": 1,
        "data": {
            "cardlistInfo": {"total": 1},
            "cards": [{"card_group": [user]}]
        }
    })
}

#[async_trait]
impl Transport for FakeApi {
    async fn get_json(&self, url: &str) -> Result<JsonResponse> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((Instant::now(), url.to_string()));
            calls.len()
        };
        if seen <= self.blocked_calls {
            return Ok(JsonResponse::new(200, json!({"ok": -100})));
        }

        let (containerid, keyword, page) = decode_request(url);
        if page > 1 {
            return Ok(JsonResponse::new(200, json!({"ok": 1, "data": {"cards": []}})));
        }
        let payload = if containerid.starts_with("100103") {
            user_page(json!({
                "card_type": 10,
                "user": {"id": 1001, "screen_name": format!("{}-host", keyword)}
            }))
        } else if self.no_contributors.contains(&keyword) {
            json!({"ok": 1, "data": {"cards": []}})
        } else {
            user_page(json!({
                "card_type": 10,
                "user": {"id": 2002, "screen_name": "fan"},
                "desc1": "贡献值 12"
            }))
        };
        Ok(JsonResponse::new(200, payload))
    }
}

/// Challenge surface that reports the scripted states in order, then clear.
#[derive(Default)]
struct ScriptedSurface {
    states: Mutex<VecDeque<ChallengeState>>,
    refreshes: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedSurface {
    fn with_states(states: Vec<ChallengeState>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChallengeResolver for ScriptedSurface {
    fn supports_inspection(&self, _selector: &SurfaceSelector) -> bool {
        true
    }

    async fn refresh(&self, _selector: &SurfaceSelector) -> std::result::Result<(), ResolverError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_state(
        &self,
        _selector: &SurfaceSelector,
    ) -> std::result::Result<ChallengeState, ResolverError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.states.lock().unwrap().pop_front();
        Ok(next.unwrap_or(ChallengeState::Cleared))
    }

    async fn current_location(
        &self,
        _selector: &SurfaceSelector,
    ) -> std::result::Result<String, ResolverError> {
        Ok("https://m.weibo.cn/".to_string())
    }
}

fn settings_in(dir: &Path, tweak: impl FnOnce(&mut RunArgs)) -> Settings {
    let mut args = RunArgs {
        csv: Some("keywords.csv".into()),
        accounts: Some("accounts.json".into()),
        state_db: Some(dir.join("state.db")),
        output: Some(dir.join("results.jsonl")),
        ..RunArgs::default()
    };
    tweak(&mut args);
    Settings::merge(&args, FileConfig::default()).unwrap()
}

fn context(
    settings: Settings,
    keywords: &[&str],
    apis: &[(&str, Arc<FakeApi>)],
    surface: Arc<ScriptedSurface>,
) -> CrawlContext {
    let accounts: Vec<Account> = apis
        .iter()
        .map(|(name, _)| Account::new(*name, "SUB=test", 2.0))
        .collect();
    let by_name: HashMap<String, Arc<FakeApi>> = apis
        .iter()
        .map(|(name, api)| (name.to_string(), api.clone()))
        .collect();

    CrawlContext::assemble(
        settings,
        keywords.iter().map(|k| k.to_string()).collect(),
        accounts,
        move |account| {
            let api = by_name
                .get(&account.name)
                .cloned()
                .ok_or_else(|| CrawlError::config("unknown account"))?;
            Ok(api as Arc<dyn Transport>)
        },
        surface,
    )
    .unwrap()
}

fn result_lines(dir: &Path) -> Vec<Value> {
    match fs::read_to_string(dir.join("results.jsonl")) {
        Ok(text) => text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_keywords_found_across_two_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let first = Arc::new(FakeApi::default());
    let second = Arc::new(FakeApi::default());
    let settings = settings_in(dir.path(), |a| a.concurrency = Some(2));
    let ctx = context(
        settings,
        &["alpha", "beta", "gamma"],
        &[("acc1", first.clone()), ("acc2", second.clone())],
        Arc::new(ScriptedSurface::default()),
    );

    let scheduler = ctx.scheduler(ShutdownSignal::never());
    assert_eq!(scheduler.worker_count(), 2);
    let summary = scheduler.run(&ctx.keywords, None).await.unwrap();

    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.found, 3);
    assert_eq!(summary.remaining, 0);

    // Two pages per endpoint: one with an item, one empty.
    assert_eq!(first.call_count() + second.call_count(), 12);

    let lines = result_lines(dir.path());
    assert_eq!(lines.len(), 3);
    let mut keywords: Vec<&str> = lines.iter().map(|l| l["keyword"].as_str().unwrap()).collect();
    keywords.sort();
    assert_eq!(keywords, vec!["alpha", "beta", "gamma"]);
    for line in &lines {
        assert_eq!(line["found"], json!(true));
        let keyword = line["keyword"].as_str().unwrap();
        assert_eq!(line["host"], json!(format!("{}-host", keyword)));
        assert_eq!(line["media_publish_count"], json!(1));
        assert_eq!(line["top_contributors"][0]["contribution_value"], json!(12));
        assert!(line.get("account").is_none());
    }

    let store = ctx.store.lock().await;
    assert_eq!(store.list_done().unwrap().len(), 3);
    assert_eq!(store.status_counts().unwrap().count(KeywordStatus::Success), 3);
}

#[tokio::test(start_paused = true)]
async fn test_requests_on_one_account_are_spaced() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default());
    let settings = settings_in(dir.path(), |_| {});
    let ctx = context(
        settings,
        &["alpha", "beta", "gamma"],
        &[("only", api.clone())],
        Arc::new(ScriptedSurface::default()),
    );

    ctx.scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, None)
        .await
        .unwrap();

    let times = api.call_times();
    assert_eq!(times.len(), 12);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn test_risk_block_passes_gate_and_retries_once() {
    let dir = tempfile::tempdir().unwrap();
    // Both query variants of the first attempt are blocked.
    let api = Arc::new(FakeApi::blocked_for(2));
    let surface = Arc::new(ScriptedSurface::with_states(vec![
        ChallengeState::Pending,
        ChallengeState::Cleared,
    ]));
    let settings = settings_in(dir.path(), |a| {
        a.max_retries = Some(1);
        a.refresh_on_not_found = true;
        a.refresh_wait = Some(0.0);
    });
    let ctx = context(settings, &["alpha"], &[("only", api.clone())], surface.clone());

    let (tx, mut rx) = tokio::sync::mpsc::channel(100);
    let summary = ctx
        .scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, Some(tx))
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.gated, 1);
    assert_eq!(summary.found, 1);
    assert_eq!(surface.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(surface.polls.load(Ordering::SeqCst), 2);
    // Two blocked requests, then four for the retried keyword.
    assert_eq!(api.call_count(), 6);

    let mut gate_cycles = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CrawlEvent::GateLeft {
            cycles, cleared, ..
        } = event
        {
            assert!(cleared);
            gate_cycles.push(cycles);
        }
    }
    assert_eq!(gate_cycles, vec![1]);

    // Only the retry's outcome is persisted.
    let lines = result_lines(dir.path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["found"], json!(true));
    let record = ctx.store.lock().await.get_record("alpha").unwrap().unwrap();
    assert_eq!(record.status, KeywordStatus::Success);
    assert_eq!(record.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_gate_that_stays_blocked_persists_the_retry() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::blocked_for(usize::MAX));
    let surface = Arc::new(ScriptedSurface::default());
    let settings = settings_in(dir.path(), |a| {
        a.max_retries = Some(1);
        a.refresh_on_not_found = true;
        a.refresh_wait = Some(0.0);
        a.max_rounds = Some(1);
    });
    let ctx = context(settings, &["alpha"], &[("only", api.clone())], surface.clone());

    let (tx, mut rx) = tokio::sync::mpsc::channel(100);
    let summary = ctx
        .scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, Some(tx))
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::MaxRounds);
    assert_eq!(summary.gated, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(surface.refreshes.load(Ordering::SeqCst), 1);
    // Two blocked variants before the gate, two more on the retry.
    assert_eq!(api.call_count(), 4);

    let mut finished = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CrawlEvent::KeywordFinished { account, error, .. } = event {
            finished.push((account, error));
        }
    }
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0.as_deref(), Some("only"));
    assert!(finished[0]
        .1
        .as_deref()
        .unwrap()
        .starts_with("RiskControlBlocked"));

    let lines = result_lines(dir.path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["found"], json!(false));
    let record = ctx.store.lock().await.get_record("alpha").unwrap().unwrap();
    assert_eq!(record.status, KeywordStatus::Failed);
    assert_eq!(record.retries, 1);
    assert!(record.error.starts_with("RiskControlBlocked"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_gate_error_replaces_first_error() {
    let dir = tempfile::tempdir().unwrap();
    // The first attempt is blocked; the retry gets through but finds no contributors.
    let api = Arc::new(FakeApi {
        blocked_calls: 2,
        ..FakeApi::without_contributors(&["alpha"])
    });
    let settings = settings_in(dir.path(), |a| {
        a.max_retries = Some(1);
        a.refresh_on_not_found = true;
        a.refresh_wait = Some(0.0);
        a.max_rounds = Some(1);
    });
    let ctx = context(
        settings,
        &["alpha"],
        &[("only", api.clone())],
        Arc::new(ScriptedSurface::default()),
    );

    ctx.scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, None)
        .await
        .unwrap();

    assert_eq!(result_lines(dir.path()).len(), 1);
    let record = ctx.store.lock().await.get_record("alpha").unwrap().unwrap();
    assert_eq!(record.retries, 1);
    assert!(record.error.starts_with("EmptyResult"));
}

#[tokio::test(start_paused = true)]
async fn test_workers_share_the_queue_fairly() {
    let dir = tempfile::tempdir().unwrap();
    let first = Arc::new(FakeApi::default());
    let second = Arc::new(FakeApi::default());
    let settings = settings_in(dir.path(), |a| a.concurrency = Some(2));
    let keywords = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let ctx = context(
        settings,
        &keywords,
        &[("acc1", first), ("acc2", second)],
        Arc::new(ScriptedSurface::default()),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(100);
    let summary = ctx
        .scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, Some(tx))
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.processed, 5);

    let mut per_worker: HashMap<usize, usize> = HashMap::new();
    while let Ok(event) = rx.try_recv() {
        if let CrawlEvent::KeywordFinished { worker_id, .. } = event {
            *per_worker.entry(worker_id).or_default() += 1;
        }
    }
    assert_eq!(per_worker.values().sum::<usize>(), 5);
    assert!(per_worker.values().all(|&n| n <= 3));
    assert_eq!(result_lines(dir.path()).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_gate_without_retry_persists_the_failure() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::blocked_for(2));
    let surface = Arc::new(ScriptedSurface::default());
    let settings = settings_in(dir.path(), |a| {
        a.max_retries = Some(1);
        a.refresh_on_not_found = true;
        a.no_retry_false_after_verify = true;
        a.refresh_wait = Some(0.0);
        a.max_rounds = Some(1);
    });
    let ctx = context(settings, &["alpha"], &[("only", api.clone())], surface.clone());

    let summary = ctx
        .scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, None)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::MaxRounds);
    assert_eq!(summary.remaining, 1);
    assert_eq!(surface.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(api.call_count(), 2);

    let record = ctx.store.lock().await.get_record("alpha").unwrap().unwrap();
    assert_eq!(record.status, KeywordStatus::Failed);
    assert_eq!(record.retries, 1);
    assert!(record.error.starts_with("RiskControlBlocked"));
}

#[tokio::test(start_paused = true)]
async fn test_rounds_repeat_until_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::without_contributors(&["ghost"]));
    let settings = settings_in(dir.path(), |a| {
        a.max_retries = Some(1);
        a.max_rounds = Some(3);
    });
    let ctx = context(
        settings,
        &["alpha", "ghost"],
        &[("only", api.clone())],
        Arc::new(ScriptedSurface::default()),
    );

    let summary = ctx
        .scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, None)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::MaxRounds);
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.remaining, 1);
    assert_eq!(summary.processed, 4);

    let store = ctx.store.lock().await;
    let ghost = store.get_record("ghost").unwrap().unwrap();
    assert_eq!(ghost.status, KeywordStatus::Failed);
    assert_eq!(ghost.retries, 3);
    assert!(ghost.error.starts_with("EmptyResult"));
    assert!(store.is_done("alpha").unwrap());
    drop(store);

    // One line per persisted attempt.
    assert_eq!(result_lines(dir.path()).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_done_keywords() {
    let dir = tempfile::tempdir().unwrap();
    {
        let api = Arc::new(FakeApi::default());
        let ctx = context(
            settings_in(dir.path(), |_| {}),
            &["alpha", "beta"],
            &[("only", api)],
            Arc::new(ScriptedSurface::default()),
        );
        let summary = ctx
            .scheduler(ShutdownSignal::never())
            .run(&ctx.keywords, None)
            .await
            .unwrap();
        assert_eq!(summary.remaining, 0);
    }

    let api = Arc::new(FakeApi::default());
    let ctx = context(
        settings_in(dir.path(), |_| {}),
        &["alpha", "beta"],
        &[("only", api.clone())],
        Arc::new(ScriptedSurface::default()),
    );
    assert_eq!(ctx.done_count().await.unwrap(), 2);
    let summary = ctx
        .scheduler(ShutdownSignal::never())
        .run(&ctx.keywords, None)
        .await
        .unwrap();

    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.rounds, 0);
    assert_eq!(api.call_count(), 0);
    assert_eq!(result_lines(dir.path()).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_start_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default());
    let ctx = context(
        settings_in(dir.path(), |_| {}),
        &["alpha"],
        &[("only", api.clone())],
        Arc::new(ScriptedSurface::default()),
    );

    let (tx, shutdown) = ShutdownSignal::channel();
    tx.send(true).unwrap();
    let summary = ctx.scheduler(shutdown).run(&ctx.keywords, None).await.unwrap();

    assert_eq!(summary.stop, StopReason::Shutdown);
    assert_eq!(summary.rounds, 0);
    assert_eq!(summary.remaining, 1);
    assert_eq!(api.call_count(), 0);
}
