use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{self, EntityType};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy)]
pub enum Scope {
    Project(i64),
    WorkPackage(i64),
}

// ── Rate limiter ──

/// Request budget over a rolling 60 s window plus a fixed minimum gap
/// between consecutive requests. Pure over `Instant` so the policy is
/// testable without sleeping; `acquire` performs the actual waits.
pub struct RateLimiter {
    rpm: u32,
    min_interval: Duration,
    window_start: Option<Instant>,
    count: u32,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        RateLimiter {
            rpm,
            min_interval: Duration::from_secs_f64(60.0 / rpm.max(1) as f64),
            window_start: None,
            count: 0,
            last: None,
        }
    }

    /// Sleep demanded by the window budget for a request at `now`.
    pub fn budget_delay(&mut self, now: Instant) -> Duration {
        match self.window_start {
            None => Duration::ZERO,
            Some(start) if now.duration_since(start) >= RATE_WINDOW => {
                self.window_start = Some(now);
                self.count = 0;
                Duration::ZERO
            }
            Some(start) if self.count >= self.rpm => {
                (start + RATE_WINDOW).saturating_duration_since(now)
            }
            Some(_) => Duration::ZERO,
        }
    }

    /// Extra spacing so consecutive requests stay `60/rpm` apart.
    pub fn pacing_delay(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => (last + self.min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Record a request actually issued at `now`.
    pub fn record(&mut self, now: Instant) {
        match self.window_start {
            None => {
                self.window_start = Some(now);
                self.count = 0;
            }
            Some(start) if now.duration_since(start) >= RATE_WINDOW => {
                self.window_start = Some(now);
                self.count = 0;
            }
            Some(_) => {}
        }
        self.count += 1;
        self.last = Some(now);
    }

    pub async fn acquire(&mut self) {
        let now = Instant::now();
        let delay = self.budget_delay(now).max(self.pacing_delay(now));
        if delay > Duration::ZERO {
            debug!("rate limit: waiting {:.1}s", delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }
        self.record(Instant::now());
    }
}

// ── Retry policy ──

/// What one attempt's HTTP status means for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Success,
    /// Server back-pressure: wait this many seconds, no attempt consumed.
    RateLimited(u64),
    /// Worth retrying with backoff (5xx, timeouts, connection errors).
    Transient(String),
    /// Client-side error: retrying cannot help.
    Fatal(String),
}

impl Disposition {
    fn describe(&self) -> String {
        match self {
            Disposition::Success => "success".into(),
            Disposition::RateLimited(wait) => format!("rate limited, Retry-After {wait}s"),
            Disposition::Transient(msg) | Disposition::Fatal(msg) => msg.clone(),
        }
    }
}

fn classify_status(status: u16, retry_after: Option<&str>) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        429 => Disposition::RateLimited(retry_after_secs(retry_after)),
        500..=599 => Disposition::Transient(format!("server error {status}")),
        other => Disposition::Fatal(format!("client error {other}")),
    }
}

/// Sleep before the next try, or None when the retry budget is spent.
/// Rate-limit waits never consume the budget; fatal outcomes never wait.
fn next_retry_delay(disposition: &Disposition, attempt: &mut u32, budget: u32) -> Option<Duration> {
    match disposition {
        Disposition::RateLimited(wait) => Some(Duration::from_secs(*wait)),
        Disposition::Transient(_) => {
            if *attempt + 1 >= budget {
                None
            } else {
                let delay = backoff_delay(*attempt);
                *attempt += 1;
                Some(delay)
            }
        }
        Disposition::Success | Disposition::Fatal(_) => None,
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

fn retry_after_secs(header: Option<&str>) -> u64 {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

// ── Filter predicates ──

/// OpenProject `filters` query parameter: a JSON array of single-field
/// `{field: {operator, values}}` objects.
pub fn build_filters(scope: Option<&Scope>, hwm: Option<&str>) -> Vec<Value> {
    let mut filters = Vec::new();
    match scope {
        Some(Scope::Project(id)) => {
            filters.push(json!({"project": {"operator": "=", "values": [id.to_string()]}}));
        }
        Some(Scope::WorkPackage(id)) => {
            filters.push(json!({"workPackage": {"operator": "=", "values": [id.to_string()]}}));
        }
        None => {}
    }
    if let Some(hwm) = hwm {
        filters.push(json!({"updatedAt": {"operator": ">=", "values": [hwm]}}));
    }
    filters
}

/// Filter predicates for one collection request. The versions endpoint
/// rejects the `filters` parameter outright (its project scope travels
/// in the path), so it gets none.
fn entity_filters(entity: EntityType, scope: Option<&Scope>, hwm: Option<&str>) -> Vec<Value> {
    if entity == EntityType::Versions {
        return Vec::new();
    }
    build_filters(scope, hwm)
}

/// Whether pagination is finished after a page of `page_len` elements,
/// given `fetched` cumulative elements and the API-reported `total`.
fn page_complete(page_len: usize, fetched: usize, total: u64) -> bool {
    page_len == 0 || (total > 0 && fetched as u64 >= total)
}

// ── Fetcher ──

struct PageOutcome {
    data: Option<Value>,
    error: Option<String>,
}

pub struct Fetcher<'a> {
    cfg: &'a Config,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl<'a> Fetcher<'a> {
    pub fn new(cfg: &'a Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .context("building HTTP client")?;
        Ok(Fetcher {
            cfg,
            client,
            limiter: RateLimiter::new(cfg.rate_limit_rpm),
        })
    }

    /// One GET with the retry policy: transient failures (timeout, 5xx)
    /// back off exponentially up to `retry_attempts`; 429 honors the
    /// server's Retry-After without consuming an attempt; other 4xx fail
    /// immediately. The final outcome is returned, never raised.
    async fn request_page(&mut self, url: &str, params: &[(&str, String)]) -> PageOutcome {
        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;
            let sent = self
                .client
                .get(url)
                .basic_auth("apikey", Some(&self.cfg.api_key))
                .query(params)
                .send()
                .await;

            let disposition = match sent {
                Ok(resp) => {
                    let retry_after = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let disposition = classify_status(resp.status().as_u16(), retry_after.as_deref());
                    if disposition == Disposition::Success {
                        return match resp.json::<Value>().await {
                            Ok(data) => PageOutcome { data: Some(data), error: None },
                            Err(e) => PageOutcome {
                                data: None,
                                error: Some(format!("invalid JSON body: {e}")),
                            },
                        };
                    }
                    disposition
                }
                Err(e) if e.is_timeout() => Disposition::Transient(format!("request timed out: {e}")),
                Err(e) => Disposition::Transient(format!("request failed: {e}")),
            };

            if let Disposition::Fatal(msg) = &disposition {
                return PageOutcome { data: None, error: Some(msg.clone()) };
            }
            match next_retry_delay(&disposition, &mut attempt, self.cfg.retry_attempts) {
                Some(delay) => {
                    warn!("{} from {url}, retrying in {}s", disposition.describe(), delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return PageOutcome {
                        data: None,
                        error: Some(format!(
                            "{} (after {} attempts)",
                            disposition.describe(),
                            attempt + 1
                        )),
                    };
                }
            }
        }
    }

    fn store_page(
        &self,
        conn: &Connection,
        entity: EntityType,
        url: &str,
        params: &Map<String, Value>,
        scope: Option<&Scope>,
        outcome: &PageOutcome,
    ) -> Result<()> {
        let input = scope.map(|s| match s {
            Scope::Project(id) => json!({"project_id": id}).to_string(),
            Scope::WorkPackage(id) => json!({"work_package_id": id}).to_string(),
        });
        db::insert_raw(
            conn,
            entity,
            &db::RawPageRow {
                connection_id: self.cfg.connection_id,
                params: Value::Object(params.clone()).to_string(),
                url: url.to_string(),
                input,
                data: outcome.data.as_ref().map(Value::to_string),
                error: outcome.error.clone(),
                created_at: db::now_ts(),
            },
        )
    }

    /// Page through one collection endpoint, persisting every page
    /// outcome verbatim before moving on. Returns collected elements;
    /// a failed page stops this entity's loop without raising.
    pub async fn collect(
        &mut self,
        conn: &Connection,
        entity: EntityType,
        scope: Option<&Scope>,
        mode: SyncMode,
    ) -> Result<usize> {
        let filterable = entity != EntityType::Versions;
        let hwm = match mode {
            SyncMode::Incremental if filterable => {
                db::last_successful_fetch(conn, entity, self.cfg.connection_id)?
            }
            _ => None,
        };
        if let Some(hwm) = &hwm {
            info!("{entity}: incremental fetch since {hwm}");
        }
        let filters = entity_filters(entity, scope, hwm.as_deref());
        let filters_json = if filters.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&filters)?)
        };

        let endpoint = match (entity, scope) {
            (EntityType::Versions, Some(Scope::Project(id))) => {
                format!("/api/v3/projects/{id}/versions")
            }
            _ => entity.endpoint().to_string(),
        };
        let url = format!("{}{}", self.cfg.base_url, endpoint);

        let mut fetched = 0usize;
        let mut page: u32 = 1;
        while page <= self.cfg.max_pages_per_collection {
            let mut query: Vec<(&str, String)> = vec![
                ("pageSize", self.cfg.page_size.to_string()),
                ("offset", page.to_string()),
            ];
            if let Some(f) = &filters_json {
                query.push(("filters", f.clone()));
            }
            let mut params = Map::new();
            for (k, v) in &query {
                params.insert((*k).to_string(), Value::String(v.clone()));
            }

            let outcome = self.request_page(&url, &query).await;
            self.store_page(conn, entity, &url, &params, scope, &outcome)?;

            let Some(data) = outcome.data else {
                warn!(
                    "{entity}: page {page} failed ({}), stopping this entity",
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                break;
            };

            let page_len = data
                .pointer("/_embedded/elements")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            fetched += page_len;
            let total = data.get("total").and_then(Value::as_u64).unwrap_or(0);
            debug!("{entity}: page {page}, {page_len} elements, {fetched}/{total}");

            if page_complete(page_len, fetched, total) {
                break;
            }
            page += 1;
        }
        if page > self.cfg.max_pages_per_collection {
            warn!(
                "{entity}: stopped at page cap {}",
                self.cfg.max_pages_per_collection
            );
        }
        Ok(fetched)
    }

    /// Single-shot metadata endpoint. The activities endpoint moved
    /// between OpenProject releases, so that one probes both paths.
    pub async fn collect_metadata(&mut self, conn: &Connection, entity: EntityType) -> Result<usize> {
        let endpoints: &[&str] = if entity == EntityType::Activities {
            &["/api/v3/time_entries/activities", "/api/v3/activities"]
        } else {
            &[entity.endpoint()]
        };

        let query: Vec<(&str, String)> = Vec::new();
        for endpoint in endpoints {
            let url = format!("{}{}", self.cfg.base_url, endpoint);
            let outcome = self.request_page(&url, &query).await;
            self.store_page(conn, entity, &url, &Map::new(), None, &outcome)?;
            if let Some(data) = outcome.data {
                let n = data
                    .pointer("/_embedded/elements")
                    .and_then(Value::as_array)
                    .map(|a| a.len())
                    .unwrap_or(0);
                return Ok(n);
            }
        }
        warn!("{entity}: no endpoint responded, skipping");
        Ok(0)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_blocks_once_past_the_budget() {
        let mut rl = RateLimiter::new(60);
        let t0 = Instant::now();
        let mut t = t0;
        let mut sleeps = Vec::new();
        for i in 1..=65u32 {
            let d = rl.budget_delay(t);
            if d > Duration::ZERO {
                sleeps.push((i, d));
                t += d;
            }
            rl.record(t);
        }
        // Exactly one blocking sleep, before request #61, of the window remainder.
        assert_eq!(sleeps.len(), 1);
        assert_eq!(sleeps[0].0, 61);
        assert_eq!(sleeps[0].1, RATE_WINDOW);
    }

    #[test]
    fn window_slides_after_sixty_seconds() {
        let mut rl = RateLimiter::new(2);
        let t0 = Instant::now();
        rl.record(t0);
        rl.record(t0);
        assert!(rl.budget_delay(t0 + Duration::from_secs(1)) > Duration::ZERO);
        assert_eq!(rl.budget_delay(t0 + Duration::from_secs(60)), Duration::ZERO);
    }

    #[test]
    fn pacing_enforces_minimum_gap() {
        let mut rl = RateLimiter::new(60);
        let t0 = Instant::now();
        assert_eq!(rl.pacing_delay(t0), Duration::ZERO);
        rl.record(t0);
        assert_eq!(rl.pacing_delay(t0), Duration::from_secs(1));
        assert_eq!(rl.pacing_delay(t0 + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn filters_shape_matches_the_api() {
        let filters = build_filters(Some(&Scope::Project(7)), Some("2024-01-01T00:00:00Z"));
        let rendered = serde_json::to_string(&filters).unwrap();
        assert_eq!(
            rendered,
            r#"[{"project":{"operator":"=","values":["7"]}},{"updatedAt":{"operator":">=","values":["2024-01-01T00:00:00Z"]}}]"#
        );
        assert!(build_filters(None, None).is_empty());
    }

    #[test]
    fn pagination_stops_on_total_and_empty() {
        // 242 elements at page size 100: full, full, partial.
        assert!(!page_complete(100, 100, 242));
        assert!(!page_complete(100, 200, 242));
        assert!(page_complete(42, 242, 242));
        // Empty page always terminates, even with a bogus total.
        assert!(page_complete(0, 0, 9999));
        // Missing total keeps going until an empty page.
        assert!(!page_complete(100, 500, 0));
    }

    #[test]
    fn versions_endpoint_carries_no_filters() {
        // Project scope is in the path and updatedAt is unsupported there.
        let filters = entity_filters(
            EntityType::Versions,
            Some(&Scope::Project(7)),
            Some("2024-01-01T00:00:00Z"),
        );
        assert!(filters.is_empty());

        // Other paged entities keep both predicates.
        let filters = entity_filters(
            EntityType::WorkPackages,
            Some(&Scope::Project(7)),
            Some("2024-01-01T00:00:00Z"),
        );
        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(200, None), Disposition::Success);
        assert_eq!(classify_status(204, None), Disposition::Success);
        assert_eq!(classify_status(429, Some("30")), Disposition::RateLimited(30));
        assert_eq!(
            classify_status(429, None),
            Disposition::RateLimited(DEFAULT_RETRY_AFTER_SECS)
        );
        assert!(matches!(classify_status(500, None), Disposition::Transient(_)));
        assert!(matches!(classify_status(503, None), Disposition::Transient(_)));
        assert!(matches!(classify_status(403, None), Disposition::Fatal(_)));
        assert!(matches!(classify_status(404, None), Disposition::Fatal(_)));
    }

    #[test]
    fn rate_limit_waits_do_not_consume_the_retry_budget() {
        let budget = 3;
        let mut attempt = 0;
        let transient = Disposition::Transient("server error 503".into());

        // First transient failure backs off and spends an attempt.
        assert_eq!(
            next_retry_delay(&transient, &mut attempt, budget),
            Some(Duration::from_secs(1))
        );
        assert_eq!(attempt, 1);

        // A 429 in between waits the server's interval but spends nothing.
        let limited = Disposition::RateLimited(60);
        assert_eq!(
            next_retry_delay(&limited, &mut attempt, budget),
            Some(Duration::from_secs(60))
        );
        assert_eq!(attempt, 1);

        // The remaining budget still allows one more backoff, then stops.
        assert_eq!(
            next_retry_delay(&transient, &mut attempt, budget),
            Some(Duration::from_secs(2))
        );
        assert_eq!(next_retry_delay(&transient, &mut attempt, budget), None);

        // Fatal outcomes never wait.
        let fatal = Disposition::Fatal("client error 403".into());
        assert_eq!(next_retry_delay(&fatal, &mut 0, budget), None);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn retry_after_parses_or_defaults() {
        assert_eq!(retry_after_secs(Some("30")), 30);
        assert_eq!(retry_after_secs(Some(" 5 ")), 5);
        assert_eq!(retry_after_secs(Some("soon")), DEFAULT_RETRY_AFTER_SECS);
        assert_eq!(retry_after_secs(None), DEFAULT_RETRY_AFTER_SECS);
    }
}
