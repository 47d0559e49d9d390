use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rusqlite::Connection;
use tracing::{error, info};

use crate::config::Config;
use crate::convert;
use crate::db::{self, EntityType};
use crate::extract;
use crate::fetch::{Fetcher, Scope, SyncMode};

pub struct RunOptions {
    pub mode: SyncMode,
    pub entities: Option<Vec<EntityType>>,
    pub skip_fetch: bool,
    pub skip_extract: bool,
    pub skip_convert: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            mode: SyncMode::Incremental,
            entities: None,
            skip_fetch: false,
            skip_extract: false,
            skip_convert: false,
        }
    }
}

#[derive(Debug)]
pub struct StageReport {
    pub name: &'static str,
    pub counts: Vec<(String, usize)>,
    pub failures: Vec<(String, String)>,
    pub elapsed_secs: f64,
}

impl StageReport {
    fn new(name: &'static str) -> Self {
        StageReport { name, counts: Vec::new(), failures: Vec::new(), elapsed_secs: 0.0 }
    }

    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn run_unit(&mut self, unit: &str, result: Result<usize>) {
        match result {
            Ok(n) => self.counts.push((unit.to_string(), n)),
            Err(e) => {
                error!("{} / {unit}: {e:#}", self.name);
                self.failures.push((unit.to_string(), format!("{e:#}")));
            }
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    /// Name of the failed stage that stopped the run, if any.
    pub aborted_after: Option<&'static str>,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn ok(&self) -> bool {
        self.aborted_after.is_none() && self.stages.iter().all(StageReport::ok)
    }

    pub fn print(&self) {
        for stage in &self.stages {
            println!("{} ({:.1}s):", stage.name, stage.elapsed_secs);
            for (unit, n) in &stage.counts {
                println!("  {unit:<14} {n}");
            }
            for (unit, err) in &stage.failures {
                println!("  {unit:<14} FAILED: {err}");
            }
        }
        if let Some(stage) = self.aborted_after {
            println!("Run aborted after failed {stage} stage.");
        }
    }
}

fn lease_ttl(cfg: &Config) -> Duration {
    // Crash timeout: twice the scheduler interval, at least an hour.
    Duration::from_secs((cfg.sync_interval_hours * 2 * 3600).max(3600))
}

fn selected(opts: &RunOptions, entity: EntityType) -> bool {
    opts.entities
        .as_ref()
        .map(|list| list.contains(&entity))
        .unwrap_or(true)
}

/// Fetch → Extract → Convert. Entities within a stage are isolated from
/// one another; a failed unit marks the stage failed and skips the later
/// stages, while commits already made stay durable.
pub async fn run(conn: &Connection, cfg: &Config, opts: &RunOptions) -> Result<RunReport> {
    if !db::acquire_lease(conn, cfg.connection_id, lease_ttl(cfg))? {
        bail!(
            "another sync run holds the lease for connection {}; try again later",
            cfg.connection_id
        );
    }
    let report = execute(conn, cfg, opts).await;
    db::release_lease(conn, cfg.connection_id)?;
    report
}

async fn execute(conn: &Connection, cfg: &Config, opts: &RunOptions) -> Result<RunReport> {
    let t0 = Instant::now();
    let mut stages = Vec::new();
    let mut aborted_after = None;

    if !opts.skip_fetch {
        let stage = fetch_stage(conn, cfg, opts).await?;
        let failed = !stage.ok();
        stages.push(stage);
        if failed {
            aborted_after = Some("fetch");
        }
    }

    if aborted_after.is_none() && !opts.skip_extract {
        let stage = extract_stage(conn, cfg, opts);
        let failed = !stage.ok();
        stages.push(stage);
        if failed {
            aborted_after = Some("extract");
        }
    }

    if aborted_after.is_none() && !opts.skip_convert {
        let stage = convert_stage(conn, cfg);
        stages.push(stage);
    }

    Ok(RunReport {
        stages,
        aborted_after,
        elapsed_secs: t0.elapsed().as_secs_f64(),
    })
}

async fn fetch_stage(conn: &Connection, cfg: &Config, opts: &RunOptions) -> Result<StageReport> {
    let t0 = Instant::now();
    let mut stage = StageReport::new("fetch");
    let mut fetcher = Fetcher::new(cfg)?;

    for entity in EntityType::METADATA {
        if !selected(opts, entity) {
            continue;
        }
        let result = fetcher.collect_metadata(conn, entity).await;
        stage.run_unit(entity.as_str(), result);
    }

    for entity in [EntityType::Projects, EntityType::Users] {
        if !selected(opts, entity) {
            continue;
        }
        let result = fetcher.collect(conn, entity, None, opts.mode).await;
        stage.run_unit(entity.as_str(), result);
    }

    for entity in [EntityType::WorkPackages, EntityType::TimeEntries, EntityType::Versions] {
        if !selected(opts, entity) {
            continue;
        }
        if cfg.projects.is_empty() {
            let result = fetcher.collect(conn, entity, None, opts.mode).await;
            stage.run_unit(entity.as_str(), result);
        } else {
            let mut total = 0usize;
            let mut failed = None;
            for &project in &cfg.projects {
                let scope = Scope::Project(project);
                match fetcher.collect(conn, entity, Some(&scope), opts.mode).await {
                    Ok(n) => total += n,
                    Err(e) => {
                        failed = Some(Err(e));
                        break;
                    }
                }
            }
            stage.run_unit(entity.as_str(), failed.unwrap_or(Ok(total)));
        }
    }

    info!("fetch stage done in {:.1}s", t0.elapsed().as_secs_f64());
    stage.elapsed_secs = t0.elapsed().as_secs_f64();
    Ok(stage)
}

fn extract_stage(conn: &Connection, cfg: &Config, opts: &RunOptions) -> StageReport {
    let t0 = Instant::now();
    let mut stage = StageReport::new("extract");

    for entity in EntityType::ALL {
        if !selected(opts, entity) {
            continue;
        }
        let result = extract::extract(conn, cfg.connection_id, entity);
        stage.run_unit(entity.as_str(), result);
    }
    stage.run_unit(
        "repair",
        extract::repair_references(conn, cfg.connection_id).map(|()| 0),
    );

    stage.elapsed_secs = t0.elapsed().as_secs_f64();
    stage
}

fn convert_stage(conn: &Connection, cfg: &Config) -> StageReport {
    let t0 = Instant::now();
    let mut stage = StageReport::new("convert");

    stage.run_unit("boards", convert::convert_boards(conn, cfg));
    stage.run_unit("accounts", convert::convert_accounts(conn, cfg));
    stage.run_unit("sprints", convert::convert_sprints(conn, cfg));
    stage.run_unit("issues", convert::convert_issues(conn, cfg));
    stage.run_unit("worklogs", convert::convert_worklogs(conn, cfg));
    stage.run_unit("board_issues", convert::convert_board_issues(conn, cfg));
    stage.run_unit("sprint_issues", convert::convert_sprint_issues(conn, cfg));

    stage.elapsed_secs = t0.elapsed().as_secs_f64();
    stage
}

// ── Tests ──
