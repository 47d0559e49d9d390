use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

use crate::config::Config;
use crate::db::{self, EntityType};
use crate::extract::fields::parse_datetime;

/// Tool tag prefixed onto every canonical id.
pub const SOURCE_TAG: &str = "openproject";

pub fn domain_id(entity: EntityType, cid: i64, source_id: i64) -> String {
    format!("{SOURCE_TAG}:{}:{cid}:{source_id}", entity.domain_kind())
}

fn domain_prefix(entity: EntityType, cid: i64) -> String {
    format!("{SOURCE_TAG}:{}:{cid}:", entity.domain_kind())
}

/// Source type/status names to the fixed canonical vocabularies.
/// Unknown names fall back rather than fail: analytics prefers a coarse
/// bucket over a dropped row.
pub struct Taxonomy<'a> {
    types: &'a BTreeMap<String, String>,
    statuses: &'a BTreeMap<String, String>,
}

impl<'a> Taxonomy<'a> {
    pub fn from_config(cfg: &'a Config) -> Self {
        Taxonomy {
            types: &cfg.type_mappings,
            statuses: &cfg.status_mappings,
        }
    }

    pub fn map_type(&self, name: &str) -> String {
        self.types.get(name).cloned().unwrap_or_else(|| "REQUIREMENT".into())
    }

    pub fn map_status(&self, name: &str) -> String {
        self.statuses.get(name).cloned().unwrap_or_else(|| "TODO".into())
    }
}

fn minutes(hours: Option<f64>) -> Option<i64> {
    hours.map(|h| (h * 60.0) as i64)
}

fn lead_time_minutes(created: Option<&str>, updated: Option<&str>) -> Option<i64> {
    let created = parse_datetime(created?)?;
    let updated = parse_datetime(updated?)?;
    Some((updated - created).num_minutes())
}

/// Pure per-row conversion, the heart of the issue mapping.
pub fn issue_from_work_package(
    base_url: &str,
    cid: i64,
    tax: &Taxonomy,
    wp: &db::WorkPackageRow,
) -> db::Issue {
    let original_type = wp.type_name.clone().unwrap_or_else(|| "Task".into());
    let original_status = wp.status_name.clone().unwrap_or_else(|| "New".into());

    // A closed source status is terminal regardless of the name map.
    let status = if wp.status_is_closed {
        "DONE".to_string()
    } else {
        tax.map_status(&original_status)
    };
    let done = status == "DONE";

    let estimate = minutes(wp.estimated_hours);
    let spent = minutes(wp.spent_hours);
    let remaining = match (estimate, spent) {
        (Some(e), Some(s)) => Some((e - s).max(0)),
        _ => None,
    };

    db::Issue {
        id: domain_id(EntityType::WorkPackages, cid, wp.id),
        issue_key: format!("WP-{}", wp.id),
        url: format!("{base_url}/work_packages/{}", wp.id),
        title: wp.subject.clone(),
        description: wp.description.clone(),
        issue_type: tax.map_type(&original_type),
        original_type,
        status,
        original_status,
        resolution_date: if done { wp.updated_at.clone() } else { None },
        created_date: wp.created_at.clone(),
        updated_date: wp.updated_at.clone(),
        lead_time_minutes: if done {
            lead_time_minutes(wp.created_at.as_deref(), wp.updated_at.as_deref())
        } else {
            None
        },
        time_estimate_minutes: estimate,
        time_spent_minutes: spent,
        time_remaining_minutes: remaining,
        parent_issue_id: wp.parent_id.map(|p| domain_id(EntityType::WorkPackages, cid, p)),
        priority: wp.priority_name.clone(),
        severity: wp.priority_name.clone(),
        component: wp.category_name.clone(),
        creator_id: wp.author_id.map(|u| domain_id(EntityType::Users, cid, u)),
        creator_name: wp.author_name.clone(),
        assignee_id: wp.assignee_id.map(|u| domain_id(EntityType::Users, cid, u)),
        assignee_name: wp.assignee_name.clone(),
        original_project: wp.project_name.clone(),
    }
}

// ── Per-table conversions ──

pub fn convert_boards(conn: &Connection, cfg: &Config) -> Result<usize> {
    let cid = cfg.connection_id;
    let boards: Vec<db::Board> = db::fetch_projects(conn, cid)?
        .iter()
        .map(|p| {
            let slug = if p.identifier.is_empty() {
                p.id.to_string()
            } else {
                p.identifier.clone()
            };
            db::Board {
                id: domain_id(EntityType::Projects, cid, p.id),
                name: p.name.clone(),
                description: p.description.clone(),
                url: format!("{}/projects/{slug}", cfg.base_url),
                created_date: p.created_at.clone(),
                board_type: "project".into(),
            }
        })
        .collect();
    db::save_boards(conn, &boards)
}

pub fn convert_accounts(conn: &Connection, cfg: &Config) -> Result<usize> {
    let cid = cfg.connection_id;
    let inactive = ["locked", "closed", "inactive"];
    let accounts: Vec<db::Account> = db::fetch_users(conn, cid)?
        .iter()
        .map(|u| {
            let active = u
                .status
                .as_deref()
                .map(|s| !inactive.contains(&s.to_lowercase().as_str()))
                .unwrap_or(true);
            db::Account {
                id: domain_id(EntityType::Users, cid, u.id),
                email: u.mail.clone(),
                full_name: u.name.clone(),
                user_name: u.login.clone(),
                avatar_url: u.avatar.clone(),
                status: if active { 1 } else { 0 },
            }
        })
        .collect();
    db::save_accounts(conn, &accounts)
}

pub fn convert_sprints(conn: &Connection, cfg: &Config) -> Result<usize> {
    let cid = cfg.connection_id;
    let identifiers: HashMap<i64, String> = db::fetch_projects(conn, cid)?
        .into_iter()
        .filter(|p| !p.identifier.is_empty())
        .map(|p| (p.id, p.identifier))
        .collect();
    let sprints: Vec<db::Sprint> = db::fetch_versions(conn, cid)?
        .iter()
        .map(|v| {
            let status = match v.status.as_str() {
                "open" => "active",
                "locked" | "closed" => "closed",
                _ => "active",
            };
            // Version pages live under the project identifier slug; the
            // numeric id only stands in when the project is unknown.
            let project_slug = v
                .project_id
                .and_then(|p| identifiers.get(&p).cloned())
                .or_else(|| v.project_id.map(|p| p.to_string()))
                .unwrap_or_else(|| "-".into());
            db::Sprint {
                id: domain_id(EntityType::Versions, cid, v.id),
                name: v.name.clone(),
                url: format!("{}/projects/{project_slug}/versions/{}", cfg.base_url, v.id),
                status: status.into(),
                started_date: v.start_date.clone().or_else(|| v.created_at.clone()),
                ended_date: v.due_date.clone(),
                completed_date: if status == "closed" { v.updated_at.clone() } else { None },
                original_board_id: v.project_id.map(|p| domain_id(EntityType::Projects, cid, p)),
            }
        })
        .collect();
    db::save_sprints(conn, &sprints)
}

pub fn convert_issues(conn: &Connection, cfg: &Config) -> Result<usize> {
    let cid = cfg.connection_id;
    let tax = Taxonomy::from_config(cfg);
    let issues: Vec<db::Issue> = db::fetch_work_packages(conn, cid)?
        .iter()
        .map(|wp| issue_from_work_package(&cfg.base_url, cid, &tax, wp))
        .collect();
    db::save_issues(conn, &issues)
}

pub fn convert_worklogs(conn: &Connection, cfg: &Config) -> Result<usize> {
    let cid = cfg.connection_id;
    let worklogs: Vec<db::Worklog> = db::fetch_time_entries(conn, cid)?
        .iter()
        .map(|te| db::Worklog {
            id: domain_id(EntityType::TimeEntries, cid, te.id),
            author_id: te.user_id.map(|u| domain_id(EntityType::Users, cid, u)),
            comment: te.comment.clone(),
            time_spent_minutes: minutes(te.hours),
            logged_date: te.created_at.clone(),
            started_date: te.spent_on.clone(),
            issue_id: te
                .work_package_id
                .map(|wp| domain_id(EntityType::WorkPackages, cid, wp)),
        })
        .collect();
    db::save_worklogs(conn, &worklogs)
}

pub fn convert_board_issues(conn: &Connection, cfg: &Config) -> Result<usize> {
    let cid = cfg.connection_id;
    let pairs: Vec<(String, String)> = db::fetch_work_packages(conn, cid)?
        .iter()
        .filter_map(|wp| {
            wp.project_id.map(|p| {
                (
                    domain_id(EntityType::Projects, cid, p),
                    domain_id(EntityType::WorkPackages, cid, wp.id),
                )
            })
        })
        .collect();
    db::rebuild_relations(
        conn,
        "board_issues",
        "board_id",
        "issue_id",
        &domain_prefix(EntityType::Projects, cid),
        &pairs,
    )
}

pub fn convert_sprint_issues(conn: &Connection, cfg: &Config) -> Result<usize> {
    let cid = cfg.connection_id;
    let pairs: Vec<(String, String)> = db::fetch_work_packages(conn, cid)?
        .iter()
        .filter_map(|wp| {
            wp.version_id.map(|v| {
                (
                    domain_id(EntityType::Versions, cid, v),
                    domain_id(EntityType::WorkPackages, cid, wp.id),
                )
            })
        })
        .collect();
    db::rebuild_relations(
        conn,
        "sprint_issues",
        "sprint_id",
        "issue_id",
        &domain_prefix(EntityType::Versions, cid),
        &pairs,
    )
}

pub struct ConvertCounts {
    pub boards: usize,
    pub accounts: usize,
    pub sprints: usize,
    pub issues: usize,
    pub worklogs: usize,
    pub board_issues: usize,
    pub sprint_issues: usize,
}

/// Dependency order: collections and actors first, then items, then the
/// relation rebuilds that reference both sides.
pub fn convert_all(conn: &Connection, cfg: &Config) -> Result<ConvertCounts> {
    let counts = ConvertCounts {
        boards: convert_boards(conn, cfg)?,
        accounts: convert_accounts(conn, cfg)?,
        sprints: convert_sprints(conn, cfg)?,
        issues: convert_issues(conn, cfg)?,
        worklogs: convert_worklogs(conn, cfg)?,
        board_issues: convert_board_issues(conn, cfg)?,
        sprint_issues: convert_sprint_issues(conn, cfg)?,
    };
    info!(
        "converted {} issues, {} boards, {} accounts, {} sprints, {} worklogs",
        counts.issues, counts.boards, counts.accounts, counts.sprints, counts.worklogs
    );
    Ok(counts)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> Config {
        Config {
            base_url: "https://op.example".into(),
            api_key: "k".into(),
            connection_id: 1,
            ..Default::default()
        }
    }

    fn mem() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    fn closed_bug() -> db::WorkPackageRow {
        db::WorkPackageRow {
            id: 42,
            subject: "Crash on save".into(),
            type_name: Some("Bug".into()),
            status_name: Some("Closed".into()),
            status_is_closed: true,
            created_at: Some("2024-01-01T00:00:00Z".into()),
            updated_at: Some("2024-01-03T00:00:00Z".into()),
            ..Default::default()
        }
    }

    #[test]
    fn closed_bug_maps_to_done_with_lead_time() {
        let cfg = test_cfg();
        let tax = Taxonomy::from_config(&cfg);
        let issue = issue_from_work_package(&cfg.base_url, 1, &tax, &closed_bug());

        assert_eq!(issue.id, "openproject:WorkPackages:1:42");
        assert_eq!(issue.issue_key, "WP-42");
        assert_eq!(issue.url, "https://op.example/work_packages/42");
        assert_eq!(issue.issue_type, "BUG");
        assert_eq!(issue.status, "DONE");
        assert_eq!(issue.resolution_date.as_deref(), Some("2024-01-03T00:00:00Z"));
        // Two full days between creation and last update.
        assert_eq!(issue.lead_time_minutes, Some(2880));
    }

    #[test]
    fn unknown_terminal_status_still_forces_done() {
        let cfg = test_cfg();
        let tax = Taxonomy::from_config(&cfg);
        let mut wp = closed_bug();
        wp.status_name = Some("Archivado".into());
        let issue = issue_from_work_package(&cfg.base_url, 1, &tax, &wp);
        assert_eq!(issue.status, "DONE");
        assert_eq!(issue.original_status, "Archivado");
        assert!(issue.resolution_date.is_some());
    }

    #[test]
    fn open_issue_has_no_resolution_or_lead_time() {
        let cfg = test_cfg();
        let tax = Taxonomy::from_config(&cfg);
        let mut wp = closed_bug();
        wp.status_name = Some("In progress".into());
        wp.status_is_closed = false;
        let issue = issue_from_work_package(&cfg.base_url, 1, &tax, &wp);
        assert_eq!(issue.status, "DOING");
        assert_eq!(issue.resolution_date, None);
        assert_eq!(issue.lead_time_minutes, None);
        // updated_date is still carried.
        assert_eq!(issue.updated_date.as_deref(), Some("2024-01-03T00:00:00Z"));
    }

    #[test]
    fn unknown_names_fall_back_to_defaults() {
        let cfg = test_cfg();
        let tax = Taxonomy::from_config(&cfg);
        let mut wp = closed_bug();
        wp.type_name = Some("Saga".into());
        wp.status_name = Some("Triage".into());
        wp.status_is_closed = false;
        let issue = issue_from_work_package(&cfg.base_url, 1, &tax, &wp);
        assert_eq!(issue.issue_type, "REQUIREMENT");
        assert_eq!(issue.status, "TODO");
    }

    #[test]
    fn effort_minutes_and_remaining_clamp() {
        let cfg = test_cfg();
        let tax = Taxonomy::from_config(&cfg);
        let mut wp = closed_bug();
        wp.estimated_hours = Some(1.0);
        wp.spent_hours = Some(2.5);
        let issue = issue_from_work_package(&cfg.base_url, 1, &tax, &wp);
        assert_eq!(issue.time_estimate_minutes, Some(60));
        assert_eq!(issue.time_spent_minutes, Some(150));
        assert_eq!(issue.time_remaining_minutes, Some(0));

        wp.spent_hours = None;
        let issue = issue_from_work_package(&cfg.base_url, 1, &tax, &wp);
        assert_eq!(issue.time_remaining_minutes, None);
    }

    #[test]
    fn references_become_composite_ids() {
        let cfg = test_cfg();
        let tax = Taxonomy::from_config(&cfg);
        let mut wp = closed_bug();
        wp.parent_id = Some(7);
        wp.author_id = Some(5);
        wp.assignee_id = Some(6);
        let issue = issue_from_work_package(&cfg.base_url, 1, &tax, &wp);
        assert_eq!(issue.parent_issue_id.as_deref(), Some("openproject:WorkPackages:1:7"));
        assert_eq!(issue.creator_id.as_deref(), Some("openproject:Users:1:5"));
        assert_eq!(issue.assignee_id.as_deref(), Some("openproject:Users:1:6"));
    }

    fn seed_structural(conn: &Connection) {
        db::replace_projects(conn, 1, &[db::ProjectRow {
            id: 7, identifier: "platform".into(), name: "Platform".into(),
            created_at: Some("2023-01-01T00:00:00Z".into()), ..Default::default()
        }]).unwrap();
        db::replace_users(conn, 1, &[db::UserRow {
            id: 5, login: "ada".into(), name: "Ada".into(), mail: "ada@example.com".into(),
            status: Some("locked".into()), ..Default::default()
        }]).unwrap();
        db::replace_versions(conn, 1, &[db::VersionRow {
            id: 3, name: "Sprint 1".into(), status: "closed".into(),
            project_id: Some(7), due_date: Some("2024-02-01".into()),
            updated_at: Some("2024-02-02T00:00:00Z".into()), ..Default::default()
        }]).unwrap();
        let mut wp = closed_bug();
        wp.project_id = Some(7);
        wp.version_id = Some(3);
        db::replace_work_packages(conn, 1, &[wp]).unwrap();
        db::replace_time_entries(conn, 1, &[db::TimeEntryRow {
            id: 11, hours: Some(1.5), user_id: Some(5), work_package_id: Some(42),
            spent_on: Some("2024-01-02".into()),
            created_at: Some("2024-01-02T12:00:00Z".into()), ..Default::default()
        }]).unwrap();
    }

    #[test]
    fn convert_all_is_idempotent() {
        let conn = mem();
        let cfg = test_cfg();
        seed_structural(&conn);

        convert_all(&conn, &cfg).unwrap();
        let dump = |conn: &Connection| -> Vec<(String, String)> {
            let mut stmt = conn
                .prepare("SELECT id, status FROM issues ORDER BY id")
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        let first = dump(&conn);
        convert_all(&conn, &cfg).unwrap();
        assert_eq!(dump(&conn), first);

        let relations: usize = conn
            .query_row("SELECT COUNT(*) FROM board_issues", [], |r| r.get(0))
            .unwrap();
        assert_eq!(relations, 1);
        let sprint_links: usize = conn
            .query_row("SELECT COUNT(*) FROM sprint_issues", [], |r| r.get(0))
            .unwrap();
        assert_eq!(sprint_links, 1);
    }

    #[test]
    fn locked_user_becomes_inactive_account() {
        let conn = mem();
        let cfg = test_cfg();
        seed_structural(&conn);
        convert_accounts(&conn, &cfg).unwrap();

        let status: i64 = conn
            .query_row(
                "SELECT status FROM accounts WHERE id = ?1",
                ["openproject:Users:1:5"],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, 0);
    }

    #[test]
    fn closed_version_becomes_completed_sprint() {
        let conn = mem();
        let cfg = test_cfg();
        seed_structural(&conn);
        convert_sprints(&conn, &cfg).unwrap();

        let (status, completed, board): (String, Option<String>, Option<String>) = conn
            .query_row(
                "SELECT status, completed_date, original_board_id FROM sprints WHERE id = ?1",
                ["openproject:Versions:1:3"],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "closed");
        assert_eq!(completed.as_deref(), Some("2024-02-02T00:00:00Z"));
        assert_eq!(board.as_deref(), Some("openproject:Projects:1:7"));
    }

    #[test]
    fn sprint_url_uses_project_identifier() {
        let conn = mem();
        let cfg = test_cfg();
        seed_structural(&conn);
        // A version whose project is not in tool_projects keeps the numeric slug.
        db::replace_versions(&conn, 1, &[
            db::VersionRow { id: 3, name: "Sprint 1".into(), project_id: Some(7), ..Default::default() },
            db::VersionRow { id: 4, name: "Orphan".into(), project_id: Some(99), ..Default::default() },
        ]).unwrap();
        convert_sprints(&conn, &cfg).unwrap();

        let url = |id: &str| -> String {
            conn.query_row("SELECT url FROM sprints WHERE id = ?1", [id], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(
            url("openproject:Versions:1:3"),
            "https://op.example/projects/platform/versions/3"
        );
        assert_eq!(
            url("openproject:Versions:1:4"),
            "https://op.example/projects/99/versions/4"
        );
    }

    #[test]
    fn worklog_minutes_and_links() {
        let conn = mem();
        let cfg = test_cfg();
        seed_structural(&conn);
        convert_worklogs(&conn, &cfg).unwrap();

        let (mins, author, issue): (i64, String, String) = conn
            .query_row(
                "SELECT time_spent_minutes, author_id, issue_id FROM issue_worklogs WHERE id = ?1",
                ["openproject:TimeEntries:1:11"],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(mins, 90);
        assert_eq!(author, "openproject:Users:1:5");
        assert_eq!(issue, "openproject:WorkPackages:1:42");
    }
}
