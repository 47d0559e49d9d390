use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

/// UTC timestamp in the sortable RFC3339 form used throughout the store.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

// ── Entity types ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Projects,
    Users,
    WorkPackages,
    TimeEntries,
    Versions,
    Statuses,
    Types,
    Priorities,
    Activities,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Statuses,
        EntityType::Types,
        EntityType::Priorities,
        EntityType::Activities,
        EntityType::Projects,
        EntityType::Users,
        EntityType::WorkPackages,
        EntityType::TimeEntries,
        EntityType::Versions,
    ];

    /// Entities served through offset pagination.
    pub const PAGED: [EntityType; 5] = [
        EntityType::Projects,
        EntityType::Users,
        EntityType::WorkPackages,
        EntityType::TimeEntries,
        EntityType::Versions,
    ];

    /// Single-shot metadata endpoints.
    pub const METADATA: [EntityType; 4] = [
        EntityType::Statuses,
        EntityType::Types,
        EntityType::Priorities,
        EntityType::Activities,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Projects => "projects",
            EntityType::Users => "users",
            EntityType::WorkPackages => "work_packages",
            EntityType::TimeEntries => "time_entries",
            EntityType::Versions => "versions",
            EntityType::Statuses => "statuses",
            EntityType::Types => "types",
            EntityType::Priorities => "priorities",
            EntityType::Activities => "activities",
        }
    }

    pub fn raw_table(self) -> String {
        format!("raw_{}", self.as_str())
    }

    pub fn tool_table(self) -> String {
        format!("tool_{}", self.as_str())
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            EntityType::Projects => "/api/v3/projects",
            EntityType::Users => "/api/v3/users",
            EntityType::WorkPackages => "/api/v3/work_packages",
            EntityType::TimeEntries => "/api/v3/time_entries",
            EntityType::Versions => "/api/v3/versions",
            EntityType::Statuses => "/api/v3/statuses",
            EntityType::Types => "/api/v3/types",
            EntityType::Priorities => "/api/v3/priorities",
            EntityType::Activities => "/api/v3/time_entries/activities",
        }
    }

    /// Middle segment of canonical composite ids, e.g. `openproject:WorkPackages:1:42`.
    pub fn domain_kind(self) -> &'static str {
        match self {
            EntityType::Projects => "Projects",
            EntityType::Users => "Users",
            EntityType::WorkPackages => "WorkPackages",
            EntityType::TimeEntries => "TimeEntries",
            EntityType::Versions => "Versions",
            EntityType::Statuses => "Statuses",
            EntityType::Types => "Types",
            EntityType::Priorities => "Priorities",
            EntityType::Activities => "Activities",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projects" => Ok(EntityType::Projects),
            "users" => Ok(EntityType::Users),
            "work_packages" => Ok(EntityType::WorkPackages),
            "time_entries" => Ok(EntityType::TimeEntries),
            "versions" => Ok(EntityType::Versions),
            "statuses" => Ok(EntityType::Statuses),
            "types" => Ok(EntityType::Types),
            "priorities" => Ok(EntityType::Priorities),
            "activities" => Ok(EntityType::Activities),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

// ── Schema ──

pub fn init_schema(conn: &Connection) -> Result<()> {
    // Raw layer: one append-only table per entity type, failures included.
    for entity in EntityType::ALL {
        let table = entity.raw_table();
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                id            INTEGER PRIMARY KEY,
                connection_id INTEGER NOT NULL,
                params        TEXT NOT NULL,
                url           TEXT NOT NULL,
                input         TEXT,
                data          TEXT,
                error         TEXT,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_conn ON {table}(connection_id, created_at);
            "
        ))?;
    }

    conn.execute_batch(
        "
        -- Tool layer: flattened per-entity records, rebuilt per run.
        CREATE TABLE IF NOT EXISTS tool_projects (
            connection_id INTEGER NOT NULL,
            id            INTEGER NOT NULL,
            identifier    TEXT NOT NULL DEFAULT '',
            name          TEXT NOT NULL DEFAULT '',
            description   TEXT NOT NULL DEFAULT '',
            status        TEXT NOT NULL DEFAULT '',
            is_public     INTEGER NOT NULL DEFAULT 0,
            parent_id     INTEGER,
            parent_name   TEXT,
            created_at    TEXT,
            updated_at    TEXT,
            all_fields    TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_users (
            connection_id INTEGER NOT NULL,
            id            INTEGER NOT NULL,
            login         TEXT NOT NULL DEFAULT '',
            first_name    TEXT NOT NULL DEFAULT '',
            last_name     TEXT NOT NULL DEFAULT '',
            name          TEXT NOT NULL DEFAULT '',
            mail          TEXT NOT NULL DEFAULT '',
            admin         INTEGER NOT NULL DEFAULT 0,
            avatar        TEXT,
            status        TEXT,
            created_at    TEXT,
            updated_at    TEXT,
            all_fields    TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_work_packages (
            connection_id     INTEGER NOT NULL,
            id                INTEGER NOT NULL,
            subject           TEXT NOT NULL DEFAULT '',
            description       TEXT NOT NULL DEFAULT '',
            start_date        TEXT,
            due_date          TEXT,
            created_at        TEXT,
            updated_at        TEXT,
            estimated_hours   REAL,
            spent_hours       REAL,
            project_id        INTEGER,
            project_name      TEXT,
            project_identifier TEXT,
            type_id           INTEGER,
            type_name         TEXT,
            status_id         INTEGER,
            status_name       TEXT,
            status_is_closed  INTEGER NOT NULL DEFAULT 0,
            priority_id       INTEGER,
            priority_name     TEXT,
            assignee_id       INTEGER,
            assignee_name     TEXT,
            assignee_login    TEXT,
            responsible_id    INTEGER,
            responsible_name  TEXT,
            responsible_login TEXT,
            author_id         INTEGER,
            author_name       TEXT,
            author_login      TEXT,
            parent_id         INTEGER,
            version_id        INTEGER,
            version_name      TEXT,
            category_id       INTEGER,
            category_name     TEXT,
            custom_fields     TEXT,
            all_fields        TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_time_entries (
            connection_id      INTEGER NOT NULL,
            id                 INTEGER NOT NULL,
            hours              REAL,
            comment            TEXT NOT NULL DEFAULT '',
            spent_on           TEXT,
            work_package_id    INTEGER,
            work_package_title TEXT,
            user_id            INTEGER,
            user_name          TEXT,
            activity_id        INTEGER,
            activity_name      TEXT,
            project_id         INTEGER,
            project_name       TEXT,
            created_at         TEXT,
            updated_at         TEXT,
            all_fields         TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_versions (
            connection_id INTEGER NOT NULL,
            id            INTEGER NOT NULL,
            name          TEXT NOT NULL DEFAULT '',
            description   TEXT NOT NULL DEFAULT '',
            status        TEXT NOT NULL DEFAULT '',
            start_date    TEXT,
            due_date      TEXT,
            project_id    INTEGER,
            project_name  TEXT,
            created_at    TEXT,
            updated_at    TEXT,
            all_fields    TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_statuses (
            connection_id INTEGER NOT NULL,
            id            INTEGER NOT NULL,
            name          TEXT NOT NULL DEFAULT '',
            is_closed     INTEGER NOT NULL DEFAULT 0,
            is_default    INTEGER NOT NULL DEFAULT 0,
            position      INTEGER,
            color         TEXT,
            all_fields    TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_types (
            connection_id INTEGER NOT NULL,
            id            INTEGER NOT NULL,
            name          TEXT NOT NULL DEFAULT '',
            color         TEXT,
            position      INTEGER,
            is_default    INTEGER NOT NULL DEFAULT 0,
            is_milestone  INTEGER NOT NULL DEFAULT 0,
            all_fields    TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_priorities (
            connection_id INTEGER NOT NULL,
            id            INTEGER NOT NULL,
            name          TEXT NOT NULL DEFAULT '',
            position      INTEGER,
            color         TEXT,
            is_default    INTEGER NOT NULL DEFAULT 0,
            is_active     INTEGER NOT NULL DEFAULT 1,
            all_fields    TEXT,
            PRIMARY KEY (connection_id, id)
        );

        CREATE TABLE IF NOT EXISTS tool_activities (
            connection_id INTEGER NOT NULL,
            id            INTEGER NOT NULL,
            name          TEXT NOT NULL DEFAULT '',
            position      INTEGER,
            is_default    INTEGER NOT NULL DEFAULT 0,
            is_active     INTEGER NOT NULL DEFAULT 1,
            all_fields    TEXT,
            PRIMARY KEY (connection_id, id)
        );

        -- Domain layer: cross-tool canonical tables, upserted by composite id.
        CREATE TABLE IF NOT EXISTS issues (
            id                     TEXT PRIMARY KEY,
            issue_key              TEXT NOT NULL,
            url                    TEXT NOT NULL,
            title                  TEXT NOT NULL DEFAULT '',
            description            TEXT NOT NULL DEFAULT '',
            type                   TEXT NOT NULL,
            original_type          TEXT NOT NULL,
            status                 TEXT NOT NULL,
            original_status        TEXT NOT NULL,
            resolution_date        TEXT,
            created_date           TEXT,
            updated_date           TEXT,
            lead_time_minutes      INTEGER,
            time_estimate_minutes  INTEGER,
            time_spent_minutes     INTEGER,
            time_remaining_minutes INTEGER,
            parent_issue_id        TEXT,
            priority               TEXT,
            severity               TEXT,
            component              TEXT,
            creator_id             TEXT,
            creator_name           TEXT,
            assignee_id            TEXT,
            assignee_name          TEXT,
            original_project       TEXT
        );

        CREATE TABLE IF NOT EXISTS boards (
            id           TEXT PRIMARY KEY,
            name         TEXT NOT NULL DEFAULT '',
            description  TEXT NOT NULL DEFAULT '',
            url          TEXT NOT NULL,
            created_date TEXT,
            type         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
            id         TEXT PRIMARY KEY,
            email      TEXT NOT NULL DEFAULT '',
            full_name  TEXT NOT NULL DEFAULT '',
            user_name  TEXT NOT NULL DEFAULT '',
            avatar_url TEXT,
            status     INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS sprints (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL DEFAULT '',
            url               TEXT NOT NULL,
            status            TEXT NOT NULL,
            started_date      TEXT,
            ended_date        TEXT,
            completed_date    TEXT,
            original_board_id TEXT
        );

        CREATE TABLE IF NOT EXISTS issue_worklogs (
            id                 TEXT PRIMARY KEY,
            author_id          TEXT,
            comment            TEXT NOT NULL DEFAULT '',
            time_spent_minutes INTEGER,
            logged_date        TEXT,
            started_date       TEXT,
            issue_id           TEXT
        );

        -- Relation tables: truncated and rebuilt per run, scoped by id prefix.
        CREATE TABLE IF NOT EXISTS board_issues (
            board_id TEXT NOT NULL,
            issue_id TEXT NOT NULL,
            PRIMARY KEY (board_id, issue_id)
        );

        CREATE TABLE IF NOT EXISTS sprint_issues (
            sprint_id TEXT NOT NULL,
            issue_id  TEXT NOT NULL,
            PRIMARY KEY (sprint_id, issue_id)
        );

        -- One lease per connection guards against overlapping runs.
        CREATE TABLE IF NOT EXISTS sync_leases (
            connection_id INTEGER PRIMARY KEY,
            acquired_at   TEXT NOT NULL,
            expires_at    TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

// ── Raw layer ──

pub struct RawPageRow {
    pub connection_id: i64,
    pub params: String,
    pub url: String,
    pub input: Option<String>,
    pub data: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

pub fn insert_raw(conn: &Connection, entity: EntityType, row: &RawPageRow) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (connection_id, params, url, input, data, error, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        entity.raw_table()
    );
    conn.execute(
        &sql,
        rusqlite::params![
            row.connection_id,
            row.params,
            row.url,
            row.input,
            row.data,
            row.error,
            row.created_at,
        ],
    )?;
    Ok(())
}

/// High-water mark for incremental fetches: newest successful raw row.
pub fn last_successful_fetch(
    conn: &Connection,
    entity: EntityType,
    connection_id: i64,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT MAX(created_at) FROM {} WHERE connection_id = ?1 AND data IS NOT NULL",
        entity.raw_table()
    );
    let hwm: Option<String> = conn.query_row(&sql, [connection_id], |r| r.get(0))?;
    Ok(hwm)
}

/// Successful raw payloads, newest first, so the first occurrence of a
/// source id during extraction is the freshest one.
pub fn load_raw_payloads(
    conn: &Connection,
    entity: EntityType,
    connection_id: i64,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT data FROM {} WHERE connection_id = ?1 AND data IS NOT NULL
         ORDER BY created_at DESC, id DESC",
        entity.raw_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([connection_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Tool layer rows ──

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectRow {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub status: String,
    pub is_public: bool,
    pub parent_id: Option<i64>,
    pub parent_name: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRow {
    pub id: i64,
    pub login: String,
    pub first_name: String,
    pub last_name: String,
    pub name: String,
    pub mail: String,
    pub admin: bool,
    pub avatar: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkPackageRow {
    pub id: i64,
    pub subject: String,
    pub description: String,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub estimated_hours: Option<f64>,
    pub spent_hours: Option<f64>,
    pub project_id: Option<i64>,
    pub project_name: Option<String>,
    pub project_identifier: Option<String>,
    pub type_id: Option<i64>,
    pub type_name: Option<String>,
    pub status_id: Option<i64>,
    pub status_name: Option<String>,
    pub status_is_closed: bool,
    pub priority_id: Option<i64>,
    pub priority_name: Option<String>,
    pub assignee_id: Option<i64>,
    pub assignee_name: Option<String>,
    pub assignee_login: Option<String>,
    pub responsible_id: Option<i64>,
    pub responsible_name: Option<String>,
    pub responsible_login: Option<String>,
    pub author_id: Option<i64>,
    pub author_name: Option<String>,
    pub author_login: Option<String>,
    pub parent_id: Option<i64>,
    pub version_id: Option<i64>,
    pub version_name: Option<String>,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub custom_fields: Option<String>,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeEntryRow {
    pub id: i64,
    pub hours: Option<f64>,
    pub comment: String,
    pub spent_on: Option<String>,
    pub work_package_id: Option<i64>,
    pub work_package_title: Option<String>,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub activity_id: Option<i64>,
    pub activity_name: Option<String>,
    pub project_id: Option<i64>,
    pub project_name: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub status: String,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub project_id: Option<i64>,
    pub project_name: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusRow {
    pub id: i64,
    pub name: String,
    pub is_closed: bool,
    pub is_default: bool,
    pub position: Option<i64>,
    pub color: Option<String>,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeRow {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
    pub position: Option<i64>,
    pub is_default: bool,
    pub is_milestone: bool,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityRow {
    pub id: i64,
    pub name: String,
    pub position: Option<i64>,
    pub color: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
    pub all_fields: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityRow {
    pub id: i64,
    pub name: String,
    pub position: Option<i64>,
    pub is_default: bool,
    pub is_active: bool,
    pub all_fields: Option<String>,
}

// ── Tool layer writes (full replace per connection, one transaction) ──

pub fn replace_projects(conn: &Connection, cid: i64, rows: &[ProjectRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_projects WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_projects
             (connection_id, id, identifier, name, description, status, is_public,
              parent_id, parent_name, created_at, updated_at, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.identifier, r.name, r.description, r.status, r.is_public,
                r.parent_id, r.parent_name, r.created_at, r.updated_at, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_users(conn: &Connection, cid: i64, rows: &[UserRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_users WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_users
             (connection_id, id, login, first_name, last_name, name, mail, admin,
              avatar, status, created_at, updated_at, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.login, r.first_name, r.last_name, r.name, r.mail, r.admin,
                r.avatar, r.status, r.created_at, r.updated_at, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_work_packages(conn: &Connection, cid: i64, rows: &[WorkPackageRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_work_packages WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_work_packages
             (connection_id, id, subject, description, start_date, due_date,
              created_at, updated_at, estimated_hours, spent_hours,
              project_id, project_name, project_identifier,
              type_id, type_name, status_id, status_name, status_is_closed,
              priority_id, priority_name, assignee_id, assignee_name, assignee_login,
              responsible_id, responsible_name, responsible_login,
              author_id, author_name, author_login, parent_id,
              version_id, version_name, category_id, category_name,
              custom_fields, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,
                     ?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33,?34,?35,?36)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.subject, r.description, r.start_date, r.due_date,
                r.created_at, r.updated_at, r.estimated_hours, r.spent_hours,
                r.project_id, r.project_name, r.project_identifier,
                r.type_id, r.type_name, r.status_id, r.status_name, r.status_is_closed,
                r.priority_id, r.priority_name, r.assignee_id, r.assignee_name, r.assignee_login,
                r.responsible_id, r.responsible_name, r.responsible_login,
                r.author_id, r.author_name, r.author_login, r.parent_id,
                r.version_id, r.version_name, r.category_id, r.category_name,
                r.custom_fields, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_time_entries(conn: &Connection, cid: i64, rows: &[TimeEntryRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_time_entries WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_time_entries
             (connection_id, id, hours, comment, spent_on,
              work_package_id, work_package_title, user_id, user_name,
              activity_id, activity_name, project_id, project_name,
              created_at, updated_at, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.hours, r.comment, r.spent_on,
                r.work_package_id, r.work_package_title, r.user_id, r.user_name,
                r.activity_id, r.activity_name, r.project_id, r.project_name,
                r.created_at, r.updated_at, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_versions(conn: &Connection, cid: i64, rows: &[VersionRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_versions WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_versions
             (connection_id, id, name, description, status, start_date, due_date,
              project_id, project_name, created_at, updated_at, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.name, r.description, r.status, r.start_date, r.due_date,
                r.project_id, r.project_name, r.created_at, r.updated_at, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_statuses(conn: &Connection, cid: i64, rows: &[StatusRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_statuses WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_statuses
             (connection_id, id, name, is_closed, is_default, position, color, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.name, r.is_closed, r.is_default, r.position, r.color, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_types(conn: &Connection, cid: i64, rows: &[TypeRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_types WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_types
             (connection_id, id, name, color, position, is_default, is_milestone, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.name, r.color, r.position, r.is_default, r.is_milestone, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_priorities(conn: &Connection, cid: i64, rows: &[PriorityRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_priorities WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_priorities
             (connection_id, id, name, position, color, is_default, is_active, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.name, r.position, r.color, r.is_default, r.is_active, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn replace_activities(conn: &Connection, cid: i64, rows: &[ActivityRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM tool_activities WHERE connection_id = ?1", [cid])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO tool_activities
             (connection_id, id, name, position, is_default, is_active, all_fields)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                cid, r.id, r.name, r.position, r.is_default, r.is_active, r.all_fields,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

// ── Tool layer reads ──

pub fn fetch_projects(conn: &Connection, cid: i64) -> Result<Vec<ProjectRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, identifier, name, description, status, is_public,
                parent_id, parent_name, created_at, updated_at, all_fields
         FROM tool_projects WHERE connection_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([cid], |row| {
            Ok(ProjectRow {
                id: row.get(0)?,
                identifier: row.get(1)?,
                name: row.get(2)?,
                description: row.get(3)?,
                status: row.get(4)?,
                is_public: row.get(5)?,
                parent_id: row.get(6)?,
                parent_name: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
                all_fields: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_users(conn: &Connection, cid: i64) -> Result<Vec<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, login, first_name, last_name, name, mail, admin,
                avatar, status, created_at, updated_at, all_fields
         FROM tool_users WHERE connection_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([cid], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                login: row.get(1)?,
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                name: row.get(4)?,
                mail: row.get(5)?,
                admin: row.get(6)?,
                avatar: row.get(7)?,
                status: row.get(8)?,
                created_at: row.get(9)?,
                updated_at: row.get(10)?,
                all_fields: row.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_work_packages(conn: &Connection, cid: i64) -> Result<Vec<WorkPackageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, subject, description, start_date, due_date,
                created_at, updated_at, estimated_hours, spent_hours,
                project_id, project_name, project_identifier,
                type_id, type_name, status_id, status_name, status_is_closed,
                priority_id, priority_name, assignee_id, assignee_name, assignee_login,
                responsible_id, responsible_name, responsible_login,
                author_id, author_name, author_login, parent_id,
                version_id, version_name, category_id, category_name,
                custom_fields, all_fields
         FROM tool_work_packages WHERE connection_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([cid], |row| {
            Ok(WorkPackageRow {
                id: row.get(0)?,
                subject: row.get(1)?,
                description: row.get(2)?,
                start_date: row.get(3)?,
                due_date: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
                estimated_hours: row.get(7)?,
                spent_hours: row.get(8)?,
                project_id: row.get(9)?,
                project_name: row.get(10)?,
                project_identifier: row.get(11)?,
                type_id: row.get(12)?,
                type_name: row.get(13)?,
                status_id: row.get(14)?,
                status_name: row.get(15)?,
                status_is_closed: row.get(16)?,
                priority_id: row.get(17)?,
                priority_name: row.get(18)?,
                assignee_id: row.get(19)?,
                assignee_name: row.get(20)?,
                assignee_login: row.get(21)?,
                responsible_id: row.get(22)?,
                responsible_name: row.get(23)?,
                responsible_login: row.get(24)?,
                author_id: row.get(25)?,
                author_name: row.get(26)?,
                author_login: row.get(27)?,
                parent_id: row.get(28)?,
                version_id: row.get(29)?,
                version_name: row.get(30)?,
                category_id: row.get(31)?,
                category_name: row.get(32)?,
                custom_fields: row.get(33)?,
                all_fields: row.get(34)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_time_entries(conn: &Connection, cid: i64) -> Result<Vec<TimeEntryRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, hours, comment, spent_on,
                work_package_id, work_package_title, user_id, user_name,
                activity_id, activity_name, project_id, project_name,
                created_at, updated_at, all_fields
         FROM tool_time_entries WHERE connection_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([cid], |row| {
            Ok(TimeEntryRow {
                id: row.get(0)?,
                hours: row.get(1)?,
                comment: row.get(2)?,
                spent_on: row.get(3)?,
                work_package_id: row.get(4)?,
                work_package_title: row.get(5)?,
                user_id: row.get(6)?,
                user_name: row.get(7)?,
                activity_id: row.get(8)?,
                activity_name: row.get(9)?,
                project_id: row.get(10)?,
                project_name: row.get(11)?,
                created_at: row.get(12)?,
                updated_at: row.get(13)?,
                all_fields: row.get(14)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_versions(conn: &Connection, cid: i64) -> Result<Vec<VersionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, status, start_date, due_date,
                project_id, project_name, created_at, updated_at, all_fields
         FROM tool_versions WHERE connection_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([cid], |row| {
            Ok(VersionRow {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                status: row.get(3)?,
                start_date: row.get(4)?,
                due_date: row.get(5)?,
                project_id: row.get(6)?,
                project_name: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
                all_fields: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Domain layer ──

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Issue {
    pub id: String,
    pub issue_key: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub issue_type: String,
    pub original_type: String,
    pub status: String,
    pub original_status: String,
    pub resolution_date: Option<String>,
    pub created_date: Option<String>,
    pub updated_date: Option<String>,
    pub lead_time_minutes: Option<i64>,
    pub time_estimate_minutes: Option<i64>,
    pub time_spent_minutes: Option<i64>,
    pub time_remaining_minutes: Option<i64>,
    pub parent_issue_id: Option<String>,
    pub priority: Option<String>,
    pub severity: Option<String>,
    pub component: Option<String>,
    pub creator_id: Option<String>,
    pub creator_name: Option<String>,
    pub assignee_id: Option<String>,
    pub assignee_name: Option<String>,
    pub original_project: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Board {
    pub id: String,
    pub name: String,
    pub description: String,
    pub url: String,
    pub created_date: Option<String>,
    pub board_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub user_name: String,
    pub avatar_url: Option<String>,
    pub status: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Sprint {
    pub id: String,
    pub name: String,
    pub url: String,
    pub status: String,
    pub started_date: Option<String>,
    pub ended_date: Option<String>,
    pub completed_date: Option<String>,
    pub original_board_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Worklog {
    pub id: String,
    pub author_id: Option<String>,
    pub comment: String,
    pub time_spent_minutes: Option<i64>,
    pub logged_date: Option<String>,
    pub started_date: Option<String>,
    pub issue_id: Option<String>,
}

pub fn save_issues(conn: &Connection, rows: &[Issue]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO issues
             (id, issue_key, url, title, description, type, original_type,
              status, original_status, resolution_date, created_date, updated_date,
              lead_time_minutes, time_estimate_minutes, time_spent_minutes,
              time_remaining_minutes, parent_issue_id, priority, severity, component,
              creator_id, creator_name, assignee_id, assignee_name, original_project)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,
                     ?19,?20,?21,?22,?23,?24,?25)
             ON CONFLICT(id) DO UPDATE SET
                issue_key = excluded.issue_key,
                url = excluded.url,
                title = excluded.title,
                description = excluded.description,
                type = excluded.type,
                original_type = excluded.original_type,
                status = excluded.status,
                original_status = excluded.original_status,
                resolution_date = excluded.resolution_date,
                created_date = excluded.created_date,
                updated_date = excluded.updated_date,
                lead_time_minutes = excluded.lead_time_minutes,
                time_estimate_minutes = excluded.time_estimate_minutes,
                time_spent_minutes = excluded.time_spent_minutes,
                time_remaining_minutes = excluded.time_remaining_minutes,
                parent_issue_id = excluded.parent_issue_id,
                priority = excluded.priority,
                severity = excluded.severity,
                component = excluded.component,
                creator_id = excluded.creator_id,
                creator_name = excluded.creator_name,
                assignee_id = excluded.assignee_id,
                assignee_name = excluded.assignee_name,
                original_project = excluded.original_project",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                r.id, r.issue_key, r.url, r.title, r.description, r.issue_type,
                r.original_type, r.status, r.original_status, r.resolution_date,
                r.created_date, r.updated_date, r.lead_time_minutes,
                r.time_estimate_minutes, r.time_spent_minutes, r.time_remaining_minutes,
                r.parent_issue_id, r.priority, r.severity, r.component,
                r.creator_id, r.creator_name, r.assignee_id, r.assignee_name,
                r.original_project,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn save_boards(conn: &Connection, rows: &[Board]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO boards (id, name, description, url, created_date, type)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                url = excluded.url,
                created_date = excluded.created_date,
                type = excluded.type",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                r.id, r.name, r.description, r.url, r.created_date, r.board_type,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn save_accounts(conn: &Connection, rows: &[Account]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO accounts (id, email, full_name, user_name, avatar_url, status)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                full_name = excluded.full_name,
                user_name = excluded.user_name,
                avatar_url = excluded.avatar_url,
                status = excluded.status",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                r.id, r.email, r.full_name, r.user_name, r.avatar_url, r.status,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn save_sprints(conn: &Connection, rows: &[Sprint]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO sprints
             (id, name, url, status, started_date, ended_date, completed_date, original_board_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                status = excluded.status,
                started_date = excluded.started_date,
                ended_date = excluded.ended_date,
                completed_date = excluded.completed_date,
                original_board_id = excluded.original_board_id",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                r.id, r.name, r.url, r.status, r.started_date, r.ended_date,
                r.completed_date, r.original_board_id,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn save_worklogs(conn: &Connection, rows: &[Worklog]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO issue_worklogs
             (id, author_id, comment, time_spent_minutes, logged_date, started_date, issue_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(id) DO UPDATE SET
                author_id = excluded.author_id,
                comment = excluded.comment,
                time_spent_minutes = excluded.time_spent_minutes,
                logged_date = excluded.logged_date,
                started_date = excluded.started_date,
                issue_id = excluded.issue_id",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                r.id, r.author_id, r.comment, r.time_spent_minutes, r.logged_date,
                r.started_date, r.issue_id,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

/// Truncate-and-rebuild for a relation table, scoped to ids under `prefix`.
pub fn rebuild_relations(
    conn: &Connection,
    table: &str,
    left_col: &str,
    right_col: &str,
    prefix: &str,
    pairs: &[(String, String)],
) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        &format!("DELETE FROM {table} WHERE {left_col} LIKE ?1"),
        [format!("{prefix}%")],
    )?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT OR IGNORE INTO {table} ({left_col}, {right_col}) VALUES (?1, ?2)"
        ))?;
        for (left, right) in pairs {
            stmt.execute(rusqlite::params![left, right])?;
        }
    }
    tx.commit()?;
    Ok(pairs.len())
}

// ── Sync lease ──

/// Take the per-connection run lease. Returns false when a live lease is
/// already held; expired leases (crashed runs) are stolen.
pub fn acquire_lease(conn: &Connection, cid: i64, ttl: Duration) -> Result<bool> {
    let now = now_ts();
    let held: Option<String> = conn
        .query_row(
            "SELECT expires_at FROM sync_leases WHERE connection_id = ?1",
            [cid],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if let Some(expires) = held {
        // RFC3339 UTC strings compare lexicographically.
        if expires > now {
            return Ok(false);
        }
    }

    let expires = (Utc::now() + chrono::Duration::from_std(ttl)?)
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    conn.execute(
        "INSERT INTO sync_leases (connection_id, acquired_at, expires_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(connection_id) DO UPDATE SET
            acquired_at = excluded.acquired_at,
            expires_at = excluded.expires_at",
        rusqlite::params![cid, now, expires],
    )?;
    Ok(true)
}

pub fn release_lease(conn: &Connection, cid: i64) -> Result<()> {
    conn.execute("DELETE FROM sync_leases WHERE connection_id = ?1", [cid])?;
    Ok(())
}

// ── Stats ──

pub struct EntityStats {
    pub entity: EntityType,
    pub raw_pages: usize,
    pub raw_errors: usize,
    pub last_fetched_at: Option<String>,
    pub tool_rows: usize,
}

pub struct DomainStats {
    pub issues: usize,
    pub boards: usize,
    pub accounts: usize,
    pub sprints: usize,
    pub worklogs: usize,
}

pub fn entity_stats(conn: &Connection, cid: i64) -> Result<Vec<EntityStats>> {
    let mut out = Vec::new();
    for entity in EntityType::ALL {
        let raw = entity.raw_table();
        let raw_pages: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {raw} WHERE connection_id = ?1"),
            [cid],
            |r| r.get(0),
        )?;
        let raw_errors: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {raw} WHERE connection_id = ?1 AND error IS NOT NULL"),
            [cid],
            |r| r.get(0),
        )?;
        let last_fetched_at: Option<String> = conn.query_row(
            &format!("SELECT MAX(created_at) FROM {raw} WHERE connection_id = ?1"),
            [cid],
            |r| r.get(0),
        )?;
        let tool_rows: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE connection_id = ?1", entity.tool_table()),
            [cid],
            |r| r.get(0),
        )?;
        out.push(EntityStats { entity, raw_pages, raw_errors, last_fetched_at, tool_rows });
    }
    Ok(out)
}

pub fn domain_stats(conn: &Connection, source_tag: &str, cid: i64) -> Result<DomainStats> {
    let count = |table: &str, kind: &str| -> Result<usize> {
        let prefix = format!("{source_tag}:{kind}:{cid}:%");
        let n = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE id LIKE ?1"),
            [prefix],
            |r| r.get(0),
        )?;
        Ok(n)
    };
    Ok(DomainStats {
        issues: count("issues", "WorkPackages")?,
        boards: count("boards", "Projects")?,
        accounts: count("accounts", "Users")?,
        sprints: count("sprints", "Versions")?,
        worklogs: count("issue_worklogs", "TimeEntries")?,
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = mem();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn raw_rows_keep_failures() {
        let conn = mem();
        insert_raw(&conn, EntityType::Projects, &RawPageRow {
            connection_id: 1,
            params: "{}".into(),
            url: "https://op.example/api/v3/projects".into(),
            input: None,
            data: Some(r#"{"total":0}"#.into()),
            error: None,
            created_at: "2024-01-01T00:00:00Z".into(),
        }).unwrap();
        insert_raw(&conn, EntityType::Projects, &RawPageRow {
            connection_id: 1,
            params: "{}".into(),
            url: "https://op.example/api/v3/projects".into(),
            input: None,
            data: None,
            error: Some("client error 403".into()),
            created_at: "2024-01-02T00:00:00Z".into(),
        }).unwrap();

        // Failed rows never become the high-water mark.
        let hwm = last_successful_fetch(&conn, EntityType::Projects, 1).unwrap();
        assert_eq!(hwm.as_deref(), Some("2024-01-01T00:00:00Z"));

        // But they count for health reporting.
        let stats = entity_stats(&conn, 1).unwrap();
        let projects = stats.iter().find(|s| s.entity == EntityType::Projects).unwrap();
        assert_eq!(projects.raw_pages, 2);
        assert_eq!(projects.raw_errors, 1);
        assert_eq!(projects.last_fetched_at.as_deref(), Some("2024-01-02T00:00:00Z"));
    }

    #[test]
    fn replace_is_full_rebuild() {
        let conn = mem();
        let a = ProjectRow { id: 1, name: "one".into(), ..Default::default() };
        let b = ProjectRow { id: 2, name: "two".into(), ..Default::default() };
        replace_projects(&conn, 1, &[a, b]).unwrap();
        let c = ProjectRow { id: 3, name: "three".into(), ..Default::default() };
        replace_projects(&conn, 1, &[c]).unwrap();

        let rows = fetch_projects(&conn, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 3);
    }

    #[test]
    fn replace_scopes_by_connection() {
        let conn = mem();
        replace_users(&conn, 1, &[UserRow { id: 5, login: "alice".into(), ..Default::default() }]).unwrap();
        replace_users(&conn, 2, &[UserRow { id: 5, login: "bob".into(), ..Default::default() }]).unwrap();
        replace_users(&conn, 1, &[]).unwrap();

        assert!(fetch_users(&conn, 1).unwrap().is_empty());
        assert_eq!(fetch_users(&conn, 2).unwrap()[0].login, "bob");
    }

    #[test]
    fn issue_upsert_updates_in_place() {
        let conn = mem();
        let mut issue = Issue {
            id: "openproject:WorkPackages:1:42".into(),
            issue_key: "WP-42".into(),
            url: "https://op.example/work_packages/42".into(),
            title: "before".into(),
            issue_type: "BUG".into(),
            original_type: "Bug".into(),
            status: "TODO".into(),
            original_status: "New".into(),
            ..Default::default()
        };
        save_issues(&conn, std::slice::from_ref(&issue)).unwrap();
        issue.title = "after".into();
        issue.status = "DONE".into();
        save_issues(&conn, &[issue]).unwrap();

        let (n, title, status): (usize, String, String) = conn
            .query_row(
                "SELECT COUNT(*), title, status FROM issues WHERE id = ?1",
                ["openproject:WorkPackages:1:42"],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(title, "after");
        assert_eq!(status, "DONE");
    }

    #[test]
    fn relation_rebuild_is_prefix_scoped() {
        let conn = mem();
        let ours = ("openproject:Projects:1:7".to_string(), "openproject:WorkPackages:1:42".to_string());
        let theirs = ("openproject:Projects:2:7".to_string(), "openproject:WorkPackages:2:42".to_string());
        rebuild_relations(&conn, "board_issues", "board_id", "issue_id",
            "openproject:Projects:1:", std::slice::from_ref(&ours)).unwrap();
        rebuild_relations(&conn, "board_issues", "board_id", "issue_id",
            "openproject:Projects:2:", std::slice::from_ref(&theirs)).unwrap();

        // Rebuilding connection 1 with nothing must not disturb connection 2.
        rebuild_relations(&conn, "board_issues", "board_id", "issue_id",
            "openproject:Projects:1:", &[]).unwrap();
        let n: usize = conn
            .query_row("SELECT COUNT(*) FROM board_issues", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn lease_blocks_second_run_until_released() {
        let conn = mem();
        assert!(acquire_lease(&conn, 1, Duration::from_secs(3600)).unwrap());
        assert!(!acquire_lease(&conn, 1, Duration::from_secs(3600)).unwrap());
        // Other connections are unaffected.
        assert!(acquire_lease(&conn, 2, Duration::from_secs(3600)).unwrap());
        release_lease(&conn, 1).unwrap();
        assert!(acquire_lease(&conn, 1, Duration::from_secs(3600)).unwrap());
    }

    #[test]
    fn expired_lease_is_stolen() {
        let conn = mem();
        assert!(acquire_lease(&conn, 1, Duration::from_secs(0)).unwrap());
        assert!(acquire_lease(&conn, 1, Duration::from_secs(3600)).unwrap());
    }
}
