pub mod fields;

use std::collections::HashSet;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{self, EntityType};
use self::fields::{normalize_datetime, parse_date, parse_duration, resolve_link};

/// Flatten one entity's raw pages into its tool table. Returns the number
/// of structural rows written.
pub fn extract(conn: &Connection, cid: i64, entity: EntityType) -> Result<usize> {
    let elements = deduped_elements(conn, cid, entity)?;
    match entity {
        EntityType::Projects => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_project).collect();
            db::replace_projects(conn, cid, &rows)
        }
        EntityType::Users => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_user).collect();
            db::replace_users(conn, cid, &rows)
        }
        EntityType::WorkPackages => {
            let pb = ProgressBar::new(elements.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            let rows: Vec<_> = elements
                .iter()
                .filter_map(|el| {
                    pb.inc(1);
                    flatten_work_package(el)
                })
                .collect();
            pb.finish_and_clear();
            db::replace_work_packages(conn, cid, &rows)
        }
        EntityType::TimeEntries => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_time_entry).collect();
            db::replace_time_entries(conn, cid, &rows)
        }
        EntityType::Versions => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_version).collect();
            db::replace_versions(conn, cid, &rows)
        }
        EntityType::Statuses => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_status).collect();
            db::replace_statuses(conn, cid, &rows)
        }
        EntityType::Types => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_type).collect();
            db::replace_types(conn, cid, &rows)
        }
        EntityType::Priorities => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_priority).collect();
            db::replace_priorities(conn, cid, &rows)
        }
        EntityType::Activities => {
            let rows: Vec<_> = elements.iter().filter_map(flatten_activity).collect();
            db::replace_activities(conn, cid, &rows)
        }
    }
}

/// Walk raw pages newest-first and keep the first occurrence of each
/// source id, so re-fetched entities resolve to their freshest capture.
fn deduped_elements(conn: &Connection, cid: i64, entity: EntityType) -> Result<Vec<Value>> {
    let payloads = db::load_raw_payloads(conn, entity, cid)?;
    let mut seen: HashSet<i64> = HashSet::new();
    let mut out = Vec::new();
    for payload in &payloads {
        let data: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("{entity}: skipping unparseable raw page: {e}");
                continue;
            }
        };
        let Some(elements) = data.pointer("/_embedded/elements").and_then(Value::as_array) else {
            debug!("{entity}: raw page without _embedded.elements");
            continue;
        };
        for el in elements {
            match el.get("id").and_then(Value::as_i64) {
                Some(id) if seen.insert(id) => out.push(el.clone()),
                Some(_) => {}
                None => warn!("{entity}: skipping element without numeric id"),
            }
        }
    }
    Ok(out)
}

fn text(el: &Value, key: &str) -> String {
    el.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn opt_text(el: &Value, key: &str) -> Option<String> {
    el.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn datetime(el: &Value, key: &str) -> Option<String> {
    el.get(key).and_then(Value::as_str).and_then(normalize_datetime)
}

fn date(el: &Value, key: &str) -> Option<String> {
    el.get(key).and_then(Value::as_str).and_then(parse_date)
}

/// Rich-text fields arrive as `{format, raw, html}` objects; plain
/// strings appear on older instances.
fn formattable(el: &Value, key: &str) -> String {
    match el.get(key) {
        Some(Value::Object(m)) => m.get("raw").and_then(Value::as_str).unwrap_or("").to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn duration_hours(el: &Value, key: &str) -> Option<f64> {
    match el.get(key) {
        Some(Value::String(s)) => parse_duration(s),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

fn link<'v>(el: &'v Value, name: &str) -> Option<&'v Value> {
    el.pointer(&format!("/_links/{name}"))
}

fn custom_fields_json(el: &Value) -> Option<String> {
    let obj = el.as_object()?;
    let customs: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| k.starts_with("customField"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if customs.is_empty() {
        None
    } else {
        Some(Value::Object(customs).to_string())
    }
}

// ── Per-entity flattening ──

fn flatten_project(el: &Value) -> Option<db::ProjectRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    let (parent_id, parent_name) = resolve_link(link(el, "parent"));
    Some(db::ProjectRow {
        id,
        identifier: text(el, "identifier"),
        name: text(el, "name"),
        description: formattable(el, "description"),
        status: text(el, "status"),
        is_public: el.get("public").and_then(Value::as_bool).unwrap_or(false),
        parent_id,
        parent_name,
        created_at: datetime(el, "createdAt"),
        updated_at: datetime(el, "updatedAt"),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_user(el: &Value) -> Option<db::UserRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    Some(db::UserRow {
        id,
        login: text(el, "login"),
        first_name: text(el, "firstName"),
        last_name: text(el, "lastName"),
        name: text(el, "name"),
        mail: text(el, "email"),
        admin: el.get("admin").and_then(Value::as_bool).unwrap_or(false),
        avatar: opt_text(el, "avatar"),
        status: opt_text(el, "status"),
        created_at: datetime(el, "createdAt"),
        updated_at: datetime(el, "updatedAt"),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_work_package(el: &Value) -> Option<db::WorkPackageRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    let (project_id, project_name) = resolve_link(link(el, "project"));
    let (type_id, type_name) = resolve_link(link(el, "type"));
    let (status_id, status_name) = resolve_link(link(el, "status"));
    let (priority_id, priority_name) = resolve_link(link(el, "priority"));
    let (assignee_id, assignee_name) = resolve_link(link(el, "assignee"));
    let (responsible_id, responsible_name) = resolve_link(link(el, "responsible"));
    let (author_id, author_name) = resolve_link(link(el, "author"));
    let (parent_id, _) = resolve_link(link(el, "parent"));
    let (version_id, version_name) = resolve_link(link(el, "version"));
    let (category_id, category_name) = resolve_link(link(el, "category"));

    Some(db::WorkPackageRow {
        id,
        subject: text(el, "subject"),
        description: formattable(el, "description"),
        start_date: date(el, "startDate"),
        due_date: date(el, "dueDate"),
        created_at: datetime(el, "createdAt"),
        updated_at: datetime(el, "updatedAt"),
        estimated_hours: duration_hours(el, "estimatedTime"),
        spent_hours: duration_hours(el, "spentTime"),
        project_id,
        project_name,
        project_identifier: None, // repaired from tool_projects afterwards
        type_id,
        type_name,
        status_id,
        status_name,
        status_is_closed: false, // repaired from tool_statuses afterwards
        priority_id,
        priority_name,
        assignee_id,
        assignee_name,
        assignee_login: None,
        responsible_id,
        responsible_name,
        responsible_login: None,
        author_id,
        author_name,
        author_login: None,
        parent_id,
        version_id,
        version_name,
        category_id,
        category_name,
        custom_fields: custom_fields_json(el),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_time_entry(el: &Value) -> Option<db::TimeEntryRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    let (work_package_id, work_package_title) = resolve_link(link(el, "workPackage"));
    let (user_id, user_name) = resolve_link(link(el, "user"));
    let (activity_id, activity_name) = resolve_link(link(el, "activity"));
    let (project_id, project_name) = resolve_link(link(el, "project"));
    Some(db::TimeEntryRow {
        id,
        hours: duration_hours(el, "hours"),
        comment: formattable(el, "comment"),
        spent_on: date(el, "spentOn"),
        work_package_id,
        work_package_title,
        user_id,
        user_name,
        activity_id,
        activity_name,
        project_id,
        project_name,
        created_at: datetime(el, "createdAt"),
        updated_at: datetime(el, "updatedAt"),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_version(el: &Value) -> Option<db::VersionRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    let (project_id, project_name) = resolve_link(link(el, "definingProject"));
    Some(db::VersionRow {
        id,
        name: text(el, "name"),
        description: formattable(el, "description"),
        status: text(el, "status"),
        start_date: date(el, "startDate"),
        due_date: date(el, "endDate"),
        project_id,
        project_name,
        created_at: datetime(el, "createdAt"),
        updated_at: datetime(el, "updatedAt"),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_status(el: &Value) -> Option<db::StatusRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    Some(db::StatusRow {
        id,
        name: text(el, "name"),
        is_closed: el.get("isClosed").and_then(Value::as_bool).unwrap_or(false),
        is_default: el.get("isDefault").and_then(Value::as_bool).unwrap_or(false),
        position: el.get("position").and_then(Value::as_i64),
        color: opt_text(el, "color"),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_type(el: &Value) -> Option<db::TypeRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    Some(db::TypeRow {
        id,
        name: text(el, "name"),
        color: opt_text(el, "color"),
        position: el.get("position").and_then(Value::as_i64),
        is_default: el.get("isDefault").and_then(Value::as_bool).unwrap_or(false),
        is_milestone: el.get("isMilestone").and_then(Value::as_bool).unwrap_or(false),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_priority(el: &Value) -> Option<db::PriorityRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    Some(db::PriorityRow {
        id,
        name: text(el, "name"),
        position: el.get("position").and_then(Value::as_i64),
        color: opt_text(el, "color"),
        is_default: el.get("isDefault").and_then(Value::as_bool).unwrap_or(false),
        is_active: el.get("isActive").and_then(Value::as_bool).unwrap_or(true),
        all_fields: Some(el.to_string()),
    })
}

fn flatten_activity(el: &Value) -> Option<db::ActivityRow> {
    let id = el.get("id").and_then(Value::as_i64)?;
    Some(db::ActivityRow {
        id,
        name: text(el, "name"),
        position: el.get("position").and_then(Value::as_i64),
        is_default: el.get("default").and_then(Value::as_bool).unwrap_or(false),
        is_active: true,
        all_fields: Some(el.to_string()),
    })
}

/// Cross-entity back-fill after all entities are extracted: work package
/// logins from users, project identifiers from projects, closed flags
/// from statuses. COALESCE keeps existing values where no match exists.
pub fn repair_references(conn: &Connection, cid: i64) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for (column, key) in [
        ("assignee_login", "assignee_id"),
        ("responsible_login", "responsible_id"),
        ("author_login", "author_id"),
    ] {
        tx.execute(
            &format!(
                "UPDATE tool_work_packages SET {column} = COALESCE(
                     (SELECT u.login FROM tool_users u
                      WHERE u.connection_id = tool_work_packages.connection_id
                        AND u.id = tool_work_packages.{key}),
                     {column})
                 WHERE connection_id = ?1 AND {key} IS NOT NULL"
            ),
            [cid],
        )?;
    }
    tx.execute(
        "UPDATE tool_work_packages SET project_identifier = COALESCE(
             (SELECT p.identifier FROM tool_projects p
              WHERE p.connection_id = tool_work_packages.connection_id
                AND p.id = tool_work_packages.project_id),
             project_identifier)
         WHERE connection_id = ?1 AND project_id IS NOT NULL",
        [cid],
    )?;
    tx.execute(
        "UPDATE tool_work_packages SET status_is_closed = COALESCE(
             (SELECT s.is_closed FROM tool_statuses s
              WHERE s.connection_id = tool_work_packages.connection_id
                AND s.id = tool_work_packages.status_id),
             status_is_closed)
         WHERE connection_id = ?1 AND status_id IS NOT NULL",
        [cid],
    )?;
    tx.commit()?;
    Ok(())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mem() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    fn raw_page(conn: &Connection, entity: EntityType, created_at: &str, elements: Value) {
        db::insert_raw(conn, entity, &db::RawPageRow {
            connection_id: 1,
            params: "{}".into(),
            url: "https://op.example".into(),
            input: None,
            data: Some(json!({"_embedded": {"elements": elements}, "total": 0}).to_string()),
            error: None,
            created_at: created_at.into(),
        })
        .unwrap();
    }

    fn wp_element(id: i64, subject: &str) -> Value {
        json!({
            "id": id,
            "subject": subject,
            "description": {"format": "markdown", "raw": "body", "html": "<p>body</p>"},
            "estimatedTime": "PT8H30M",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-03T00:00:00Z",
            "_links": {
                "project": {"href": "/api/v3/projects/7", "title": "Platform"},
                "type": {"href": "/api/v3/types/2", "title": "Bug"},
                "status": {"href": "/api/v3/statuses/13", "title": "Closed"},
                "assignee": {"href": "/api/v3/users/42", "title": "Ada"}
            }
        })
    }

    #[test]
    fn newest_raw_batch_wins_dedup() {
        let conn = mem();
        raw_page(&conn, EntityType::WorkPackages, "2024-01-01T00:00:00Z",
            json!([wp_element(1, "stale subject")]));
        raw_page(&conn, EntityType::WorkPackages, "2024-02-01T00:00:00Z",
            json!([wp_element(1, "fresh subject"), wp_element(2, "other")]));

        let n = extract(&conn, 1, EntityType::WorkPackages).unwrap();
        assert_eq!(n, 2);
        let rows = db::fetch_work_packages(&conn, 1).unwrap();
        assert_eq!(rows[0].subject, "fresh subject");
    }

    #[test]
    fn flattening_resolves_links_and_durations() {
        let conn = mem();
        raw_page(&conn, EntityType::WorkPackages, "2024-01-01T00:00:00Z",
            json!([wp_element(9, "one")]));
        extract(&conn, 1, EntityType::WorkPackages).unwrap();

        let wp = &db::fetch_work_packages(&conn, 1).unwrap()[0];
        assert_eq!(wp.project_id, Some(7));
        assert_eq!(wp.project_name.as_deref(), Some("Platform"));
        assert_eq!(wp.type_name.as_deref(), Some("Bug"));
        assert_eq!(wp.status_id, Some(13));
        assert_eq!(wp.assignee_id, Some(42));
        assert_eq!(wp.estimated_hours, Some(8.5));
        assert_eq!(wp.description, "body");
        assert_eq!(wp.created_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn malformed_elements_are_skipped_not_fatal() {
        let conn = mem();
        raw_page(&conn, EntityType::Projects, "2024-01-01T00:00:00Z",
            json!([
                {"name": "no id here"},
                {"id": "forty-two", "name": "bad id"},
                {"id": 3, "identifier": "ok", "name": "Good"}
            ]));
        let n = extract(&conn, 1, EntityType::Projects).unwrap();
        assert_eq!(n, 1);
        assert_eq!(db::fetch_projects(&conn, 1).unwrap()[0].identifier, "ok");
    }

    #[test]
    fn unparseable_raw_page_does_not_stop_siblings() {
        let conn = mem();
        db::insert_raw(&conn, EntityType::Users, &db::RawPageRow {
            connection_id: 1,
            params: "{}".into(),
            url: "https://op.example".into(),
            input: None,
            data: Some("not json at all".into()),
            error: None,
            created_at: "2024-03-01T00:00:00Z".into(),
        }).unwrap();
        raw_page(&conn, EntityType::Users, "2024-01-01T00:00:00Z",
            json!([{"id": 42, "login": "ada", "name": "Ada"}]));

        assert_eq!(extract(&conn, 1, EntityType::Users).unwrap(), 1);
    }

    #[test]
    fn three_pages_accumulate_to_full_count() {
        let conn = mem();
        let page = |lo: i64, hi: i64| -> Value {
            json!((lo..hi).map(|i| json!({"id": i, "subject": format!("wp {i}")}))
                .collect::<Vec<_>>())
        };
        raw_page(&conn, EntityType::WorkPackages, "2024-01-01T00:00:03Z", page(0, 100));
        raw_page(&conn, EntityType::WorkPackages, "2024-01-01T00:00:02Z", page(100, 200));
        raw_page(&conn, EntityType::WorkPackages, "2024-01-01T00:00:01Z", page(200, 242));

        assert_eq!(extract(&conn, 1, EntityType::WorkPackages).unwrap(), 242);
    }

    #[test]
    fn repair_backfills_logins_identifier_and_closed_flag() {
        let conn = mem();
        db::replace_users(&conn, 1, &[db::UserRow {
            id: 42, login: "ada".into(), name: "Ada".into(), ..Default::default()
        }]).unwrap();
        db::replace_projects(&conn, 1, &[db::ProjectRow {
            id: 7, identifier: "platform".into(), name: "Platform".into(), ..Default::default()
        }]).unwrap();
        db::replace_statuses(&conn, 1, &[db::StatusRow {
            id: 13, name: "Closed".into(), is_closed: true, ..Default::default()
        }]).unwrap();
        db::replace_work_packages(&conn, 1, &[db::WorkPackageRow {
            id: 1,
            assignee_id: Some(42),
            author_id: Some(999), // no such user: login stays NULL
            project_id: Some(7),
            status_id: Some(13),
            ..Default::default()
        }]).unwrap();

        repair_references(&conn, 1).unwrap();

        let wp = &db::fetch_work_packages(&conn, 1).unwrap()[0];
        assert_eq!(wp.assignee_login.as_deref(), Some("ada"));
        assert_eq!(wp.author_login, None);
        assert_eq!(wp.project_identifier.as_deref(), Some("platform"));
        assert!(wp.status_is_closed);
    }
}
