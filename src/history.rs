//! Append-only snapshots of child records.

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{Child, ChildHistoryEntry, NewChildHistoryEntry};
use crate::schema::child_history;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Archived,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Archived => "archived",
        }
    }
}

pub fn snapshot(child: &Child) -> Value {
    json!({
        "id": child.id,
        "site_id": child.site_id,
        "last_name": child.last_name,
        "first_name": child.first_name,
        "birth_date": child.birth_date,
        "sex": child.sex,
        "birth_place": child.birth_place,
        "photo_key": child.photo_key,
        "arrival_date": child.arrival_date,
        "admission_reason": child.admission_reason,
        "life_story": child.life_story,
        "status": child.status,
        "departure_date": child.departure_date,
        "is_active": child.is_active,
        "updated_at": to_iso(child.updated_at),
    })
}

/// Stores the current state of `child`. Call inside the transaction that
/// performed the change.
pub fn record(
    conn: &mut PgConnection,
    child: &Child,
    kind: ChangeKind,
    changed_by: Uuid,
) -> QueryResult<ChildHistoryEntry> {
    let entry = NewChildHistoryEntry {
        id: Uuid::new_v4(),
        child_id: child.id,
        change_kind: kind.as_str().to_string(),
        snapshot: snapshot(child),
        changed_by: Some(changed_by),
    };
    diesel::insert_into(child_history::table)
        .values(&entry)
        .get_result(conn)
}

pub fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn snapshot_carries_every_tracked_field() {
        let now = Utc::now().naive_utc();
        let child = Child {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            last_name: "Mensah".into(),
            first_name: "Afi".into(),
            birth_date: NaiveDate::from_ymd_opt(2015, 2, 14).unwrap(),
            sex: "F".into(),
            birth_place: "Kpalimé".into(),
            photo_key: None,
            arrival_date: NaiveDate::from_ymd_opt(2020, 9, 1).unwrap(),
            admission_reason: "Orpheline".into(),
            life_story: String::new(),
            status: "adopte".into(),
            departure_date: NaiveDate::from_ymd_opt(2023, 6, 30),
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let value = snapshot(&child);
        assert_eq!(value["status"], "adopte");
        assert_eq!(value["departure_date"], "2023-06-30");
        assert_eq!(value["photo_key"], Value::Null);
        assert_eq!(value["site_id"], child.site_id.to_string());
    }
}
