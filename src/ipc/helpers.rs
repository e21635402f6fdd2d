use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeSet;

use crate::access::{Role, UserAccess};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// Terms run 1..=3 in the school year.
pub fn required_term(req: &Request) -> Result<i64, serde_json::Value> {
    let term = required_i64(req, "term")?;
    if !(1..=3).contains(&term) {
        return Err(err(
            &req.id,
            "bad_params",
            "term must be in 1..=3",
            Some(json!({ "term": term })),
        ));
    }
    Ok(term)
}

pub fn required_year(req: &Request) -> Result<i64, serde_json::Value> {
    let year = required_i64(req, "year")?;
    if !(1970..=2100).contains(&year) {
        return Err(err(
            &req.id,
            "bad_params",
            "year must be in 1970..=2100",
            Some(json!({ "year": year })),
        ));
    }
    Ok(year)
}

fn string_set(
    req: &Request,
    auth: &serde_json::Value,
    key: &str,
) -> Result<BTreeSet<String>, serde_json::Value> {
    let Some(raw) = auth.get(key) else {
        return Ok(BTreeSet::new());
    };
    if raw.is_null() {
        return Ok(BTreeSet::new());
    }
    let Some(items) = raw.as_array() else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("auth.{} must be an array of strings", key),
            None,
        ));
    };
    let mut out = BTreeSet::new();
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("auth.{} must contain only strings", key),
                None,
            ));
        };
        out.insert(s.to_string());
    }
    Ok(out)
}

/// Rebuild the caller descriptor from the request's verified credential.
/// Scoped endpoints fail closed when it is absent.
pub fn user_access(req: &Request) -> Result<UserAccess, serde_json::Value> {
    let Some(auth) = req.params.get("auth") else {
        return Err(err(
            &req.id,
            "auth_required",
            "missing auth descriptor",
            None,
        ));
    };
    let Some(role_raw) = auth.get("role").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "auth_required", "missing auth.role", None));
    };
    let Some(role) = Role::parse(role_raw) else {
        return Err(err(
            &req.id,
            "bad_params",
            "unknown auth.role",
            Some(json!({ "role": role_raw })),
        ));
    };

    Ok(UserAccess {
        role,
        assigned_classes: string_set(req, auth, "assignedClasses")?,
        assigned_subjects: string_set(req, auth, "assignedSubjects")?,
    })
}

/// Catalog mutations (classes, subjects, teachers, settings, archives) are
/// reserved for admin-level roles.
pub fn require_admin_level(req: &Request, user: &UserAccess) -> Result<(), serde_json::Value> {
    if user.role.is_admin_level() {
        return Ok(());
    }
    Err(err(
        &req.id,
        "forbidden",
        "requires an admin-level role",
        Some(json!({ "role": user.role.as_str() })),
    ))
}

/// Class-level mutations (students, remarks) are open to admin-level roles
/// and to the class/form teacher of that class.
pub fn can_manage_class(user: &UserAccess, class_id: &str) -> bool {
    match user.role {
        Role::Admin | Role::HeadTeacher => true,
        Role::ClassTeacher | Role::FormMaster => user.assigned_classes.contains(class_id),
        Role::SubjectTeacher => false,
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
