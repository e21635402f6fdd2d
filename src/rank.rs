use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Totals closer than this are treated as tied. Wide enough to absorb the
/// rounding drift of upstream float arithmetic on 1-decimal marks.
pub const TIE_EPSILON: f64 = 1e-2;

/// One student's term total in one subject. `position` is request-scoped
/// output only; it is never written back to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    #[serde(default)]
    pub subject_id: String,
    pub student_id: String,
    #[serde(default)]
    pub class_id: String,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

/// Missing or non-finite totals compare as 0; the stored value is untouched.
fn effective_total(total: Option<f64>) -> f64 {
    match total {
        Some(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Lenient numeric extraction for mark payloads: numbers pass through,
/// numeric strings parse, anything else is unscored.
pub fn coerce_total(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Assign competition-style positions per subject.
///
/// Records are grouped by subject in first-seen order, each group is
/// stable-sorted by total descending, and tied totals share a position with
/// the following position skipped (1,1,3 rather than 1,1,2). The per-group
/// results are concatenated back in the original subject order. All input is
/// normalized rather than rejected, so this never fails.
pub fn assign_positions(records: Vec<ScoreRecord>) -> Vec<ScoreRecord> {
    let mut subject_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ScoreRecord>> = HashMap::new();
    for record in records {
        if !groups.contains_key(&record.subject_id) {
            subject_order.push(record.subject_id.clone());
        }
        groups
            .entry(record.subject_id.clone())
            .or_default()
            .push(record);
    }

    let mut out: Vec<ScoreRecord> = Vec::new();
    for subject_id in subject_order {
        let Some(mut group) = groups.remove(&subject_id) else {
            continue;
        };
        // sort_by is stable: tied totals keep their input order.
        group.sort_by(|a, b| {
            effective_total(b.total)
                .partial_cmp(&effective_total(a.total))
                .unwrap_or(Ordering::Equal)
        });

        let mut prev_total = 0.0_f64;
        let mut prev_position = 0_i64;
        for (i, record) in group.iter_mut().enumerate() {
            let total = effective_total(record.total);
            let position = if i == 0 {
                1
            } else if (prev_total - total).abs() <= TIE_EPSILON {
                prev_position
            } else {
                (i as i64) + 1
            };
            record.position = Some(position);
            prev_total = total;
            prev_position = position;
        }
        out.extend(group);
    }
    out
}
