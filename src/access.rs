use serde::Serialize;
use std::collections::BTreeSet;

/// Staff roles recognized by the access layer. The set is closed: anything
/// else in a credential is a request error, not a silently-ignored flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    HeadTeacher,
    ClassTeacher,
    FormMaster,
    SubjectTeacher,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "head_teacher" => Some(Self::HeadTeacher),
            "class_teacher" => Some(Self::ClassTeacher),
            "form_master" => Some(Self::FormMaster),
            "subject_teacher" => Some(Self::SubjectTeacher),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::HeadTeacher => "head_teacher",
            Self::ClassTeacher => "class_teacher",
            Self::FormMaster => "form_master",
            Self::SubjectTeacher => "subject_teacher",
        }
    }

    /// Admin and head teacher see everything and may manage catalog data.
    pub fn is_admin_level(self) -> bool {
        matches!(self, Self::Admin | Self::HeadTeacher)
    }
}

/// Verified caller descriptor. Rebuilt from the request credential on every
/// call; never stored in `AppState` and never written back.
#[derive(Debug, Clone)]
pub struct UserAccess {
    pub role: Role,
    pub assigned_classes: BTreeSet<String>,
    pub assigned_subjects: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    Class,
    Subject,
}

impl AccessDenied {
    pub fn code(self) -> &'static str {
        match self {
            Self::Class => "class_access_denied",
            Self::Subject => "subject_access_denied",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Class => "class is outside the caller's assigned classes",
            Self::Subject => "subject is outside the caller's assigned subjects",
        }
    }
}

/// Filter set to inject into downstream queries. `None` on an axis means
/// unrestricted; `Some(empty)` legitimately matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classes: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjects: Option<BTreeSet<String>>,
}

impl AccessScope {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn allows_class(&self, class_id: &str) -> bool {
        self.classes.as_ref().map(|c| c.contains(class_id)).unwrap_or(true)
    }

    pub fn allows_subject(&self, subject_id: &str) -> bool {
        self.subjects
            .as_ref()
            .map(|s| s.contains(subject_id))
            .unwrap_or(true)
    }
}

/// Decide whether the caller may touch the requested class/subject and, if
/// so, how far downstream queries must be narrowed.
///
/// A class or form teacher requesting their own class sees every subject in
/// it; the subject restriction only binds outside that anchor. Denials are
/// values for the router to surface, never panics.
pub fn check_access(
    user: &UserAccess,
    requested_class: Option<&str>,
    requested_subject: Option<&str>,
) -> Result<AccessScope, AccessDenied> {
    match user.role {
        Role::Admin | Role::HeadTeacher => Ok(AccessScope::unrestricted()),
        Role::ClassTeacher | Role::FormMaster => {
            let own_class = match requested_class {
                Some(class_id) => {
                    if !user.assigned_classes.contains(class_id) {
                        return Err(AccessDenied::Class);
                    }
                    true
                }
                None => false,
            };

            if own_class {
                // Full subject visibility inside the anchored class.
                return Ok(AccessScope {
                    classes: Some(user.assigned_classes.clone()),
                    subjects: None,
                });
            }

            if let Some(subject_id) = requested_subject {
                if !user.assigned_subjects.contains(subject_id) {
                    return Err(AccessDenied::Subject);
                }
            }
            Ok(AccessScope {
                classes: Some(user.assigned_classes.clone()),
                subjects: Some(user.assigned_subjects.clone()),
            })
        }
        Role::SubjectTeacher => {
            if let Some(class_id) = requested_class {
                if !user.assigned_classes.contains(class_id) {
                    return Err(AccessDenied::Class);
                }
            }
            if let Some(subject_id) = requested_subject {
                if !user.assigned_subjects.contains(subject_id) {
                    return Err(AccessDenied::Subject);
                }
            }
            Ok(AccessScope {
                classes: Some(user.assigned_classes.clone()),
                subjects: Some(user.assigned_subjects.clone()),
            })
        }
    }
}
