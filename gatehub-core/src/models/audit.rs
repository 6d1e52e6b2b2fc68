use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Y/N flag column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Flag {
    Y,
    #[default]
    N,
}

text_enum!(Flag, "flag", { Y => "Y", N => "N" });

impl Flag {
    #[must_use]
    pub const fn is_set(self) -> bool {
        matches!(self, Self::Y)
    }
}

impl From<bool> for Flag {
    fn from(value: bool) -> Self {
        if value {
            Self::Y
        } else {
            Self::N
        }
    }
}

/// Standard audit columns carried by every persisted row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFields {
    pub add_time: DateTime<Utc>,
    pub add_who: String,
    pub edit_time: DateTime<Utc>,
    pub edit_who: String,
    /// Optimistic concurrency counter, bumped by every successful update
    pub version: i64,
    pub active_flag: Flag,
    pub note_text: Option<String>,
    pub ext_property: Option<serde_json::Value>,
    pub reserved1: Option<String>,
    pub reserved2: Option<String>,
    pub reserved3: Option<String>,
}

impl AuditFields {
    #[must_use]
    pub fn new(who: impl Into<String>) -> Self {
        let now = Utc::now();
        let who = who.into();
        Self {
            add_time: now,
            add_who: who.clone(),
            edit_time: now,
            edit_who: who,
            version: 1,
            active_flag: Flag::Y,
            note_text: None,
            ext_property: None,
            reserved1: None,
            reserved2: None,
            reserved3: None,
        }
    }

    /// Record an edit; the version itself is bumped by the store on write
    pub fn touch(&mut self, who: impl Into<String>) {
        self.edit_time = Utc::now();
        self.edit_who = who.into();
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active_flag.is_set()
    }
}

impl Default for AuditFields {
    fn default() -> Self {
        Self::new("system")
    }
}
