use serde::{Deserialize, Serialize};

use super::db::Status;

pub const DEFAULT_CATEGORY: &str = "General";

/// Matches every category or status in dashboard filters.
pub const ALL: &str = "All";

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct NewComplaint {
    pub title: String,
    pub description: String,
    pub category: String,
}

/// File attached to a submission.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DashboardCriteria {
    pub search: String,
    pub category: String,
    pub status: String,
}

impl Default for DashboardCriteria {
    fn default() -> Self {
        Self {
            search: String::new(),
            category: ALL.to_string(),
            status: ALL.to_string(),
        }
    }
}

impl DashboardCriteria {
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status.as_str().to_string();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }
}
