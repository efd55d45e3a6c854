//! Admin dashboard: every complaint with search, filters and CSV export.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{
    app::CampusContext,
    error::CampusResult,
    schema::{
        api::{DashboardCriteria, ALL},
        db::{Complaint, Status},
    },
    sync::{LiveView, Outcome, Subscription, ViewStatus},
};

pub use crate::utils::shorten;

pub const CSV_HEADERS: [&str; 6] = [
    "title",
    "description",
    "category",
    "status",
    "createdBy",
    "createdAt",
];

pub struct AdminDashboard {
    ctx: CampusContext,
    complaints: LiveView<Complaint>,
    _subscription: Subscription,
}

impl AdminDashboard {
    pub fn mount(ctx: &CampusContext) -> CampusResult<Self> {
        ctx.session.require_admin()?;
        let (complaints, subscription) =
            LiveView::bind(&ctx.subscriptions, super::all_complaints());
        Ok(Self {
            ctx: ctx.clone(),
            complaints,
            _subscription: subscription,
        })
    }

    pub fn view(&self) -> &LiveView<Complaint> {
        &self.complaints
    }

    pub fn status(&self) -> ViewStatus {
        self.complaints.status()
    }

    pub fn complaints(&self) -> Vec<Complaint> {
        self.complaints.items()
    }

    pub fn filtered(&self, criteria: &DashboardCriteria) -> Vec<Complaint> {
        filter_complaints(self.complaints(), criteria)
    }

    pub fn categories(&self) -> Vec<String> {
        category_options(&self.complaints())
    }

    pub fn statuses(&self) -> Vec<String> {
        status_options(&self.complaints())
    }

    /// CSV of the rows matching `criteria`, or `None` when nothing matches.
    pub fn export_csv(&self, criteria: &DashboardCriteria) -> Option<String> {
        let rows = self.filtered(criteria);
        (!rows.is_empty()).then(|| to_csv(&rows))
    }

    pub async fn mark_resolved(&self, id: &str) -> CampusResult<Outcome<Status>> {
        self.set_status(id, Status::Resolved).await
    }

    pub async fn set_status(&self, id: &str, status: Status) -> CampusResult<Outcome<Status>> {
        super::change_status(&self.ctx, &self.complaints, id, status).await
    }
}

/// Title search is a case-insensitive substring match; category and status
/// match exactly unless set to "All".
pub fn filter_complaints(items: Vec<Complaint>, criteria: &DashboardCriteria) -> Vec<Complaint> {
    let search = criteria.search.trim().to_lowercase();
    items
        .into_iter()
        .filter(|c| search.is_empty() || c.title.to_lowercase().contains(&search))
        .filter(|c| criteria.category == ALL || c.category == criteria.category)
        .filter(|c| criteria.status == ALL || c.status.as_str() == criteria.status)
        .collect()
}

fn with_all(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut options = vec![ALL.to_string()];
    for value in values {
        if !options.contains(&value) {
            options.push(value);
        }
    }
    options
}

/// "All" followed by each non-empty category in first-seen order.
pub fn category_options(items: &[Complaint]) -> Vec<String> {
    with_all(
        items
            .iter()
            .map(|c| c.category.clone())
            .filter(|category| !category.is_empty()),
    )
}

pub fn status_options(items: &[Complaint]) -> Vec<String> {
    with_all(items.iter().map(|c| c.status.as_str().to_string()))
}

fn quoted(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

pub fn to_csv(items: &[Complaint]) -> String {
    let mut lines = vec![CSV_HEADERS.join(",")];
    for c in items {
        let created_at = c
            .created_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        lines.push(
            [
                quoted(&c.title),
                quoted(&c.description),
                c.category.clone(),
                c.status.to_string(),
                c.created_by.clone(),
                created_at,
            ]
            .join(","),
        );
    }
    lines.join("\n")
}

pub fn export_file_name(now: DateTime<Utc>) -> String {
    format!("complaints-{}.csv", now.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn complaint(title: &str, category: &str, status: Status) -> Complaint {
        Complaint {
            id: title.to_lowercase(),
            title: title.to_string(),
            category: category.to_string(),
            status,
            ..Default::default()
        }
    }

    fn sample() -> Vec<Complaint> {
        vec![
            complaint("Broken AC", "Facilities", Status::Open),
            complaint("Wifi drops", "IT", Status::InProgress),
            complaint("AC noisy", "Facilities", Status::Resolved),
            complaint("No title category", "", Status::Open),
        ]
    }

    fn titles(items: &[Complaint]) -> Vec<&str> {
        items.iter().map(|c| c.title.as_str()).collect()
    }

    #[test]
    fn default_criteria_match_everything() {
        let all = filter_complaints(sample(), &DashboardCriteria::default());
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn filters_combine() {
        let criteria = DashboardCriteria::default().with_search("ac");
        assert_eq!(
            titles(&filter_complaints(sample(), &criteria)),
            vec!["Broken AC", "AC noisy"]
        );

        let criteria = criteria.with_status(Status::Resolved);
        assert_eq!(titles(&filter_complaints(sample(), &criteria)), vec!["AC noisy"]);

        let criteria = DashboardCriteria::default().with_category("IT");
        assert_eq!(titles(&filter_complaints(sample(), &criteria)), vec!["Wifi drops"]);
    }

    #[test]
    fn option_lists_keep_first_seen_order() {
        assert_eq!(category_options(&sample()), vec!["All", "Facilities", "IT"]);
        assert_eq!(
            status_options(&sample()),
            vec!["All", "open", "in-progress", "resolved"]
        );
    }

    #[test]
    fn csv_quotes_free_text() {
        let mut c = complaint("Say \"hi\"", "IT", Status::Open);
        c.description = "line, with comma".into();
        c.created_by = "u1".into();
        c.created_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap());

        let csv = to_csv(&[c]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "title,description,category,status,createdBy,createdAt");
        assert_eq!(
            lines[1],
            "\"Say \"\"hi\"\"\",\"line, with comma\",IT,open,u1,2024-03-01T09:30:00.000Z"
        );
    }

    #[test]
    fn export_name_uses_millis() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(export_file_name(now), "complaints-1700000000123.csv");
    }
}
