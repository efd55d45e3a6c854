use crate::{
    app::CampusContext,
    error::CampusResult,
    schema::{
        db::Complaint,
        query::{CollectionPath, Direction, Query, CREATED_AT},
    },
    sync::{LiveView, Subscription, ViewStatus},
};

/// Complaints submitted by the signed-in user, newest first.
pub struct MyComplaintsPage {
    complaints: LiveView<Complaint>,
    _subscription: Subscription,
}

impl MyComplaintsPage {
    pub fn mount(ctx: &CampusContext) -> CampusResult<Self> {
        let user = ctx.session.require_user()?;
        let query = Query::collection(CollectionPath::complaints())
            .where_eq("createdBy", user.id)
            .order_by(CREATED_AT, Direction::Descending);
        let (complaints, subscription) = LiveView::bind(&ctx.subscriptions, query);
        Ok(Self {
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

    pub fn items(&self) -> Vec<Complaint> {
        self.complaints.items()
    }
}
