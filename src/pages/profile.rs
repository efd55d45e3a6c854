use crate::{app::CampusContext, error::CampusResult, schema::db::Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub avatar: Option<String>,
}

impl Profile {
    pub fn load(ctx: &CampusContext) -> CampusResult<Self> {
        let user = ctx.session.require_user()?;
        Ok(Self {
            name: user.display_name,
            email: user.email,
            role: user.role,
            avatar: user.avatar,
        })
    }
}
