//! # Data Models
//!
//! SeaORM entities for the master database ([`master`]) and the per-company
//! tenant databases ([`tenant`]).

use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

pub mod master;
pub mod tenant;

pub use master::invitation_token::Entity as InvitationToken;
pub use master::secret::Entity as Secret;
pub use master::slack_install_state::Entity as SlackInstallState;
pub use master::slack_workspace::Entity as SlackWorkspace;
pub use master::tenant::Entity as Tenant;

pub use tenant::chat_message::Entity as ChatMessage;
pub use tenant::chat_room::Entity as ChatRoom;
pub use tenant::company::Entity as Company;
pub use tenant::company_user::Entity as CompanyUser;
pub use tenant::csv_file::Entity as CsvFile;
pub use tenant::senpai::Entity as Senpai;

/// String array persisted as a JSON column.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }
}

impl From<Vec<String>> for StringList {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl From<StringList> for Vec<String> {
    fn from(list: StringList) -> Self {
        list.0
    }
}
