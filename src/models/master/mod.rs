//! Entities stored in the shared master database.

pub mod invitation_token;
pub mod secret;
pub mod slack_install_state;
pub mod slack_workspace;
pub mod tenant;
