//! # Repository Layer
//!
//! SeaORM access for the master registry and the per-company tenant
//! databases. Repositories borrow a connection and return `sea_orm::DbErr`;
//! mapping to API errors happens in the services.

pub mod chat;
pub mod company;
pub mod csv_file;
pub mod invitation_token;
pub mod secret;
pub mod slack;
pub mod tenant;

pub use chat::{ChatRepository, NewMessage};
pub use company::{CompanyRepository, CompanyUserRepository, NewCompanyUser, SenpaiRepository};
pub use csv_file::CsvFileRepository;
pub use invitation_token::InvitationTokenRepository;
pub use secret::{SecretError, SecretRepository, slack_token_name};
pub use slack::{SlackInstallStateRepository, SlackWorkspaceRepository};
pub use tenant::TenantRepository;
