//! Entities stored in each company's tenant database.

pub mod chat_message;
pub mod chat_room;
pub mod company;
pub mod company_user;
pub mod csv_file;
pub mod senpai;
