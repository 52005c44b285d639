//! Postgres store backends

mod activities;
mod books;
mod comments;
mod members;

pub use activities::PgActivityLedger;
pub use books::PgBookStore;
pub use comments::PgCommentStore;
pub use members::PgMemberStore;
