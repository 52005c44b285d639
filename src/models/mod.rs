//! Data models for Libris

pub mod activity;
pub mod book;
pub mod comment;
pub mod member;
pub mod token;

// Re-export commonly used types
pub use activity::{ActivityAction, ActivityQuery, ActivityRecord};
pub use book::{Book, BookFilter, CreateBook, IssueEntry, OverdueBook, StockAdjustment};
pub use comment::{Comment, RateBook};
pub use member::{Identity, Member, MemberFilter, MemberShort, NewMember, RegisterMember, Role};
pub use token::{ActionToken, TokenAction};
