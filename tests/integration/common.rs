//! Shared setup: in-memory stores, a hand-driven clock and a mailbox that records

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use libris_server::{
    clock::{Clock, ManualClock},
    models::{Book, CreateBook, Identity, Member, MemberFilter, RegisterMember, Role, BookFilter},
    repository::{memory::MemoryTokenStore, BookStore, MemberStore, Repository},
    services::{email::Notifier, Services},
    AppConfig, AppResult,
};

#[derive(Debug, Clone)]
pub struct Sent {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipients: &[String], subject: &str, body: &str) -> AppResult<()> {
        self.sent.lock().unwrap().push(Sent {
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

pub struct Harness {
    pub repository: Repository,
    pub services: Services,
    pub clock: Arc<ManualClock>,
    pub mailbox: Arc<RecordingNotifier>,
    pub admin: Identity,
}

impl Harness {
    pub async fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let repository = Repository::in_memory_with_clock(clock.clone());
        let mailbox = Arc::new(RecordingNotifier::default());
        let services = Services::new(
            repository.clone(),
            Arc::new(MemoryTokenStore::default()),
            mailbox.clone(),
            clock.clone(),
            &AppConfig::default(),
        );

        let admin = services
            .auth
            .register(RegisterMember {
                name: "Librarian".to_string(),
                email: "librarian@libris.test".to_string(),
                password: Some("shelves".to_string()),
                role: Role::Admin,
                newsletter: false,
            })
            .await
            .unwrap();

        Self {
            repository,
            services,
            clock,
            mailbox,
            admin: Identity::admin(admin.member.id),
        }
    }

    /// Register a member with a plan running for another month
    pub async fn member(&self, name: &str) -> Member {
        let registered = self
            .services
            .auth
            .register(RegisterMember {
                name: name.to_string(),
                email: format!("{}@libris.test", name.to_lowercase()),
                password: Some("secret".to_string()),
                role: Role::Member,
                newsletter: true,
            })
            .await
            .unwrap();

        self.repository
            .members
            .set_subscription_end(registered.member.id, self.clock.now() + Duration::days(30))
            .await
            .unwrap()
    }

    pub async fn book(&self, title: &str, stock: i32) -> Book {
        self.services
            .catalog
            .add_book(
                &self.admin,
                CreateBook {
                    title: title.to_string(),
                    author: "Anon".to_string(),
                    genres: vec!["Fiction".to_string()],
                    stock,
                    rating: 0.0,
                },
            )
            .await
            .unwrap()
    }

    pub async fn fetch_book(&self, id: uuid::Uuid) -> Book {
        self.repository.books.get(id).await.unwrap().unwrap()
    }

    pub async fn fetch_member(&self, id: uuid::Uuid) -> Member {
        self.repository.members.get(id).await.unwrap().unwrap()
    }

    /// Holds after every completed transition
    pub async fn assert_consistent(&self) {
        let books = self.repository.books.list(&BookFilter::default()).await.unwrap();
        let members = self
            .repository
            .members
            .list(&MemberFilter::default())
            .await
            .unwrap();

        let mut book_side = HashSet::new();
        for book in &books {
            assert!(book.stock >= 0, "negative stock on {}", book.title);
            assert!(book.rating >= 0.0 && book.rating <= 5.0);
            for entry in &book.issued_to {
                assert!(
                    book_side.insert((book.id, entry.member_id)),
                    "{} issued twice to one member",
                    book.title
                );
            }
        }

        let mut member_side = HashSet::new();
        for member in &members {
            assert!(member.issued_books.len() <= 2, "{} holds too many", member.name);
            for book_id in &member.issued_books {
                member_side.insert((*book_id, member.id));
                assert!(member.read_history.contains(book_id));
            }
        }

        assert_eq!(book_side, member_side);
    }
}
