use chrono::Duration;
use tokio_test::{assert_err, assert_ok};

use libris_server::{
    clock::Clock,
    models::{ActivityAction, ActivityQuery, Identity, RateBook, StockAdjustment},
    AppError,
};

use crate::common::Harness;

#[tokio::test]
async fn last_copy_passes_from_one_member_to_the_next() {
    let h = Harness::new().await;
    let book = h.book("Dune", 1).await;
    let alice = h.member("Alice").await;
    let bob = h.member("Bob").await;

    let issued = assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, alice.id).await);
    assert_eq!(issued.book.stock, 0);
    assert_eq!(issued.member.issued_books, vec![book.id]);

    let bob_identity = Identity::member(bob.id);
    let requested = assert_ok!(
        h.services
            .lifecycle
            .request_book(&bob_identity, bob.id, book.id)
            .await
    );
    assert_eq!(requested.requested_by, vec![bob.id]);

    // No copy left for Bob yet
    let err = h
        .services
        .lifecycle
        .issue_book(&h.admin, book.id, bob.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::OutOfStock(_)));

    h.clock.advance(Duration::days(3));
    let returned = assert_ok!(h.services.lifecycle.return_book(&h.admin, book.id, alice.id).await);
    assert_eq!(returned.book.stock, 1);
    assert!(returned.book.issued_to.is_empty());
    assert_eq!(returned.book.requested_by, vec![bob.id]);
    assert!(returned.member.issued_books.is_empty());
    assert!(!returned.was_overdue);

    let issued_at = h.clock.now();
    let issued = assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, bob.id).await);
    assert!(issued.book.requested_by.is_empty());
    assert_eq!(issued.member.issued_books, vec![book.id]);
    assert_eq!(issued.due_date, issued_at + Duration::days(15));
    assert_eq!(issued.book.issued_to[0].due_date, issued.due_date);

    let log = assert_ok!(
        h.services
            .lifecycle
            .activity_log(&h.admin, &ActivityQuery { book_id: Some(book.id), ..Default::default() })
            .await
    );
    let actions: Vec<_> = log.iter().map(|r| (r.member_id, r.action)).collect();
    assert_eq!(
        actions,
        vec![
            (alice.id, ActivityAction::Issue),
            (alice.id, ActivityAction::Return),
            (bob.id, ActivityAction::Issue),
        ]
    );

    h.assert_consistent().await;
}

#[tokio::test]
async fn cancelling_a_request_restores_the_waiting_list() {
    let h = Harness::new().await;
    let book = h.book("Emma", 2).await;
    let carol = h.member("Carol").await;
    let dave = h.member("Dave").await;

    assert_ok!(
        h.services
            .lifecycle
            .request_book(&Identity::member(carol.id), carol.id, book.id)
            .await
    );
    let before = h.fetch_book(book.id).await;

    let me = Identity::member(dave.id);
    assert_ok!(h.services.lifecycle.request_book(&me, dave.id, book.id).await);
    let err = h
        .services
        .lifecycle
        .request_book(&me, dave.id, book.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyRequested { .. }));

    let after = assert_ok!(h.services.lifecycle.cancel_request(&me, dave.id, book.id).await);
    assert_eq!(after.requested_by, before.requested_by);
    assert_eq!(after.stock, before.stock);

    let err = h
        .services
        .lifecycle
        .cancel_request(&me, dave.id, book.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotRequested { .. }));
}

#[tokio::test]
async fn member_cannot_touch_another_members_requests() {
    let h = Harness::new().await;
    let book = h.book("Ulysses", 1).await;
    let erin = h.member("Erin").await;
    let frank = h.member("Frank").await;

    let err = h
        .services
        .lifecycle
        .request_book(&Identity::member(erin.id), frank.id, book.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));
    assert!(h.fetch_book(book.id).await.requested_by.is_empty());
}

#[tokio::test]
async fn third_book_is_refused() {
    let h = Harness::new().await;
    let gina = h.member("Gina").await;
    let a = h.book("A", 1).await;
    let b = h.book("B", 1).await;
    let c = h.book("C", 1).await;

    assert_ok!(h.services.lifecycle.issue_book(&h.admin, a.id, gina.id).await);
    assert_ok!(h.services.lifecycle.issue_book(&h.admin, b.id, gina.id).await);
    let err = h
        .services
        .lifecycle
        .issue_book(&h.admin, c.id, gina.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::IssueLimitReached { limit: 2, .. }));
    assert_eq!(h.fetch_book(c.id).await.stock, 1);

    h.assert_consistent().await;
}

#[tokio::test]
async fn same_book_twice_is_refused() {
    let h = Harness::new().await;
    let hugo = h.member("Hugo").await;
    let book = h.book("Twice", 3).await;

    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, hugo.id).await);
    let err = h
        .services
        .lifecycle
        .issue_book(&h.admin, book.id, hugo.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyIssuedToMember { .. }));
    assert_eq!(h.fetch_book(book.id).await.stock, 2);
}

#[tokio::test]
async fn returning_an_unissued_book_changes_nothing() {
    let h = Harness::new().await;
    let ivy = h.member("Ivy").await;
    let book = h.book("Nowhere", 1).await;

    let err = h
        .services
        .lifecycle
        .return_book(&h.admin, book.id, ivy.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotIssuedToMember { .. }));
    assert_eq!(h.fetch_book(book.id).await.stock, 1);
    assert!(h
        .services
        .lifecycle
        .activity_log(&h.admin, &ActivityQuery::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn late_return_is_flagged() {
    let h = Harness::new().await;
    let jay = h.member("Jay").await;
    let book = h.book("Late", 1).await;

    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, jay.id).await);
    h.clock.advance(Duration::days(16));

    let overdue = assert_ok!(h.services.lifecycle.due_sweep(h.clock.now()).await);
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].overdue[0].member_id, jay.id);

    let returned = assert_ok!(h.services.lifecycle.return_book(&h.admin, book.id, jay.id).await);
    assert!(returned.was_overdue);
    assert!(h.services.lifecycle.due_sweep(h.clock.now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn book_in_circulation_cannot_be_deleted() {
    let h = Harness::new().await;
    let kim = h.member("Kim").await;
    let book = h.book("Kept", 2).await;

    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, kim.id).await);
    let before = h.fetch_book(book.id).await;

    let err = h
        .services
        .lifecycle
        .delete_book(&h.admin, book.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BooksInCirculation(_)));
    assert_eq!(h.fetch_book(book.id).await, before);

    let err = h
        .services
        .lifecycle
        .delete_member(&h.admin, kim.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MemberHasIssuedBooks(_)));

    assert_ok!(h.services.lifecycle.return_book(&h.admin, book.id, kim.id).await);
    assert_ok!(h.services.lifecycle.delete_book(&h.admin, book.id).await);
    assert_err!(h.services.catalog.get_book(book.id).await);
}

#[tokio::test]
async fn deleting_a_member_clears_their_requests() {
    let h = Harness::new().await;
    let lou = h.member("Lou").await;
    let book = h.book("Queued", 0).await;

    assert_ok!(h.services.lifecycle.request_book(&Identity::member(lou.id), lou.id, book.id).await);
    assert_ok!(h.services.lifecycle.delete_member(&h.admin, lou.id).await);

    assert!(h.fetch_book(book.id).await.requested_by.is_empty());
    let err = h
        .services
        .members
        .get(&h.admin, lou.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MemberNotFound(_)));
}

#[tokio::test]
async fn ratings_blend_with_the_running_value() {
    let h = Harness::new().await;
    let max = h.member("Max").await;
    let book = h.book("Rated", 1).await;
    let me = Identity::member(max.id);

    let err = h
        .services
        .lifecycle
        .rate_and_comment(&me, book.id, RateBook { rating: 4.0, comment: "early".to_string() })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotInReadHistory { .. }));

    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, max.id).await);
    assert_ok!(h.services.lifecycle.return_book(&h.admin, book.id, max.id).await);

    let (after_first, _) = assert_ok!(
        h.services
            .lifecycle
            .rate_and_comment(&me, book.id, RateBook { rating: 3.0, comment: "fine".to_string() })
            .await
    );
    assert!((after_first.rating - 1.5).abs() < 1e-9);

    let (after_second, comment) = assert_ok!(
        h.services
            .lifecycle
            .rate_and_comment(
                &me,
                book.id,
                RateBook {
                    rating: 5.0,
                    comment: "grew on me".to_string(),
                },
            )
            .await
    );
    assert!((after_second.rating - 3.25).abs() < 1e-9);
    assert_eq!(after_second.rating_count, 2);
    assert_eq!(comment.member_name, "Max");

    let comments = assert_ok!(h.services.catalog.comments(book.id).await);
    assert_eq!(comments.len(), 2);

    let err = h
        .services
        .lifecycle
        .rate_and_comment(&me, book.id, RateBook { rating: 6.0, comment: "too much".to_string() })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn ratings_three_then_five_from_a_rated_book() {
    let h = Harness::new().await;
    let nia = h.member("Nia").await;
    let book = assert_ok!(
        h.services
            .catalog
            .add_book(
                &h.admin,
                libris_server::models::CreateBook {
                    title: "Seeded".to_string(),
                    author: "Anon".to_string(),
                    genres: vec!["Poetry".to_string()],
                    stock: 1,
                    rating: 2.0,
                },
            )
            .await
    );
    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, nia.id).await);

    let me = Identity::member(nia.id);
    for rating in [3.0, 5.0] {
        assert_ok!(
            h.services
                .lifecycle
                .rate_and_comment(&me, book.id, RateBook { rating, comment: "ok".to_string() })
                .await
        );
    }
    // (2 + 3) / 2 = 2.5, then (2.5 + 5) / 2
    assert!((h.fetch_book(book.id).await.rating - 3.75).abs() < 1e-9);
}

#[tokio::test]
async fn issued_copies_cannot_be_removed_from_stock() {
    let h = Harness::new().await;
    let book = h.book("Popular", 5).await;
    let ola = h.member("Ola").await;
    let pat = h.member("Pat").await;

    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, ola.id).await);
    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, pat.id).await);
    let before = h.fetch_book(book.id).await;
    assert_eq!(before.stock, 3);
    assert_eq!(before.issued_to.len(), 2);

    let err = h
        .services
        .lifecycle
        .adjust_stock(&h.admin, book.id, StockAdjustment::Subtract(2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientAvailableStock { requested: 2, available: 1, .. }
    ));
    assert_eq!(h.fetch_book(book.id).await, before);

    let book = assert_ok!(
        h.services
            .lifecycle
            .adjust_stock(&h.admin, book.id, StockAdjustment::Subtract(1))
            .await
    );
    assert_eq!(book.stock, 2);
    assert_eq!(book.total_copies(), 4);

    let book = assert_ok!(
        h.services
            .lifecycle
            .adjust_stock(&h.admin, book.id, StockAdjustment::Add(4))
            .await
    );
    assert_eq!(book.stock, 6);
    assert_eq!(book.total_copies(), 8);

    let err = h
        .services
        .lifecycle
        .adjust_stock(&Identity::member(ola.id), book.id, StockAdjustment::Add(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));
    h.assert_consistent().await;
}

#[tokio::test]
async fn lapsed_member_cannot_request_until_plan_extended() {
    let h = Harness::new().await;
    let quinn = h.member("Quinn").await;
    let book = h.book("Plan", 1).await;
    let me = Identity::member(quinn.id);

    h.clock.advance(Duration::days(31));
    let err = h
        .services
        .lifecycle
        .request_book(&me, quinn.id, book.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SubscriptionExpired(_)));

    assert_ok!(
        h.services
            .members
            .extend_subscription(&h.admin, quinn.id, h.clock.now() + Duration::days(30))
            .await
    );
    assert_ok!(h.services.lifecycle.request_book(&me, quinn.id, book.id).await);
}

#[tokio::test]
async fn blocked_member_cannot_be_issued() {
    let h = Harness::new().await;
    let rae = h.member("Rae").await;
    let book = h.book("Blocked", 1).await;

    assert_ok!(h.services.members.block(&h.admin, rae.id).await);
    let err = h
        .services
        .lifecycle
        .issue_book(&h.admin, book.id, rae.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MemberBlocked(_)));

    assert_ok!(h.services.members.unblock(&h.admin, rae.id).await);
    assert_ok!(h.services.lifecycle.issue_book(&h.admin, book.id, rae.id).await);
}
