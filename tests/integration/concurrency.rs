use std::sync::Arc;

use libris_server::{models::Identity, AppError};

use crate::common::Harness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_copy_goes_to_exactly_one_member() {
    let h = Arc::new(Harness::new().await);
    let book_id = h.book("Scarce", 1).await.id;
    let sam = h.member("Sam").await;
    let tess = h.member("Tess").await;

    let handles: Vec<_> = [sam.id, tess.id]
        .into_iter()
        .map(|member_id| {
            let h = h.clone();
            tokio::spawn(async move {
                h.services
                    .lifecycle
                    .issue_book(&h.admin, book_id, member_id)
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.into_iter().find_map(|r| r.err()).unwrap();
    assert!(matches!(
        loser,
        AppError::OutOfStock(_) | AppError::Conflict(_)
    ));

    let book = h.fetch_book(book_id).await;
    assert_eq!(book.stock, 0);
    assert_eq!(book.issued_to.len(), 1);
    h.assert_consistent().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn member_never_exceeds_two_books_under_contention() {
    let h = Arc::new(Harness::new().await);
    let uma = h.member("Uma").await.id;
    let mut books = Vec::new();
    for title in ["One", "Two", "Three", "Four", "Five"] {
        books.push(h.book(title, 1).await);
    }

    let handles: Vec<_> = books
        .iter()
        .map(|book| {
            let h = h.clone();
            let book_id = book.id;
            tokio::spawn(async move {
                h.services
                    .lifecycle
                    .issue_book(&h.admin, book_id, uma)
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    for err in results.into_iter().filter_map(|r| r.err()) {
        assert!(matches!(err, AppError::IssueLimitReached { .. }), "{err}");
    }

    // Copies refused at the member step went back on the shelf
    let mut on_shelf = 0;
    for book in &books {
        on_shelf += h.fetch_book(book.id).await.stock;
    }
    assert_eq!(on_shelf, 3);
    assert_eq!(h.fetch_member(uma).await.issued_books.len(), 2);
    h.assert_consistent().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_traffic_keeps_both_sides_in_step() {
    let h = Arc::new(Harness::new().await);
    let mut members = Vec::new();
    for name in ["Vic", "Wes", "Xan", "Yara", "Zed"] {
        members.push(h.member(name).await);
    }
    let mut books = Vec::new();
    for (title, stock) in [("Alpha", 2), ("Beta", 1), ("Gamma", 3)] {
        books.push(h.book(title, stock).await);
    }
    let total: i32 = books.iter().map(|b| b.stock).sum();

    let mut handles = Vec::new();
    for round in 0..3 {
        for (i, member) in members.iter().enumerate() {
            let h = h.clone();
            let member_id = member.id;
            let book_id = books[(i + round) % books.len()].id;
            handles.push(tokio::spawn(async move {
                let lifecycle = &h.services.lifecycle;
                let _ = lifecycle
                    .request_book(&Identity::member(member_id), member_id, book_id)
                    .await;
                let issued = lifecycle.issue_book(&h.admin, book_id, member_id).await;
                if issued.is_ok() && round % 2 == 0 {
                    let _ = lifecycle.return_book(&h.admin, book_id, member_id).await;
                }
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut copies = 0;
    for book in &books {
        let book = h.fetch_book(book.id).await;
        copies += book.total_copies();
        for entry in &book.issued_to {
            assert!(!book.requested_by.contains(&entry.member_id));
        }
    }
    assert_eq!(copies, total);
    h.assert_consistent().await;
}
