use chrono::Duration;
use tokio_test::assert_ok;

use libris_server::{
    clock::Clock,
    models::Identity,
    services::notifications::{Audience, Delivery},
    AppError,
};

use crate::common::Harness;

#[tokio::test]
async fn overdue_holders_get_one_blind_reminder() {
    let h = Harness::new().await;
    let gus = h.member("Gus").await;
    let hal = h.member("Hal").await;
    let _ida = h.member("Ida").await;
    let a = h.book("Late One", 1).await;
    let b = h.book("Late Two", 1).await;

    assert_eq!(
        assert_ok!(h.services.notifications.send_due_reminders().await),
        Delivery::Skipped
    );

    assert_ok!(h.services.lifecycle.issue_book(&h.admin, a.id, gus.id).await);
    assert_ok!(h.services.lifecycle.issue_book(&h.admin, b.id, hal.id).await);
    h.clock.advance(Duration::days(16));

    let delivery = assert_ok!(h.services.notifications.send_due_reminders().await);
    assert_eq!(delivery, Delivery::Sent { recipients: 2 });

    let sent = h.mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Return Book");
    let mut to = sent[0].recipients.clone();
    to.sort();
    assert_eq!(to, vec![gus.email, hal.email]);
}

#[tokio::test]
async fn lapsed_plans_are_reminded() {
    let h = Harness::new().await;
    let jo = h.member("Jo").await;
    let _kai = h.member("Kai").await;

    h.services
        .members
        .extend_subscription(&h.admin, jo.id, h.clock.now() + Duration::days(2))
        .await
        .unwrap();
    h.clock.advance(Duration::days(5));

    let delivery = assert_ok!(h.services.notifications.send_subscription_reminders().await);
    assert_eq!(delivery, Delivery::Sent { recipients: 1 });
    assert_eq!(h.mailbox.sent()[0].recipients, vec![jo.email]);
}

#[tokio::test]
async fn newsletter_reaches_opted_in_members_only() {
    let h = Harness::new().await;
    let lia = h.member("Lia").await;
    let mo = h.member("Mo").await;
    assert_ok!(
        h.services
            .members
            .unsubscribe_newsletter(&Identity::member(mo.id))
            .await
    );

    let delivery = assert_ok!(
        h.services
            .notifications
            .newsletter(&h.admin, "New arrivals", "Come and see", Audience::Subscribers)
            .await
    );
    assert_eq!(delivery, Delivery::Sent { recipients: 1 });
    assert_eq!(h.mailbox.sent()[0].recipients, vec![lia.email]);

    let delivery = assert_ok!(
        h.services
            .notifications
            .newsletter(&h.admin, "Closing", "Shut on Monday", Audience::All)
            .await
    );
    assert_eq!(delivery, Delivery::Sent { recipients: 2 });

    let err = h
        .services
        .notifications
        .newsletter(&Identity::member(lia.id), "Spam", "Spam", Audience::All)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));
}

#[tokio::test]
async fn newsletter_without_audience_is_refused() {
    let h = Harness::new().await;
    let err = h
        .services
        .notifications
        .newsletter(&h.admin, "Hello", "Anyone?", Audience::Subscribers)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoRecipients(_)));
    assert!(h.mailbox.sent().is_empty());
}

#[tokio::test]
async fn contact_goes_to_the_library_address() {
    let h = Harness::new().await;
    let ned = h.member("Ned").await;

    let delivery = assert_ok!(
        h.services
            .notifications
            .contact_librarian(&Identity::member(ned.id), "Lost card", "I lost my card")
            .await
    );
    assert_eq!(delivery, Delivery::Sent { recipients: 1 });

    let sent = h.mailbox.sent();
    assert_eq!(sent[0].recipients, vec!["library@libris.local".to_string()]);
    assert!(sent[0].body.contains("I lost my card"));
    assert!(sent[0].body.contains(&ned.email));
}

#[tokio::test]
async fn mailed_reset_link_sets_a_new_password_once() {
    let h = Harness::new().await;
    let ona = h.member("Ona").await;

    assert_ok!(h.services.auth.forgot_password(&ona.email).await);
    let err = h
        .services
        .auth
        .forgot_password(&ona.email)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ResetAlreadyRequested(_)));

    let body = h.mailbox.sent()[0].body.clone();
    let secret = body.rsplit('/').next().unwrap().trim().to_string();

    assert_ok!(
        h.services
            .auth
            .reset_password(&ona.email, &secret, "fresh-pass")
            .await
    );
    assert_ok!(h.services.auth.login(&ona.email, "fresh-pass", false).await);
    assert!(h.services.auth.login(&ona.email, "secret", false).await.is_err());

    let err = h
        .services
        .auth
        .reset_password(&ona.email, &secret, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidToken));
}
