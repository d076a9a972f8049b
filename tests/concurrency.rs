#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, spawn, spawn_with, MockCompletion, MOCK_ANSWER};
use parley::auth::Role;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_slot_goes_to_exactly_one_request() {
    let app = Arc::new(spawn(3).await);
    let token = app.token("user-1", Role::User);

    assert_eq!(app.ask(Some(&token), "warm up one").await.0, 200);
    assert_eq!(app.ask(Some(&token), "warm up two").await.0, 200);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let app = app.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            app.ask(Some(&token), &format!("racing question {}", i)).await.0
        }));
    }
    let mut statuses = Vec::new();
    for t in tasks {
        statuses.push(t.await.unwrap());
    }
    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == 429).count(), 15);
    assert_eq!(app.mock.calls(), 3);
    assert_eq!(app.conversations.len().await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subjects_do_not_share_quota() {
    let app = Arc::new(spawn(5).await);
    let mut tasks = Vec::new();
    for user in 0..4 {
        let token = app.token(&format!("user-{}", user), Role::User);
        for i in 0..8 {
            let app = app.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                app.ask(Some(&token), &format!("question {}", i)).await.0
            }));
        }
    }
    let mut ok = 0;
    for t in tasks {
        if t.await.unwrap() == 200 {
            ok += 1;
        }
    }
    assert_eq!(ok, 4 * 5);
    assert_eq!(app.conversations.len().await, 20);
}

#[tokio::test]
async fn quota_returns_after_window_elapses() {
    let mut cfg = config(1);
    cfg.rate_window = Duration::from_secs(1);
    let app = spawn_with(cfg, MockCompletion::answering(MOCK_ANSWER)).await;
    let token = app.token("user-1", Role::User);

    assert_eq!(app.ask(Some(&token), "first try").await.0, 200);
    assert_eq!(app.ask(Some(&token), "second try").await.0, 429);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let (status, body) = app.ask(Some(&token), "third try").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["rateLimitInfo"]["remaining"], 0);
}
