use std::sync::Arc;
use std::time::Duration;

use integrations::app::run_background;
use integrations::config::AppConfig;
use integrations::models::{Credentials, IntegrationStatus, ProviderType, SyncType};
use integrations::oauth::AuthorizationRequest;
use integrations::providers::SyncProvider;
use integrations::token_refresh::RefreshOutcome;
use integrations::repositories::SyncLogRepository;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod test_utils;
use test_utils::{
    BlockingProvider, ScriptedProvider, TestApp, http_error, test_config, with_github_oauth,
};

fn without_jitter(mut config: AppConfig) -> AppConfig {
    config.scheduler.jitter_pct_min = 0.0;
    config.scheduler.jitter_pct_max = 0.0;
    config.token_refresh.jitter_factor = 0.0;
    config
}

fn api_key() -> Credentials {
    Credentials::ApiKey {
        api_key: "key".to_string(),
    }
}

#[tokio::test]
async fn scheduler_tick_runs_only_due_integrations() {
    let provider = ScriptedProvider::new(ProviderType::Gitlab, vec![]);
    let app = TestApp::with_provider(without_jitter(test_config()), provider.clone())
        .await
        .unwrap();
    let org_id = Uuid::new_v4();

    let due = app
        .insert_integration(org_id, ProviderType::Gitlab, api_key(), Some(600))
        .await
        .unwrap();
    let later = app
        .insert_integration(org_id, ProviderType::Gitlab, api_key(), Some(3600))
        .await
        .unwrap();
    app.insert_integration(org_id, ProviderType::Gitlab, api_key(), None)
        .await
        .unwrap();

    app.clock.advance(Duration::from_secs(601));
    let scheduler = app.state.scheduler();
    let report = scheduler.tick().await.unwrap();

    assert_eq!(report.candidates, 2);
    assert_eq!(report.due, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(scheduler.drain().await.completed, 1);
    assert_eq!(provider.calls(), 1);

    let logs = SyncLogRepository::new(app.state.db.clone());
    let runs = logs.list_for_integration(org_id, due.id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].sync_type, SyncType::Scheduled.as_str());
    assert_eq!(logs.count_for_integration(later.id).await.unwrap(), 0);

    // The run just happened, so nothing is due until the next interval.
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.due, 0);
    assert_eq!(report.dispatched, 0);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn scheduler_counts_failures_and_ignores_inactive() {
    let provider = ScriptedProvider::always_failing(ProviderType::Jira, http_error(404), 1);
    let app = TestApp::with_provider(without_jitter(test_config()), provider.clone())
        .await
        .unwrap();
    let org_id = Uuid::new_v4();

    app.insert_integration(org_id, ProviderType::Jira, api_key(), Some(300))
        .await
        .unwrap();
    let paused = app
        .insert_integration(org_id, ProviderType::Jira, api_key(), Some(300))
        .await
        .unwrap();
    app.state
        .integrations
        .set_status(org_id, paused.id, IntegrationStatus::Inactive)
        .await
        .unwrap();

    app.clock.advance(Duration::from_secs(301));
    let scheduler = app.state.scheduler();
    let report = scheduler.tick().await.unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.due, 1);
    let drained = scheduler.drain().await;
    assert_eq!(drained.failed, 1);
    assert_eq!(drained.completed, 0);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn blocked_sync_does_not_hold_back_other_integrations() {
    let blocking = BlockingProvider::new(ProviderType::Gitlab);
    let scripted = ScriptedProvider::new(ProviderType::Jira, vec![]);
    let app = TestApp::new(
        without_jitter(test_config()),
        vec![
            blocking.clone() as Arc<dyn SyncProvider>,
            scripted.clone() as Arc<dyn SyncProvider>,
        ],
    )
    .await
    .unwrap();
    let org_id = Uuid::new_v4();
    let stuck = app
        .insert_integration(org_id, ProviderType::Gitlab, api_key(), Some(300))
        .await
        .unwrap();
    let other = app
        .insert_integration(org_id, ProviderType::Jira, api_key(), Some(3600))
        .await
        .unwrap();
    let scheduler = app.state.scheduler();

    app.clock.advance(Duration::from_secs(301));
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    tokio::time::timeout(Duration::from_secs(5), blocking.started.notified())
        .await
        .expect("first sync reaches the provider");

    // The first sync is still parked inside the provider.
    app.clock.advance(Duration::from_secs(3600));
    let report = tokio::time::timeout(Duration::from_secs(5), scheduler.tick())
        .await
        .expect("tick does not wait for running syncs")
        .unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.dispatched, 1);

    let logs = SyncLogRepository::new(app.state.db.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while logs.count_for_integration(other.id).await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second integration syncs while the first is blocked");
    assert_eq!(scripted.calls(), 1);
    assert_eq!(logs.count_for_integration(stuck.id).await.unwrap(), 0);

    blocking.release.notify_one();
    let drained = scheduler.drain().await;
    assert_eq!(drained.completed, 2);
    assert_eq!(logs.count_for_integration(stuck.id).await.unwrap(), 1);
}

#[tokio::test]
async fn queued_sync_is_not_dispatched_twice() {
    let blocking = BlockingProvider::new(ProviderType::Gitlab);
    let scripted = ScriptedProvider::new(ProviderType::Jira, vec![]);
    let mut config = without_jitter(test_config());
    config.scheduler.concurrency = 1;
    let app = TestApp::new(
        config,
        vec![
            blocking.clone() as Arc<dyn SyncProvider>,
            scripted.clone() as Arc<dyn SyncProvider>,
        ],
    )
    .await
    .unwrap();
    let org_id = Uuid::new_v4();
    app.insert_integration(org_id, ProviderType::Gitlab, api_key(), Some(300))
        .await
        .unwrap();
    app.insert_integration(org_id, ProviderType::Jira, api_key(), Some(3600))
        .await
        .unwrap();
    let scheduler = app.state.scheduler();

    app.clock.advance(Duration::from_secs(301));
    scheduler.tick().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), blocking.started.notified())
        .await
        .expect("first sync holds the only permit");

    // The second integration is dispatched but waits for the permit.
    app.clock.advance(Duration::from_secs(3600));
    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, 1);

    let report = scheduler.tick().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.still_running, 1);
    assert_eq!(scripted.calls(), 0);

    blocking.release.notify_one();
    let drained = scheduler.drain().await;
    assert_eq!(drained.completed, 2);
    assert_eq!(scripted.calls(), 1);
}

#[tokio::test]
async fn token_refresh_tick_refreshes_expiring_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-due"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "gho_fresh",
            "refresh_token": "refresh-next",
            "expires_in": 28800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::new(
        without_jitter(with_github_oauth(test_config(), &server.uri())),
        vec![],
    )
    .await
    .unwrap();
    let org_id = Uuid::new_v4();
    let soon = app.clock_now() + chrono::Duration::minutes(5);

    let due = app
        .insert_oauth_integration(org_id, "gho_due", Some("refresh-due"), Some(soon))
        .await
        .unwrap();
    let busy = app
        .insert_oauth_integration(org_id, "gho_busy", Some("refresh-busy"), Some(soon))
        .await
        .unwrap();
    app.insert_oauth_integration(org_id, "gho_static", None, Some(soon))
        .await
        .unwrap();
    app.insert_oauth_integration(
        org_id,
        "gho_later",
        Some("refresh-later"),
        Some(app.clock_now() + chrono::Duration::hours(6)),
    )
    .await
    .unwrap();

    let _sync_in_flight = app.state.locks.try_acquire(busy.id).unwrap();
    let report = app.state.token_refresh().tick().await.unwrap();

    assert_eq!(report.polled, 3);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.marked_error, 0);

    let refreshed = app.reload(due.id).await.unwrap();
    let config = app.state.vault.open_config(&refreshed).unwrap();
    assert_eq!(config.bearer_token(), Some("gho_fresh"));
    assert_eq!(config.refresh_token(), Some("refresh-next"));
    assert!(refreshed.token_expires_at.unwrap() > soon);
    assert_eq!(refreshed.status().unwrap(), IntegrationStatus::Active);
    assert!(refreshed.lock_expires_at.is_none());

    let untouched = app.reload(busy.id).await.unwrap();
    assert_eq!(untouched.config_ciphertext, busy.config_ciphertext);
}

#[tokio::test]
async fn token_refresh_skips_integration_leased_by_another_instance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "gho_racing",
            "refresh_token": "refresh-racing",
            "expires_in": 28800
        })))
        .expect(0)
        .mount(&server)
        .await;

    let app = TestApp::new(
        without_jitter(with_github_oauth(test_config(), &server.uri())),
        vec![],
    )
    .await
    .unwrap();
    let soon = app.clock_now() + chrono::Duration::minutes(5);
    let listed = app
        .insert_oauth_integration(Uuid::new_v4(), "gho_old", Some("refresh-rotating"), Some(soon))
        .await
        .unwrap();

    // A sync elsewhere claims the row after the refresher listed it.
    let now = app.clock_now();
    assert!(
        app.integrations()
            .try_mark_syncing(listed.id, now, now + chrono::Duration::minutes(15))
            .await
            .unwrap()
    );

    let outcome = app.state.token_refresh().refresh_integration(listed.clone()).await;
    assert_eq!(outcome, RefreshOutcome::Skipped);

    let stored = app.reload(listed.id).await.unwrap();
    assert_eq!(stored.status().unwrap(), IntegrationStatus::Syncing);
    assert!(stored.lock_expires_at.is_some());
    assert_eq!(stored.config_ciphertext, listed.config_ciphertext);
}

#[tokio::test]
async fn token_refresh_tick_marks_revoked_grants() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "The refresh token has been revoked"
        })))
        .mount(&server)
        .await;

    let app = TestApp::new(
        without_jitter(with_github_oauth(test_config(), &server.uri())),
        vec![],
    )
    .await
    .unwrap();
    let integration = app
        .insert_oauth_integration(
            Uuid::new_v4(),
            "gho_old",
            Some("refresh-revoked"),
            Some(app.clock_now()),
        )
        .await
        .unwrap();

    let report = app.state.token_refresh().tick().await.unwrap();

    assert_eq!(report.polled, 1);
    assert_eq!(report.marked_error, 1);
    let stored = app.reload(integration.id).await.unwrap();
    assert_eq!(stored.status().unwrap(), IntegrationStatus::Error);

    // Errored integrations are no longer polled.
    let report = app.state.token_refresh().tick().await.unwrap();
    assert_eq!(report.polled, 0);
}

#[tokio::test]
async fn token_refresh_tick_purges_expired_sessions() {
    let server = MockServer::start().await;
    let app = TestApp::new(
        without_jitter(with_github_oauth(test_config(), &server.uri())),
        vec![],
    )
    .await
    .unwrap();

    let start = app
        .state
        .oauth
        .begin(AuthorizationRequest {
            org_id: Uuid::new_v4(),
            provider: ProviderType::Github,
            scopes: Vec::new(),
            integration_name: "Abandoned".to_string(),
            integration_id: None,
        })
        .await
        .unwrap();

    let report = app.state.token_refresh().tick().await.unwrap();
    assert_eq!(report.sessions_purged, 0);

    app.clock.advance(Duration::from_secs(601));
    let report = app.state.token_refresh().tick().await.unwrap();
    assert_eq!(report.sessions_purged, 1);

    assert!(app.state.oauth.complete(&start.state, "code").await.is_err());
}

#[tokio::test]
async fn background_services_stop_on_shutdown() {
    let app = TestApp::new(test_config(), vec![]).await.unwrap();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(run_background(app.state.clone(), shutdown.clone()));
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("background services stop promptly")
        .expect("task joins")
        .expect("clean shutdown");
}
