use integrations::error::IntegrationError;
use integrations::models::{Credentials, IntegrationStatus, ProviderType, SyncType};
use integrations::repositories::{CircuitBreakerRepository, HealthRepository, SyncLogRepository};
use integrations::retry::RetryPolicy;
use integrations::service::ManualIntegration;
use serde_json::{Map, json};
use uuid::Uuid;

mod test_utils;
use test_utils::{ScriptedProvider, TestApp, http_error, test_config};

fn manual(org_id: Uuid, name: &str, credentials: Credentials) -> ManualIntegration {
    ManualIntegration {
        org_id,
        provider: ProviderType::Aws,
        name: name.to_string(),
        credentials,
        options: Map::new(),
        sync_interval_seconds: Some(900),
        retry_policy: None,
    }
}

fn access_key() -> Credentials {
    Credentials::AccessKey {
        access_key_id: "AKIATEST".to_string(),
        secret_access_key: "very-secret".to_string(),
    }
}

#[tokio::test]
async fn create_manual_seals_credentials_and_options() {
    let app = TestApp::new(test_config(), vec![]).await.unwrap();
    let org_id = Uuid::new_v4();

    let mut input = manual(org_id, "  Production account ", access_key());
    input.options.insert("region".to_string(), json!("eu-west-1"));
    input.retry_policy = Some(RetryPolicy {
        max_attempts: 5,
        ..RetryPolicy::default()
    });

    let created = app.state.integrations.create_manual(input).await.unwrap();

    assert_eq!(created.name, "Production account");
    assert_eq!(created.status().unwrap(), IntegrationStatus::Active);
    assert_eq!(created.provider().unwrap(), ProviderType::Aws);
    assert_eq!(created.sync_interval_seconds, Some(900));
    assert!(created.token_expires_at.is_none());
    assert!(
        !String::from_utf8_lossy(&created.config_ciphertext).contains("very-secret"),
        "secrets must not be stored in plaintext"
    );

    let stored_policy: RetryPolicy =
        serde_json::from_value(created.retry_policy.clone().unwrap()).unwrap();
    assert_eq!(stored_policy.max_attempts, 5);

    let config = app.state.vault.open_config(&created).unwrap();
    assert!(config.credentials == access_key());
    assert_eq!(config.option_str("region"), Some("eu-west-1"));
}

#[tokio::test]
async fn create_manual_rejects_invalid_input() {
    let app = TestApp::new(test_config(), vec![]).await.unwrap();
    let org_id = Uuid::new_v4();
    let service = &app.state.integrations;

    let oauth = Credentials::OAuth {
        access_token: "token".to_string(),
        refresh_token: None,
        expires_at: None,
        scopes: vec![],
    };
    let err = service
        .create_manual(manual(org_id, "via oauth", oauth))
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidConfig(_)));

    let err = service
        .create_manual(manual(org_id, "   ", access_key()))
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidConfig(_)));

    let mut zero_interval = manual(org_id, "zero", access_key());
    zero_interval.sync_interval_seconds = Some(0);
    let err = service.create_manual(zero_interval).await.unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidConfig(_)));

    assert!(service.list(org_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_and_get_are_scoped_to_the_org() {
    let app = TestApp::new(test_config(), vec![]).await.unwrap();
    let org_id = Uuid::new_v4();
    let other_org = Uuid::new_v4();
    let service = &app.state.integrations;

    let ours = service
        .create_manual(manual(org_id, "ours", access_key()))
        .await
        .unwrap();
    service
        .create_manual(manual(other_org, "theirs", access_key()))
        .await
        .unwrap();

    let listed = service.list(org_id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, ours.id);

    assert_eq!(service.get(org_id, ours.id).await.unwrap().id, ours.id);
    let err = service.get(other_org, ours.id).await.unwrap_err();
    assert!(matches!(err, IntegrationError::IntegrationNotFound(id) if id == ours.id));
}

#[tokio::test]
async fn deactivated_integrations_do_not_sync_until_reactivated() {
    let provider = ScriptedProvider::new(ProviderType::Gitlab, vec![]);
    let app = TestApp::with_provider(test_config(), provider.clone())
        .await
        .unwrap();
    let integration = app
        .insert_api_key_integration(Uuid::new_v4(), ProviderType::Gitlab)
        .await
        .unwrap();
    let service = &app.state.integrations;

    let updated = service
        .set_status(integration.org_id, integration.id, IntegrationStatus::Inactive)
        .await
        .unwrap();
    assert_eq!(updated.status().unwrap(), IntegrationStatus::Inactive);

    let err = app
        .state
        .orchestrator
        .run_sync(integration.id, SyncType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::IntegrationInactive { .. }));
    assert_eq!(provider.calls(), 0);

    service
        .set_status(integration.org_id, integration.id, IntegrationStatus::Active)
        .await
        .unwrap();
    let outcome = app
        .state
        .orchestrator
        .run_sync(integration.id, SyncType::Manual)
        .await
        .unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
async fn status_changes_are_restricted() {
    let app = TestApp::new(test_config(), vec![]).await.unwrap();
    let integration = app
        .insert_api_key_integration(Uuid::new_v4(), ProviderType::Okta)
        .await
        .unwrap();
    let service = &app.state.integrations;

    let err = service
        .set_status(integration.org_id, integration.id, IntegrationStatus::Syncing)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidConfig(_)));

    app.integrations()
        .mark_error(integration.id, "token revoked", app.clock_now())
        .await
        .unwrap();
    let err = service
        .set_status(integration.org_id, integration.id, IntegrationStatus::Active)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::ReauthorizationRequired { .. }));

    let err = service
        .set_status(Uuid::new_v4(), integration.id, IntegrationStatus::Inactive)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::IntegrationNotFound(_)));
}

#[tokio::test]
async fn delete_cancels_sync_and_drops_derived_state_but_keeps_logs() {
    let provider = ScriptedProvider::always_failing(ProviderType::Jira, http_error(400), 1);
    let app = TestApp::with_provider(test_config(), provider).await.unwrap();
    let integration = app
        .insert_api_key_integration(Uuid::new_v4(), ProviderType::Jira)
        .await
        .unwrap();

    app.state
        .orchestrator
        .run_sync(integration.id, SyncType::Manual)
        .await
        .unwrap();

    let breakers = CircuitBreakerRepository::new(app.state.db.clone());
    let health = HealthRepository::new(app.state.db.clone());
    let logs = SyncLogRepository::new(app.state.db.clone());
    assert!(breakers.find(integration.id).await.unwrap().is_some());
    assert!(
        health
            .find_for_org(integration.org_id, integration.id)
            .await
            .unwrap()
            .is_some()
    );

    let token = app.state.cancellations.register(integration.id);

    let err = app
        .state
        .integrations
        .delete(Uuid::new_v4(), integration.id)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::IntegrationNotFound(_)));
    assert!(!token.is_cancelled());

    app.state
        .integrations
        .delete(integration.org_id, integration.id)
        .await
        .unwrap();

    assert!(token.is_cancelled());
    assert!(app.integrations().find_by_id(integration.id).await.unwrap().is_none());
    assert!(breakers.find(integration.id).await.unwrap().is_none());
    assert!(
        health
            .find_for_org(integration.org_id, integration.id)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(logs.count_for_integration(integration.id).await.unwrap(), 1);

    let err = app
        .state
        .orchestrator
        .run_sync(integration.id, SyncType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::IntegrationNotFound(_)));
}

#[tokio::test]
async fn outcome_landing_after_delete_leaves_no_breaker_row() {
    let app = TestApp::new(test_config(), vec![]).await.unwrap();
    let integration = app
        .insert_api_key_integration(Uuid::new_v4(), ProviderType::Jira)
        .await
        .unwrap();
    let breaker = app.state.orchestrator.breaker();
    let breakers = CircuitBreakerRepository::new(app.state.db.clone());

    let live = breaker
        .record_outcome(integration.id, integration.org_id, false)
        .await
        .unwrap();
    assert_eq!(live.consecutive_failures, 1);

    app.state
        .integrations
        .delete(integration.org_id, integration.id)
        .await
        .unwrap();
    assert!(breakers.find(integration.id).await.unwrap().is_none());

    // A sync that was already past its cancellation check reports late.
    let late = breaker
        .record_outcome(integration.id, integration.org_id, false)
        .await
        .unwrap();
    assert_eq!(late.consecutive_failures, 0);
    assert!(breakers.find(integration.id).await.unwrap().is_none());
}
