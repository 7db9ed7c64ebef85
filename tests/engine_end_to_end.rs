use std::sync::Arc;
use std::time::Duration;

use flow_adapters::{standard_graph, RateTablePricingOracle, STEP_DETAILS, STEP_MEASUREMENTS, STEP_SERVICES};
use flow_core::{DraftStore, EngineConfig, FlowError, GuidedFlowEngine, InMemoryDraftStore, RecoveryOptions,
                RecoveryPhase, SaveState};
use flow_domain::{Confidence, GuidedFlowData, SessionContext};
use flow_policies::{ThresholdParams, ThresholdPolicy};
use guidedflow::{AppConfig, AppError};
use serde_json::json;
use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready_ok};

fn config() -> EngineConfig {
    AppConfig::from_lookup(|k| match k {
                               "GUIDEDFLOW_PRICING_DEBOUNCE_MS" => Some("300".into()),
                               "GUIDEDFLOW_VALIDATION_DEBOUNCE_MS" => Some("300".into()),
                               "GUIDEDFLOW_AUTOSAVE_INTERVAL_MS" => Some("5000".into()),
                               _ => None,
                           }).engine_config()
}

fn engine(principal: &str, estimate: &str, store: Arc<InMemoryDraftStore>) -> GuidedFlowEngine {
    GuidedFlowEngine::builder(SessionContext::new(principal, estimate), Arc::new(standard_graph().unwrap()))
        .oracle(Arc::new(RateTablePricingOracle::standard()))
        .draft_store(store)
        .policy(Arc::new(ThresholdPolicy::new(ThresholdParams::default())))
        .config(config())
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn interrupted_session_is_recovered_by_the_next_one() {
    let store = Arc::new(InMemoryDraftStore::default());

    let first = engine("user-1", "est-a", store.clone());
    assert_ok!(first.start(RecoveryOptions::default()).await);
    assert_ok!(first.edit_step(STEP_MEASUREMENTS, json!({"glassArea": 4000, "stories": 1})).await);
    assert_ok!(first.go_to_step(1));
    assert_ok!(first.edit_step(STEP_SERVICES, json!({"services": ["window-cleaning"]})).await);
    // El autosave periódico persiste sin intervención.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(first.autosave().status().state, SaveState::Clean);
    assert_eq!(store.write_count(), 1);
    let price = first.pricing().latest("est-a").unwrap();
    assert_eq!(price.total_cost, 1150.0);
    assert_eq!(price.confidence, Confidence::High);
    first.shutdown();

    let second = engine("user-1", "est-b", store.clone());
    let state = assert_ok!(second.start(RecoveryOptions::default()).await);
    assert_eq!(state.phase, RecoveryPhase::RecoveryPending);
    assert_eq!(state.available_drafts.len(), 1);
    let draft = assert_ok!(second.recover(state.available_drafts[0].id).await).unwrap();
    assert_eq!(draft.current_step, 1);
    assert_eq!(second.store().current_step(), 1);
    assert_eq!(second.pricing().latest("est-b").unwrap().total_cost, 1150.0);
    // El estado recuperado se guarda antes de borrar el original.
    assert_eq!(store.write_count(), 2);
    assert!(store.get_draft(draft.id).await.unwrap().is_none());

    assert_ok!(second.go_to_step(2));
    assert_ok!(second.edit_step(STEP_DETAILS, json!({"accessNotes": "side gate"})).await);
    let receipt = assert_ok!(second.save_and_exit().await);
    let saved = store.get_draft(receipt.draft_id).await.unwrap().unwrap();
    assert!(saved.data.has_step(STEP_DETAILS));
    assert_eq!(saved.estimate_id, "est-b");
}

#[tokio::test(start_paused = true)]
async fn scheduled_save_resolves_when_the_interval_elapses() {
    let store = Arc::new(InMemoryDraftStore::default());
    let e = engine("user-2", "est-c", store.clone());
    let data = GuidedFlowData::new().with_step(STEP_MEASUREMENTS, json!({"glassArea": 10}));

    let mut save = tokio_test::task::spawn(e.autosave().save_draft(data, 0, false));
    assert_pending!(save.poll());
    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_pending!(save.poll());
    assert_eq!(store.write_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let receipt = assert_ready_ok!(save.poll());
    assert_eq!(receipt.version, 1);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn saves_after_exit_are_refused() {
    let e = engine("user-3", "est-d", Arc::new(InMemoryDraftStore::default()));
    assert_ok!(e.edit_step(STEP_MEASUREMENTS, json!({"glassArea": 10})).await);
    assert_ok!(e.save_and_exit().await);
    let err = assert_err!(e.autosave().save_draft(GuidedFlowData::new(), 0, true).await);
    assert!(matches!(err, FlowError::SaveFailed(_)));
}

#[test]
fn engine_errors_surface_through_app_error() {
    let err: AppError = tokio_test::block_on(async {
                            let e = engine("user-4", "est-e", Arc::new(InMemoryDraftStore::default()));
                            e.edit_step("not-a-step", json!({})).await
                        }).unwrap_err()
                          .into();
    assert_eq!(err.exit_code(), 5);
    assert!(err.to_string().contains("validation rejected"));
}
