use std::sync::Arc;
use std::time::Duration;

use flow_adapters::{standard_graph, RateTablePricingOracle, STEP_DETAILS, STEP_MEASUREMENTS, STEP_SERVICES};
use flow_core::{DraftStore, GuidedFlowEngine, InMemoryDraftStore, RecoveryOptions};
use flow_domain::SessionContext;
use flow_policies::ThresholdPolicy;
use guidedflow::config::CONFIG;
use guidedflow::errors::AppError;
use serde_json::json;

fn engine_for(principal: &str, estimate: &str, store: Arc<dyn DraftStore>) -> Result<GuidedFlowEngine, AppError> {
    let graph = Arc::new(standard_graph()?);
    Ok(GuidedFlowEngine::builder(SessionContext::new(principal, estimate), graph)
        .oracle(Arc::new(RateTablePricingOracle::standard()))
        .draft_store(store)
        .policy(Arc::new(ThresholdPolicy::new(CONFIG.threshold_params())))
        .config(CONFIG.engine_config())
        .build()?)
}

/// Primera sesión: el usuario carga medidas y servicios y cierra a mitad de
/// camino. Segunda sesión: el borrador aparece como recuperable y se
/// restaura.
async fn run(store: Arc<dyn DraftStore>) -> Result<(), AppError> {
    let first = engine_for("demo-user", "est-demo", store.clone())?;
    let _prices = first.pricing().subscribe(first.estimate_id(), |r| {
                                      println!("[pricing] total={:.2} confidence={:?} missing={:?}",
                                               r.total_cost, r.confidence, r.missing_data)
                                  });
    let _checks = first.validation().subscribe(first.estimate_id(), |v| {
                                        println!("[validation] valid={} errors={} warnings={} blocked={:?}",
                                                 v.is_valid(),
                                                 v.errors.len(),
                                                 v.warnings.len(),
                                                 v.blocked_steps)
                                    });

    first.start(RecoveryOptions::default()).await?;
    first.edit_step(STEP_MEASUREMENTS, json!({ "glassArea": 1800, "stories": 2 })).await?;
    first.go_to_step(1)?;
    first.edit_step(STEP_SERVICES, json!({ "services": ["window-cleaning", "gutter-cleaning"] }))
         .await?;
    // Deja pasar la ventana de debounce para ver la publicación coalescida.
    tokio::time::sleep(CONFIG.engine.pricing_debounce.max(CONFIG.engine.validation_debounce) + Duration::from_millis(200)).await;
    first.go_to_step(2)?;
    first.edit_step(STEP_DETAILS, json!({ "accessNotes": "gate code 1234" })).await?;
    let receipt = first.save_and_exit().await?;
    println!("[autosave] draft={} version={} coalesced={}", receipt.draft_id, receipt.version, receipt.coalesced);

    let second = engine_for("demo-user", "est-demo-2", store)?;
    let state = second.start(RecoveryOptions::default()).await?;
    println!("[recovery] phase={:?} candidates={}", state.phase, state.available_drafts.len());
    if let Some(candidate) = state.available_drafts.first() {
        if let Some(draft) = second.recover(candidate.id).await? {
            println!("[recovery] restaurado draft={} step={} steps={:?}",
                     draft.id,
                     draft.current_step,
                     draft.data.step_ids().collect::<Vec<_>>());
        }
    }
    let (pricing, validation) = second.recalculate().await?;
    println!("[recalculate] total={:.2} confidence={:?} valid={}",
             pricing.total_cost,
             pricing.confidence,
             validation.is_valid());
    second.save_and_exit().await?;
    Ok(())
}

#[cfg(feature = "pg_demo")]
fn open_store() -> Result<Arc<dyn DraftStore>, AppError> {
    use flow_persistence::{DbConfig, PgDraftStore, PoolProvider};
    if !DbConfig::is_configured() {
        eprintln!("[PG DEMO] DATABASE_URL no definido; se usa el store en memoria");
        return Ok(Arc::new(InMemoryDraftStore::default()));
    }
    let pool = flow_persistence::build_dev_pool_from_env().map_err(|e| AppError::Config(e.to_string()))?;
    Ok(Arc::new(PgDraftStore::new(PoolProvider { pool })))
}

#[cfg(not(feature = "pg_demo"))]
fn open_store() -> Result<Arc<dyn DraftStore>, AppError> {
    Ok(Arc::new(InMemoryDraftStore::default()))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let result = match open_store() {
        Ok(store) => run(store).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}
