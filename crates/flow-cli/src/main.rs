use std::process::exit;
use std::sync::Arc;

use flow_adapters::{standard_graph, RateTablePricingOracle, STEP_MEASUREMENTS, STEP_SERVICES};
use flow_core::{DraftStore, FlowError, GuidedFlowEngine, InMemoryDraftStore, RecoveryOptions, StoreError};
use flow_domain::SessionContext;
use flow_persistence::{DbConfig, PgDraftStore, PoolProvider};
use log::info;
use serde_json::json;
use uuid::Uuid;

const USAGE: &str = "Uso:
  flow drafts list --principal <ID>
  flow drafts show --id <UUID>
  flow drafts delete --id <UUID>
  flow simulate [--principal <ID>] [--estimate <ID>] [--glass-area <N>] [--stories <N>] [--services <a,b>]";

/// Valor de `--clave valor` buscando desde `args[from..]`. Flags
/// desconocidos se ignoran.
fn flag(args: &[String], from: usize, name: &str) -> Option<String> {
    let mut i = from;
    while i < args.len() {
        if args[i] == name {
            return args.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

fn usage() -> ! {
    eprintln!("{USAGE}");
    exit(2);
}

/// Postgres si hay `DATABASE_URL`; si no, un store en memoria (sólo útil
/// para `simulate`).
fn open_store() -> Arc<dyn DraftStore> {
    if DbConfig::is_configured() {
        match flow_persistence::build_dev_pool_from_env() {
            Ok(pool) => return Arc::new(PgDraftStore::new(PoolProvider { pool })),
            Err(e) => {
                eprintln!("[flow] pool error: {e}");
                exit(5);
            }
        }
    }
    info!("cli:store backend=memory (DATABASE_URL no definido)");
    Arc::new(InMemoryDraftStore::default())
}

fn parse_id(args: &[String]) -> Uuid {
    match flag(args, 3, "--id").and_then(|v| Uuid::parse_str(&v).ok()) {
        Some(id) => id,
        None => usage(),
    }
}

async fn drafts(args: &[String]) {
    let store = open_store();
    match args.get(2).map(String::as_str) {
        Some("list") => {
            let Some(principal) = flag(args, 3, "--principal") else { usage() };
            match store.list_drafts(&principal).await {
                Ok(list) => {
                    for d in list {
                        println!("{}", serde_json::to_string(&d).unwrap_or_default());
                    }
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit(5);
                }
            }
        }
        Some("show") => {
            let id = parse_id(args);
            match store.get_draft(id).await {
                Ok(Some(d)) => println!("{}", serde_json::to_string_pretty(&d).unwrap_or_default()),
                Ok(None) => {
                    eprintln!("[flow drafts show] borrador no encontrado: {id}");
                    exit(4);
                }
                Err(e @ StoreError::Corrupted { .. }) => {
                    eprintln!("[flow drafts show] {e}");
                    exit(5);
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit(5);
                }
            }
        }
        Some("delete") => {
            let id = parse_id(args);
            match store.delete_draft(id).await {
                Ok(true) => println!("eliminado: {id}"),
                Ok(false) => {
                    eprintln!("[flow drafts delete] borrador no encontrado: {id}");
                    exit(4);
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit(5);
                }
            }
        }
        _ => usage(),
    }
}

/// Corre una sesión completa con el layout estándar: recuperación, medidas,
/// servicios, recálculo y guardado final.
async fn simulate(args: &[String]) -> Result<(), FlowError> {
    let number = |name: &str, default: f64| -> f64 { flag(args, 2, name).and_then(|v| v.parse().ok()).unwrap_or(default) };
    let principal = flag(args, 2, "--principal").unwrap_or_else(|| "demo-user".into());
    let estimate = flag(args, 2, "--estimate").unwrap_or_else(|| format!("est-{}", Uuid::new_v4()));
    let services: Vec<String> = flag(args, 2, "--services").map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                                                           .unwrap_or_else(|| vec!["window-cleaning".into()]);

    let engine = GuidedFlowEngine::builder(SessionContext::new(principal, estimate), Arc::new(standard_graph()?))
        .oracle(Arc::new(RateTablePricingOracle::standard()))
        .draft_store(open_store())
        .build()?;

    let recovery = engine.start(RecoveryOptions::default()).await?;
    if recovery.has_recoverable_sessions {
        println!("borradores recuperables: {}", recovery.available_drafts.len());
        for d in &recovery.available_drafts {
            println!("  {} estimate={} step={} updated_at={}", d.id, d.estimate_id, d.current_step, d.updated_at);
        }
    }

    engine.edit_step(STEP_MEASUREMENTS,
                     json!({ "glassArea": number("--glass-area", 1200.0), "stories": number("--stories", 1.0) }))
          .await?;
    engine.go_to_step(1)?;
    engine.edit_step(STEP_SERVICES, json!({ "services": services })).await?;

    let (pricing, validation) = engine.recalculate().await?;
    println!("pricing: {}", serde_json::to_string_pretty(&*pricing).unwrap_or_default());
    println!("validation: {}", serde_json::to_string_pretty(&*validation).unwrap_or_default());

    let receipt = engine.save_and_exit().await?;
    println!("guardado: draft={} version={} at={}", receipt.draft_id, receipt.version, receipt.saved_at);
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    flow_persistence::init_dotenv();
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("drafts") => drafts(&args).await,
        Some("simulate") => {
            if let Err(e) = simulate(&args).await {
                eprintln!("error: {e}");
                exit(5);
            }
        }
        _ => usage(),
    }
}
