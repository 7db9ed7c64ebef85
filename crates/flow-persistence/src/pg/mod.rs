//! Implementación Postgres (Diesel) de `DraftStore`.
//!
//! - Una fila por borrador en `session_drafts`; `data` se guarda como JSONB
//!   y `checksum` tal como lo calculó el dominio.
//! - `put_draft` corre en una transacción: lee la fila previa con
//!   `FOR UPDATE`, asigna `version = previa + 1`, conserva `created_at` y
//!   hace upsert por `id`. `updated_at` nunca retrocede respecto de la fila
//!   previa.
//! - Diesel es bloqueante: cada operación se ejecuta en `spawn_blocking`
//!   con reintento/backoff ante errores transitorios.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use flow_core::clock::not_before;
use flow_core::{Clock, DraftStore, StoreError, SystemClock};
use flow_domain::{DraftSummary, GuidedFlowData, SaveReason, SessionDraft};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::session_drafts;

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
///
/// Al construirlo se corre el set de migraciones pendientes (una sola vez).
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Permite inyectar un pool real o uno alternativo en tests sin acoplar el
/// store a r2d2. Debe devolver una conexión válida o
/// `PersistenceError::TransientIo`.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError>;
}

/// Implementación concreta de `ConnectionProvider` respaldada por un `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

/// Fila completa de `session_drafts`.
#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = session_drafts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DraftRow {
    pub id: Uuid,
    pub principal_id: String,
    pub estimate_id: String,
    pub data: Value,
    pub current_step: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub save_reason: String,
    pub version: i64,
    pub checksum: String,
}

/// Fila para upsert. `AsChangeset` omite `id` (clave primaria).
#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = session_drafts)]
pub struct NewDraftRow<'a> {
    pub id: Uuid,
    pub principal_id: &'a str,
    pub estimate_id: &'a str,
    pub data: &'a Value,
    pub current_step: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub save_reason: &'a str,
    pub version: i64,
    pub checksum: &'a str,
}

type SummaryColumns = (Uuid, String, String, i32, DateTime<Utc>, String, i64);

/// Determina si un error es transitorio (recomendado reintentar con backoff).
fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        // Algunos mensajes llegan como Unknown con texto; best-effort sin
        // acoplar a SQLSTATE.
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry simple con backoff lineal (15ms, 30ms, 45ms; hasta 3 reintentos).
fn with_retry<F, T>(op: &str, mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("pg_store:{op}:retry attempt={} err={:?} sleep_ms={}", attempts + 1, e, delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

fn decode_row(row: DraftRow) -> Result<SessionDraft, StoreError> {
    let id = row.id;
    let corrupted = |reason: String| StoreError::Corrupted { id, reason };
    let data: GuidedFlowData = serde_json::from_value(row.data).map_err(|e| corrupted(e.to_string()))?;
    let save_reason = SaveReason::parse(&row.save_reason)
        .ok_or_else(|| corrupted(format!("unknown save reason '{}'", row.save_reason)))?;
    let current_step = usize::try_from(row.current_step).map_err(|e| corrupted(e.to_string()))?;
    let draft = SessionDraft { id,
                               principal_id: row.principal_id,
                               estimate_id: row.estimate_id,
                               data,
                               current_step,
                               created_at: row.created_at,
                               updated_at: row.updated_at,
                               save_reason,
                               version: row.version.max(0) as u64,
                               checksum: row.checksum };
    draft.verify_checksum().map_err(|e| corrupted(e.to_string()))?;
    Ok(draft)
}

fn decode_summary(cols: SummaryColumns) -> Option<DraftSummary> {
    let (id, principal_id, estimate_id, current_step, updated_at, save_reason, version) = cols;
    let Some(save_reason) = SaveReason::parse(&save_reason) else {
        warn!("pg_store:list:skip_unreadable draft_id={id} save_reason={save_reason}");
        return None;
    };
    Some(DraftSummary { id,
                        principal_id,
                        estimate_id,
                        current_step: usize::try_from(current_step).ok()?,
                        updated_at,
                        save_reason,
                        version: version.max(0) as u64 })
}

/// Store de borradores sobre Postgres.
pub struct PgDraftStore<P: ConnectionProvider> {
    provider: Arc<P>,
    clock: Arc<dyn Clock>,
}

impl<P: ConnectionProvider> std::fmt::Debug for PgDraftStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDraftStore").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> PgDraftStore<P> {
    pub fn new(provider: P) -> Self {
        Self::with_clock(provider, Arc::new(SystemClock))
    }

    pub fn with_clock(provider: P, clock: Arc<dyn Clock>) -> Self {
        Self { provider: Arc::new(provider),
               clock }
    }

    /// Ejecuta `f` en el pool bloqueante de tokio.
    async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
        where F: FnOnce(&P) -> Result<T, PersistenceError> + Send + 'static,
              T: Send + 'static
    {
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || f(&provider)).await
                                                         .map_err(|e| StoreError::Backend(format!("{op}: blocking task failed: {e}")))?
                                                         .map_err(StoreError::from)
    }
}

fn upsert(conn: &mut PgConnection, draft: &SessionDraft, now: DateTime<Utc>) -> Result<(i64, DateTime<Utc>, DateTime<Utc>), PersistenceError> {
    let data = serde_json::to_value(&draft.data).map_err(|e| PersistenceError::Unknown(format!("ser: {e}")))?;
    let current_step =
        i32::try_from(draft.current_step).map_err(|_| PersistenceError::CheckViolation("current_step out of range".into()))?;
    conn.build_transaction()
        .read_write()
        .run(|tx| {
            let previous = session_drafts::table.find(draft.id)
                                                .select((session_drafts::version,
                                                         session_drafts::created_at,
                                                         session_drafts::updated_at))
                                                .for_update()
                                                .first::<(i64, DateTime<Utc>, DateTime<Utc>)>(tx)
                                                .optional()?;
            let (version, created_at, updated_at) = match previous {
                Some((v, created, updated)) => (v + 1, created, not_before(now, Some(updated))),
                None => (1, draft.created_at, not_before(now, Some(draft.created_at))),
            };
            let row = NewDraftRow { id: draft.id,
                                    principal_id: &draft.principal_id,
                                    estimate_id: &draft.estimate_id,
                                    data: &data,
                                    current_step,
                                    created_at,
                                    updated_at,
                                    save_reason: draft.save_reason.as_str(),
                                    version,
                                    checksum: &draft.checksum };
            diesel::insert_into(session_drafts::table).values(&row)
                                                      .on_conflict(session_drafts::id)
                                                      .do_update()
                                                      .set(&row)
                                                      .execute(tx)?;
            Ok::<_, diesel::result::Error>((version, created_at, updated_at))
        })
        .map_err(PersistenceError::from)
}

#[async_trait]
impl<P: ConnectionProvider> DraftStore for PgDraftStore<P> {
    async fn put_draft(&self, mut draft: SessionDraft) -> Result<SessionDraft, StoreError> {
        debug!("pg_store:put:start draft_id={}", draft.id);
        let now = self.clock.now();
        let snapshot = draft.clone();
        let (version, created_at, updated_at) = self.blocking("put", move |p| {
                                                        with_retry("put", || {
                                                            let mut conn = p.connection()?;
                                                            upsert(&mut conn, &snapshot, now)
                                                        })
                                                    })
                                                    .await?;
        draft.version = version.max(0) as u64;
        draft.created_at = created_at;
        draft.updated_at = updated_at;
        debug!("pg_store:put:ok draft_id={} version={}", draft.id, draft.version);
        Ok(draft)
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<SessionDraft>, StoreError> {
        let row = self.blocking("get", move |p| {
                          with_retry("get", || {
                              let mut conn = p.connection()?;
                              session_drafts::table.find(id)
                                                   .select(DraftRow::as_select())
                                                   .first(&mut conn)
                                                   .optional()
                                                   .map_err(PersistenceError::from)
                          })
                      })
                      .await?;
        row.map(decode_row).transpose()
    }

    async fn delete_draft(&self, id: Uuid) -> Result<bool, StoreError> {
        let deleted = self.blocking("delete", move |p| {
                              with_retry("delete", || {
                                  let mut conn = p.connection()?;
                                  diesel::delete(session_drafts::table.find(id)).execute(&mut conn)
                                                                                .map_err(PersistenceError::from)
                              })
                          })
                          .await?;
        debug!("pg_store:delete draft_id={id} deleted={deleted}");
        Ok(deleted > 0)
    }

    async fn list_drafts(&self, principal_id: &str) -> Result<Vec<DraftSummary>, StoreError> {
        let principal = principal_id.to_string();
        let rows: Vec<SummaryColumns> = self.blocking("list", move |p| {
                                                with_retry("list", || {
                                                    let mut conn = p.connection()?;
                                                    session_drafts::table.filter(session_drafts::principal_id.eq(&principal))
                                                                         .select((session_drafts::id,
                                                                                  session_drafts::principal_id,
                                                                                  session_drafts::estimate_id,
                                                                                  session_drafts::current_step,
                                                                                  session_drafts::updated_at,
                                                                                  session_drafts::save_reason,
                                                                                  session_drafts::version))
                                                                         .order((session_drafts::updated_at.desc(),
                                                                                 session_drafts::id.asc()))
                                                                         .load(&mut conn)
                                                                         .map_err(PersistenceError::from)
                                                })
                                            })
                                            .await?;
        Ok(rows.into_iter().filter_map(decode_summary).collect())
    }
}

/// Construye un pool Postgres r2d2 a partir de URL y corre migraciones.
///
/// Si `min_size > max_size` se usa `min_size = max_size`; tamaños en cero se
/// llevan a 1.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_max = max_size.max(1);
    let validated_min = min_size.max(1);
    if validated_min > validated_max {
        warn!("build_pool: min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(validated_min.min(validated_max)))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee configuración (DATABASE_URL,
/// tamaños) y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_domain::SessionContext;
    use serde_json::json;

    fn row_for(draft: &SessionDraft) -> DraftRow {
        DraftRow { id: draft.id,
                   principal_id: draft.principal_id.clone(),
                   estimate_id: draft.estimate_id.clone(),
                   data: serde_json::to_value(&draft.data).unwrap(),
                   current_step: draft.current_step as i32,
                   created_at: draft.created_at,
                   updated_at: draft.updated_at,
                   save_reason: draft.save_reason.as_str().to_string(),
                   version: 3,
                   checksum: draft.checksum.clone() }
    }

    fn sample() -> SessionDraft {
        SessionDraft::new(Uuid::new_v4(),
                          &SessionContext::new("user-1", "est-1"),
                          GuidedFlowData::new().with_step("step1", json!({"glassArea": 10})),
                          1,
                          SaveReason::AutoSave,
                          Utc::now())
    }

    #[test]
    fn decode_row_restores_draft() {
        let d = sample();
        let back = decode_row(row_for(&d)).unwrap();
        assert_eq!(back.data, d.data);
        assert_eq!(back.version, 3);
        assert_eq!(back.current_step, 1);
    }

    #[test]
    fn tampered_payload_is_corrupted() {
        let d = sample();
        let mut row = row_for(&d);
        row.data = json!({"step1": {"glassArea": 11}});
        assert!(matches!(decode_row(row), Err(StoreError::Corrupted { .. })));

        let mut row = row_for(&d);
        row.save_reason = "mystery".into();
        assert!(matches!(decode_row(row), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn unknown_save_reason_is_skipped_in_listings() {
        let cols = (Uuid::new_v4(), "u".to_string(), "e".to_string(), 0, Utc::now(), "weird".to_string(), 1);
        assert!(decode_summary(cols).is_none());
    }

    #[test]
    fn retry_classification() {
        assert!(is_retryable(&PersistenceError::SerializationConflict));
        assert!(is_retryable(&PersistenceError::Unknown("Deadlock detected".into())));
        assert!(!is_retryable(&PersistenceError::CheckViolation("x".into())));
    }
}
