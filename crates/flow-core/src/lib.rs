//! flow-core: motor de coordinación del flujo guiado.
//!
//! Orquesta recálculo de precios y validación con debounce, guardado
//! automático single-flight y recuperación de borradores sobre colaboradores
//! inyectados (`PricingOracle`, `DraftStore`).
pub mod autosave;
pub mod clock;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod hashing;
pub mod hub;
pub mod oracle;
pub mod pricing;
pub mod recovery;
pub mod repo;
pub mod scheduler;
pub mod store;
pub mod validation;

pub use autosave::{AutoSaveCoordinator, AutoSaveStatus, SaveReceipt, SaveState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use coordinator::{KeyedCoordinator, Recompute, RecomputeRequest, UpdateOutcome};
pub use engine::{EngineBuilder, EngineBuilderInit, GuidedFlowEngine};
pub use errors::{classify_error, ErrorClass, FlowError};
pub use graph::{Computation, DependencyGraph, DependencyGraphBuilder, StepNode, StepRole, StepSpec};
pub use hub::{Subscription, SubscriptionHub};
pub use oracle::{OracleError, PricingOracle};
pub use pricing::{PricingCoordinator, PricingEngine};
pub use recovery::{RecoveryManager, RecoveryOptions, RecoveryPhase, RecoveryState};
pub use repo::{DraftStore, InMemoryDraftStore, StoreError};
pub use scheduler::Debouncer;
pub use store::{FlowDataStore, FlowSnapshot};
pub use validation::{check_step_transition, ValidationCoordinator, ValidationEngine};
