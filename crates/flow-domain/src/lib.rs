// flow-domain library entry point
//! Modelo de datos del estimador guiado: payloads por step, snapshots de
//! precio/validación y borradores de sesión persistibles. Sin I/O ni
//! concurrencia; todo lo que vive aquí es serializable a JSON.
pub mod draft;
pub mod error;
pub mod flow_data;
pub mod pricing;
pub mod session;
pub mod validation;

pub use draft::{DraftSummary, SaveReason, SessionDraft};
pub use error::DomainError;
pub use flow_data::{GuidedFlowData, StepId};
pub use pricing::{Confidence, Measurements, PricingResult, ServiceCost, ServiceLineItem, ServiceSelection};
pub use session::SessionContext;
pub use validation::{Severity, ValidationError, ValidationResult, ValidationWarning};
