// gridflow core library
//
// Operation model shared by the orchestrator and its callers: operations,
// fingerprints, targets, payloads and the failure taxonomy.

pub mod error;
pub mod fingerprint;
pub mod operation;
pub mod payload;
pub mod target;

pub use error::{FailureClass, OperationError, OrchestratorError, UpstreamError};
pub use fingerprint::Fingerprint;
pub use operation::{Operation, OperationKind, Origin, Priority, DEFAULT_SCOPE};
pub use payload::Payload;
pub use target::{GridRange, Target, ALL_COLUMNS};
