//! terraflow core
//!
//! Drives an external infrastructure-as-code tool on behalf of a
//! declarative reconciler. Every managed resource gets its own workspace
//! directory; long operations run in the background and are observed by
//! polling, so no reconciler call blocks for longer than a few filesystem
//! calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   Reconciler                     │
//! │        observe / create / update / delete        │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                terraflow-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  WorkspaceStore ── Workspace (per resource)│  │
//! │  │     LastOperation · lock file · mailbox   │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────────────┐     │
//! │  │ProcessRunner │  │ SharedProvider       │     │
//! │  └──────────────┘  └──────────────────────┘     │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │   terraform   │ │   provider    │
//! │  (per call)   │ │ plugin (once) │
//! └───────────────┘ └───────────────┘
//! ```

pub mod error;
pub mod external;
pub mod operation;
pub mod pipeline;
pub mod plan;
pub mod provider_runner;
pub mod render;
pub mod runner;
pub mod state;
pub mod store;
pub mod workspace;

// Re-exports
pub use error::{CloudError, Result, SharedProviderError};
pub use external::{
    CompletionHandler, ExternalClient, LoggingCompletionHandler, Observation, WorkspaceExternal,
};
pub use operation::{LastOperation, OperationKind, OperationOutcome, OperationRecord};
pub use pipeline::{LockInfo, OperationLock, PipelineResult, PipelineState};
pub use plan::{ChangeSummary, PlanResult};
pub use provider_runner::{
    NoOpProviderRunner, ProviderRunner, ReattachConfig, SharedProvider, SharedProviderConfig,
};
pub use render::{ProviderSetup, ResourceBlock};
pub use runner::{OutputStream, ProcessExit, ProcessHandle, ProcessSpec};
pub use state::{SeedState, StateFile, TfState};
pub use store::{ResourceRequest, StoreSettings, WorkspaceStore};
pub use workspace::{Handle, ImportResult, RefreshResult, ToolSettings, Workspace};
