//! # atlas-console
//!
//! Live-data console for CodeAtlas: a tool server that executes safe,
//! read-only queries against the target application's runtime state.
//!
//! Every tool flows through the same perimeter:
//!
//! 1. **registry** -- model/column/association names validate against a
//!    registry built from the extracted metadata
//! 2. **safety** -- queries run inside a transaction that is always
//!    rolled back, with a dialect-aware statement timeout; mutating and
//!    escape-hatch tools pass a confirmation gate; every call lands in
//!    the audit log; configured columns are redacted from results
//! 3. **sql** -- the free-SQL tool accepts only validated
//!    SELECT/WITH/EXPLAIN statements
//! 4. **adapter** -- execution happens in-process against the
//!    application database (embedded) or in a child process speaking
//!    the wire protocol (bridge)

pub mod adapter;
pub mod registry;
pub mod safety;
pub mod sql;
pub mod tools;

pub use adapter::{BridgeAdapter, EmbeddedAdapter, LiveAdapter};
pub use registry::{ModelInfo, ModelRegistry};
pub use safety::{AuditLogger, Confirmation, ConfirmationMode, Dialect, SafeContext};
pub use sql::SqlValidator;
pub use tools::{build_console_server, ConsoleState};
