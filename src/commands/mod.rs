// =============================================================================
// Commands Module
// =============================================================================
//
// The trade command path:
// - Registry: database-driven command/alias/phrase table, hot-reloadable
// - Matcher: structured trading notation and fuzzy phrase matching
// - Executor: handlers that mutate the position ledger

pub mod executor;
pub mod matcher;
pub mod registry;

pub use executor::{CommandExecutor, CommandResponse};
pub use registry::CommandRegistry;
