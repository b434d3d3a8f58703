//! Run lifecycle: the state machine and the wiring of vault, proxies,
//! runtime and storage into one run.

pub mod langserver;
pub mod manager;
pub mod options;
pub mod run;
pub mod storage;

pub use langserver::{LangServerRegistry, McpStdioConfig};
pub use manager::{default_base_dir, ExecTap, RunManager};
pub use options::{apply_config, AgentConfig, McpServerSpec, Options, ServicePublish};
pub use run::Run;
pub use storage::Store;
