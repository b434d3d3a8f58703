pub mod audit;
pub mod error;
pub mod grant;
pub mod names;
pub mod records;
pub mod secrets;

pub use error::{Error, ErrorClass, ErrorKind};
pub use grant::{Grant, Provider};
pub use names::{AgentLabel, RunId, RunName};
pub use records::{ExecEvent, LogLine, LogStream, Metadata, NetworkRecord, RunState, Span};
pub use secrets::Secret;
