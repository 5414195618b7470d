pub mod exec;
pub mod mask;
pub mod time;

pub use exec::{CommandOutput, ExecError, Executor, MockExecutor, MockResponse, TokioExecutor};
pub use mask::{mask_secrets, truncate_output};
pub use time::{now_rfc3339, parse_rfc3339};
