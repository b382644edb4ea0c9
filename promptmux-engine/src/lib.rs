//! # promptmux-engine
//!
//! Engine process layer for promptmux: spawns the external interactive
//! assistant ("the engine") as a supervised child process and turns its
//! line-framed JSON stdout into a typed message stream.
//!
//! The orchestration layer (`promptmux-core`) builds sessions, pooling and
//! fan-out on top of this crate. The seams are small traits so tests can
//! inject scripted engines, clocks and credentials:
//!
//! - [`ProcessSpawner`]: how children are started ([`EngineLauncher`] in
//!   production, [`MockSpawner`] in tests)
//! - [`Clock`]: monotonic time for stamps and age computations
//! - [`Credentials`]: where the engine's OAuth token comes from
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use promptmux_engine::{EngineLauncher, EnvCredentials, ProcessSpawner, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> promptmux_engine::Result<()> {
//! let launcher = EngineLauncher::new("claude", Arc::new(EnvCredentials))?;
//! let config = SessionConfig::builder()
//!     .working_dir("/workspace")
//!     .max_turns(3)
//!     .allow_tool("Read")
//!     .build();
//! let handle = launcher.spawn(&config).await?;
//! handle.write_line(r#"{"type":"user","content":"hello"}"#.to_string())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod clock;
mod credentials;
mod errors;
pub mod parser;
pub mod process;
pub mod spawn;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{Credentials, EnvCredentials, StaticCredentials, OAUTH_TOKEN_ENV};
pub use errors::{EngineError, Result};
pub use parser::{message_stream, parse_line};
pub use process::{
    classify_stderr, CloseMode, ExitInfo, ProcessEvent, ProcessHandle, ProcessTeardown,
    StderrTail, DEFAULT_FORCE, DEFAULT_GRACE, MAX_LINE_BYTES, STDERR_TAIL_BYTES,
};
pub use spawn::{EngineLauncher, MockBehavior, MockSpawner, ProcessSpawner, ScriptedEngine};
pub use types::{
    CancelReason, CompatibilityKey, ErrorKind, Message, MessagePayload, RequestId, SessionConfig,
    SessionConfigBuilder, SessionId, MAX_TURNS_MAX, MAX_TURNS_MIN,
};
