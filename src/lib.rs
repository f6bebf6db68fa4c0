//! Calltrace - lightweight in-process call tracer
//!
//! This library records the calls made while serving one logical unit of
//! work (for example a request), with checkpoints inside each call, and
//! renders them as a nested text report with elapsed times and a count of
//! the tracer's own storage reallocations.
//!
//! ```
//! use calltrace::{fetch, inject, Context};
//!
//! let ctx = inject(&Context::background(), 10);
//!
//! let call = fetch(&ctx).start().mark("root");
//! call.checkpoint_with(["parsed"]);
//! call.stop();
//!
//! println!("{}", fetch(&ctx));
//! ```

pub mod caller;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod demo;
pub mod trace;

pub use caller::CallerInfo;
pub use config::{Config, ConfigError};
pub use context::{fetch, inject, inject_with, Context};
pub use trace::{Call, Checkpoint, Label, StopGuard, Trace};
