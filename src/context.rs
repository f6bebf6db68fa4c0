//! Carrying a trace through a logical execution
//!
//! [`Context`] is a small immutable key-value scope: adding a value returns
//! a new context whose parent is the old one, and lookups walk from the
//! newest entry outward. Keys are types, so a private key type cannot be
//! read or shadowed by code outside the module that declares it.
//!
//! [`inject`] attaches a fresh [`Trace`] under such a private key and
//! [`fetch`] retrieves it:
//!
//! ```
//! use calltrace::{fetch, inject, Context};
//!
//! fn handler(ctx: &Context) {
//!     let call = fetch(ctx).start_with(["req-1"]);
//!     call.checkpoint_with(["parsed"]);
//!     call.stop();
//! }
//!
//! let ctx = inject(&Context::background(), 4);
//! handler(&ctx);
//! assert!(fetch(&ctx).to_string().contains("call handler [req-1]"));
//! ```

use crate::config::Config;
use crate::trace::Trace;
use std::any::{Any, TypeId};
use std::fmt;
use std::rc::Rc;

/// Key under which [`inject`] stores the trace
enum TraceKey {}

struct Entry {
    key: TypeId,
    value: Box<dyn Any>,
    parent: Option<Rc<Entry>>,
}

/// An immutable, scoped set of values keyed by type
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Rc<Entry>>,
}

impl Context {
    /// The empty root context
    pub fn background() -> Self {
        Self::default()
    }

    /// A child context that additionally maps `K` to `value`
    ///
    /// A value stored under a key already present shadows the older one
    /// for lookups through the child; the parent is unchanged.
    pub fn with_value<K: 'static, V: 'static>(&self, value: V) -> Self {
        Self {
            head: Some(Rc::new(Entry {
                key: TypeId::of::<K>(),
                value: Box::new(value),
                parent: self.head.clone(),
            })),
        }
    }

    /// The value most recently stored under `K`, if it has type `V`
    pub fn value<K: 'static, V: 'static>(&self) -> Option<&V> {
        let key = TypeId::of::<K>();
        let mut entry = self.head.as_deref();
        while let Some(current) = entry {
            if current.key == key {
                return current.value.downcast_ref();
            }
            entry = current.parent.as_deref();
        }
        None
    }

    /// Number of values in scope, counting shadowed ones
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut entry = self.head.as_deref();
        while let Some(current) = entry {
            depth += 1;
            entry = current.parent.as_deref();
        }
        depth
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("depth", &self.depth())
            .field("traced", &!fetch(self).is_inert())
            .finish()
    }
}

/// Attach a fresh trace with room for `capacity` calls
///
/// A capacity of 0 is valid: the trace starts empty.
pub fn inject(ctx: &Context, capacity: usize) -> Context {
    inject_with(ctx, &Config::with_call_capacity(capacity))
}

/// Attach a fresh trace sized according to `config`
pub fn inject_with(ctx: &Context, config: &Config) -> Context {
    tracing::trace!(
        call_capacity = config.call_capacity,
        checkpoint_capacity = config.checkpoint_capacity,
        "trace injected"
    );
    ctx.with_value::<TraceKey, _>(Trace::from_config(config))
}

/// The trace attached to `ctx`, or an inert trace if there is none
///
/// ```
/// use calltrace::{fetch, Context};
///
/// // Won't panic: the inert trace ignores everything.
/// fetch(&Context::background()).start().stop();
/// ```
pub fn fetch(ctx: &Context) -> Trace {
    ctx.value::<TraceKey, Trace>()
        .cloned()
        .unwrap_or_else(Trace::inert)
}
