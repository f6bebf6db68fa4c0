//! Call tracing core
//!
//! A [`Trace`] is a flat log of the calls made during one logical
//! execution (usually one request), in the order they were started. Each
//! [`Call`] carries its own ordered [`Checkpoint`]s.
//!
//! All three types are handles. A handle is either live (it points into a
//! trace) or inert, and every operation on an inert handle does nothing.
//! That lets instrumented code trace unconditionally:
//!
//! ```
//! use calltrace::{fetch, Context};
//!
//! // Nothing injected: the trace is inert and so is everything it returns.
//! let ctx = Context::background();
//! let call = fetch(&ctx).start().mark("noop");
//! call.checkpoint();
//! call.stop();
//! assert_eq!(fetch(&ctx).to_string(), "");
//! ```
//!
//! # Allocation accounting
//!
//! The call log and every call's checkpoint list are reserved up front
//! (see [`Config`](crate::Config)). Whenever an append finds its storage
//! full, the owning counter is incremented before the storage grows. The
//! trace-level counter covers the call log; each call counts its own
//! checkpoint list.
//!
//! # Report format
//!
//! ```text
//! allocates at call stack: 0, detailed call stack:
//!     call handle [req-1]: 12.3ms, allocates: 1
//!         checkpoint [serialize]: 1.1ms
//!         checkpoint [store]: 10.2ms
//!     call fetch_data: 1ms, allocates: 0
//! ```
//!
//! (Indentation is one tab per level.) Checkpoint durations are measured
//! from the previous checkpoint, or from the call's start for the first.

use crate::caller::{self, CallerInfo};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use backtrace::Frame;
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Frames between `capture` and the instrumented function: `start*` itself
const CALLER_SKIP: usize = 1;

/// A call or checkpoint label (zero-copy for static strings)
///
/// Ids built at runtime must be passed as an owned `String`: a borrowed
/// `&str` is only accepted when it is `'static`.
pub type Label = Cow<'static, str>;

type Shared = Rc<RefCell<TraceState>>;

struct TraceState {
    calls: Vec<CallRecord>,
    allocates: usize,
    checkpoint_capacity: usize,
    clock: Box<dyn Clock>,
}

struct CallRecord {
    caller: Option<Frame>,
    id: Option<Label>,
    tags: Vec<Label>,
    start: Instant,
    stop: Option<Instant>,
    checkpoints: Vec<CheckpointRecord>,
    allocates: usize,
}

impl CallRecord {
    fn elapsed(&self) -> Duration {
        self.stop
            .map(|stop| stop.saturating_duration_since(self.start))
            .unwrap_or_default()
    }
}

struct CheckpointRecord {
    id: Option<Label>,
    tags: Vec<Label>,
    at: Instant,
}

/// Count a growth event if pushing onto `storage` has to reallocate
fn count_growth<T>(storage: &Vec<T>, counter: &mut usize) -> bool {
    let grows = storage.len() == storage.capacity();
    if grows {
        *counter += 1;
    }
    grows
}

fn split_labels<I>(labels: I) -> (Option<Label>, Vec<Label>)
where
    I: IntoIterator,
    I::Item: Into<Label>,
{
    let mut labels = labels.into_iter().map(Into::into);
    let id = labels.next();
    (id, labels.collect())
}

fn write_id(f: &mut fmt::Formatter<'_>, id: Option<&str>) -> fmt::Result {
    match id {
        Some(id) if !id.is_empty() => write!(f, " [{}]", id),
        _ => Ok(()),
    }
}

/// The record of calls for one logical execution
///
/// Cloning a `Trace` clones the handle, not the record. A trace is confined
/// to the thread that created it.
#[derive(Clone)]
pub struct Trace {
    state: Option<Shared>,
}

impl Trace {
    /// A live trace with no reserved call storage
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// A live trace with room for `calls` calls before its storage grows
    pub fn with_capacity(calls: usize) -> Self {
        Self::from_config(&Config {
            call_capacity: calls,
            ..Config::default()
        })
    }

    /// A live trace sized according to `config`
    pub fn from_config(config: &Config) -> Self {
        let state = TraceState {
            calls: Vec::with_capacity(config.call_capacity),
            allocates: 0,
            checkpoint_capacity: config.checkpoint_capacity,
            clock: Box::new(SystemClock),
        };
        Self {
            state: Some(Rc::new(RefCell::new(state))),
        }
    }

    /// The absent trace: every operation is a no-op
    pub fn inert() -> Self {
        Self { state: None }
    }

    /// Replace the timestamp source (no-op on an inert trace)
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        if let Some(state) = &self.state {
            state.borrow_mut().clock = Box::new(clock);
        }
        self
    }

    /// Check whether this is the absent trace
    pub fn is_inert(&self) -> bool {
        self.state.is_none()
    }

    /// Number of times the call storage had to grow
    pub fn allocates(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |state| state.borrow().allocates)
    }

    /// Number of recorded calls
    pub fn len(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |state| state.borrow().calls.len())
    }

    /// Check whether no calls were recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a call attributed to the function calling `start`
    #[inline(never)]
    pub fn start(&self) -> Call {
        let Some(state) = &self.state else {
            return Call::inert();
        };
        let frame = caller::capture(CALLER_SKIP);
        Self::push(state, frame, None, Vec::new())
    }

    /// Start a call with labels: the first becomes the call id, the rest
    /// are kept as tags
    ///
    /// ```
    /// let trace = calltrace::Trace::new();
    /// let call = trace.start_with(["req-42", "POST", "/message"]);
    /// assert_eq!(call.id().as_deref(), Some("req-42"));
    /// assert_eq!(call.tags(), ["POST", "/message"]);
    /// ```
    #[inline(never)]
    pub fn start_with<I>(&self, labels: I) -> Call
    where
        I: IntoIterator,
        I::Item: Into<Label>,
    {
        let Some(state) = &self.state else {
            return Call::inert();
        };
        let frame = caller::capture(CALLER_SKIP);
        let (id, tags) = split_labels(labels);
        Self::push(state, frame, id, tags)
    }

    fn push(state: &Shared, caller: Option<Frame>, id: Option<Label>, tags: Vec<Label>) -> Call {
        let (index, grew) = {
            let trace = &mut *state.borrow_mut();
            let start = trace.clock.now();
            let grew = count_growth(&trace.calls, &mut trace.allocates);
            trace.calls.push(CallRecord {
                caller,
                id,
                tags,
                start,
                stop: None,
                checkpoints: Vec::with_capacity(trace.checkpoint_capacity),
                allocates: 0,
            });
            (trace.calls.len() - 1, grew)
        };

        if grew {
            tracing::debug!(index, "call storage exceeded its reserved capacity");
        }
        tracing::trace!(index, "call started");

        Call {
            state: Some(Rc::clone(state)),
            index,
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let trace = state.borrow();

        write!(
            f,
            "allocates at call stack: {}, detailed call stack:",
            trace.allocates
        )?;
        if trace.calls.is_empty() {
            return f.write_str(" ~");
        }

        for call in &trace.calls {
            let caller = call
                .caller
                .as_ref()
                .map_or_else(CallerInfo::unknown, CallerInfo::from_frame);

            write!(f, "\n\tcall {}", caller.base_name())?;
            write_id(f, call.id.as_deref())?;
            write!(f, ": {:?}, allocates: {}", call.elapsed(), call.allocates)?;

            let mut previous = call.start;
            for checkpoint in &call.checkpoints {
                f.write_str("\n\t\tcheckpoint")?;
                write_id(f, checkpoint.id.as_deref())?;
                write!(f, ": {:?}", checkpoint.at.saturating_duration_since(previous))?;
                previous = checkpoint.at;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            None => f.write_str("Trace(inert)"),
            Some(state) => {
                let trace = state.borrow();
                f.debug_struct("Trace")
                    .field("calls", &trace.calls.len())
                    .field("capacity", &trace.calls.capacity())
                    .field("allocates", &trace.allocates)
                    .finish()
            }
        }
    }
}

/// Handle to one call of a [`Trace`]
#[derive(Clone)]
pub struct Call {
    state: Option<Shared>,
    index: usize,
}

impl Call {
    /// The absent call: every operation is a no-op
    pub fn inert() -> Self {
        Self {
            state: None,
            index: 0,
        }
    }

    /// Check whether this is the absent call
    pub fn is_inert(&self) -> bool {
        self.state.is_none()
    }

    fn with_record<R>(&self, f: impl FnOnce(&CallRecord) -> R) -> Option<R> {
        let state = self.state.as_ref()?;
        let trace = state.borrow();
        trace.calls.get(self.index).map(f)
    }

    fn with_record_mut<R>(&self, f: impl FnOnce(&mut CallRecord, Instant) -> R) -> Option<R> {
        let state = self.state.as_ref()?;
        let trace = &mut *state.borrow_mut();
        let now = trace.clock.now();
        trace.calls.get_mut(self.index).map(|call| f(call, now))
    }

    /// Set or overwrite the call id
    ///
    /// Useful when the id is only known after the call started:
    ///
    /// ```
    /// let trace = calltrace::Trace::new();
    /// let call = trace.start();
    /// // ... parse the request ...
    /// let call = call.mark("req-7");
    /// assert_eq!(call.id().as_deref(), Some("req-7"));
    /// ```
    pub fn mark(self, id: impl Into<Label>) -> Self {
        let id = id.into();
        self.with_record_mut(|call, _| call.id = Some(id));
        self
    }

    /// Record an unlabeled checkpoint
    pub fn checkpoint(&self) -> Checkpoint {
        self.push_checkpoint(None, Vec::new())
    }

    /// Record a checkpoint; the first label becomes its id, the rest tags
    pub fn checkpoint_with<I>(&self, labels: I) -> Checkpoint
    where
        I: IntoIterator,
        I::Item: Into<Label>,
    {
        if self.is_inert() {
            return Checkpoint::inert();
        }
        let (id, tags) = split_labels(labels);
        self.push_checkpoint(id, tags)
    }

    fn push_checkpoint(&self, id: Option<Label>, tags: Vec<Label>) -> Checkpoint {
        let pushed = self.with_record_mut(|call, at| {
            let grew = count_growth(&call.checkpoints, &mut call.allocates);
            call.checkpoints.push(CheckpointRecord { id, tags, at });
            (call.checkpoints.len() - 1, grew)
        });

        match pushed {
            Some((index, grew)) => {
                if grew {
                    tracing::debug!(
                        call = self.index,
                        index,
                        "checkpoint storage exceeded its reserved capacity"
                    );
                }
                Checkpoint {
                    state: self.state.clone(),
                    call: self.index,
                    index,
                }
            }
            None => Checkpoint::inert(),
        }
    }

    /// Record the end of the call
    ///
    /// Calling `stop` again overwrites the end time.
    pub fn stop(&self) {
        let restopped = self.with_record_mut(|call, now| call.stop.replace(now).is_some());
        match restopped {
            Some(true) => tracing::debug!(index = self.index, "call stopped more than once"),
            Some(false) => tracing::trace!(index = self.index, "call stopped"),
            None => {}
        }
    }

    /// Stop the call when the returned guard goes out of scope
    ///
    /// ```
    /// let trace = calltrace::Trace::new();
    /// {
    ///     let call = trace.start_with(["scoped"]).stop_on_drop();
    ///     call.checkpoint_with(["halfway"]);
    /// }
    /// assert!(trace.to_string().contains("[scoped]"));
    /// ```
    pub fn stop_on_drop(self) -> StopGuard {
        StopGuard { call: self }
    }

    /// The call id, if any
    pub fn id(&self) -> Option<String> {
        self.with_record(|call| call.id.as_deref().map(str::to_string))
            .flatten()
    }

    /// Labels passed after the id
    pub fn tags(&self) -> Vec<String> {
        self.with_record(|call| call.tags.iter().map(|tag| tag.to_string()).collect())
            .unwrap_or_default()
    }

    /// Time between start and stop; `None` until stopped
    pub fn elapsed(&self) -> Option<Duration> {
        self.with_record(|call| call.stop.map(|_| call.elapsed()))
            .flatten()
    }

    /// Number of times the checkpoint storage had to grow
    pub fn allocates(&self) -> usize {
        self.with_record(|call| call.allocates).unwrap_or(0)
    }

    /// Number of recorded checkpoints
    pub fn checkpoints(&self) -> usize {
        self.with_record(|call| call.checkpoints.len()).unwrap_or(0)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_inert() {
            return f.write_str("Call(inert)");
        }
        f.debug_struct("Call")
            .field("index", &self.index)
            .field("id", &self.id())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

/// Stops its call when dropped
#[must_use = "the call is stopped when the guard is dropped"]
#[derive(Debug)]
pub struct StopGuard {
    call: Call,
}

impl StopGuard {
    /// The guarded call
    pub fn call(&self) -> &Call {
        &self.call
    }
}

impl Deref for StopGuard {
    type Target = Call;

    fn deref(&self) -> &Call {
        &self.call
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.call.stop();
    }
}

/// Handle to one checkpoint of a [`Call`]
#[derive(Clone)]
pub struct Checkpoint {
    state: Option<Shared>,
    call: usize,
    index: usize,
}

impl Checkpoint {
    /// The absent checkpoint: every operation is a no-op
    pub fn inert() -> Self {
        Self {
            state: None,
            call: 0,
            index: 0,
        }
    }

    /// Check whether this is the absent checkpoint
    pub fn is_inert(&self) -> bool {
        self.state.is_none()
    }

    /// Set or overwrite the checkpoint id
    pub fn mark(self, id: impl Into<Label>) -> Self {
        if let Some(state) = &self.state {
            let mut trace = state.borrow_mut();
            if let Some(checkpoint) = trace
                .calls
                .get_mut(self.call)
                .and_then(|call| call.checkpoints.get_mut(self.index))
            {
                checkpoint.id = Some(id.into());
            }
        }
        self
    }

    /// The checkpoint id, if any
    pub fn id(&self) -> Option<String> {
        let state = self.state.as_ref()?;
        let trace = state.borrow();
        trace
            .calls
            .get(self.call)
            .and_then(|call| call.checkpoints.get(self.index))
            .and_then(|checkpoint| checkpoint.id.as_deref().map(str::to_string))
    }

    /// Labels passed after the id
    pub fn tags(&self) -> Vec<String> {
        let Some(state) = &self.state else {
            return Vec::new();
        };
        let trace = state.borrow();
        trace
            .calls
            .get(self.call)
            .and_then(|call| call.checkpoints.get(self.index))
            .map(|checkpoint| checkpoint.tags.iter().map(|tag| tag.to_string()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_inert() {
            return f.write_str("Checkpoint(inert)");
        }
        f.debug_struct("Checkpoint")
            .field("call", &self.call)
            .field("index", &self.index)
            .field("id", &self.id())
            .finish()
    }
}
