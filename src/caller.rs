//! Caller attribution via stack walking
//!
//! Every traced call is attributed to the function that started it. This
//! module finds that function by walking the current thread's stack with
//! the `backtrace` crate.
//!
//! Walking and symbolizing are split: [`capture`] only records the raw
//! frame (cheap enough to run on every `start`), and
//! [`CallerInfo::from_frame`] turns it into a name and source position when
//! the report is rendered.
//!
//! # Skip counting
//!
//! `backtrace::trace` may report frames that belong to the unwinder itself
//! before it reaches our code, so counting from the top of the walk is not
//! reliable. Instead the walk looks for the frame of [`capture`] by symbol
//! address and counts `skip` frames from there. Public tracer entry points
//! are `#[inline(never)]` so the skip constants they pass stay exact.
//!
//! # Optimized builds
//!
//! Attribution reads whatever the binary's debug info says about the
//! return address, so what it can name depends on the build profile:
//!
//! - Functions inlined into their caller only keep their own name when
//!   line tables are present (`debug = "line-tables-only"` or more). With
//!   debug info stripped, the call is attributed to the function it was
//!   inlined into.
//! - Inlined closures are recorded in debug info under a bare
//!   `{closure#N}`; [`CallerInfo::from_frame`] rejoins them to the function
//!   they were inlined into and renders them as `parent::{{closure}}`.
//! - LLVM merges functions whose machine code is identical. Instrumented
//!   functions with the same body share one copy and therefore one name.
//! - A call in tail position may be turned into a jump, which removes the
//!   calling frame from the stack. See [`resolve`].

use backtrace::Frame;
use std::path::{Path, PathBuf};

/// Placeholder name for frames that cannot be symbolized
pub const UNKNOWN_CALLER: &str = "<unknown>";

/// Maximum stack depth to walk (prevents pathological walks)
const MAX_STACK_DEPTH: usize = 128;

/// Information about a caller at some depth of the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
    /// Entry address of the function (0 when unknown)
    pub entry: usize,
    /// Demangled, fully qualified function name
    pub name: String,
    /// Source file, if debug info is available
    pub file: Option<PathBuf>,
    /// Source line, if debug info is available
    pub line: Option<u32>,
}

impl CallerInfo {
    /// The placeholder returned when a frame cannot be found or symbolized
    pub fn unknown() -> Self {
        Self {
            entry: 0,
            name: UNKNOWN_CALLER.to_string(),
            file: None,
            line: None,
        }
    }

    /// Symbolize a captured frame
    ///
    /// With inlining, one frame can resolve to several symbols, innermost
    /// first. The innermost one is the code that actually made the call;
    /// the outer ones are only consulted to name an inlined closure.
    pub fn from_frame(frame: &Frame) -> Self {
        let mut info = Self::unknown();
        info.entry = frame.symbol_address() as usize;

        let mut names = Vec::new();
        backtrace::resolve_frame(frame, |symbol| {
            if names.is_empty() {
                info.file = symbol.filename().map(Path::to_path_buf);
                info.line = symbol.lineno();
            }
            // Alternate formatting drops the trailing `::h<hash>`
            names.push(symbol.name().map(|name| format!("{:#}", name)));
        });

        if let Some(name) = inlined_name(&names) {
            info.name = name;
        }
        info
    }

    /// Function name without its module path
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }

    /// Check whether symbolization failed
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_CALLER
    }
}

/// Resolve the caller `skip` frames above the function calling `resolve`
///
/// `resolve(0)` describes the function that called `resolve`, `resolve(1)`
/// its caller, and so on. Returns [`CallerInfo::unknown`] when the stack is
/// too shallow or the frame cannot be found.
///
/// Frames are counted on the physical stack. In optimized builds a call in
/// tail position (`fn f() -> CallerInfo { resolve(0) }`) may become a jump
/// that replaces the caller's frame, so the result describes the frame one
/// level further up. Keep the call out of tail position when that matters:
///
/// ```
/// use calltrace::caller::{self, CallerInfo};
///
/// #[inline(never)]
/// fn whoami() -> CallerInfo {
///     let info = caller::resolve(0);
///     std::hint::black_box(&info);
///     info
/// }
///
/// assert_eq!(whoami().base_name(), "whoami");
/// ```
#[inline(never)]
pub fn resolve(skip: usize) -> CallerInfo {
    match capture(skip + 1) {
        Some(frame) => CallerInfo::from_frame(&frame),
        None => CallerInfo::unknown(),
    }
}

/// Capture the raw frame `skip` frames above the function calling `capture`
///
/// No symbolization happens here; the only allocation is the returned
/// frame itself. Tail-position calls lose a frame the same way they do
/// for [`resolve`].
#[inline(never)]
pub fn capture(skip: usize) -> Option<Frame> {
    let marker = capture as *const () as usize;

    let mut found = None;
    let mut fallback = None;
    let mut seen_self = false;
    let mut remaining = skip;
    let mut depth = 0;

    backtrace::trace(|frame| {
        // Best effort if symbol addresses are unavailable: assume the walk
        // starts at this function.
        if depth == skip + 1 {
            fallback = Some(frame.clone());
        }
        depth += 1;
        if depth > MAX_STACK_DEPTH {
            return false;
        }

        if !seen_self {
            seen_self = frame.symbol_address() as usize == marker;
            return true;
        }
        if remaining == 0 {
            found = Some(frame.clone());
            return false;
        }
        remaining -= 1;
        true
    });

    if seen_self {
        found
    } else {
        fallback
    }
}

/// Strip the module path from a qualified Rust function name
///
/// Generic arguments and qualified-path brackets are kept intact, and
/// closure markers stay attached to the function that owns them:
///
/// ```
/// use calltrace::caller::base_name;
///
/// assert_eq!(base_name("app::handlers::handle"), "handle");
/// assert_eq!(base_name("app::handle::{{closure}}"), "handle::{{closure}}");
/// assert_eq!(base_name("<app::Server as app::Service>::call"), "call");
/// ```
pub fn base_name(qualified: &str) -> &str {
    let bytes = qualified.as_bytes();
    let mut depth = 0usize;
    let mut named_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' if i > 0 && bytes[i - 1] != b'-' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                let start = i + 2;
                if !qualified[start..].starts_with('{') {
                    named_start = start;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    &qualified[named_start..]
}

/// Name for a frame whose symbols were resolved innermost first
///
/// Debug info names an inlined closure `{closure#N}` with no path. Such
/// names are joined onto the next enclosing symbol until a real function
/// is reached, and closure markers are normalized to `{{closure}}`.
fn inlined_name(names: &[Option<String>]) -> Option<String> {
    let mut closures = 0;
    let mut owner = None;
    for name in names {
        match name.as_deref() {
            Some(name) if is_closure(name) => closures += 1,
            Some(name) if !name.is_empty() => {
                owner = Some(name);
                break;
            }
            _ => break,
        }
    }

    let mut segments: Vec<&str> = match owner {
        Some(owner) => owner
            .split("::")
            .map(|segment| if is_closure(segment) { CLOSURE } else { segment })
            .collect(),
        None if closures > 0 => Vec::new(),
        None => return None,
    };
    segments.extend(std::iter::repeat(CLOSURE).take(closures));
    Some(segments.join("::"))
}

const CLOSURE: &str = "{{closure}}";

fn is_closure(segment: &str) -> bool {
    segment == CLOSURE || (segment.starts_with("{closure#") && segment.ends_with('}'))
}
