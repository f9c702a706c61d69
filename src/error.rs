// Copyright 2020 Xavier Gillard
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! This module defines the error envelope shared by every component of the
//! library.  An error is a failure *kind* (a fixed taxonomy) plus a message
//! and a few optional bits of context: a subtype tag, the name of the object
//! instance that raised it, the source file and line, and a suggested display
//! count that non-interactive loggers may use to throttle repeats.

use thiserror::Error;

/// The taxonomy of failures the library can surface.  The set is closed on
/// purpose: callers dispatch on the kind, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("Bad parameter")]
    BadParameter,
    #[error("Bad data index")]
    BadIndex,
    #[error("Bad lock")]
    BadLock,
    #[error("Bad pointer")]
    BadPointer,
    #[error("Bad code")]
    BadCode,
    #[error("Resource allocation failure")]
    ResourceAlloc,
    #[error("Resource deallocation failure")]
    ResourceDealloc,
    #[error("Overflow")]
    Overflow,
    #[error("Device full")]
    DeviceFull,
    #[error("Bad user input")]
    BadUserInput,
    #[error("Bad data")]
    BadData,
    #[error("Incomplete initialization")]
    IncompleteInitialization,
    #[error("Program logic error")]
    ProgramLogicError,
    #[error("Insufficient memory")]
    NoMem,
    #[error("Bad thread")]
    BadThread,
}

/// An error raised by the minimization core.
///
/// Besides the kind and the message, an error optionally records a subtype
/// tag (a refinement of the kind), the instance name of the object that
/// raised it, the file and line it originated from, and a display-count hint
/// (`-1` meaning "no limit") that batch loggers may honor when the same
/// failure repeats.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {msg}")]
pub struct CoreError {
    /// What class of failure this is.
    pub kind: ErrorKind,
    /// Human readable description of the failure.
    pub msg: String,
    /// Optional refinement of the failure kind.
    pub subtype: Option<String>,
    /// Name of the object instance that raised the error, when known.
    pub src: Option<String>,
    /// Source file where the error was raised.
    pub file: Option<&'static str>,
    /// Line in `file` where the error was raised.
    pub line: Option<u32>,
    /// Maximum recommended number of times to show this message;
    /// -1 means no limit.
    pub display_count: i32,
}

impl CoreError {
    /// Builds a bare error of the given kind.
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        CoreError {
            kind,
            msg: msg.into(),
            subtype: None,
            src: None,
            file: None,
            line: None,
            display_count: -1,
        }
    }
    /// Attaches a subtype refinement to the error.
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }
    /// Attaches the name of the raising instance to the error.
    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }
    /// Attaches the source location to the error.
    pub fn at(mut self, file: &'static str, line: u32) -> Self {
        self.file = Some(file);
        self.line = Some(line);
        self
    }
    /// Sets the suggested display count hint.
    pub fn with_display_count(mut self, count: i32) -> Self {
        self.display_count = count;
        self
    }

    /// The kind and subtype in one string, e.g. `"Bad parameter (size)"`.
    pub fn full_type(&self) -> String {
        match &self.subtype {
            Some(st) => format!("{} ({})", self.kind, st),
            None => self.kind.to_string(),
        }
    }
    /// The instance name and source location in one string.
    pub fn full_src(&self) -> String {
        let mut out = self.src.clone().unwrap_or_default();
        if let (Some(file), Some(line)) = (self.file, self.line) {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("in file {file} at line {line}"));
        }
        out
    }

    /// Prefixes the message text in place.
    pub fn prepend(&mut self, prefix: &str) {
        self.msg = format!("{prefix}{}", self.msg);
    }
    /// Suffixes the message text in place.
    pub fn postpend(&mut self, suffix: &str) {
        self.msg.push_str(suffix);
    }
}

/// Shorthand result type used throughout the library.
pub type CoreResult<T> = Result<T, CoreError>;

/// Raises a [CoreError] of the given kind, stamped with the call site.
#[macro_export]
macro_rules! core_err {
    ($kind:ident, $($arg:tt)*) => {
        $crate::CoreError::new($crate::ErrorKind::$kind, format!($($arg)*))
            .at(file!(), line!())
    };
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_error {
    use crate::{CoreError, ErrorKind};

    #[test]
    fn kind_and_message_show_up_in_display() {
        let err = CoreError::new(ErrorKind::BadParameter, "negative size request");
        assert_eq!("Bad parameter: negative size request", err.to_string());
    }

    #[test]
    fn full_type_appends_subtype() {
        let err = CoreError::new(ErrorKind::BadData, "noise").with_subtype("bracket");
        assert_eq!("Bad data (bracket)", err.full_type());
    }

    #[test]
    fn macro_stamps_location() {
        let err = core_err!(Overflow, "{} is too big", 5);
        assert_eq!(ErrorKind::Overflow, err.kind);
        assert!(err.file.is_some() && err.line.is_some());
        assert_eq!("Overflow: 5 is too big", err.to_string());
    }

    #[test]
    fn display_count_defaults_to_no_limit() {
        let err = CoreError::new(ErrorKind::NoMem, "out of memory");
        assert_eq!(-1, err.display_count);
        assert_eq!(3, err.with_display_count(3).display_count);
    }
}
