//! Bounded console transcript with an optional attached sink.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default number of lines the console retains.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// A submitted command.
    Command,
    /// Text the engine printed.
    Output,
    /// An error or cancellation message.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub kind: LineKind,
    pub text: String,
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LineKind::Command => write!(f, "> {}", self.text),
            LineKind::Output | LineKind::Error => f.write_str(&self.text),
        }
    }
}

/// Receives every line written to the console, in order.
pub type ConsoleSink = Arc<dyn Fn(&ConsoleLine) + Send + Sync>;

struct State {
    lines: VecDeque<ConsoleLine>,
    capacity: usize,
    sink: Option<ConsoleSink>,
}

/// Shared transcript of echoed commands, their output and their errors.
///
/// Clones write to the same transcript. Once `capacity` lines are held the
/// oldest line is dropped for each new one.
#[derive(Clone)]
pub struct Console {
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Console")
            .field("lines", &state.lines.len())
            .field("capacity", &state.capacity)
            .field("attached", &state.sink.is_some())
            .finish()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_CAPACITY)
    }
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                lines: VecDeque::new(),
                capacity: capacity.max(1),
                sink: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn command(&self, text: impl Into<String>) {
        self.push(LineKind::Command, text.into());
    }

    pub fn output(&self, text: impl Into<String>) {
        self.push(LineKind::Output, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(LineKind::Error, text.into());
    }

    fn push(&self, kind: LineKind, text: String) {
        let line = ConsoleLine { kind, text };
        let sink = {
            let mut state = self.state();
            if state.lines.len() == state.capacity {
                state.lines.pop_front();
            }
            state.lines.push_back(line.clone());
            state.sink.clone()
        };
        // Called outside the lock so a sink may read the console.
        if let Some(sink) = sink {
            sink(&line);
        }
    }

    /// Send every future line to `sink`, replacing any attached sink.
    pub fn attach<F>(&self, sink: F)
    where
        F: Fn(&ConsoleLine) + Send + Sync + 'static,
    {
        self.state().sink = Some(Arc::new(sink));
    }

    pub fn detach(&self) {
        self.state().sink = None;
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> Vec<ConsoleLine> {
        self.state().lines.iter().cloned().collect()
    }

    /// Retained lines rendered one per line.
    pub fn text(&self) -> String {
        let state = self.state();
        let mut out = String::new();
        for line in &state.lines {
            out.push_str(&line.to_string());
            if !line.text.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    pub fn clear(&self) {
        self.state().lines.clear();
    }

    pub fn len(&self) -> usize {
        self.state().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_rendering() {
        let console = Console::default();
        console.command("x <- 1");
        console.output("[1] 1\n");
        console.error("object 'y' not found");
        assert_eq!(console.text(), "> x <- 1\n[1] 1\nobject 'y' not found\n");
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let console = Console::new(2);
        console.command("a");
        console.command("b");
        console.command("c");
        let texts: Vec<_> = console.lines().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn test_attached_sink_sees_lines() {
        let console = Console::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            console.attach(move |line| seen.lock().unwrap().push(line.to_string()));
        }
        console.command("ls()");
        console.detach();
        console.command("ignored");
        assert_eq!(*seen.lock().unwrap(), vec!["> ls()".to_string()]);
        assert_eq!(console.len(), 2);
    }
}
