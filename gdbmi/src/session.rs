use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    parser::{parse_record, Record, RecordKind},
    tracker::{Dispatched, MiCommand, StreamCapture, Tracker},
    Error, Token,
};

const DEFAULT_PROMPT: &str = "(gdb)";

// gdb prints breakpoint command scripts as a tuple of bare strings,
// `script={"silent","p x"}`, which is not valid MI.
const SCRIPT_MARKER: &str = "script={";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub prompt: String,
    pub fix_script_tuple: bool,
    pub log_outgoing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_owned(),
            fix_script_tuple: true,
            log_outgoing: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    /// The first prompt arrived.
    Connected,
    /// Any later prompt.
    Prompt,
    Result(Record),
    StatusAsync(Record),
    ExecAsync(Record),
    NotifyAsync(Record),
    ConsoleStream(String),
    TargetStream(String),
    LogStream(String),
    BadLine { line: String, reason: String },
    /// The transport closed; `dropped` commands never completed.
    Disconnected { dropped: usize },
}

/// Read side of a debugger connection.
///
/// Feed it one line at a time with [`Session::process_line`], or hand the
/// whole line stream to [`Session::run`]. Every routed line shows up as a
/// [`SessionEvent`] on the receiver returned by [`Session::new`].
pub struct Session {
    config: SessionConfig,
    state: ConnState,
    tracker: Arc<Tracker>,
    events: flume::Sender<SessionEvent>,
    streams: StreamCapture,
    idle_handler: Option<Box<dyn FnMut() + Send>>,
}

impl Session {
    pub fn new(config: SessionConfig, tracker: Arc<Tracker>) -> (Self, flume::Receiver<SessionEvent>) {
        let (events, rx) = flume::unbounded();
        let session = Self {
            config,
            state: ConnState::Disconnected,
            tracker,
            events,
            streams: StreamCapture::default(),
            idle_handler: None,
        };
        (session, rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Called each time the last pending command completes.
    pub fn set_idle_handler<F>(&mut self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.idle_handler = Some(Box::new(handler));
    }

    pub fn send(&mut self, cmd: MiCommand) -> Result<Token, Error> {
        let text = self.config.log_outgoing.then(|| cmd.text().to_owned());
        self.streams.clear();
        let token = self.tracker.send(cmd)?;
        if let Some(text) = text {
            debug!("-> {}{}", token, text.trim_end());
        }
        Ok(token)
    }

    pub fn clear_messages(&mut self) -> usize {
        self.streams.clear();
        self.tracker.clear_messages()
    }

    /// Route one line of debugger output. Returns whether a handler took it.
    pub fn process_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return false;
        }
        trace!("<- {}", line);
        if line.trim_end() == self.config.prompt {
            self.on_prompt();
            return true;
        }

        let rewritten;
        let line = if self.config.fix_script_tuple && line.contains(SCRIPT_MARKER) {
            rewritten = fix_script_tuple(line);
            rewritten.as_str()
        } else {
            line
        };

        let record = parse_record(line);
        if let Some(reason) = record.error() {
            // a pending command still gets its (damaged) result, otherwise
            // it would wait forever
            let owned = record.kind() == RecordKind::Result
                && record.token().is_some_and(|t| self.tracker.is_pending(t));
            if !owned {
                let reason = reason.to_owned();
                return self.error_bad_line(line, reason);
            }
            warn!("Malformed result for pending command: {}", reason);
        }

        match record.kind() {
            RecordKind::Result => self.on_result(record),
            RecordKind::StatusAsync => self.on_async(SessionEvent::StatusAsync, record),
            RecordKind::ExecAsync => self.on_async(SessionEvent::ExecAsync, record),
            RecordKind::NotifyAsync => self.on_async(SessionEvent::NotifyAsync, record),
            RecordKind::ConsoleStream => {
                let text = record.stream().unwrap_or_default().to_owned();
                debug!("console: {}", text.trim_end());
                self.streams.console.push_str(&text);
                self.emit(SessionEvent::ConsoleStream(text));
            }
            RecordKind::TargetStream => {
                let text = record.stream().unwrap_or_default().to_owned();
                self.emit(SessionEvent::TargetStream(text));
            }
            RecordKind::LogStream => {
                let text = record.stream().unwrap_or_default().to_owned();
                debug!("log: {}", text.trim_end());
                self.streams.log.push_str(&text);
                self.emit(SessionEvent::LogStream(text));
            }
            RecordKind::Query => {
                trace!("Ignoring '?' echo");
            }
            RecordKind::Unknown => {
                return self.error_bad_line(line, "unrecognized record".to_owned());
            }
        }
        true
    }

    /// Process lines until the transport closes, then drop whatever is
    /// still pending.
    pub async fn run(mut self, lines: flume::Receiver<String>) -> Self {
        while let Ok(line) = lines.recv_async().await {
            self.process_line(&line);
        }
        let dropped = self.clear_messages();
        self.state = ConnState::Disconnected;
        info!("Debugger transport closed, {} pending commands dropped", dropped);
        self.emit(SessionEvent::Disconnected { dropped });
        self
    }

    fn on_prompt(&mut self) {
        match self.state {
            ConnState::Disconnected => {
                info!("Debugger connected");
                self.state = ConnState::Connected;
                self.emit(SessionEvent::Connected);
            }
            ConnState::Connected => self.emit(SessionEvent::Prompt),
        }
    }

    fn on_result(&mut self, record: Record) {
        self.emit(SessionEvent::Result(record.clone()));
        let streams = std::mem::take(&mut self.streams);
        if let Dispatched::Completed { idle: true, .. } = self.tracker.dispatch_with(record, streams) {
            if let Some(handler) = self.idle_handler.as_mut() {
                handler();
            }
        }
    }

    fn on_async(&mut self, event: fn(Record) -> SessionEvent, record: Record) {
        self.emit(event(record.clone()));
        self.tracker.dispatch(record);
    }

    fn error_bad_line(&mut self, line: &str, reason: String) -> bool {
        warn!("Bad line from debugger {:?}: {}", line, reason);
        self.emit(SessionEvent::BadLine {
            line: line.to_owned(),
            reason,
        });
        false
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("No one is listening for session events");
        }
    }
}

/// Rewrite `script={"a","b"}` to `script=["a","b"]`. Text inside quoted
/// strings is left alone.
pub fn fix_script_tuple(line: &str) -> String {
    let marker = SCRIPT_MARKER.as_bytes();
    let mut bytes = line.as_bytes().to_vec();
    let mut in_str = false;
    let mut escaped = false;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
        } else if b == b'"' {
            in_str = true;
        } else if bytes[idx..].starts_with(marker)
            && (idx == 0 || matches!(bytes[idx - 1], b',' | b'{'))
        {
            let open = idx + marker.len() - 1;
            if bytes.get(open + 1) == Some(&b'"') {
                if let Some(close) = matching_close(&bytes, open) {
                    bytes[open] = b'[';
                    bytes[close] = b']';
                }
            }
            idx = open + 1;
            continue;
        }
        idx += 1;
    }

    // only ASCII bytes were swapped, so this stays valid UTF-8
    String::from_utf8(bytes).unwrap_or_else(|_| line.to_owned())
}

fn matching_close(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;

    for (idx, &b) in bytes.iter().enumerate().skip(open) {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (b == b'}').then_some(idx);
                }
            }
            _ => {}
        }
    }
    None
}
