use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{interaction::InteractionMenu, parser::Record, Error, RecordKind, Token};

/// Write side of the debugger connection; one MI command per message.
pub type InputSender = flume::Sender<Bytes>;

// OutputSource decides where a finished command goes.
// - Return: hand it back to a caller awaiting the oneshot channel
// - Channel: push it onto a queue someone else drains
// - Discard: nobody cares about the result
#[derive(Debug)]
pub enum OutputSource {
    Return(oneshot::Sender<FinishedCmd>),
    Channel(flume::Sender<FinishedCmd>),
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
    /// A result record reporting `stopped`; the command did not get the
    /// answer it asked for.
    Stopped,
    Other(String),
}

impl ResultClass {
    pub fn from_class(class: &str) -> Self {
        match class {
            "done" => Self::Done,
            "running" => Self::Running,
            "connected" => Self::Connected,
            "error" => Self::Error,
            "exit" => Self::Exit,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// A command waiting to be sent. The text carries no token; one is
/// assigned by [`Tracker::send`].
#[derive(Debug)]
pub struct MiCommand {
    text: String,
    out_src: OutputSource,
    empty_done_is_error: bool,
}

impl MiCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            out_src: OutputSource::Discard,
            empty_done_is_error: false,
        }
    }

    pub fn with_output(self, out_src: OutputSource) -> Self {
        Self { out_src, ..self }
    }

    /// Treat a bare `^done` as a failure. Console commands run through MI
    /// often report errors only on the log stream.
    pub fn empty_done_is_error(self) -> Self {
        Self {
            empty_done_is_error: true,
            ..self
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The line written to the debugger, token prepended.
    pub fn formatted(&self, token: Token) -> String {
        let cmd = format!("{}{}", token, self.text.trim_end_matches('\n'));
        format!("{}\n", cmd)
    }
}

/// Console and log stream text seen while a command was outstanding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamCapture {
    pub console: String,
    pub log: String,
}

impl StreamCapture {
    pub fn clear(&mut self) {
        self.console.clear();
        self.log.clear();
    }
}

#[derive(Debug, Serialize)]
pub struct FinishedCmd {
    token: Token,
    command: String,
    record: Record,
    streams: StreamCapture,
    empty_done_is_error: bool,
}

impl FinishedCmd {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn class(&self) -> ResultClass {
        ResultClass::from_class(self.record.class())
    }

    pub fn console(&self) -> &str {
        &self.streams.console
    }

    pub fn log(&self) -> &str {
        &self.streams.log
    }

    pub fn is_success(&self) -> bool {
        if self.record.is_error() {
            return false;
        }
        match self.class() {
            ResultClass::Done => !(self.empty_done_is_error && self.record.is_empty()),
            ResultClass::Running | ResultClass::Connected => true,
            ResultClass::Error
            | ResultClass::Exit
            | ResultClass::Stopped
            | ResultClass::Other(_) => false,
        }
    }

    /// Best available explanation for a failed command.
    pub fn error_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        if let Some(err) = self.record.error() {
            return Some(err.to_owned());
        }
        if let Some(msg) = self.record.results().get_const("msg") {
            return Some(msg.to_owned());
        }
        let log = self.streams.log.trim();
        if !log.is_empty() {
            return Some(log.to_owned());
        }
        Some("unknown failure".to_owned())
    }

    /// The choice menu gdb printed while this command ran, if any.
    pub fn interaction(&self) -> Option<InteractionMenu> {
        let menu = InteractionMenu::parse(&self.streams.console);
        (!menu.is_empty()).then_some(menu)
    }
}

struct PendingCmd {
    token: Token,
    // kept for debugging, e.g. listing what is still in flight
    cmd: String,
    out_src: OutputSource,
    empty_done_is_error: bool,
}

impl Debug for PendingCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCmd")
            .field("token", &self.token)
            .field("cmd", &self.cmd)
            .field("out_src", &self.out_src)
            .finish()
    }
}

/// Copy of a pending command without its output channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCmdCpy {
    pub token: Token,
    pub cmd: String,
}

/// What [`Tracker::dispatch`] did with a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A pending command finished. `idle` is set when it was the last one.
    Completed { token: Token, idle: bool },
    /// A result nobody was waiting for.
    Orphan(Option<Token>),
    /// An async record, handed to this many observers.
    Async(usize),
    /// Not a result or async record.
    Ignored,
}

struct Inflight {
    next_token: u64,
    cmds: HashMap<Token, PendingCmd>,
}

impl Inflight {
    // Tokens count up from 1. On wrap-around they restart at 1, skipping
    // any still in flight.
    fn next_free(&mut self) -> Token {
        loop {
            let candidate = Token(self.next_token);
            self.next_token = self.next_token.checked_add(1).unwrap_or(1);
            if !self.cmds.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

pub struct Tracker {
    inflight: Mutex<Inflight>,
    observers: Mutex<Vec<flume::Sender<Record>>>,
    transport: InputSender,
}

impl Tracker {
    pub fn new(transport: InputSender) -> Self {
        Self::starting_at(transport, 1)
    }

    /// Start handing out tokens from `first` instead of 1.
    pub fn starting_at(transport: InputSender, first: u64) -> Self {
        Self {
            inflight: Mutex::new(Inflight {
                next_token: first.max(1),
                cmds: HashMap::new(),
            }),
            observers: Mutex::new(Vec::new()),
            transport,
        }
    }

    fn inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign a token, record the command as pending and write it out.
    pub fn send(&self, cmd: MiCommand) -> Result<Token, Error> {
        let (token, line) = {
            let mut inflight = self.inflight();
            let token = inflight.next_free();
            let line = cmd.formatted(token);
            inflight.cmds.insert(
                token,
                PendingCmd {
                    token,
                    cmd: line.trim_end().to_owned(),
                    out_src: cmd.out_src,
                    empty_done_is_error: cmd.empty_done_is_error,
                },
            );
            (token, line)
        };

        if self.transport.send(Bytes::from(line)).is_err() {
            self.inflight().cmds.remove(&token);
            warn!("Transport closed, dropping command {}", token);
            return Err(Error::Disconnected);
        }
        Ok(token)
    }

    /// Send and wait for the matching result record.
    pub async fn send_and_wait(&self, cmd: MiCommand) -> Result<FinishedCmd, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(cmd.with_output(OutputSource::Return(tx)))?;
        rx.await.map_err(|_| Error::Abandoned)
    }

    /// Receive every async (`+`, `*`, `=`) record from now on.
    pub fn subscribe_async(&self) -> flume::Receiver<Record> {
        let (tx, rx) = flume::unbounded();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn dispatch(&self, record: Record) -> Dispatched {
        self.dispatch_with(record, StreamCapture::default())
    }

    /// Route a record, attaching stream text captured for the command it
    /// completes.
    pub fn dispatch_with(&self, record: Record, streams: StreamCapture) -> Dispatched {
        match record.kind() {
            RecordKind::Result => self.handle_result(record, streams),
            kind if kind.is_async() => Dispatched::Async(self.notify_observers(&record)),
            _ => Dispatched::Ignored,
        }
    }

    /// Forget every pending command without completing any of them.
    pub fn clear_messages(&self) -> usize {
        let mut inflight = self.inflight();
        let dropped = inflight.cmds.len();
        if dropped > 0 {
            debug!("Dropping {} pending commands", dropped);
        }
        inflight.cmds.clear();
        dropped
    }

    pub fn pending_count(&self) -> usize {
        self.inflight().cmds.len()
    }

    pub fn is_pending(&self, token: Token) -> bool {
        self.inflight().cmds.contains_key(&token)
    }

    // get a copy of the inflight commands, ordered by token
    pub fn inflight_cmds_copy(&self) -> Vec<PendingCmdCpy> {
        let mut cmds: Vec<_> = self
            .inflight()
            .cmds
            .values()
            .map(|cmd| PendingCmdCpy {
                token: cmd.token,
                cmd: cmd.cmd.clone(),
            })
            .collect();
        cmds.sort_by_key(|cmd| cmd.token);
        cmds
    }

    fn handle_result(&self, record: Record, streams: StreamCapture) -> Dispatched {
        let Some(token) = record.token() else {
            trace!("result with no token: {}", record);
            return Dispatched::Orphan(None);
        };

        let (cmd, idle) = {
            let mut inflight = self.inflight();
            match inflight.cmds.remove(&token) {
                Some(cmd) => (cmd, inflight.cmds.is_empty()),
                None => {
                    warn!("No pending command for result: {}", record);
                    return Dispatched::Orphan(Some(token));
                }
            }
        };

        trace!("Command {:?} is ready", cmd);
        let finished = FinishedCmd {
            token,
            command: cmd.cmd,
            record,
            streams,
            empty_done_is_error: cmd.empty_done_is_error,
        };
        Self::handle_finished_cmd(cmd.out_src, finished);
        Dispatched::Completed { token, idle }
    }

    fn handle_finished_cmd(out_src: OutputSource, finished: FinishedCmd) {
        match out_src {
            OutputSource::Return(tx) => {
                if let Err(finished) = tx.send(finished) {
                    warn!(
                        "Caller stopped waiting for command {}",
                        finished.token()
                    );
                }
            }
            OutputSource::Channel(tx) => {
                if let Err(e) = tx.send(finished) {
                    warn!(
                        "Failed to queue finished command {}: receiver gone",
                        e.into_inner().token()
                    );
                }
            }
            OutputSource::Discard => {
                trace!("Discarding the output of command {}", finished.token());
            }
        }
    }

    fn notify_observers(&self, record: &Record) -> usize {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|tx| tx.send(record.clone()).is_ok());
        trace!("async record {} sent to {} observers", record, observers.len());
        observers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::parse_record;
    use pretty_assertions::assert_eq;

    fn tracker() -> (Tracker, flume::Receiver<Bytes>) {
        let (tx, rx) = flume::unbounded();
        (Tracker::new(tx), rx)
    }

    fn written(rx: &flume::Receiver<Bytes>) -> String {
        String::from_utf8(rx.try_recv().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_send_prefixes_token() {
        let (tracker, rx) = tracker();
        let first = tracker.send(MiCommand::new("-break-insert main")).unwrap();
        let second = tracker.send(MiCommand::new("-exec-run\n")).unwrap();
        assert_eq!(first, Token(1));
        assert_eq!(second, Token(2));
        assert_eq!(written(&rx), "1-break-insert main\n");
        assert_eq!(written(&rx), "2-exec-run\n");
        assert_eq!(tracker.pending_count(), 2);
        assert_eq!(
            tracker.inflight_cmds_copy(),
            vec![
                PendingCmdCpy {
                    token: Token(1),
                    cmd: "1-break-insert main".to_owned()
                },
                PendingCmdCpy {
                    token: Token(2),
                    cmd: "2-exec-run".to_owned()
                },
            ]
        );
    }

    #[test]
    fn test_result_completes_matching_command_once() {
        let (tracker, _rx) = tracker();
        let (done_tx, done_rx) = flume::unbounded();
        let token = tracker
            .send(MiCommand::new("-gdb-set confirm off").with_output(OutputSource::Channel(done_tx)))
            .unwrap();

        let line = format!("{}^done", token);
        assert_eq!(
            tracker.dispatch(parse_record(&line)),
            Dispatched::Completed { token, idle: true }
        );
        let finished = done_rx.try_recv().unwrap();
        assert_eq!(finished.token(), token);
        assert_eq!(finished.class(), ResultClass::Done);
        assert!(finished.record().results().is_empty());
        assert!(finished.is_success());

        assert_eq!(
            tracker.dispatch(parse_record(&line)),
            Dispatched::Orphan(Some(token))
        );
        assert!(done_rx.try_recv().is_err());
    }

    #[test]
    fn test_idle_only_after_last_completion() {
        let (tracker, _rx) = tracker();
        let a = tracker.send(MiCommand::new("-a")).unwrap();
        let b = tracker.send(MiCommand::new("-b")).unwrap();
        assert_eq!(
            tracker.dispatch(parse_record(&format!("{}^done", b))),
            Dispatched::Completed { token: b, idle: false }
        );
        assert_eq!(
            tracker.dispatch(parse_record(&format!("{}^done", a))),
            Dispatched::Completed { token: a, idle: true }
        );
    }

    #[test]
    fn test_async_records_reach_observers_without_consuming() {
        let (tracker, _rx) = tracker();
        let token = tracker.send(MiCommand::new("-exec-continue")).unwrap();
        let observer = tracker.subscribe_async();
        let gone = tracker.subscribe_async();
        drop(gone);

        let stopped = parse_record(&format!("{}*stopped,reason=\"exited-normally\"", token));
        assert_eq!(tracker.dispatch(stopped.clone()), Dispatched::Async(1));
        assert_eq!(observer.try_recv().unwrap(), stopped);
        assert!(tracker.is_pending(token));
    }

    #[test]
    fn test_stream_records_are_ignored() {
        let (tracker, _rx) = tracker();
        assert_eq!(tracker.dispatch(parse_record("~\"hi\"")), Dispatched::Ignored);
        assert_eq!(tracker.dispatch(parse_record("^done")), Dispatched::Orphan(None));
    }

    #[test]
    fn test_closed_transport_is_reported() {
        let (tracker, rx) = tracker();
        drop(rx);
        assert!(matches!(
            tracker.send(MiCommand::new("-exec-run")),
            Err(Error::Disconnected)
        ));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_token_wrap_skips_live_tokens() {
        let (tx, _rx) = flume::unbounded();
        let tracker = Tracker::starting_at(tx, u64::MAX);
        assert_eq!(tracker.send(MiCommand::new("-a")).unwrap(), Token(u64::MAX));
        assert_eq!(tracker.send(MiCommand::new("-b")).unwrap(), Token(1));
    }

    #[test]
    fn test_failure_messages() {
        let (tracker, _rx) = tracker();
        let (done_tx, done_rx) = flume::unbounded();

        tracker
            .send(MiCommand::new("-break-insert nope").with_output(OutputSource::Channel(done_tx.clone())))
            .unwrap();
        tracker.dispatch(parse_record(r#"1^error,msg="Function \"nope\" not defined.""#));
        let finished = done_rx.try_recv().unwrap();
        assert!(!finished.is_success());
        assert_eq!(
            finished.error_message().as_deref(),
            Some("Function \"nope\" not defined.")
        );

        tracker
            .send(
                MiCommand::new("-interpreter-exec console \"frame 9\"")
                    .with_output(OutputSource::Channel(done_tx))
                    .empty_done_is_error(),
            )
            .unwrap();
        tracker.dispatch_with(
            parse_record("2^done"),
            StreamCapture {
                console: String::new(),
                log: "No frame at level 9.\n".to_owned(),
            },
        );
        let finished = done_rx.try_recv().unwrap();
        assert!(!finished.is_success());
        assert_eq!(
            finished.error_message().as_deref(),
            Some("No frame at level 9.")
        );
    }

    #[test]
    fn test_stopped_result_is_not_success() {
        let (tracker, _rx) = tracker();
        let (done_tx, done_rx) = flume::unbounded();
        tracker
            .send(MiCommand::new("-exec-step").with_output(OutputSource::Channel(done_tx)))
            .unwrap();
        tracker.dispatch(parse_record(r#"1^stopped,reason="end-stepping-range""#));
        let finished = done_rx.try_recv().unwrap();
        assert_eq!(finished.class(), ResultClass::Stopped);
        assert!(!finished.is_success());
        assert_eq!(ResultClass::from_class("stopped"), ResultClass::Stopped);
    }

    #[test]
    fn test_zero_token_result_is_untokened() {
        let (tracker, _rx) = tracker();
        tracker.send(MiCommand::new("-gdb-version")).unwrap();
        assert_eq!(tracker.dispatch(parse_record("0^done")), Dispatched::Orphan(None));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_interaction_menu_from_captured_console() {
        let (tracker, _rx) = tracker();
        let (done_tx, done_rx) = flume::unbounded();
        tracker
            .send(MiCommand::new("-break-insert f").with_output(OutputSource::Channel(done_tx)))
            .unwrap();
        tracker.dispatch_with(
            parse_record("1^done"),
            StreamCapture {
                console: "[0] cancel\n[1] all\n[2] f(int)\n[3] f(char)\n".to_owned(),
                log: String::new(),
            },
        );
        let menu = done_rx.try_recv().unwrap().interaction().unwrap();
        assert_eq!(menu.items(), vec!["f(int)", "f(char)"]);
        assert_eq!(menu.first_choice(), Some(2));
    }

    #[tokio::test]
    async fn test_send_and_wait() {
        let (tx, rx) = flume::unbounded();
        let tracker = Arc::new(Tracker::new(tx));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.send_and_wait(MiCommand::new("-exec-next")).await })
        };

        let line = rx.recv_async().await.unwrap();
        assert_eq!(&line[..], b"1-exec-next\n");
        tracker.dispatch(parse_record("1^running"));

        let finished = waiter.await.unwrap().unwrap();
        assert_eq!(finished.class(), ResultClass::Running);
        assert_eq!(finished.command(), "1-exec-next");
    }

    #[tokio::test]
    async fn test_clear_messages_abandons_waiters() {
        let (tx, rx) = flume::unbounded();
        let tracker = Arc::new(Tracker::new(tx));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.send_and_wait(MiCommand::new("-exec-finish")).await })
        };

        rx.recv_async().await.unwrap();
        assert_eq!(tracker.clear_messages(), 1);
        assert!(matches!(waiter.await.unwrap(), Err(Error::Abandoned)));
        assert_eq!(tracker.dispatch(parse_record("1^done")), Dispatched::Orphan(Some(Token(1))));
    }
}
