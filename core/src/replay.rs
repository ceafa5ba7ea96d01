use std::{
    collections::{HashMap, VecDeque},
    io::Write,
    sync::Arc,
};

use anyhow::{Context, Result};
use gdbmi::{
    session::SessionEvent, tracker::Tracker, FinishedCmd, MiCommand, OutputSource, Session, Token,
};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, trace};

use crate::common::Config;

// Leading token digits of a transcript line and the text after them.
fn split_token(line: &str) -> (&str, &str) {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    line.split_at(digits)
}

/// The MI command on a transcript line that was typed at the debugger
/// rather than printed by it, with the token it was recorded under (0 and
/// absent both mean none) and the command text with that token stripped.
pub fn command_text(line: &str) -> Option<(Option<u64>, &str)> {
    let (digits, rest) = split_token(line);
    if !rest.starts_with('-') {
        return None;
    }
    let recorded = digits.parse().ok().filter(|&t| t != 0);
    Some((recorded, rest))
}

/// Maps the tokens a transcript was recorded with onto the ones the replay
/// session hands out. Untokened results pair with untokened commands in
/// the order they were sent.
#[derive(Debug, Default)]
struct Renumber {
    recorded: HashMap<u64, Token>,
    untokened: VecDeque<Token>,
}

impl Renumber {
    fn sent(&mut self, recorded: Option<u64>, assigned: Token) {
        match recorded {
            Some(recorded) => {
                self.recorded.insert(recorded, assigned);
            }
            None => self.untokened.push_back(assigned),
        }
    }

    /// The result line re-tokened for the replay session, or `None` to feed
    /// it through unchanged.
    fn rewrite(&mut self, line: &str) -> Option<String> {
        let (digits, rest) = split_token(line.trim_end());
        if !rest.starts_with('^') {
            return None;
        }
        let assigned = match digits.parse::<u64>() {
            Ok(0) => self.untokened.pop_front()?,
            Ok(recorded) => self.recorded.remove(&recorded)?,
            Err(_) if digits.is_empty() => self.untokened.pop_front()?,
            Err(_) => return None,
        };
        trace!("result token {:?} replayed as {}", digits, assigned);
        Some(format!("{}{}", assigned, rest))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub lines: usize,
    pub commands: usize,
    pub bad_lines: usize,
    pub completed: usize,
    pub failed: usize,
    pub dropped: usize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Output {
    Sent {
        line: String,
    },
    Event {
        event: SessionEvent,
    },
    Finished {
        token: u64,
        command: String,
        class: String,
        success: bool,
        error: Option<String>,
        choices: Option<Vec<String>>,
    },
    Summary {
        summary: Summary,
    },
}

impl From<&FinishedCmd> for Output {
    fn from(finished: &FinishedCmd) -> Self {
        Output::Finished {
            token: finished.token().0,
            command: finished.command().to_owned(),
            class: finished.record().class().to_owned(),
            success: finished.is_success(),
            error: finished.error_message(),
            choices: finished
                .interaction()
                .map(|menu| menu.items().into_iter().map(str::to_owned).collect()),
        }
    }
}

fn emit<W: Write>(out: &mut W, output: &Output) -> Result<()> {
    serde_json::to_writer(&mut *out, output).context("Failed to serialize output")?;
    writeln!(out).context("Failed to write output")?;
    Ok(())
}

fn is_stream(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::ConsoleStream(_) | SessionEvent::TargetStream(_) | SessionEvent::LogStream(_)
    )
}

/// Feed a transcript through a fresh session, writing one JSON object per
/// routed record. Command lines are re-sent through the session with
/// tokens assigned anew from `Conf::first_token`, and result lines are
/// renumbered to match before they are routed.
pub async fn replay<R, W>(reader: R, out: &mut W, config: &Config) -> Result<Summary>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let (input_tx, input_rx) = flume::unbounded();
    let tracker = Arc::new(Tracker::starting_at(input_tx, config.conf.first_token));
    let (mut session, events) = Session::new(config.session.clone(), Arc::clone(&tracker));
    let (done_tx, done_rx) = flume::unbounded();
    let mut summary = Summary::default();
    let mut renumber = Renumber::default();

    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read transcript")?
    {
        summary.lines += 1;
        match command_text(line.trim()) {
            Some((recorded, cmd)) => {
                summary.commands += 1;
                let assigned = session
                    .send(MiCommand::new(cmd).with_output(OutputSource::Channel(done_tx.clone())))
                    .context("Failed to send command")?;
                renumber.sent(recorded, assigned);
            }
            None => match renumber.rewrite(&line) {
                Some(rewritten) => {
                    session.process_line(&rewritten);
                }
                None => {
                    session.process_line(&line);
                }
            },
        }

        for written in input_rx.try_iter() {
            let line = String::from_utf8_lossy(&written).trim_end().to_owned();
            emit(out, &Output::Sent { line })?;
        }
        for event in events.try_iter() {
            if matches!(event, SessionEvent::BadLine { .. }) {
                summary.bad_lines += 1;
            }
            if !config.conf.emit_streams && is_stream(&event) {
                continue;
            }
            emit(out, &Output::Event { event })?;
        }
        for finished in done_rx.try_iter() {
            summary.completed += 1;
            if !finished.is_success() {
                summary.failed += 1;
            }
            debug!("finished {}", finished.record());
            emit(out, &Output::from(&finished))?;
        }
    }

    summary.dropped = session.clear_messages();
    info!(
        "Replayed {} lines, {} of {} commands completed",
        summary.lines, summary.completed, summary.commands
    );
    emit(
        out,
        &Output::Summary {
            summary: summary.clone(),
        },
    )?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const TRANSCRIPT: &str = r#"=thread-group-added,id="i1"
~"GNU gdb (GDB) 14.2\n"
(gdb)
5-break-insert main
5^done,bkpt={number="1",type="breakpoint",func="main"}
(gdb)
7-exec-run
=thread-group-started,id="i1",pid="42"
*running,thread-id="all"
7^running
(gdb)
*stopped,reason="breakpoint-hit",bkptno="1",thread-id="1"
-data-evaluate-expression nope
^error,msg="No symbol \"nope\" in current context."
Reading symbols from ./a.out...
9-exec-continue
"#;

    async fn run(transcript: &str, config: &Config) -> (Summary, Vec<Value>) {
        let mut out = Vec::new();
        let summary = replay(transcript.as_bytes(), &mut out, config).await.unwrap();
        let outputs = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (summary, outputs)
    }

    fn of_type<'a>(outputs: &'a [Value], ty: &str) -> Vec<&'a Value> {
        outputs.iter().filter(|o| o["type"] == ty).collect()
    }

    #[test]
    fn test_command_text() {
        assert_eq!(command_text("-exec-run"), Some((None, "-exec-run")));
        assert_eq!(
            command_text("12-break-insert main"),
            Some((Some(12), "-break-insert main"))
        );
        assert_eq!(command_text("0-exec-next"), Some((None, "-exec-next")));
        assert_eq!(command_text("12^done"), None);
        assert_eq!(command_text("~\"-x\""), None);
    }

    #[test]
    fn test_renumber_results() {
        let mut renumber = Renumber::default();
        renumber.sent(Some(7), Token(1));
        renumber.sent(None, Token(2));
        renumber.sent(None, Token(3));

        assert_eq!(renumber.rewrite("7^running\r\n").as_deref(), Some("1^running"));
        assert_eq!(renumber.rewrite("7^done"), None);
        assert_eq!(renumber.rewrite("^done").as_deref(), Some("2^done"));
        assert_eq!(renumber.rewrite("0^error,msg=\"x\"").as_deref(), Some("3^error,msg=\"x\""));
        assert_eq!(renumber.rewrite("^done"), None);
        assert_eq!(renumber.rewrite("*stopped"), None);
        assert_eq!(renumber.rewrite("99999999999999999999999^done"), None);
    }

    #[tokio::test]
    async fn test_replay_transcript() {
        let (summary, outputs) = run(TRANSCRIPT, &Config::default()).await;
        assert_eq!(
            summary,
            Summary {
                lines: 16,
                commands: 4,
                bad_lines: 1,
                completed: 3,
                failed: 1,
                dropped: 1,
            }
        );

        let sent: Vec<_> = of_type(&outputs, "sent")
            .into_iter()
            .map(|o| o["line"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            sent,
            vec![
                "1-break-insert main",
                "2-exec-run",
                "3-data-evaluate-expression nope",
                "4-exec-continue",
            ]
        );

        let finished = of_type(&outputs, "finished");
        assert_eq!(finished.len(), 3);
        assert_eq!(finished[1]["class"], "running");
        assert_eq!(finished[2]["success"], false);
        assert_eq!(
            finished[2]["error"],
            "No symbol \"nope\" in current context."
        );

        let last = outputs.last().unwrap();
        assert_eq!(last["type"], "summary");
        assert_eq!(last["summary"]["dropped"], 1);
    }

    #[tokio::test]
    async fn test_streams_can_be_hidden() {
        let mut config = Config::default();
        config.conf.emit_streams = false;
        let (_, outputs) = run(TRANSCRIPT, &config).await;
        assert!(of_type(&outputs, "event")
            .iter()
            .all(|o| o["event"].get("ConsoleStream").is_none()));
    }

    #[tokio::test]
    async fn test_recorded_tokens_correlate() {
        let (summary, outputs) = run("(gdb)\n7-exec-run\n7^running\n(gdb)\n", &Config::default()).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.dropped, 0);
        let finished = of_type(&outputs, "finished");
        assert_eq!(finished[0]["token"], 1);
        assert_eq!(finished[0]["command"], "1-exec-run");
    }

    #[tokio::test]
    async fn test_result_for_unsent_command_stays_orphaned() {
        let (summary, _) = run("(gdb)\n-exec-run\n3^done\n", &Config::default()).await;
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.dropped, 1);
    }
}
