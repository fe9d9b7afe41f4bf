use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use chat_sync::api::client::ApiClient;
use chat_sync::api::models::{Identity, LocalId};
use chat_sync::sync::timeline::{PendingState, TimelineEntry};
use chat_sync::{Notice, NoticeLevel, Result, SessionHandle, SessionSnapshot};

use crate::ui::chat_view::ChatView;
use crate::ui::sidebar::render_conversations;

const HELP: &str = "\
commands:
  /list                     show conversations
  /open <id>                open a conversation
  /leave                    close the open conversation
  /schedule <when> <text>   when: +15m, +2h, +1d or an RFC 3339 time
  /cancel                   drop the pending schedule
  /refresh                  reload the open conversation
  /resend                   retry failed messages
  /quit
anything else is sent as a message";

#[derive(Debug, PartialEq)]
pub enum Input {
    List,
    Open(String),
    Leave,
    Schedule { when: DateTime<Utc>, body: String },
    Cancel,
    Refresh,
    Resend,
    Help,
    Quit,
    Message(String),
    Invalid(String),
    Empty,
}

pub fn parse_input(line: &str, now: DateTime<Utc>) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(n, r)| (n, r.trim()))
        .unwrap_or((command, ""));
    match name {
        "list" => Input::List,
        "open" if !rest.is_empty() => Input::Open(rest.to_string()),
        "open" => Input::Invalid("usage: /open <id>".into()),
        "leave" => Input::Leave,
        "schedule" => {
            let (when, body) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            match parse_when(when, now) {
                Some(when) => Input::Schedule {
                    when,
                    body: body.trim().to_string(),
                },
                None => Input::Invalid(format!("cannot read time {when:?}")),
            }
        }
        "cancel" => Input::Cancel,
        "refresh" => Input::Refresh,
        "resend" => Input::Resend,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other}")),
    }
}

fn parse_when(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(offset) = raw.strip_prefix('+') {
        let unit = offset.chars().last()?;
        let amount: i64 = offset[..offset.len() - unit.len_utf8()].parse().ok()?;
        let delta = match unit {
            'm' => TimeDelta::try_minutes(amount)?,
            'h' => TimeDelta::try_hours(amount)?,
            'd' => TimeDelta::try_days(amount)?,
            _ => return None,
        };
        return now.checked_add_signed(delta);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn failed_sends(snapshot: &SessionSnapshot) -> Vec<LocalId> {
    snapshot
        .entries
        .iter()
        .filter_map(|e| match e {
            TimelineEntry::Pending(p) if matches!(p.state, PendingState::Failed { .. }) => {
                Some(p.local_id)
            }
            _ => None,
        })
        .collect()
}

fn print_notice(notice: &Notice) {
    let level = match notice.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Success => "ok",
        NoticeLevel::Warning => "warn",
        NoticeLevel::Error => "error",
    };
    match &notice.description {
        Some(description) => println!("[{level}] {}: {description}", notice.title),
        None => println!("[{level}] {}", notice.title),
    }
}

async fn show_updates(
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut notices: mpsc::UnboundedReceiver<Notice>,
) {
    let mut view = ChatView::new();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                for line in view.update(&snapshot) {
                    println!("{line}");
                }
            }
            Some(notice) = notices.recv() => print_notice(&notice),
        }
    }
}

/// Read commands from stdin until `/quit` or end of input.
pub async fn run(
    handle: SessionHandle,
    notices: mpsc::UnboundedReceiver<Notice>,
    client: Arc<ApiClient>,
    identity: Identity,
) -> Result<()> {
    let printer = tokio::spawn(show_updates(handle.watch(), notices));
    println!("signed in as {}. /help for commands", identity.user.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line, Utc::now()) {
            Input::Empty => {}
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Invalid(reason) => println!("{reason}"),
            Input::List => match client.conversations().await {
                Ok(conversations) => {
                    let snapshot = handle.snapshot();
                    for line in render_conversations(&conversations, &identity.user.id, &snapshot) {
                        println!("{line}");
                    }
                }
                Err(e) => println!("[error] Failed to load chats: {e}"),
            },
            Input::Open(id) => handle.switch_conversation(id.as_str().into())?,
            Input::Leave => handle.leave()?,
            Input::Schedule { when, body } => handle.schedule(body, when)?,
            Input::Cancel => handle.cancel_schedule()?,
            Input::Refresh => handle.refresh()?,
            Input::Resend => {
                let failed = failed_sends(&handle.snapshot());
                if failed.is_empty() {
                    println!("nothing to resend");
                }
                for local_id in failed {
                    handle.resend(local_id)?;
                }
            }
            Input::Message(text) => {
                handle.keystroke()?;
                handle.send_message(text)?;
            }
        }
    }

    handle.shutdown()?;
    printer.abort();
    Ok(())
}
