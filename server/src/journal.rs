//! The transaction log: append-only writer, tokenizer, and startup replay.
//!
//! One UTF-8 line per journaled mutation. Tokens are whitespace-separated;
//! the writer single-quotes a token that is empty or contains whitespace, a
//! quote, or a backslash, and inside quotes `\'` and `\\` are the only
//! escapes. The grammar is append-only: replay tolerates blank lines and
//! trailing whitespace, and skips lines it cannot parse rather than abort
//! startup.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::controller::Controller;
use crate::models::Time;
use crate::uid::{ParseUuidError, Uuid};

/// One journaled mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    AddUser {
        id: Uuid,
        name: String,
        creation: Time,
    },
    AddConversation {
        id: Uuid,
        owner: Uuid,
        title: String,
        creation: Time,
    },
    AddMessage {
        id: Uuid,
        author: Uuid,
        conversation: Uuid,
        content: String,
        creation: Time,
    },
    AddUserInterest { user: Uuid, followed: Uuid },
    RemoveUserInterest { user: Uuid, followed: Uuid },
    AddConversationInterest { user: Uuid, conversation: Uuid },
    RemoveConversationInterest { user: Uuid, conversation: Uuid },
    AddCreator { conversation: Uuid, user: Uuid },
    RemoveCreator { conversation: Uuid, user: Uuid },
    AddOwner { conversation: Uuid, user: Uuid },
    RemoveOwner { conversation: Uuid, user: Uuid },
    AddMember { conversation: Uuid, user: Uuid },
    RemoveMember { conversation: Uuid, user: Uuid },
    ToggleRemoved { conversation: Uuid, user: Uuid },
}

#[derive(Debug, Error)]
pub enum RecordParseError {
    #[error("unterminated quoted token")]
    UnterminatedQuote,

    #[error("unknown record tag: {0}")]
    UnknownTag(String),

    #[error("record is missing fields")]
    MissingField,

    #[error("bad id field: {0}")]
    BadId(#[from] ParseUuidError),

    #[error("bad timestamp field: {0:?}")]
    BadTime(String),
}

/// Split a log line into tokens, resolving quotes and escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>, RecordParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&c) = chars.peek() else { break };

        let mut token = String::new();
        if c == '\'' {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(RecordParseError::UnterminatedQuote),
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped @ ('\'' | '\\')) => token.push(escaped),
                        Some(other) => {
                            // Unknown escape: keep both characters.
                            token.push('\\');
                            token.push(other);
                        }
                        None => return Err(RecordParseError::UnterminatedQuote),
                    },
                    Some(ch) => token.push(ch),
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

/// Quote a token for the log if it needs it.
fn quote(token: &str) -> String {
    let needs_quoting = token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quoting {
        return token.to_string();
    }
    let mut out = String::with_capacity(token.len() + 2);
    out.push('\'');
    for c in token.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

impl Record {
    /// Render as one log line (no trailing newline).
    pub fn render(&self) -> String {
        match self {
            Record::AddUser { id, name, creation } => {
                format!("ADD-USER {} {} {}", id, quote(name), creation)
            }
            Record::AddConversation {
                id,
                owner,
                title,
                creation,
            } => format!("ADD-CONVERSATION {} {} {} {}", id, owner, quote(title), creation),
            Record::AddMessage {
                id,
                author,
                conversation,
                content,
                creation,
            } => format!(
                "ADD-MESSAGE {} {} {} {} {}",
                id,
                author,
                conversation,
                quote(content),
                creation
            ),
            Record::AddUserInterest { user, followed } => {
                format!("ADD-INTEREST-USER {} {}", user, followed)
            }
            Record::RemoveUserInterest { user, followed } => {
                format!("REMOVE-INTEREST-USER {} {}", user, followed)
            }
            Record::AddConversationInterest { user, conversation } => {
                format!("ADD-INTEREST-CONVERSATION {} {}", user, conversation)
            }
            Record::RemoveConversationInterest { user, conversation } => {
                format!("REMOVE-INTEREST-CONVERSATION {} {}", user, conversation)
            }
            Record::AddCreator { conversation, user } => {
                format!("ADD-CONVO-CREATOR {} {}", conversation, user)
            }
            Record::RemoveCreator { conversation, user } => {
                format!("REMOVE-CONVO-CREATOR {} {}", conversation, user)
            }
            Record::AddOwner { conversation, user } => {
                format!("ADD-CONVO-OWNER {} {}", conversation, user)
            }
            Record::RemoveOwner { conversation, user } => {
                format!("REMOVE-CONVO-OWNER {} {}", conversation, user)
            }
            Record::AddMember { conversation, user } => {
                format!("ADD-CONVO-MEMBER {} {}", conversation, user)
            }
            Record::RemoveMember { conversation, user } => {
                format!("REMOVE-CONVO-MEMBER {} {}", conversation, user)
            }
            Record::ToggleRemoved { conversation, user } => {
                format!("REMOVE-CONVO-TOGGLE {} {}", conversation, user)
            }
        }
    }

    /// Parse one log line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Record>, RecordParseError> {
        fn field<'t>(tokens: &'t [String], index: usize) -> Result<&'t str, RecordParseError> {
            tokens
                .get(index)
                .map(String::as_str)
                .ok_or(RecordParseError::MissingField)
        }
        fn id_field(tokens: &[String], index: usize) -> Result<Uuid, RecordParseError> {
            Ok(field(tokens, index)?.parse::<Uuid>()?)
        }
        fn time_field(tokens: &[String], index: usize) -> Result<Time, RecordParseError> {
            let raw = field(tokens, index)?;
            raw.parse::<i64>()
                .map(Time::from_ms)
                .map_err(|_| RecordParseError::BadTime(raw.to_string()))
        }

        let tokens = tokenize(line)?;
        if tokens.is_empty() {
            return Ok(None);
        }

        let record = match tokens[0].as_str() {
            "ADD-USER" => Record::AddUser {
                id: id_field(&tokens, 1)?,
                name: field(&tokens, 2)?.to_string(),
                creation: time_field(&tokens, 3)?,
            },
            "ADD-CONVERSATION" => Record::AddConversation {
                id: id_field(&tokens, 1)?,
                owner: id_field(&tokens, 2)?,
                title: field(&tokens, 3)?.to_string(),
                creation: time_field(&tokens, 4)?,
            },
            "ADD-MESSAGE" => Record::AddMessage {
                id: id_field(&tokens, 1)?,
                author: id_field(&tokens, 2)?,
                conversation: id_field(&tokens, 3)?,
                content: field(&tokens, 4)?.to_string(),
                creation: time_field(&tokens, 5)?,
            },
            "ADD-INTEREST-USER" => Record::AddUserInterest {
                user: id_field(&tokens, 1)?,
                followed: id_field(&tokens, 2)?,
            },
            "REMOVE-INTEREST-USER" => Record::RemoveUserInterest {
                user: id_field(&tokens, 1)?,
                followed: id_field(&tokens, 2)?,
            },
            "ADD-INTEREST-CONVERSATION" => Record::AddConversationInterest {
                user: id_field(&tokens, 1)?,
                conversation: id_field(&tokens, 2)?,
            },
            "REMOVE-INTEREST-CONVERSATION" => Record::RemoveConversationInterest {
                user: id_field(&tokens, 1)?,
                conversation: id_field(&tokens, 2)?,
            },
            "ADD-CONVO-CREATOR" => Record::AddCreator {
                conversation: id_field(&tokens, 1)?,
                user: id_field(&tokens, 2)?,
            },
            "REMOVE-CONVO-CREATOR" => Record::RemoveCreator {
                conversation: id_field(&tokens, 1)?,
                user: id_field(&tokens, 2)?,
            },
            "ADD-CONVO-OWNER" => Record::AddOwner {
                conversation: id_field(&tokens, 1)?,
                user: id_field(&tokens, 2)?,
            },
            "REMOVE-CONVO-OWNER" => Record::RemoveOwner {
                conversation: id_field(&tokens, 1)?,
                user: id_field(&tokens, 2)?,
            },
            "ADD-CONVO-MEMBER" => Record::AddMember {
                conversation: id_field(&tokens, 1)?,
                user: id_field(&tokens, 2)?,
            },
            "REMOVE-CONVO-MEMBER" => Record::RemoveMember {
                conversation: id_field(&tokens, 1)?,
                user: id_field(&tokens, 2)?,
            },
            "REMOVE-CONVO-TOGGLE" => Record::ToggleRemoved {
                conversation: id_field(&tokens, 1)?,
                user: id_field(&tokens, 2)?,
            },
            other => return Err(RecordParseError::UnknownTag(other.to_string())),
        };
        Ok(Some(record))
    }
}

/// Append-only log writer. Every record is flushed before the mutation
/// returns; a failed append means the model has diverged from durable state
/// and the caller must treat it as fatal.
pub struct Journal {
    out: Box<dyn Write + Send>,
}

impl Journal {
    /// Open (creating parents as needed) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Journal> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Journal {
            out: Box::new(file),
        })
    }

    /// A journal that drops everything. For tests and ephemeral servers.
    pub fn discard() -> Journal {
        Journal {
            out: Box::new(io::sink()),
        }
    }

    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        let mut line = record.render();
        line.push('\n');
        self.out.write_all(line.as_bytes())?;
        self.out.flush()
    }
}

/// Replay the log at `path` into `controller`. A missing file means a fresh
/// server. Unparseable lines and duplicate/unknown entities are logged and
/// skipped; replay never aborts startup. Returns the number of applied
/// records.
pub fn replay_file(path: &Path, controller: &mut Controller) -> io::Result<usize> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no transaction log at {} — starting fresh", path.display());
            return Ok(0);
        }
        Err(e) => return Err(e),
    };

    let mut applied = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        match Record::parse(&line) {
            Ok(None) => {}
            Ok(Some(record)) => match controller.replay(record) {
                Ok(()) => applied += 1,
                Err(e) => warn!("skipping journal line {}: {}", index + 1, e),
            },
            Err(e) => warn!("unparseable journal line {}: {}", index + 1, e),
        }
    }

    info!("restored {} transaction log records", applied);
    Ok(applied)
}
