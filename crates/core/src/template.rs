//! Command templates
//!
//! Placeholders are substituted inside individual argv elements and the
//! program is executed directly, so folder names never pass through a shell.
//!
//! ```text
//! program = "mbsync"
//! args = ["-q", "{account}:{folder}"]
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, TemplateError};
use crate::key::{SyncKey, SyncScope};

/// Environment variable carrying the account name to the child
pub const ENV_ACCOUNT: &str = "MAILWATCH_ACCOUNT";
/// Environment variable carrying the folder to the child (unset for account-wide runs)
pub const ENV_FOLDER: &str = "MAILWATCH_FOLDER";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Account,
    Folder,
}

/// One argv element with placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgTemplate {
    segments: Vec<Segment>,
}

impl ArgTemplate {
    pub fn uses_folder(&self) -> bool {
        self.segments.iter().any(|s| *s == Segment::Folder)
    }

    pub fn render(&self, account: &str, folder: &str) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Account => out.push_str(account),
                Segment::Folder => out.push_str(folder),
            }
        }
        out
    }
}

impl FromStr for ArgTemplate {
    type Err = TemplateError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedBrace(input.to_string())),
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(TemplateError::Unclosed(input.to_string()));
                    }

                    let segment = match name.as_str() {
                        "account" => Segment::Account,
                        "folder" => Segment::Folder,
                        _ => return Err(TemplateError::UnknownPlaceholder(name)),
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }
}

/// Fully substituted command, ready to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Synchronization command for folder and account-wide runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    folder_args: Vec<ArgTemplate>,
    account_args: Vec<ArgTemplate>,
}

impl CommandTemplate {
    pub fn new(
        program: &str,
        folder_args: &[String],
        account_args: &[String],
    ) -> Result<Self, ConfigError> {
        if program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }

        let folder_args = parse_args(folder_args, "command.args")?;
        let account_args = parse_args(account_args, "command.account_args")?;
        if account_args.iter().any(ArgTemplate::uses_folder) {
            return Err(ConfigError::FolderInAccountArgs);
        }

        Ok(Self {
            program: program.to_string(),
            folder_args,
            account_args,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Substitute the key into the template
    pub fn render(&self, key: &SyncKey) -> CommandLine {
        let mut env = vec![(ENV_ACCOUNT.to_string(), key.account.to_string())];

        let args = match &key.scope {
            SyncScope::Folder(folder) => {
                env.push((ENV_FOLDER.to_string(), folder.to_string()));
                self.folder_args
                    .iter()
                    .map(|arg| arg.render(&key.account, folder.as_str()))
                    .collect()
            }
            SyncScope::Account => self
                .account_args
                .iter()
                .map(|arg| arg.render(&key.account, ""))
                .collect(),
        };

        CommandLine {
            program: self.program.clone(),
            args,
            env,
        }
    }
}

fn parse_args(args: &[String], field: &'static str) -> Result<Vec<ArgTemplate>, ConfigError> {
    args.iter()
        .map(|arg| {
            arg.parse::<ArgTemplate>()
                .map_err(|source| ConfigError::Template { field, source })
        })
        .collect()
}
