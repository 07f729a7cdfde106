//! Scratch mail stores with a matching configuration file

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Two accounts under a temp dir: `personal` (nested folders) and `work`
/// (maildir++), plus a config file pointing at them
pub struct MailStore {
    dir: TempDir,
    config: PathBuf,
}

impl MailStore {
    pub fn new() -> Self {
        Self::with_command("echo", &["synced", "{account}:{folder}"], &["synced", "{account}"])
    }

    pub fn with_command(program: &str, args: &[&str], account_args: &[&str]) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = Self {
            config: dir.path().join("mailwatch.toml"),
            dir,
        };

        store.maildir("personal", "");
        store.maildir("personal", "Lists/rust");
        store.maildir("work", "");
        store.maildir("work", ".Projects.2024");

        let text = format!(
            r#"
[daemon]
quiet_period_ms = 100

[command]
program = {program:?}
args = {args:?}
account_args = {account_args:?}

[watch]
exclude = ["Trash"]

[[account]]
name = "personal"
root = {personal:?}

[[account]]
name = "work"
root = {work:?}
layout = "maildir++"
"#,
            program = program,
            args = args,
            account_args = account_args,
            personal = store.root("personal").display().to_string(),
            work = store.root("work").display().to_string(),
        );
        fs::write(&store.config, text).expect("write config");
        store
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> &str {
        self.config.to_str().expect("utf-8 temp path")
    }

    pub fn root(&self, account: &str) -> PathBuf {
        self.dir.path().join("Mail").join(account)
    }

    /// Create `cur`/`new`/`tmp` for a folder below the account root
    pub fn maildir(&self, account: &str, folder: &str) -> PathBuf {
        let path = self.root(account).join(folder);
        for leaf in ["cur", "new", "tmp"] {
            fs::create_dir_all(path.join(leaf)).expect("create maildir");
        }
        path
    }

    /// Deliver a message file and return its path as a string
    pub fn deliver(&self, account: &str, folder: &str, name: &str) -> String {
        let path = self.root(account).join(folder).join("new").join(name);
        fs::write(&path, "Subject: test\n\nbody\n").expect("write message");
        path.display().to_string()
    }
}
