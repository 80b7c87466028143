//! Interactive shell for ShardFS.

use std::collections::BTreeMap;
use std::io::{self, BufRead, SeekFrom, Write};

use thiserror::Error;

use crate::fuse::{FsError, Mount, OpenMode};
use crate::pfs::{CommitInfo, Pfs, PfsError};
use crate::storage::CommitId;

/// Result type for shell commands.
pub type ShellResult<T> = Result<T, ShellError>;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Pfs(#[from] PfsError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("unknown command: {0} (type .help for commands)")]
    UnknownCommand(String),
}

/// Shell configuration.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Prompt string.
    pub prompt: String,
    /// Show timing information.
    pub timing: bool,
    /// Max bytes of file content to print.
    pub max_bytes: usize,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: "shardfs> ".into(),
            timing: false,
            max_bytes: 4096,
        }
    }
}

/// What a command asks the loop to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue(String),
    Exit,
}

/// The interactive shell.
pub struct Repl {
    mount: Mount,
    config: ReplConfig,
    history: Vec<String>,
}

impl Repl {
    pub fn new(pfs: Pfs) -> Self {
        Self::with_config(pfs, ReplConfig::default())
    }

    pub fn with_config(pfs: Pfs, config: ReplConfig) -> Self {
        Self {
            mount: Mount::new(pfs),
            config,
            history: Vec::new(),
        }
    }

    fn pfs(&self) -> &Pfs {
        self.mount.pfs()
    }

    /// Run the shell on stdin until EOF or `.quit`.
    pub fn run(&mut self) -> ShellResult<()> {
        self.print_banner();

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        loop {
            print!("{}", self.config.prompt);
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                println!("\nGoodbye!");
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.history.push(line.to_string());

            let start = std::time::Instant::now();
            match self.execute(line) {
                Ok(Outcome::Exit) => break,
                Ok(Outcome::Continue(output)) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                    if self.config.timing {
                        println!("Time: {:.3}ms", start.elapsed().as_secs_f64() * 1000.0);
                    }
                }
                Err(e) => eprintln!("Error: {}", e),
            }
        }
        Ok(())
    }

    fn print_banner(&self) {
        println!("ShardFS v{}", env!("CARGO_PKG_VERSION"));
        println!("mount policy: {}", self.mount.policy());
        println!("Type .help for commands");
        println!();
    }

    /// Execute one command line and return its output.
    pub fn execute(&mut self, line: &str) -> ShellResult<Outcome> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((command, args)) = parts.split_first() else {
            return Ok(Outcome::Continue(String::new()));
        };
        let command = command.trim_start_matches(&['.', '\\'][..]).to_lowercase();

        let output = match command.as_str() {
            "help" | "h" | "?" => help(),
            "quit" | "exit" | "q" => return Ok(Outcome::Exit),
            "history" => self
                .history
                .iter()
                .enumerate()
                .map(|(i, cmd)| format!("  {}: {}", i + 1, cmd))
                .collect::<Vec<_>>()
                .join("\n"),
            "timing" => {
                self.config.timing = !self.config.timing;
                format!("Timing: {}", if self.config.timing { "on" } else { "off" })
            }

            // repos
            "create-repo" => {
                let [name] = args else { return Err(ShellError::Usage("create-repo <repo>")) };
                self.pfs().create_repo(name)?;
                format!("created repo {}", name)
            }
            "delete-repo" => {
                let [name] = args else { return Err(ShellError::Usage("delete-repo <repo>")) };
                self.pfs().delete_repo(name)?;
                format!("deleted repo {}", name)
            }
            "repos" => {
                let repos = self.pfs().list_repos();
                if repos.is_empty() {
                    "No repos.".to_string()
                } else {
                    let mut out = format!("{:<20} {:>8} {:>9}  {}", "Name", "Commits", "Branches", "Created");
                    for repo in repos {
                        out.push_str(&format!(
                            "\n{:<20} {:>8} {:>9}  {}",
                            repo.name,
                            repo.commits,
                            repo.branches,
                            repo.created.format("%Y-%m-%d %H:%M:%S")
                        ));
                    }
                    out
                }
            }

            // commits
            "start" => {
                let (repo, branch) = match args {
                    [repo] => (*repo, None),
                    [repo, branch] => (*repo, Some(*branch)),
                    _ => return Err(ShellError::Usage("start <repo> [branch]")),
                };
                self.pfs().start_commit(repo, branch, None)?.to_string()
            }
            "finish" => {
                let [repo, reference] = args else { return Err(ShellError::Usage("finish <repo> <commit>")) };
                let commit = self.resolve(repo, reference)?;
                let info = self.pfs().finish_commit(repo, commit)?;
                format!("finished {} ({} bytes)", info.id, info.size_bytes)
            }
            "abort" => {
                let [repo, reference] = args else { return Err(ShellError::Usage("abort <repo> <commit>")) };
                let commit = self.resolve(repo, reference)?;
                self.pfs().abort_commit(repo, commit)?;
                format!("aborted {}", commit)
            }
            "commits" => {
                let [repo] = args else { return Err(ShellError::Usage("commits <repo>")) };
                let commits = self.pfs().list_commits(repo)?;
                commits.iter().map(format_commit).collect::<Vec<_>>().join("\n")
            }
            "inspect" => {
                let [repo, reference] = args else { return Err(ShellError::Usage("inspect <repo> <commit>")) };
                let commit = self.resolve(repo, reference)?;
                format_commit(&self.pfs().inspect_commit(repo, commit)?)
            }

            // branches
            "branches" => {
                let [repo] = args else { return Err(ShellError::Usage("branches <repo>")) };
                self.pfs()
                    .list_branches(repo)?
                    .into_iter()
                    .map(|(branch, head)| format!("{:<20} {}", branch, head))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            "branch" => {
                let [repo, branch, reference] = args else {
                    return Err(ShellError::Usage("branch <repo> <branch> <commit>"));
                };
                let commit = self.resolve(repo, reference)?;
                self.pfs().set_branch(repo, branch, commit)?;
                format!("{} -> {}", branch, commit)
            }
            "delete-branch" => {
                let [repo, branch] = args else { return Err(ShellError::Usage("delete-branch <repo> <branch>")) };
                self.pfs().delete_branch(repo, branch)?;
                format!("deleted branch {}", branch)
            }

            // files
            "put" => {
                let [repo, reference, path, content @ ..] = args else {
                    return Err(ShellError::Usage("put <repo> <commit> <path> <content>"));
                };
                let commit = self.resolve(repo, reference)?;
                let content = content.join(" ").into_bytes();
                let len = content.len();
                self.pfs().put_file(repo, commit, path, content)?;
                format!("wrote {} bytes", len)
            }
            "get" => {
                let [repo, reference, path] = args else { return Err(ShellError::Usage("get <repo> <commit> <path>")) };
                let commit = self.resolve(repo, reference)?;
                let content = self.pfs().get_file(repo, commit, path)?;
                self.format_content(&content)
            }
            "rm" => {
                let [repo, reference, path] = args else { return Err(ShellError::Usage("rm <repo> <commit> <path>")) };
                let commit = self.resolve(repo, reference)?;
                self.pfs().delete_file(repo, commit, path)?;
                format!("deleted {}", path)
            }
            "ls" => {
                let (repo, reference, prefix) = match args {
                    [repo, reference] => (*repo, *reference, "/"),
                    [repo, reference, prefix] => (*repo, *reference, *prefix),
                    _ => return Err(ShellError::Usage("ls <repo> <commit> [prefix]")),
                };
                let commit = self.resolve(repo, reference)?;
                self.pfs()
                    .list_files(repo, commit, prefix)?
                    .into_iter()
                    .map(|f| format!("{:>10}  {}", f.size, f.path))
                    .collect::<Vec<_>>()
                    .join("\n")
            }

            // mount handles
            "open" => {
                let (path, mode) = match args {
                    [path] => (*path, OpenMode::Read),
                    [path, "r"] => (*path, OpenMode::Read),
                    [path, "w"] => (*path, OpenMode::Write),
                    _ => return Err(ShellError::Usage("open <repo>/<commit>/<path> [r|w]")),
                };
                format!("fd {}", self.mount.open(path, mode)?)
            }
            "write" => {
                let [fd, content @ ..] = args else { return Err(ShellError::Usage("write <fd> <content>")) };
                let n = self.mount.write(parse_number(fd)?, content.join(" ").as_bytes())?;
                format!("wrote {} bytes", n)
            }
            "read" => {
                let [fd, len] = args else { return Err(ShellError::Usage("read <fd> <len>")) };
                let mut buf = vec![0u8; parse_number(len)? as usize];
                let n = self.mount.read(parse_number(fd)?, &mut buf)?;
                buf.truncate(n);
                self.format_content(&buf)
            }
            "seek" => {
                let [fd, offset] = args else { return Err(ShellError::Usage("seek <fd> <offset>")) };
                let position = self.mount.seek(parse_number(fd)?, SeekFrom::Start(parse_number(offset)?))?;
                format!("at {}", position)
            }
            "sync" => {
                let [fd] = args else { return Err(ShellError::Usage("sync <fd>")) };
                self.mount.sync(parse_number(fd)?)?;
                String::new()
            }
            "close" => {
                let [fd] = args else { return Err(ShellError::Usage("close <fd>")) };
                self.mount.close(parse_number(fd)?)?;
                String::new()
            }

            // maintenance
            "flush" => {
                let [repo] = args else { return Err(ShellError::Usage("flush <repo>")) };
                format!("published {} shard(s)", self.pfs().flush(repo)?)
            }
            "compact" => {
                let [repo] = args else { return Err(ShellError::Usage("compact <repo>")) };
                let results = self.pfs().compact(repo)?;
                results
                    .iter()
                    .map(|r| {
                        format!(
                            "L{} -> L{}: {} in, {} out, {} entries dropped",
                            r.level, r.output_level, r.consumed, r.produced, r.entries_dropped
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            "verify" => {
                let [repo] = args else { return Err(ShellError::Usage("verify <repo>")) };
                let report = self.pfs().verify(repo)?;
                let mut out = format!("checked {} shard(s)", report.checked);
                for (shard, reason) in &report.corrupted {
                    out.push_str(&format!("\n  corrupted {}: {}", shard, reason));
                }
                out
            }
            "stats" => {
                let [repo] = args else { return Err(ShellError::Usage("stats <repo>")) };
                let stats = self.pfs().storage_stats(repo)?;
                let mut out = String::from("Level  Shards       Bytes     Entries");
                for level in &stats.levels {
                    out.push_str(&format!(
                        "\n{:>5} {:>7} {:>11} {:>11}",
                        level.level, level.shards, level.bytes, level.entries
                    ));
                }
                out.push_str(&format!(
                    "\nbuffered: {} entries, {} bytes\nflushes: {}, compactions: {}, retries: {}, segments deleted: {}",
                    stats.buffered_entries,
                    stats.buffered_bytes,
                    stats.flushes,
                    stats.compactions,
                    stats.retries,
                    stats.segments_deleted
                ));
                out
            }

            other => return Err(ShellError::UnknownCommand(other.to_string())),
        };
        Ok(Outcome::Continue(output))
    }

    fn resolve(&self, repo: &str, reference: &str) -> ShellResult<CommitId> {
        Ok(self.pfs().resolve_commit(repo, reference)?)
    }

    fn format_content(&self, content: &[u8]) -> String {
        let shown = &content[..content.len().min(self.config.max_bytes)];
        let mut out = String::from_utf8_lossy(shown).into_owned();
        if content.len() > shown.len() {
            out.push_str(&format!("\n... ({} more bytes)", content.len() - shown.len()));
        }
        out
    }
}

fn parse_number(s: &str) -> ShellResult<u64> {
    s.parse().map_err(|_| ShellError::InvalidNumber(s.to_string()))
}

fn format_commit(info: &CommitInfo) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("parent", info.parent.map(|p| p.to_string()).unwrap_or_else(|| "-".into()));
    fields.insert("branch", info.branch.as_ref().map(|b| b.to_string()).unwrap_or_else(|| "-".into()));
    fields.insert("size", info.size_bytes.to_string());
    let details: Vec<String> = fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{} {:<8} {}", info.id, info.state, details.join(" "))
}

fn help() -> String {
    [
        "Commands:",
        "  .help, .h, .?                        Show this help message",
        "  .quit, .exit, .q                     Exit the shell",
        "  .history                             Show command history",
        "  .timing                              Toggle timing display",
        "",
        "Repos and commits:",
        "  create-repo <repo> | delete-repo <repo> | repos",
        "  start <repo> [branch]                Open a commit",
        "  finish <repo> <commit> | abort <repo> <commit>",
        "  commits <repo> | inspect <repo> <commit>",
        "  branches <repo> | branch <repo> <branch> <commit> | delete-branch <repo> <branch>",
        "",
        "Files (a commit is an ID or a branch name):",
        "  put <repo> <commit> <path> <content>",
        "  get <repo> <commit> <path> | rm <repo> <commit> <path>",
        "  ls <repo> <commit> [prefix]",
        "",
        "Mount handles:",
        "  open <repo>/<commit>/<path> [r|w]    Prints a descriptor",
        "  write <fd> <content> | read <fd> <len> | seek <fd> <offset>",
        "  sync <fd> | close <fd>",
        "",
        "Storage:",
        "  flush <repo> | compact <repo> | verify <repo> | stats <repo>",
    ]
    .join("\n")
}
