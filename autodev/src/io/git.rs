//! Git adapter for the run workspace.
//!
//! Every git call goes through a small, explicit wrapper around the `git`
//! binary. Tokens are only ever placed in one-off remote URLs and are
//! redacted from any error text.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::github::authenticated_url;

const ORIGIN: &str = "origin";

/// Overrides passed to every git call made on the host.
const HARDENED_CONFIG: [&str; 3] = [
    "core.hooksPath=/dev/null",
    "core.fsmonitor=false",
    "protocol.ext.allow=never",
];

/// Author identity applied to commits via `-c user.name/-c user.email`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Where a branch comes from when switching to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSource {
    Local,
    /// Only on `origin`; fetched and tracked locally.
    Remote,
    /// Created at the current HEAD.
    New,
}

/// Thin wrapper running `git` in one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    identity: Option<Identity>,
    secret: Option<String>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            identity: None,
            secret: None,
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Redact `secret` from any error this wrapper reports.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty());
        self
    }

    /// Shallow single-commit clone of `url` into `dest`.
    #[instrument(skip_all, fields(dest = %dest.display()))]
    pub fn clone_shallow(url: &str, dest: &Path, secret: Option<&str>) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let dest_arg = dest.to_string_lossy();
        let args = ["clone", "--depth", "1", "--no-single-branch", url, dest_arg.as_ref()];
        let output = Command::new("git")
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .context("spawn git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(redact(
                &format!("git clone {url} failed: {}", stderr.trim()),
                secret
            )));
        }
        debug!("clone finished");
        Ok(())
    }

    /// Name of the checked-out branch. Fails on a detached HEAD.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let output = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if !output.status.success() {
            warn!("HEAD is detached");
            return Err(anyhow!("HEAD is detached in {}", self.workdir.display()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// `url.<base>.insteadOf`/`pushInsteadOf` entries visible in this repo.
    pub fn url_rewrites(&self) -> Result<Vec<String>> {
        let output = self.run(&["config", "--get-regexp", r"^url\..*insteadof$"])?;
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(|line| redact(line.trim(), self.secret.as_deref()))
                .filter(|line| !line.is_empty())
                .collect()),
            // exit 1: no matching key
            Some(1) => Ok(Vec::new()),
            _ => Err(anyhow!(
                "git config --get-regexp failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    pub fn set_remote_url(&self, url: &str) -> Result<()> {
        self.run_checked(&["remote", "set-url", ORIGIN, url])
            .map(drop)
    }

    /// Where `branch` lives before [`Git::checkout`] switches to it.
    pub fn locate_branch(&self, branch: &str) -> Result<BranchSource> {
        let local = format!("refs/heads/{branch}");
        if self
            .run(&["show-ref", "--verify", "--quiet", &local])?
            .status
            .success()
        {
            return Ok(BranchSource::Local);
        }
        match self.run_capture(&["ls-remote", "--heads", ORIGIN, branch]) {
            Ok(heads) if !heads.trim().is_empty() => Ok(BranchSource::Remote),
            Ok(_) => Ok(BranchSource::New),
            Err(err) => {
                warn!(err = %err, branch, "could not query remote branches");
                Ok(BranchSource::New)
            }
        }
    }

    /// Switch to `branch`, creating it from `source` when needed.
    #[instrument(skip_all, fields(branch, source = ?source))]
    pub fn checkout(&self, branch: &str, source: BranchSource) -> Result<()> {
        match source {
            BranchSource::Local => self.run_checked(&["checkout", branch])?,
            BranchSource::Remote => {
                self.run_checked(&["fetch", "--depth", "1", ORIGIN, branch])?;
                self.run_checked(&["checkout", "-b", branch, "FETCH_HEAD"])?
            }
            BranchSource::New => self.run_checked(&["checkout", "-b", branch])?,
        };
        debug!(branch, "branch checked out");
        Ok(())
    }

    /// Stage every change in the work tree, deletions included.
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "--all"]).map(drop)
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        // exit 1 means the index differs from HEAD
        let output = self.run(&["diff", "--cached", "--quiet"])?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(anyhow!(
                "git diff --cached failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Commit the index; returns the new HEAD sha, or `None` when nothing
    /// was staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<Option<String>> {
        if !self.has_staged_changes()? {
            debug!("nothing staged");
            return Ok(None);
        }
        self.run_checked(&["commit", "--quiet", "--no-verify", "-m", message])?;
        self.head_sha().map(Some)
    }

    /// Push HEAD to `refs/heads/<branch>` at `remote` (a name or a URL).
    #[instrument(skip_all, fields(branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_checked(&["push", remote, &refspec])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub(crate) fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("git {} failed: {}", args.join(" "), stderr.trim());
            return Err(anyhow!(redact(&message, self.secret.as_deref())));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        // the work tree is written by generated code; never let its config run anything
        for setting in HARDENED_CONFIG {
            cmd.arg("-c").arg(setting);
        }
        if let Some(identity) = &self.identity {
            cmd.arg("-c")
                .arg(format!("user.name={}", identity.name))
                .arg("-c")
                .arg(format!("user.email={}", identity.email));
        }
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| redact(&format!("spawn git {}", args.join(" ")), self.secret.as_deref()))
    }
}

/// Replace every occurrence of `secret` in `text`.
pub fn redact(text: &str, secret: Option<&str>) -> String {
    match secret.filter(|s| !s.is_empty()) {
        Some(secret) => text.replace(secret, "***"),
        None => text.to_string(),
    }
}

/// Version-control operations the pipeline needs.
pub trait SourceControl {
    /// Clone `url` into `dest`, which must not exist yet.
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;

    /// Branch checked out in `workdir`.
    fn current_branch(&self, workdir: &Path) -> Result<String>;

    /// Switch to `branch`: an existing local branch, else the remote one,
    /// else a new branch at HEAD.
    fn prepare_branch(&self, workdir: &Path, branch: &str) -> Result<()>;

    /// Stage everything and commit. `None` when there was nothing to commit.
    fn commit_all(&self, workdir: &Path, message: &str) -> Result<Option<String>>;

    /// Push the checked-out HEAD to `branch` at `url`.
    fn push(&self, workdir: &Path, url: &str, branch: &str) -> Result<()>;
}

impl<T: SourceControl + ?Sized> SourceControl for &T {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        (**self).clone_repo(url, dest)
    }

    fn current_branch(&self, workdir: &Path) -> Result<String> {
        (**self).current_branch(workdir)
    }

    fn prepare_branch(&self, workdir: &Path, branch: &str) -> Result<()> {
        (**self).prepare_branch(workdir, branch)
    }

    fn commit_all(&self, workdir: &Path, message: &str) -> Result<Option<String>> {
        (**self).commit_all(workdir, message)
    }

    fn push(&self, workdir: &Path, url: &str, branch: &str) -> Result<()> {
        (**self).push(workdir, url, branch)
    }
}

/// [`SourceControl`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitSourceControl {
    token: Option<String>,
    identity: Identity,
}

impl GitSourceControl {
    pub fn new(token: Option<String>, identity: Identity) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
            identity,
        }
    }

    fn git(&self, workdir: &Path) -> Git {
        Git::new(workdir)
            .with_identity(self.identity.clone())
            .with_secret(self.token.clone())
    }

    fn remote_with_token(&self, url: &str) -> String {
        match &self.token {
            Some(token) => authenticated_url(url, token),
            None => url.to_string(),
        }
    }
}

impl SourceControl for GitSourceControl {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(anyhow!("workspace {} already exists", dest.display()));
        }
        info!(dest = %dest.display(), "cloning repository");
        let clone_url = self.remote_with_token(url);
        Git::clone_shallow(&clone_url, dest, self.token.as_deref())?;
        // keep the token out of .git/config
        if clone_url != url {
            self.git(dest).set_remote_url(url)?;
        }
        Ok(())
    }

    fn current_branch(&self, workdir: &Path) -> Result<String> {
        self.git(workdir).current_branch()
    }

    fn prepare_branch(&self, workdir: &Path, branch: &str) -> Result<()> {
        let git = self.git(workdir);
        if git.current_branch().is_ok_and(|current| current == branch) {
            return Ok(());
        }
        let source = git.locate_branch(branch)?;
        info!(branch, source = ?source, "preparing branch");
        git.checkout(branch, source)
    }

    fn commit_all(&self, workdir: &Path, message: &str) -> Result<Option<String>> {
        let git = self.git(workdir);
        git.add_all()?;
        git.commit_staged(message)
    }

    fn push(&self, workdir: &Path, url: &str, branch: &str) -> Result<()> {
        let git = self.git(workdir);
        let rewrites = git.url_rewrites()?;
        if !rewrites.is_empty() {
            warn!(count = rewrites.len(), "workspace config rewrites remote urls");
            return Err(anyhow!(
                "refusing to push: workspace config rewrites remote urls ({})",
                rewrites.join("; ")
            ));
        }
        info!(branch, "pushing branch");
        git.push(&self.remote_with_token(url), branch)
    }
}
