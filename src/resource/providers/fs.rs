//! File and directory management for unix-like hosts.
//!
//! Content drift is detected by sha256 (computed locally for the desired
//! content, remotely via `sha256sum`/`shasum`). Writes go through the
//! shell as base64 so they work on exec-only sessions and sudo-owned
//! destinations; ownership and mode are companion ops whose failures
//! surface individually.

use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::ProviderError;
use crate::resource::{
    CurrentState, Diff, DirectoryResource, Ensure, ExecutionContext, FileResource, ResourceKind,
    ResourceResult,
};
use crate::ssh::{ExecOptions, Session};

use super::Provider;

const PROP_KIND: &str = "kind";
const PROP_SHA256: &str = "sha256";
const PROP_OWNER: &str = "owner";
const PROP_GROUP: &str = "group";
const PROP_MODE: &str = "mode";
const PROP_STATE: &str = "state";

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Octal mode strings compare numerically ("0644" == "644").
fn mode_eq(a: &str, b: &str) -> bool {
    let parse = |s: &str| u32::from_str_radix(s, 8).ok();
    parse(a).is_some() && parse(a) == parse(b)
}

/// Desired-state view shared by the file and directory variants.
struct Desired<'a> {
    path: &'a str,
    state: Ensure,
    content: Option<&'a str>,
    owner: Option<&'a str>,
    group: Option<&'a str>,
    mode: Option<&'a str>,
    directory: bool,
}

fn desired(kind: &ResourceKind) -> Desired<'_> {
    match kind {
        ResourceKind::File(FileResource {
            path,
            content,
            owner,
            group,
            mode,
            state,
        }) => Desired {
            path,
            state: *state,
            content: content.as_deref(),
            owner: owner.as_deref(),
            group: group.as_deref(),
            mode: mode.as_deref(),
            directory: false,
        },
        ResourceKind::Directory(DirectoryResource {
            path,
            owner,
            group,
            mode,
            state,
        }) => Desired {
            path,
            state: *state,
            content: None,
            owner: owner.as_deref(),
            group: group.as_deref(),
            mode: mode.as_deref(),
            directory: true,
        },
        _ => unreachable!("registry routes only file and directory resources here"),
    }
}

/// Provider for File and Directory on unix-like hosts.
pub struct UnixFsProvider;

impl UnixFsProvider {
    async fn observe(
        &self,
        want: &Desired<'_>,
        session: &dyn Session,
        opts: &ExecOptions,
    ) -> Result<CurrentState, ProviderError> {
        let path = shell_words::quote(want.path).into_owned();
        let stat = session
            .exec(
                &format!(
                    "stat -c '%F|%U|%G|%a' {path} 2>/dev/null || stat -f '%HT|%Su|%Sg|%Lp' {path}"
                ),
                opts,
            )
            .await?;
        if !stat.success() {
            return Ok(CurrentState::absent());
        }

        let line = stat.stdout.trim();
        let mut fields = line.split('|');
        let file_kind = fields.next().unwrap_or("").to_lowercase();
        let owner = fields.next().unwrap_or("").to_string();
        let group = fields.next().unwrap_or("").to_string();
        let mode = fields.next().unwrap_or("").to_string();
        let is_dir = file_kind.contains("directory");

        let mut state = CurrentState::present()
            .with_prop(PROP_KIND, if is_dir { "directory" } else { "file" })
            .with_prop(PROP_OWNER, owner)
            .with_prop(PROP_GROUP, group)
            .with_prop(PROP_MODE, mode);

        if want.content.is_some() && !is_dir {
            let hash = session
                .exec(
                    &format!("(sha256sum {path} 2>/dev/null || shasum -a 256 {path}) | awk '{{print $1}}'"),
                    opts,
                )
                .await?;
            if hash.success() {
                state = state.with_prop(PROP_SHA256, hash.stdout.trim());
            }
        }

        Ok(state)
    }

    async fn run_companion(
        &self,
        session: &dyn Session,
        opts: &ExecOptions,
        cmd: String,
    ) -> Result<(), ProviderError> {
        let out = session.exec(&cmd, opts).await?;
        if !out.success() {
            return Err(ProviderError::ApplyFailed(format!(
                "{cmd}: {}",
                out.combined()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for UnixFsProvider {
    async fn check(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError> {
        let want = desired(kind);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        self.observe(&want, session, &opts).await
    }

    fn diff(&self, kind: &ResourceKind, current: &CurrentState) -> Diff {
        let want = desired(kind);
        let mut diff = Diff::unchanged();
        let noun = if want.directory { "directory" } else { "file" };

        match want.state {
            Ensure::Absent => {
                if current.exists {
                    diff.record(PROP_STATE, "present", "absent", format!("remove {}", want.path));
                }
                return diff;
            }
            Ensure::Present => {}
        }

        if !current.exists {
            diff.record(
                PROP_STATE,
                "absent",
                "present",
                format!("create {noun} {}", want.path),
            );
            if let Some(content) = want.content {
                diff.after
                    .insert(PROP_SHA256.to_string(), sha256_hex(content.as_bytes()));
            }
            if let Some(mode) = want.mode {
                diff.after.insert(PROP_MODE.to_string(), mode.to_string());
            }
            if let Some(owner) = want.owner {
                diff.after.insert(PROP_OWNER.to_string(), owner.to_string());
            }
            if let Some(group) = want.group {
                diff.after.insert(PROP_GROUP.to_string(), group.to_string());
            }
            return diff;
        }

        let current_kind = current.prop(PROP_KIND).unwrap_or("file");
        let wrong_kind = (current_kind == "directory") != want.directory;
        if wrong_kind {
            diff.record(
                PROP_KIND,
                current_kind,
                noun,
                format!("replace {} with {noun}", want.path),
            );
            return diff;
        }

        if let Some(content) = want.content {
            let desired_hash = sha256_hex(content.as_bytes());
            if current.prop(PROP_SHA256) != Some(desired_hash.as_str()) {
                diff.record(
                    PROP_SHA256,
                    current.prop(PROP_SHA256).unwrap_or(""),
                    desired_hash,
                    format!("update content of {}", want.path),
                );
            }
        }
        if let Some(mode) = want.mode {
            let current_mode = current.prop(PROP_MODE).unwrap_or("");
            if !mode_eq(mode, current_mode) {
                diff.record(
                    PROP_MODE,
                    current_mode,
                    mode,
                    format!("chmod {mode} {}", want.path),
                );
            }
        }
        if let Some(owner) = want.owner {
            if current.prop(PROP_OWNER) != Some(owner) {
                diff.record(
                    PROP_OWNER,
                    current.prop(PROP_OWNER).unwrap_or(""),
                    owner,
                    format!("chown {owner} {}", want.path),
                );
            }
        }
        if let Some(group) = want.group {
            if current.prop(PROP_GROUP) != Some(group) {
                diff.record(
                    PROP_GROUP,
                    current.prop(PROP_GROUP).unwrap_or(""),
                    group,
                    format!("chgrp {group} {}", want.path),
                );
            }
        }

        diff
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError> {
        let want = desired(kind);
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        let current = self.observe(&want, session, &opts).await?;
        let pending = self.diff(kind, &current);
        if !pending.changed {
            return Ok(ResourceResult::ok(kind.describe()));
        }

        let path = shell_words::quote(want.path).into_owned();

        if want.state == Ensure::Absent {
            session.rm(want.path).await?;
            return Ok(ResourceResult::applied(kind.describe()));
        }

        if pending.after.get(PROP_KIND).is_some() {
            // Wrong node type in the way; replace it wholesale.
            session.rm(want.path).await?;
        }

        let creating = !current.exists || pending.after.contains_key(PROP_KIND);
        if want.directory {
            if creating {
                session.mkdir_p(want.path).await?;
            }
        } else if creating || pending.after.contains_key(PROP_SHA256) {
            if let Some(parent) = std::path::Path::new(want.path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
            {
                session.mkdir_p(&parent.to_string_lossy()).await?;
            }
            match want.content {
                Some(content) => {
                    let encoded =
                        base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
                    self.run_companion(
                        session,
                        &opts,
                        format!("printf '%s' {encoded} | base64 -d > {path}"),
                    )
                    .await?;
                }
                None => {
                    self.run_companion(session, &opts, format!("touch {path}")).await?;
                }
            }
        }

        if let Some(mode) = pending.after.get(PROP_MODE) {
            self.run_companion(session, &opts, format!("chmod {mode} {path}"))
                .await?;
        }
        if let Some(owner) = pending.after.get(PROP_OWNER) {
            self.run_companion(session, &opts, format!("chown {owner} {path}"))
                .await?;
        }
        if let Some(group) = pending.after.get(PROP_GROUP) {
            self.run_companion(session, &opts, format!("chgrp {group} {path}"))
                .await?;
        }

        Ok(ResourceResult::applied(kind.describe()))
    }
}
