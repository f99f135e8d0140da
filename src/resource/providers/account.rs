//! User and group management.
//!
//! Linux hosts go through getent/useradd/groupadd; macOS hosts go through
//! dscl. Observed properties: `uid`/`gid`, `shell`, `home`, and the user's
//! supplementary `groups`.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::resource::{
    CurrentState, Diff, Ensure, ExecutionContext, GroupResource, ResourceKind, ResourceResult,
    UserResource,
};
use crate::ssh::{ExecOptions, Session};

use super::Provider;

const PROP_UID: &str = "uid";
const PROP_GID: &str = "gid";
const PROP_SHELL: &str = "shell";
const PROP_HOME: &str = "home";
const PROP_GROUPS: &str = "groups";
const PROP_STATE: &str = "state";

fn user_diff(user: &UserResource, current: &CurrentState) -> Diff {
    let mut diff = Diff::unchanged();

    match user.state {
        Ensure::Absent => {
            if current.exists {
                diff.record(PROP_STATE, "present", "absent", format!("remove user {}", user.name));
            }
            return diff;
        }
        Ensure::Present => {}
    }

    if !current.exists {
        diff.record(PROP_STATE, "absent", "present", format!("create user {}", user.name));
        return diff;
    }

    if let Some(uid) = user.uid {
        let current_uid = current.prop(PROP_UID).unwrap_or("");
        if current_uid != uid.to_string() {
            diff.record(PROP_UID, current_uid, uid.to_string(), format!("set uid of {} to {uid}", user.name));
        }
    }
    if let Some(shell) = &user.shell {
        let current_shell = current.prop(PROP_SHELL).unwrap_or("");
        if current_shell != shell {
            diff.record(
                PROP_SHELL,
                current_shell,
                shell,
                format!("set shell of {} to {shell}", user.name),
            );
        }
    }
    if let Some(home) = &user.home {
        let current_home = current.prop(PROP_HOME).unwrap_or("");
        if current_home != home {
            diff.record(
                PROP_HOME,
                current_home,
                home,
                format!("set home of {} to {home}", user.name),
            );
        }
    }
    if !user.groups.is_empty() {
        let current_groups: Vec<&str> = current
            .prop(PROP_GROUPS)
            .map(|g| g.split_whitespace().collect())
            .unwrap_or_default();
        let missing: Vec<&str> = user
            .groups
            .iter()
            .map(String::as_str)
            .filter(|g| !current_groups.contains(g))
            .collect();
        if !missing.is_empty() {
            diff.record(
                PROP_GROUPS,
                current_groups.join(" "),
                missing.join(" "),
                format!("add {} to groups {}", user.name, missing.join(",")),
            );
        }
    }

    diff
}

fn group_diff(group: &GroupResource, current: &CurrentState) -> Diff {
    let mut diff = Diff::unchanged();
    match group.state {
        Ensure::Absent => {
            if current.exists {
                diff.record(PROP_STATE, "present", "absent", format!("remove group {}", group.name));
            }
        }
        Ensure::Present => {
            if !current.exists {
                diff.record(PROP_STATE, "absent", "present", format!("create group {}", group.name));
            } else if let Some(gid) = group.gid {
                let current_gid = current.prop(PROP_GID).unwrap_or("");
                if current_gid != gid.to_string() {
                    diff.record(
                        PROP_GID,
                        current_gid,
                        gid.to_string(),
                        format!("set gid of {} to {gid}", group.name),
                    );
                }
            }
        }
    }
    diff
}

async fn run_checked(
    session: &dyn Session,
    opts: &ExecOptions,
    cmd: String,
) -> Result<(), ProviderError> {
    let out = session.exec(&cmd, opts).await?;
    if !out.success() {
        return Err(ProviderError::ApplyFailed(format!("{cmd}: {}", out.combined())));
    }
    Ok(())
}

/// getent/shadow-utils provider for Linux.
pub struct LinuxAccountProvider;

impl LinuxAccountProvider {
    async fn check_user(
        &self,
        user: &UserResource,
        session: &dyn Session,
        opts: &ExecOptions,
    ) -> Result<CurrentState, ProviderError> {
        let name = shell_words::quote(&user.name).into_owned();
        let out = session.exec(&format!("getent passwd {name}"), opts).await?;
        if !out.success() {
            return Ok(CurrentState::absent());
        }

        // name:x:uid:gid:gecos:home:shell
        let line = out.stdout.trim();
        let fields: Vec<&str> = line.split(':').collect();
        let mut state = CurrentState::present();
        if let Some(uid) = fields.get(2) {
            state = state.with_prop(PROP_UID, *uid);
        }
        if let Some(home) = fields.get(5) {
            state = state.with_prop(PROP_HOME, *home);
        }
        if let Some(shell) = fields.get(6) {
            state = state.with_prop(PROP_SHELL, *shell);
        }

        if !user.groups.is_empty() {
            let groups = session.exec(&format!("id -nG {name}"), opts).await?;
            if groups.success() {
                state = state.with_prop(PROP_GROUPS, groups.stdout.trim());
            }
        }
        Ok(state)
    }

    async fn check_group(
        &self,
        group: &GroupResource,
        session: &dyn Session,
        opts: &ExecOptions,
    ) -> Result<CurrentState, ProviderError> {
        let name = shell_words::quote(&group.name).into_owned();
        let out = session.exec(&format!("getent group {name}"), opts).await?;
        if !out.success() {
            return Ok(CurrentState::absent());
        }
        let gid = out.stdout.trim().split(':').nth(2).unwrap_or("").to_string();
        Ok(CurrentState::present().with_prop(PROP_GID, gid))
    }
}

#[async_trait]
impl Provider for LinuxAccountProvider {
    async fn check(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError> {
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        match kind {
            ResourceKind::User(user) => self.check_user(user, session, &opts).await,
            ResourceKind::Group(group) => self.check_group(group, session, &opts).await,
            _ => unreachable!("registry routes only user and group resources here"),
        }
    }

    fn diff(&self, kind: &ResourceKind, current: &CurrentState) -> Diff {
        match kind {
            ResourceKind::User(user) => user_diff(user, current),
            ResourceKind::Group(group) => group_diff(group, current),
            _ => unreachable!(),
        }
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError> {
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        let current = self.check(kind, session, ctx).await?;
        let pending = self.diff(kind, &current);
        if !pending.changed {
            return Ok(ResourceResult::ok(kind.describe()));
        }

        match kind {
            ResourceKind::User(user) => {
                let name = shell_words::quote(&user.name).into_owned();
                if user.state == Ensure::Absent {
                    run_checked(session, &opts, format!("userdel -r {name}")).await?;
                } else if !current.exists {
                    let mut cmd = String::from("useradd -m");
                    if let Some(uid) = user.uid {
                        cmd.push_str(&format!(" -u {uid}"));
                    }
                    if let Some(shell) = &user.shell {
                        cmd.push_str(&format!(" -s {}", shell_words::quote(shell)));
                    }
                    if let Some(home) = &user.home {
                        cmd.push_str(&format!(" -d {}", shell_words::quote(home)));
                    }
                    if !user.groups.is_empty() {
                        cmd.push_str(&format!(" -G {}", user.groups.join(",")));
                    }
                    cmd.push_str(&format!(" {name}"));
                    run_checked(session, &opts, cmd).await?;
                } else {
                    if let Some(uid) = user.uid.filter(|_| pending.after.contains_key(PROP_UID)) {
                        run_checked(session, &opts, format!("usermod -u {uid} {name}")).await?;
                    }
                    if let Some(shell) = pending.after.get(PROP_SHELL) {
                        run_checked(
                            session,
                            &opts,
                            format!("usermod -s {} {name}", shell_words::quote(shell)),
                        )
                        .await?;
                    }
                    if let Some(home) = pending.after.get(PROP_HOME) {
                        run_checked(
                            session,
                            &opts,
                            format!("usermod -d {} -m {name}", shell_words::quote(home)),
                        )
                        .await?;
                    }
                    if let Some(missing) = pending.after.get(PROP_GROUPS) {
                        let list = missing.split_whitespace().collect::<Vec<_>>().join(",");
                        run_checked(session, &opts, format!("usermod -aG {list} {name}")).await?;
                    }
                }
            }
            ResourceKind::Group(group) => {
                let name = shell_words::quote(&group.name).into_owned();
                if group.state == Ensure::Absent {
                    run_checked(session, &opts, format!("groupdel {name}")).await?;
                } else if !current.exists {
                    let mut cmd = String::from("groupadd");
                    if let Some(gid) = group.gid {
                        cmd.push_str(&format!(" -g {gid}"));
                    }
                    cmd.push_str(&format!(" {name}"));
                    run_checked(session, &opts, cmd).await?;
                } else if let Some(gid) = group.gid {
                    run_checked(session, &opts, format!("groupmod -g {gid} {name}")).await?;
                }
            }
            _ => unreachable!(),
        }

        Ok(ResourceResult::applied(kind.describe()))
    }
}

/// dscl provider for macOS.
pub struct DarwinAccountProvider;

impl DarwinAccountProvider {
    async fn read_attr(
        session: &dyn Session,
        opts: &ExecOptions,
        path: &str,
        attr: &str,
    ) -> Result<Option<String>, ProviderError> {
        let out = session
            .exec(&format!("dscl . -read {path} {attr}"), opts)
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out
            .stdout
            .split_once(':')
            .map(|(_, value)| value.trim().to_string()))
    }
}

#[async_trait]
impl Provider for DarwinAccountProvider {
    async fn check(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<CurrentState, ProviderError> {
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        match kind {
            ResourceKind::User(user) => {
                let path = format!("/Users/{}", user.name);
                let Some(uid) = Self::read_attr(session, &opts, &path, "UniqueID").await? else {
                    return Ok(CurrentState::absent());
                };
                let mut state = CurrentState::present().with_prop(PROP_UID, uid);
                if let Some(shell) = Self::read_attr(session, &opts, &path, "UserShell").await? {
                    state = state.with_prop(PROP_SHELL, shell);
                }
                if let Some(home) =
                    Self::read_attr(session, &opts, &path, "NFSHomeDirectory").await?
                {
                    state = state.with_prop(PROP_HOME, home);
                }
                if !user.groups.is_empty() {
                    let groups = session
                        .exec(&format!("id -nG {}", shell_words::quote(&user.name)), &opts)
                        .await?;
                    if groups.success() {
                        state = state.with_prop(PROP_GROUPS, groups.stdout.trim());
                    }
                }
                Ok(state)
            }
            ResourceKind::Group(group) => {
                let path = format!("/Groups/{}", group.name);
                match Self::read_attr(session, &opts, &path, "PrimaryGroupID").await? {
                    Some(gid) => Ok(CurrentState::present().with_prop(PROP_GID, gid)),
                    None => Ok(CurrentState::absent()),
                }
            }
            _ => unreachable!("registry routes only user and group resources here"),
        }
    }

    fn diff(&self, kind: &ResourceKind, current: &CurrentState) -> Diff {
        match kind {
            ResourceKind::User(user) => user_diff(user, current),
            ResourceKind::Group(group) => group_diff(group, current),
            _ => unreachable!(),
        }
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        session: &dyn Session,
        ctx: &ExecutionContext,
    ) -> Result<ResourceResult, ProviderError> {
        let opts = ExecOptions::default().with_cancel(ctx.cancel.clone());
        let current = self.check(kind, session, ctx).await?;
        let pending = self.diff(kind, &current);
        if !pending.changed {
            return Ok(ResourceResult::ok(kind.describe()));
        }

        match kind {
            ResourceKind::User(user) => {
                let path = format!("/Users/{}", user.name);
                if user.state == Ensure::Absent {
                    run_checked(session, &opts, format!("dscl . -delete {path}")).await?;
                } else {
                    if !current.exists {
                        run_checked(session, &opts, format!("dscl . -create {path}")).await?;
                    }
                    if let Some(uid) = user.uid {
                        run_checked(
                            session,
                            &opts,
                            format!("dscl . -create {path} UniqueID {uid}"),
                        )
                        .await?;
                    }
                    if let Some(shell) = &user.shell {
                        run_checked(
                            session,
                            &opts,
                            format!("dscl . -create {path} UserShell {}", shell_words::quote(shell)),
                        )
                        .await?;
                    }
                    if let Some(home) = &user.home {
                        run_checked(
                            session,
                            &opts,
                            format!(
                                "dscl . -create {path} NFSHomeDirectory {}",
                                shell_words::quote(home)
                            ),
                        )
                        .await?;
                    }
                    for group in &user.groups {
                        run_checked(
                            session,
                            &opts,
                            format!(
                                "dseditgroup -o edit -a {} -t user {}",
                                shell_words::quote(&user.name),
                                shell_words::quote(group)
                            ),
                        )
                        .await?;
                    }
                }
            }
            ResourceKind::Group(group) => {
                let path = format!("/Groups/{}", group.name);
                if group.state == Ensure::Absent {
                    run_checked(session, &opts, format!("dscl . -delete {path}")).await?;
                } else {
                    if !current.exists {
                        run_checked(session, &opts, format!("dscl . -create {path}")).await?;
                    }
                    if let Some(gid) = group.gid {
                        run_checked(
                            session,
                            &opts,
                            format!("dscl . -create {path} PrimaryGroupID {gid}"),
                        )
                        .await?;
                    }
                }
            }
            _ => unreachable!(),
        }

        Ok(ResourceResult::applied(kind.describe()))
    }
}
