//! File-transfer and template steps.
//!
//! Uploads are byte-faithful; ownership and mode changes ride along as
//! companion shell ops whose failures surface individually. Templates are
//! rendered locally with tera against facts, config vars, and step vars,
//! then uploaded like any other file.

use std::path::Path;

use indexmap::IndexMap;
use tracing::debug;

use crate::config::{Download, TemplateStep, Upload};
use crate::error::StepError;
use crate::facts::Facts;
use crate::ssh::{ExecOptions, Session};

/// Uploads a local file, then applies mode/owner/group if requested.
pub async fn upload(session: &dyn Session, step: &Upload) -> Result<String, StepError> {
    let data = tokio::fs::read(&step.src).await?;
    ensure_remote_parent(session, &step.dest).await?;
    session.upload(&data, &step.dest).await?;
    apply_attrs(
        session,
        &step.dest,
        step.mode.as_deref(),
        step.owner.as_deref(),
        step.group.as_deref(),
    )
    .await?;
    debug!(src = %step.src.display(), dest = %step.dest, bytes = data.len(), "Uploaded");
    Ok(format!("uploaded {} bytes to {}", data.len(), step.dest))
}

/// Downloads a remote file to a local path.
pub async fn download(session: &dyn Session, step: &Download) -> Result<String, StepError> {
    let data = session.download(&step.src).await?;
    if let Some(parent) = step.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&step.dest, &data).await?;
    Ok(format!(
        "downloaded {} bytes to {}",
        data.len(),
        step.dest.display()
    ))
}

/// Renders a template locally and uploads the result.
pub async fn template(
    session: &dyn Session,
    step: &TemplateStep,
    facts: &Facts,
    config_vars: &IndexMap<String, serde_json::Value>,
    host_label: &str,
) -> Result<String, StepError> {
    let raw = tokio::fs::read_to_string(&step.src).await?;

    let mut context = tera::Context::new();
    context.insert("facts", &facts.to_json());
    context.insert("host", host_label);
    for (key, value) in config_vars {
        context.insert(key, value);
    }
    for (key, value) in &step.vars {
        context.insert(key, value);
    }

    let rendered = tera::Tera::one_off(&raw, &context, false)?;
    ensure_remote_parent(session, &step.dest).await?;
    session.upload(rendered.as_bytes(), &step.dest).await?;
    apply_attrs(session, &step.dest, step.mode.as_deref(), None, None).await?;

    Ok(format!(
        "rendered {} to {}",
        step.src.display(),
        step.dest
    ))
}

async fn ensure_remote_parent(session: &dyn Session, dest: &str) -> Result<(), StepError> {
    if let Some(parent) = Path::new(dest).parent().filter(|p| !p.as_os_str().is_empty()) {
        session.mkdir_p(&parent.to_string_lossy()).await?;
    }
    Ok(())
}

/// Companion ownership/mode ops; each failure surfaces on its own.
async fn apply_attrs(
    session: &dyn Session,
    dest: &str,
    mode: Option<&str>,
    owner: Option<&str>,
    group: Option<&str>,
) -> Result<(), StepError> {
    let quoted = shell_words::quote(dest).into_owned();
    let opts = ExecOptions::default();

    let mut ops = Vec::new();
    if let Some(mode) = mode {
        ops.push(format!("chmod {mode} {quoted}"));
    }
    if let Some(owner) = owner {
        ops.push(format!("chown {owner} {quoted}"));
    }
    if let Some(group) = group {
        ops.push(format!("chgrp {group} {quoted}"));
    }

    for op in ops {
        let out = session.exec(&op, &opts).await?;
        if !out.success() {
            return Err(StepError::Session(crate::error::SessionError::Exec(
                format!("{op}: {}", out.combined()),
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::MockSession;
    use crate::ssh::LocalSession;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_upload_round_trip_local() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.conf");
        let dest = dir.path().join("deployed/app.conf");
        let payload: Vec<u8> = (0u16..300).map(|b| (b % 256) as u8).collect();
        std::fs::write(&src, &payload).unwrap();

        let session = LocalSession::new();
        let step = Upload {
            src,
            dest: dest.to_string_lossy().into_owned(),
            mode: None,
            owner: None,
            group: None,
        };
        upload(&session, &step).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_download_round_trip_local() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote.bin");
        std::fs::write(&remote, b"remote bytes").unwrap();

        let session = LocalSession::new();
        let step = Download {
            src: remote.to_string_lossy().into_owned(),
            dest: dir.path().join("fetched/remote.bin"),
        };
        download(&session, &step).await.unwrap();
        assert_eq!(std::fs::read(&step.dest).unwrap(), b"remote bytes");
    }

    #[tokio::test]
    async fn test_upload_companion_failure_surfaces() {
        let session = MockSession::new();
        session.on("chown nobody", 1, "");

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("f");
        std::fs::write(&src, b"x").unwrap();

        let step = Upload {
            src,
            dest: "/etc/f".into(),
            mode: None,
            owner: Some("nobody".into()),
            group: None,
        };
        let err = upload(&session, &step).await.unwrap_err();
        assert!(err.to_string().contains("chown nobody"));
        // The payload itself still landed before the companion op failed.
        assert_eq!(session.file("/etc/f").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_template_renders_facts_and_vars() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("motd.tmpl");
        std::fs::write(
            &src,
            "host={{ host }} family={{ facts.os_family }} port={{ app_port }}\n",
        )
        .unwrap();

        let session = MockSession::new();
        let mut vars = IndexMap::new();
        vars.insert("app_port".to_string(), serde_json::json!(8080));

        let step = TemplateStep {
            src,
            dest: "/etc/motd".into(),
            mode: None,
            vars: IndexMap::new(),
        };
        let facts = Facts::for_os("linux", "debian");
        template(&session, &step, &facts, &vars, "web1").await.unwrap();

        let rendered = String::from_utf8(session.file("/etc/motd").unwrap()).unwrap();
        assert_eq!(rendered, "host=web1 family=debian port=8080\n");
    }

    #[tokio::test]
    async fn test_template_step_vars_override_config_vars() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("t.tmpl");
        std::fs::write(&src, "{{ env }}").unwrap();

        let session = MockSession::new();
        let mut config_vars = IndexMap::new();
        config_vars.insert("env".to_string(), serde_json::json!("staging"));
        let mut step_vars = IndexMap::new();
        step_vars.insert("env".to_string(), serde_json::json!("production"));

        let step = TemplateStep {
            src,
            dest: "/etc/env".into(),
            mode: None,
            vars: step_vars,
        };
        template(
            &session,
            &step,
            &Facts::for_os("linux", "debian"),
            &config_vars,
            "web1",
        )
        .await
        .unwrap();

        assert_eq!(session.file("/etc/env").unwrap(), b"production");
    }

    #[tokio::test]
    async fn test_missing_template_source() {
        let session = MockSession::new();
        let step = TemplateStep {
            src: PathBuf::from("/nonexistent/motd.tmpl"),
            dest: "/etc/motd".into(),
            mode: None,
            vars: IndexMap::new(),
        };
        let err = template(
            &session,
            &step,
            &Facts::for_os("linux", "debian"),
            &IndexMap::new(),
            "web1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StepError::Io(_)));
    }
}
