//! russh-backed SSH sessions.
//!
//! `SshConnector` dials hosts (applying SSH config overrides, the
//! authentication candidate order, and optional single-hop proxy jump)
//! and hands out `SshSession` values implementing the [`Session`]
//! contract. Auth resolution is performed once per host and cached for
//! the connector's lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use russh_keys::key;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{Defaults, Host};
use crate::error::SessionError;
use crate::pool::Connector;

use super::auth::{self, AuthCandidate, AuthOptions};
use super::ssh_config::{HostOverride, SshConfigMap};
use super::{
    is_sudo_password_refusal, shell_command, sudo_wrap, ExecOptions, ExecOutput, FileStat, Session,
};

/// Accepts or verifies server keys depending on strict host key checking.
struct ClientHandler {
    hostname: String,
    port: u16,
    strict: bool,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.strict {
            return Ok(true);
        }
        match russh_keys::check_known_hosts(&self.hostname, self.port, server_public_key) {
            Ok(known) => Ok(known),
            Err(err) => {
                warn!(host = %self.hostname, error = %err, "known_hosts check failed");
                Ok(false)
            }
        }
    }
}

/// Endpoint derived from a host, its SSH config override, and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    hostname: String,
    port: u16,
    user: String,
    connect_timeout: Duration,
    strict: bool,
    proxy_jump: Option<String>,
}

fn effective_endpoint(host: &Host, overrides: &HostOverride, defaults: &Defaults) -> Endpoint {
    let user = overrides
        .user
        .clone()
        .or_else(|| host.user.clone())
        .or_else(|| defaults.default_user.clone())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string());

    Endpoint {
        hostname: overrides
            .hostname
            .clone()
            .unwrap_or_else(|| host.hostname.clone()),
        port: overrides.port.unwrap_or(host.port),
        user,
        connect_timeout: overrides.connect_timeout.unwrap_or(defaults.connect_timeout),
        strict: overrides.strict_host_key_checking.unwrap_or(false),
        proxy_jump: overrides.proxy_jump.clone(),
    }
}

/// Dials hosts and produces live sessions.
pub struct SshConnector {
    defaults: Defaults,
    ssh_config: SshConfigMap,
    auth: AuthOptions,
    /// Per-host resolved auth candidates, cached for the connector's life.
    candidate_cache: Mutex<HashMap<String, Vec<AuthCandidate>>>,
}

impl SshConnector {
    pub fn new(defaults: Defaults, ssh_config: SshConfigMap, auth: AuthOptions) -> Self {
        Self {
            defaults,
            ssh_config,
            auth,
            candidate_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn candidates_for(&self, host: &Host, overrides: &HostOverride) -> Vec<AuthCandidate> {
        let mut cache = self.candidate_cache.lock().await;
        if let Some(cached) = cache.get(&host.name) {
            return cached.clone();
        }
        let candidates =
            auth::resolve_candidates(&self.auth, overrides.identity_file.as_deref());
        cache.insert(host.name.clone(), candidates.clone());
        candidates
    }

    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        })
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        host: &Host,
        endpoint: &Endpoint,
        candidates: &[AuthCandidate],
    ) -> Result<(), SessionError> {
        if candidates.is_empty() {
            return Err(SessionError::NoAuthMethod {
                host: host.name.clone(),
            });
        }

        for candidate in candidates {
            let authed = match candidate {
                AuthCandidate::IdentityFile(path) => {
                    let keypair = match auth::load_key(path, self.auth.passphrase.as_deref()) {
                        Ok(keypair) => keypair,
                        Err(SessionError::KeyPermissions(path)) => {
                            return Err(SessionError::KeyPermissions(path))
                        }
                        Err(err) => {
                            debug!(key = %path.display(), error = %err, "Skipping unusable key");
                            continue;
                        }
                    };
                    handle
                        .authenticate_publickey(&endpoint.user, Arc::new(keypair))
                        .await
                        .unwrap_or(false)
                }
                AuthCandidate::Agent => self
                    .authenticate_agent(handle, &endpoint.user)
                    .await
                    .unwrap_or(false),
                AuthCandidate::Password(password) => handle
                    .authenticate_password(&endpoint.user, password)
                    .await
                    .unwrap_or(false),
            };
            if authed {
                return Ok(());
            }
        }

        Err(SessionError::AuthFailed {
            host: host.name.clone(),
        })
    }

    async fn authenticate_agent(
        &self,
        handle: &mut Handle<ClientHandler>,
        user: &str,
    ) -> Result<bool, SessionError> {
        let mut agent = russh_keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|err| SessionError::Exec(format!("ssh-agent unavailable: {err}")))?;
        let identities = agent
            .request_identities()
            .await
            .map_err(|err| SessionError::Exec(format!("ssh-agent identities: {err}")))?;

        for identity in identities {
            let (returned, result) = handle.authenticate_future(user, identity, agent).await;
            agent = returned;
            if result.unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Dials `endpoint` directly, or through a single proxy-jump hop.
    async fn dial(
        &self,
        host: &Host,
        endpoint: &Endpoint,
    ) -> Result<Handle<ClientHandler>, SessionError> {
        let handler = ClientHandler {
            hostname: endpoint.hostname.clone(),
            port: endpoint.port,
            strict: endpoint.strict,
        };
        let config = Self::client_config();

        let connect = async {
            match &endpoint.proxy_jump {
                None => client::connect(
                    config,
                    (endpoint.hostname.as_str(), endpoint.port),
                    handler,
                )
                .await
                .map_err(|err| SessionError::ConnectionFailed {
                    host: host.name.clone(),
                    reason: err.to_string(),
                }),
                Some(jump_spec) => self.dial_via_jump(host, endpoint, jump_spec, handler).await,
            }
        };

        tokio::time::timeout(endpoint.connect_timeout, connect)
            .await
            .map_err(|_| SessionError::ConnectionFailed {
                host: host.name.clone(),
                reason: format!("connect timed out after {:?}", endpoint.connect_timeout),
            })?
    }

    async fn dial_via_jump(
        &self,
        host: &Host,
        endpoint: &Endpoint,
        jump_spec: &str,
        handler: ClientHandler,
    ) -> Result<Handle<ClientHandler>, SessionError> {
        let jump_host = Host::parse(format!("jump:{jump_spec}"), jump_spec).map_err(|_| {
            SessionError::ConnectionFailed {
                host: host.name.clone(),
                reason: format!("invalid proxy_jump spec '{jump_spec}'"),
            }
        })?;

        // One hop only; the jump host's own proxy_jump is not followed.
        let jump_overrides = self.ssh_config.resolve(&jump_host.name);
        let mut jump_endpoint = effective_endpoint(&jump_host, &jump_overrides, &self.defaults);
        jump_endpoint.proxy_jump = None;

        let jump_handler = ClientHandler {
            hostname: jump_endpoint.hostname.clone(),
            port: jump_endpoint.port,
            strict: jump_endpoint.strict,
        };
        let mut jump_handle = client::connect(
            Self::client_config(),
            (jump_endpoint.hostname.as_str(), jump_endpoint.port),
            jump_handler,
        )
        .await
        .map_err(|err| SessionError::ConnectionFailed {
            host: host.name.clone(),
            reason: format!("proxy jump dial failed: {err}"),
        })?;

        let jump_candidates = self.candidates_for(&jump_host, &jump_overrides).await;
        self.authenticate(&mut jump_handle, &jump_host, &jump_endpoint, &jump_candidates)
            .await?;

        let channel = jump_handle
            .channel_open_direct_tcpip(
                endpoint.hostname.clone(),
                endpoint.port as u32,
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|err| SessionError::ConnectionFailed {
                host: host.name.clone(),
                reason: format!("proxy jump channel failed: {err}"),
            })?;

        client::connect_stream(Self::client_config(), channel.into_stream(), handler)
            .await
            .map_err(|err| SessionError::ConnectionFailed {
                host: host.name.clone(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, SessionError> {
        let overrides = self.ssh_config.resolve(&host.name);
        let endpoint = effective_endpoint(host, &overrides, &self.defaults);
        debug!(
            host = %host.name,
            address = %endpoint.hostname,
            port = endpoint.port,
            user = %endpoint.user,
            "Dialing"
        );

        let mut handle = self.dial(host, &endpoint).await?;
        let candidates = self.candidates_for(host, &overrides).await;
        self.authenticate(&mut handle, host, &endpoint, &candidates)
            .await?;

        Ok(Box::new(SshSession {
            host: host.name.clone(),
            handle: Mutex::new(handle),
        }))
    }
}

/// A live authenticated SSH session.
pub struct SshSession {
    host: String,
    handle: Mutex<Handle<ClientHandler>>,
}

impl SshSession {
    async fn open_channel(&self) -> Result<russh::Channel<client::Msg>, SessionError> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_session()
            .await
            .map_err(|err| SessionError::ConnectionLost(err.to_string()))
    }

    /// Runs a command over a fresh channel, optionally streaming stdout.
    async fn run(
        &self,
        line: String,
        opts: &ExecOptions,
        mut on_chunk: Option<&mut (dyn for<'c> FnMut(&'c [u8]) + Send)>,
    ) -> Result<ExecOutput, SessionError> {
        let mut channel = self.open_channel().await?;

        let work = async {
            channel
                .exec(true, line.as_str())
                .await
                .map_err(|err| SessionError::ConnectionLost(err.to_string()))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        if let Some(cb) = on_chunk.as_deref_mut() {
                            cb(data);
                        }
                        stdout.extend_from_slice(data);
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status as i32);
                    }
                    _ => {}
                }
            }

            Ok(ExecOutput {
                exit_code: exit_code.unwrap_or(-1),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };

        let result = tokio::select! {
            _ = opts.cancel.cancelled() => Err(SessionError::Cancelled),
            result = async {
                match opts.timeout {
                    Some(limit) => tokio::time::timeout(limit, work)
                        .await
                        .map_err(|_| SessionError::Timeout)?,
                    None => work.await,
                }
            } => result,
        };

        result
    }

    async fn sftp(&self) -> Result<russh_sftp::client::SftpSession, SessionError> {
        let mut channel = self.open_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|err| SessionError::ConnectionLost(err.to_string()))?;
        russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|err| SessionError::Sftp(err.to_string()))
    }
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&self, cmd: &str, opts: &ExecOptions) -> Result<ExecOutput, SessionError> {
        self.run(shell_command(cmd, opts), opts, None).await
    }

    async fn exec_sudo(
        &self,
        cmd: &str,
        user: Option<&str>,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, SessionError> {
        let wrapped = sudo_wrap(&shell_command(cmd, opts), user)?;
        let output = self.run(wrapped, opts, None).await?;
        if is_sudo_password_refusal(&output) {
            return Err(SessionError::SudoPasswordRequired);
        }
        Ok(output)
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        opts: &ExecOptions,
        on_chunk: &mut (dyn for<'c> FnMut(&'c [u8]) + Send),
    ) -> Result<ExecOutput, SessionError> {
        self.run(shell_command(cmd, opts), opts, Some(on_chunk)).await
    }

    async fn upload(&self, data: &[u8], remote: &str) -> Result<(), SessionError> {
        let sftp = self.sftp().await?;
        let mut file = sftp
            .create(remote)
            .await
            .map_err(|err| SessionError::Sftp(err.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|err| SessionError::Sftp(err.to_string()))?;
        file.shutdown()
            .await
            .map_err(|err| SessionError::Sftp(err.to_string()))?;
        Ok(())
    }

    async fn download(&self, remote: &str) -> Result<Vec<u8>, SessionError> {
        let sftp = self.sftp().await?;
        let mut file = sftp
            .open(remote)
            .await
            .map_err(|err| SessionError::Sftp(err.to_string()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|err| SessionError::Sftp(err.to_string()))?;
        Ok(data)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, SessionError> {
        let sftp = self.sftp().await?;
        match sftp.metadata(path).await {
            Ok(attrs) => Ok(Some(FileStat {
                size: attrs.size.unwrap_or(0),
                mode: attrs.permissions.map(|m| m & 0o7777),
                is_dir: attrs.is_dir(),
            })),
            Err(russh_sftp::client::error::Error::Status(status))
                if status.status_code == russh_sftp::protocol::StatusCode::NoSuchFile =>
            {
                Ok(None)
            }
            Err(err) => Err(SessionError::Sftp(err.to_string())),
        }
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), SessionError> {
        let out = self
            .run(
                format!("mkdir -p {}", shell_words::quote(path)),
                &ExecOptions::default(),
                None,
            )
            .await?;
        if !out.success() {
            return Err(SessionError::Sftp(format!(
                "mkdir -p {path} failed: {}",
                out.combined()
            )));
        }
        Ok(())
    }

    async fn rm(&self, path: &str) -> Result<(), SessionError> {
        let out = self
            .run(
                format!("rm -rf {}", shell_words::quote(path)),
                &ExecOptions::default(),
                None,
            )
            .await?;
        if !out.success() {
            return Err(SessionError::Sftp(format!(
                "rm {path} failed: {}",
                out.combined()
            )));
        }
        Ok(())
    }

    async fn alive(&self) -> bool {
        let handle = self.handle.lock().await;
        !handle.is_closed()
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        debug!(host = %self.host, "Dropping SSH session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(spec: &str) -> Host {
        Host::parse("h", spec).unwrap()
    }

    #[test]
    fn test_effective_endpoint_prefers_overrides() {
        let overrides = HostOverride {
            hostname: Some("10.0.0.5".into()),
            port: Some(2222),
            user: Some("ops".into()),
            ..Default::default()
        };
        let endpoint = effective_endpoint(
            &host("deploy@web1.example.com"),
            &overrides,
            &Defaults::default(),
        );
        assert_eq!(endpoint.hostname, "10.0.0.5");
        assert_eq!(endpoint.port, 2222);
        assert_eq!(endpoint.user, "ops");
    }

    #[test]
    fn test_effective_endpoint_falls_back_to_host_then_defaults() {
        let defaults = Defaults {
            default_user: Some("fallback".into()),
            ..Default::default()
        };
        let endpoint = effective_endpoint(&host("web1.example.com:2200"), &HostOverride::default(), &defaults);
        assert_eq!(endpoint.hostname, "web1.example.com");
        assert_eq!(endpoint.port, 2200);
        assert_eq!(endpoint.user, "fallback");
        assert_eq!(endpoint.connect_timeout, defaults.connect_timeout);
    }

    #[test]
    fn test_effective_endpoint_host_user_beats_default() {
        let defaults = Defaults {
            default_user: Some("fallback".into()),
            ..Default::default()
        };
        let endpoint = effective_endpoint(&host("deploy@web1"), &HostOverride::default(), &defaults);
        assert_eq!(endpoint.user, "deploy");
    }
}
