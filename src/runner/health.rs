//! Health-check polling for wait-for steps and rolling batches.
//!
//! Three probe types: HTTP (expected status, 2xx if unset), TCP connect,
//! and a shell command run on the target host. Each is polled on the
//! configured interval until it passes or the overall timeout expires.

use std::time::Duration;

use tracing::debug;

use crate::common::{CancellationToken, Stopwatch};
use crate::config::{HealthCheck, Host, WaitFor};
use crate::error::StepError;
use crate::ssh::{ExecOptions, Session};

/// Polls one health check until success or timeout.
///
/// `host` supplies the default address for TCP probes; command probes run
/// over `session` so they observe the target host, not the controller.
pub async fn wait_for(
    check: &WaitFor,
    host: Option<&Host>,
    session: &dyn Session,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    let stopwatch = Stopwatch::start();
    let mut last_failure = String::from("not attempted");

    loop {
        if cancel.is_cancelled() {
            return Err(StepError::Health("cancelled".into()));
        }

        match probe(&check.check, host, session, cancel).await {
            Ok(()) => {
                debug!(check = %check.describe(), elapsed_ms = stopwatch.elapsed_ms(), "Health check passed");
                return Ok(());
            }
            Err(reason) => last_failure = reason,
        }

        if stopwatch.elapsed() + check.interval > check.timeout {
            return Err(StepError::Health(format!(
                "{} did not pass within {:?}: {last_failure}",
                check.describe(),
                check.timeout
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(StepError::Health("cancelled".into())),
            _ = tokio::time::sleep(check.interval) => {}
        }
    }
}

async fn probe(
    check: &HealthCheck,
    host: Option<&Host>,
    session: &dyn Session,
    cancel: &CancellationToken,
) -> Result<(), String> {
    match check {
        HealthCheck::Http { url, status } => probe_http(url, *status).await,
        HealthCheck::Tcp { host: addr, port } => {
            let target = addr
                .clone()
                .or_else(|| host.map(|h| h.hostname.clone()))
                .unwrap_or_else(|| "127.0.0.1".to_string());
            probe_tcp(&target, *port).await
        }
        HealthCheck::Cmd { cmd } => {
            let opts = ExecOptions::default()
                .with_timeout(Duration::from_secs(30))
                .with_cancel(cancel.clone());
            match session.exec(cmd, &opts).await {
                Ok(out) if out.success() => Ok(()),
                Ok(out) => Err(format!("command exited {}", out.exit_code)),
                Err(err) => Err(err.to_string()),
            }
        }
    }
}

async fn probe_http(url: &str, expected: Option<u16>) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| err.to_string())?;
    let response = client.get(url).send().await.map_err(|err| err.to_string())?;
    let status = response.status().as_u16();
    let passed = match expected {
        Some(expected) => status == expected,
        None => (200..300).contains(&status),
    };
    if passed {
        Ok(())
    } else {
        Err(format!("status {status}"))
    }
}

async fn probe_tcp(host: &str, port: u16) -> Result<(), String> {
    match tokio::time::timeout(
        Duration::from_secs(5),
        tokio::net::TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("connect timed out".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::MockSession;

    fn cmd_check(cmd: &str, interval_ms: u64, timeout_ms: u64) -> WaitFor {
        WaitFor {
            check: HealthCheck::Cmd { cmd: cmd.into() },
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_cmd_check_passes_immediately() {
        let session = MockSession::new();
        let check = cmd_check("service-ready", 10, 200);
        wait_for(&check, None, &session, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cmd_check_times_out() {
        let session = MockSession::new();
        session.on("service-ready", 1, "");
        let check = cmd_check("service-ready", 10, 80);
        let err = wait_for(&check, None, &session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not pass"));
        // Polled more than once.
        assert!(session.calls().len() > 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let session = MockSession::new();
        session.on("service-ready", 1, "");
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stopper.cancel();
        });

        let check = cmd_check("service-ready", 10, 10_000);
        let err = wait_for(&check, None, &session, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Keep the listener alive while probing.
        let _guard = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let session = MockSession::new();
        let check = WaitFor {
            check: HealthCheck::Tcp {
                host: Some("127.0.0.1".into()),
                port,
            },
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(500),
        };
        wait_for(&check, None, &session, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe_unreachable_times_out() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = MockSession::new();
        let check = WaitFor {
            check: HealthCheck::Tcp {
                host: Some("127.0.0.1".into()),
                port,
            },
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
        };
        assert!(wait_for(&check, None, &session, &CancellationToken::new())
            .await
            .is_err());
    }
}
