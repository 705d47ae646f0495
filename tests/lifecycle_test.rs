//! Connection lifecycle tests against a scripted transport
//!
//! All tests run on a paused clock, so multi-minute recovery schedules
//! complete instantly.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

use common::{start_client, test_config, MockConnector, OpenScript, CLIENT_ID, TARGET};
use courier::connection::{
    ConnectionState, DisconnectReason, FallbackPoller, NextCheck, PollerSignal,
    ReinitializeOptions, Remediation,
};
use courier::gateway::InitIssueKind;
use courier::transport::{Connector, SendOptions, TransportError, TransportEvent, TransportState};
use courier::{GatewayError, GatewayFacade};

const TICK: Duration = Duration::from_millis(100);

fn assert_gap(gap: Duration, floor: Duration, ceiling: Duration) {
    // timers round up to the next millisecond
    let slack = Duration::from_millis(2);
    assert!(
        gap >= floor && gap <= ceiling + slack,
        "gap {gap:?} outside [{floor:?}, {ceiling:?}]"
    );
}

/// A poller over the client's supervisor with fresh budgets, so single
/// checks can be asserted directly
fn standalone_poller(client: &courier::GatewayClient, config: courier::GatewayConfig) -> FallbackPoller {
    FallbackPoller::new(
        client.supervisor().clone(),
        Arc::new(PollerSignal::default()),
        Arc::new(config),
    )
}

// ============================================================================
// Connect
// ============================================================================

/// Concurrent connect calls share one transport session
#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let client = start_client(&connector, test_config(&dir));

    let callers: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        })
        .collect();
    sleep(TICK).await;
    assert_eq!(connector.open_count(), 1);
    assert!(client.supervisor().has_in_flight());

    assert!(connector.emit(TransportEvent::Ready));
    for caller in callers {
        caller.await.unwrap().unwrap();
    }
    assert!(client.is_ready());
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(connector.open_count(), 1);
    assert!(!client.supervisor().has_in_flight());
}

/// A reinitialize supersedes a running connect; concurrent reinitialize
/// calls share one attempt and the superseded connect follows it to READY
#[tokio::test(start_paused = true)]
async fn test_reinitialize_supersedes_connect() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let client = start_client(&connector, test_config(&dir));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    sleep(TICK).await;
    assert_eq!(connector.open_count(), 1);

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.reinitialize(ReinitializeOptions::keeping_session()).await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.reinitialize(ReinitializeOptions::default()).await })
    };
    sleep(TICK).await;
    assert_eq!(connector.open_count(), 2, "concurrent reinitialize calls share one attempt");

    assert!(connector.emit(TransportEvent::Ready));
    connecting.await.unwrap().unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert!(client.is_ready());
    assert_eq!(connector.open_count(), 2);
    assert!(connector.logout_times().is_empty(), "session was kept");
    assert!(connector.close_count() >= 1, "superseded session was closed");
}

/// A missing local dependency is fatal: no retries, waits fail at once
#[tokio::test(start_paused = true)]
async fn test_missing_dependency_is_fatal() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Fail(TransportError::MissingDependency(
        "browser executable not found".to_string(),
    )));
    let client = start_client(&connector, test_config(&dir));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, GatewayError::Fatal(_)), "got {err:?}");
    assert!(client.state().is_fatal());

    let started = Instant::now();
    let err = client
        .wait_for_ready(Some(Duration::from_secs(60)))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        err.readiness().map(|timeout| timeout.remediation),
        Some(Remediation::MissingDependency)
    );

    sleep(Duration::from_secs(30 * 60)).await;
    assert_eq!(connector.open_count(), 1);

    let issue = client.init_issue().unwrap();
    assert_eq!(issue.kind, InitIssueKind::MissingDependency);
    assert!(client.readiness_summary().fatal_error.is_some());
}

/// Failed initial connects retry with capped exponential backoff, then stop
#[tokio::test(start_paused = true)]
async fn test_hard_init_retries_then_gives_up() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Fail(TransportError::Other(
        "socket hang up".to_string(),
    )));
    let config = courier::GatewayConfig {
        fallback_delay: Duration::from_secs(3600),
        ..test_config(&dir)
    };
    let client = start_client(&connector, config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, GatewayError::ConnectFailed { .. }), "got {err:?}");

    sleep(Duration::from_secs(30)).await;
    let opens = connector.open_times();
    assert_eq!(opens.len(), 3, "initial attempt plus two retries");
    assert_gap(opens[1] - opens[0], Duration::from_secs(1), Duration::from_millis(1200));
    assert_gap(opens[2] - opens[1], Duration::from_secs(2), Duration::from_millis(2400));
    assert_eq!(client.supervisor().hard_init_attempts(), 3);

    let summary = client.readiness_summary();
    assert!(!summary.ready);
    assert!(
        summary
            .last_connect_error
            .as_deref()
            .is_some_and(|error| error.contains("exhausted")),
        "got {:?}",
        summary.last_connect_error
    );

    sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(connector.open_count(), 3);
}

/// A status probe after the auth-ready timeout promotes the client to READY
#[tokio::test(start_paused = true)]
async fn test_auth_ready_timeout_infers_readiness() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Authenticated]));
    connector.set_probe(true, TransportState::Opening);
    let client = start_client(&connector, test_config(&dir));

    let started = Instant::now();
    client.connect().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(client.is_ready());
    assert_eq!(
        client.supervisor().gate().snapshot().last_ready_source.as_deref(),
        Some("probe:is-ready")
    );
}

/// A transport whose status calls never return cannot stall a readiness
/// wait past its deadline
#[tokio::test(start_paused = true)]
async fn test_stalled_status_calls_respect_wait_deadline() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let client = start_client(&connector, test_config(&dir));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    sleep(TICK).await;
    connector.stall_status_calls(true);

    let started = Instant::now();
    let err = client
        .wait_for_ready(Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(err.is_readiness_timeout(), "got {err:?}");
    assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(5));

    let started = Instant::now();
    let err = client
        .send_message(
            TARGET,
            "stalled",
            SendOptions::default().with_ready_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
    assert!(err.is_readiness_timeout(), "got {err:?}");
    assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(5));
    assert!(connector.sent().is_empty());

    // the send worker is free for the next message
    assert!(connector.emit(TransportEvent::Ready));
    connecting.await.unwrap().unwrap();
    client
        .send_message(TARGET, "after", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(connector.sent(), vec![(TARGET.to_string(), "after".to_string())]);
}

// ============================================================================
// Disconnects and pairing
// ============================================================================

/// A transient drop reconnects after the reconnect delay
#[tokio::test(start_paused = true)]
async fn test_transient_disconnect_reconnects() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    let client = start_client(&connector, test_config(&dir));
    client.connect().await.unwrap();

    assert!(connector.emit(TransportEvent::Disconnected("connection_lost".to_string())));
    sleep(TICK).await;
    assert!(!client.is_ready());
    assert_eq!(
        client.state(),
        ConnectionState::Disconnected {
            reason: DisconnectReason::ConnectionLost
        }
    );

    sleep(Duration::from_secs(4)).await;
    assert_eq!(connector.open_count(), 1);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.open_count(), 2);
    assert!(client.is_ready());
}

/// Full pairing flow: sends fail with a pairing hint until the code is
/// scanned; a later logout does not trigger a reconnect
#[tokio::test(start_paused = true)]
async fn test_pairing_then_logout() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::PairingChallenge(
        "ABCD-EFGH".to_string(),
    )]));
    let config = test_config(&dir);
    let reconnect_delay = config.reconnect_delay;
    let client = start_client(&connector, config);

    let paired = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    sleep(TICK).await;
    assert!(matches!(client.state(), ConnectionState::AwaitingPairing { .. }));
    assert!(client.readiness_summary().last_pairing_code_at.is_some());

    let err = client
        .send_message(
            TARGET,
            "too early",
            SendOptions::default().with_ready_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
    assert!(err.is_readiness_timeout());
    assert!(err.to_string().contains("pairing required"), "got {err}");
    assert!(connector.sent().is_empty());

    // the pairing wait does not count against the connect timeout
    sleep(Duration::from_secs(60)).await;
    assert!(matches!(client.state(), ConnectionState::AwaitingPairing { .. }));

    assert!(connector.emit(TransportEvent::Authenticated));
    assert!(connector.emit(TransportEvent::Ready));
    paired.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);

    client
        .send_message(TARGET, "hello", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(connector.sent(), vec![(TARGET.to_string(), "hello".to_string())]);

    assert!(connector.emit(TransportEvent::Disconnected("LOGGED_OUT".to_string())));
    sleep(TICK).await;
    assert_eq!(
        client.state(),
        ConnectionState::Disconnected {
            reason: DisconnectReason::LoggedOut
        }
    );
    let summary = client.readiness_summary();
    assert!(summary.awaiting_pairing);
    assert_eq!(summary.last_disconnect_reason, Some(DisconnectReason::LoggedOut));

    sleep(reconnect_delay + Duration::from_secs(1)).await;
    assert_eq!(connector.open_count(), 1);
    assert_eq!(client.init_issue().unwrap().kind, InitIssueKind::AwaitingPairing);
}

/// An explicit disconnect suspends automatic recovery until the next connect
#[tokio::test(start_paused = true)]
async fn test_disconnect_suspends_recovery() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    let client = start_client(&connector, test_config(&dir));
    client.connect().await.unwrap();

    client.disconnect().await.unwrap();
    assert!(!client.is_ready());
    assert!(client.supervisor().is_suspended());
    assert_eq!(connector.close_count(), 1);

    sleep(Duration::from_secs(30 * 60)).await;
    assert_eq!(connector.open_count(), 1);

    client.connect().await.unwrap();
    assert!(client.is_ready());
    assert!(!client.supervisor().is_suspended());
    assert_eq!(connector.open_count(), 2);
}

/// An explicit disconnect reaches disconnect observers like a transport drop
#[tokio::test(start_paused = true)]
async fn test_disconnect_notifies_observers() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    let client = start_client(&connector, test_config(&dir));
    client.connect().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        client.on_disconnected(move |client_id, reason| {
            seen.lock().unwrap().push((client_id.to_string(), reason.clone()));
        });
    }

    client.disconnect().await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(CLIENT_ID.to_string(), DisconnectReason::ConnectionClosed)]
    );
    assert_eq!(
        client.readiness_summary().last_disconnect_reason,
        Some(DisconnectReason::ConnectionClosed)
    );
}

// ============================================================================
// Fallback poller
// ============================================================================

/// Repeated ambiguous probes escalate to exactly one destructive
/// reinitialize, followed by a cooldown with no further attempts
#[tokio::test(start_paused = true)]
async fn test_ambiguous_state_escalates_once() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::scripted(
        vec![OpenScript::Emit(vec![TransportEvent::Ready])],
        OpenScript::Emit(vec![]),
    );
    connector.set_probe(false, TransportState::Unknown);
    let config = courier::GatewayConfig {
        connect_timeout: Duration::from_secs(10),
        ..test_config(&dir)
    };
    let cooldown = config.fallback_cooldown;
    let client = start_client(&connector, config);
    client.connect().await.unwrap();

    let session_path = client.supervisor().session().session_path.clone();
    tokio::fs::write(session_path.join("creds.json"), b"{}")
        .await
        .unwrap();

    assert!(connector.emit(TransportEvent::StateChanged(TransportState::Closing)));
    sleep(TICK).await;
    assert!(!client.is_ready());

    sleep(Duration::from_secs(40 * 60)).await;

    let logouts = connector.logout_times();
    assert_eq!(logouts.len(), 1, "exactly one destructive reinitialize");
    let escalated_at = logouts[0];

    let opens = connector.open_times();
    let during_cooldown = opens
        .iter()
        .filter(|at| **at >= escalated_at && **at < escalated_at + cooldown)
        .count();
    assert_eq!(during_cooldown, 1, "only the reinitialize itself opens during the cooldown");
    assert!(
        opens.iter().any(|at| *at >= escalated_at + cooldown),
        "recovery resumes after the cooldown"
    );
    assert!(!client.supervisor().has_persisted_session().await);
}

/// The poller marks the client READY when a probe reports a live connection
/// that never produced a ready event
#[tokio::test(start_paused = true)]
async fn test_fallback_probe_recovers_missed_ready() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    let client = start_client(&connector, test_config(&dir));
    client.connect().await.unwrap();

    assert!(connector.emit(TransportEvent::StateChanged(TransportState::Closing)));
    sleep(TICK).await;
    assert!(!client.is_ready());

    connector.set_probe(false, TransportState::Connected);
    sleep(Duration::from_secs(61)).await;
    assert!(client.is_ready());
    assert_eq!(
        client.supervisor().gate().snapshot().last_ready_source.as_deref(),
        Some("fallback-probe")
    );
    assert_eq!(connector.open_count(), 1);
}

/// Status calls that hang are abandoned; the poller keeps its schedule and
/// recovers once the transport answers again
#[tokio::test(start_paused = true)]
async fn test_fallback_poller_survives_stalled_status_calls() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    let client = start_client(&connector, test_config(&dir));
    client.connect().await.unwrap();

    connector.stall_status_calls(true);
    assert!(connector.emit(TransportEvent::StateChanged(TransportState::Closing)));
    sleep(TICK).await;

    // first check at 60s gives up on both status calls by 70s
    sleep(Duration::from_secs(75)).await;
    assert!(!client.is_ready());
    assert_eq!(connector.open_count(), 1);
    assert!(connector.logout_times().is_empty());

    connector.stall_status_calls(false);
    connector.set_probe(false, TransportState::Connected);
    sleep(Duration::from_secs(60)).await;
    assert!(client.is_ready());
    assert_eq!(
        client.supervisor().gate().snapshot().last_ready_source.as_deref(),
        Some("fallback-probe")
    );
}

/// A connect stuck past the in-flight limit is reinitialized without
/// clearing the session; the warning threshold alone takes no action
#[tokio::test(start_paused = true)]
async fn test_stalled_connect_forces_reinitialize() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let config = courier::GatewayConfig {
        connect_timeout: Duration::from_secs(3600),
        connect_inflight_reinit: Duration::from_secs(250),
        ..test_config(&dir)
    };
    let client = start_client(&connector, config.clone());

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    sleep(TICK).await;

    // past the warning threshold only
    sleep(Duration::from_secs(130)).await;
    let poller = standalone_poller(&client, config.clone());
    assert_eq!(poller.check_once().await, NextCheck::After(config.fallback_delay));
    assert_eq!(connector.open_count(), 1);

    // the check at 240s is still under the limit; the one at 300s is not
    sleep(Duration::from_secs(115)).await;
    assert_eq!(connector.open_count(), 1);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.open_count(), 2);
    assert!(connector.logout_times().is_empty());
    assert!(!connecting.is_finished(), "the connect follows the new attempt");

    assert!(connector.emit(TransportEvent::Ready));
    connecting.await.unwrap().unwrap();
    assert!(client.is_ready());
}

/// A freshly issued pairing code holds off the forced reinitialize until the
/// grace window has passed
#[tokio::test(start_paused = true)]
async fn test_fresh_pairing_code_defers_forced_reinitialize() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::PairingChallenge(
        "ABCD-EFGH".to_string(),
    )]));
    let config = courier::GatewayConfig {
        connect_inflight_reinit: Duration::from_secs(250),
        ..test_config(&dir)
    };
    let client = start_client(&connector, config);

    let _connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    sleep(TICK).await;
    assert!(client.supervisor().awaiting_pairing());

    // the code refreshes shortly before the in-flight limit is crossed
    sleep(Duration::from_secs(280)).await;
    assert!(connector.emit(TransportEvent::PairingChallenge("IJKL-MNOP".to_string())));

    // checks at 300s and 360s defer, the one at 420s reinitializes
    sleep(Duration::from_secs(130)).await;
    assert_eq!(connector.open_count(), 1);
    sleep(Duration::from_secs(20)).await;
    assert_eq!(connector.open_count(), 2);
    assert!(connector.logout_times().is_empty());
}

/// An authentication failure is recorded and parks all automatic recovery
#[tokio::test(start_paused = true)]
async fn test_auth_failure_parks_recovery() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let config = test_config(&dir);
    let client = start_client(&connector, config.clone());

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    sleep(TICK).await;
    assert!(connector.emit(TransportEvent::AuthFailure(Some("bad credentials".to_string()))));

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::AuthFailed(_)), "got {err:?}");
    assert_eq!(
        client.state(),
        ConnectionState::AuthFailed {
            message: Some("bad credentials".to_string())
        }
    );
    let snapshot = client.supervisor().gate().snapshot();
    assert!(snapshot.last_auth_failure_at.is_some());
    assert_eq!(snapshot.last_auth_failure_message.as_deref(), Some("bad credentials"));

    let poller = standalone_poller(&client, config);
    assert_eq!(poller.check_once().await, NextCheck::Park);

    sleep(Duration::from_secs(30 * 60)).await;
    assert_eq!(connector.open_count(), 1);
    assert!(connector.logout_times().is_empty());
    assert_eq!(client.init_issue().unwrap().kind, InitIssueKind::AuthFailure);
}

/// While waiting for a fresh pairing the poller only reschedules itself,
/// even when the transport state looks ambiguous
#[tokio::test(start_paused = true)]
async fn test_awaiting_pairing_skips_recovery() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    connector.set_probe(false, TransportState::Unknown);
    let config = test_config(&dir);
    let client = start_client(&connector, config.clone());
    client.connect().await.unwrap();

    assert!(connector.emit(TransportEvent::Disconnected("LOGGED_OUT".to_string())));
    sleep(TICK).await;
    assert!(client.supervisor().awaiting_pairing());

    let poller = standalone_poller(&client, config.clone());
    assert_eq!(poller.check_once().await, NextCheck::After(config.fallback_delay));

    sleep(Duration::from_secs(40 * 60)).await;
    assert_eq!(connector.open_count(), 1);
    assert!(connector.logout_times().is_empty());
    assert!(client.supervisor().awaiting_pairing());
}

/// A plainly closed transport gets bounded non-destructive reconnects, then a
/// cooldown; stored credentials are never cleared
#[tokio::test(start_paused = true)]
async fn test_closed_state_reconnects_then_cools_down() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::scripted(
        vec![OpenScript::Emit(vec![TransportEvent::Ready])],
        OpenScript::Emit(vec![]),
    );
    connector.set_probe(false, TransportState::Closed);
    let config = courier::GatewayConfig {
        connect_timeout: Duration::from_secs(10),
        ..test_config(&dir)
    };
    let client = start_client(&connector, config);
    client.connect().await.unwrap();

    let creds = client.supervisor().session().session_path.join("creds.json");
    tokio::fs::write(&creds, b"{}").await.unwrap();

    assert!(connector.emit(TransportEvent::StateChanged(TransportState::Closed)));
    sleep(TICK).await;
    assert!(!client.is_ready());

    // two reconnect cycles finish by 300s; the exhausted budget then cools
    // down until at least 615s
    sleep(Duration::from_secs(560)).await;
    assert_eq!(connector.open_count(), 3, "initial connect plus two reconnects");
    assert!(connector.logout_times().is_empty());

    sleep(Duration::from_secs(40 * 60)).await;
    assert!(connector.open_count() > 3, "reconnects resume after the cooldown");
    assert!(connector.logout_times().is_empty());
    assert!(creds.exists());
}

/// Ambiguous states with nothing on disk fall back to a plain reconnect
/// instead of a destructive reinitialize
#[tokio::test(start_paused = true)]
async fn test_ambiguous_state_without_session_reconnects() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::scripted(
        vec![OpenScript::Emit(vec![TransportEvent::Ready])],
        OpenScript::Emit(vec![]),
    );
    connector.set_probe(false, TransportState::Unknown);
    let config = courier::GatewayConfig {
        connect_timeout: Duration::from_secs(10),
        ..test_config(&dir)
    };
    let client = start_client(&connector, config);
    client.connect().await.unwrap();
    assert!(!client.supervisor().has_persisted_session().await);

    assert!(connector.emit(TransportEvent::StateChanged(TransportState::Closing)));
    sleep(TICK).await;

    sleep(Duration::from_secs(40 * 60)).await;
    assert!(connector.open_count() >= 3);
    assert!(connector.logout_times().is_empty());
}

// ============================================================================
// Sending
// ============================================================================

/// Messages sent before READY are held and delivered in submission order
#[tokio::test(start_paused = true)]
async fn test_sends_before_ready_keep_order() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let client = start_client(&connector, test_config(&dir));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let sends = futures::future::join_all((0..3).map(|i| {
        client.send_message(TARGET, format!("message {i}"), SendOptions::default())
    }));
    let trigger = {
        let connector = Arc::clone(&connector);
        async move {
            sleep(Duration::from_secs(1)).await;
            assert!(connector.emit(TransportEvent::Ready));
        }
    };
    let (results, ()) = tokio::join!(sends, trigger);

    assert!(results.iter().all(Result::is_ok));
    connecting.await.unwrap().unwrap();
    let texts: Vec<String> = connector.sent().into_iter().map(|(_, text)| text).collect();
    assert_eq!(texts, vec!["message 0", "message 1", "message 2"]);
    assert_eq!(client.queue_depth(), 0);
}

/// Rate-limited sends back off with strictly increasing delays, then fail
#[tokio::test(start_paused = true)]
async fn test_rate_limit_backoff_then_failure() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    let client = start_client(&connector, test_config(&dir));
    client.connect().await.unwrap();

    connector.push_send_results(
        std::iter::repeat_with(|| Err(TransportError::RateLimited("rate-overlimit".to_string())))
            .take(5),
    );
    let err = client
        .send_message(TARGET, "hello", SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited { attempts: 5, .. }), "got {err:?}");

    let times = connector.send_times();
    assert_eq!(times.len(), 5, "five transport calls in total");
    let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    for (retry, gap) in gaps.iter().enumerate() {
        let floor = Duration::from_millis(800) * 2u32.pow(retry as u32);
        assert_gap(*gap, floor, floor.mul_f64(1.2));
    }
    assert!(gaps.windows(2).all(|pair| pair[1] > pair[0]));

    // next message is unaffected
    client
        .send_message(TARGET, "after", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(connector.send_times().len(), 6);
}

/// Non rate-limit errors fail the message without retrying
#[tokio::test(start_paused = true)]
async fn test_send_error_not_retried() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![TransportEvent::Ready]));
    let client = start_client(&connector, test_config(&dir));
    client.connect().await.unwrap();

    connector.push_send_results([Err(TransportError::Other("invalid recipient".to_string()))]);
    let err = client
        .send_message(TARGET, "hello", SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Send(_)), "got {err:?}");
    assert_eq!(connector.send_times().len(), 1);
}

/// A caller that gives up while the queue is full leaves no phantom entry
/// behind, so the queue still drains to idle
#[tokio::test(start_paused = true)]
async fn test_abandoned_send_on_full_queue_keeps_depth() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let config = courier::GatewayConfig {
        send_queue_capacity: 1,
        ..test_config(&dir)
    };
    let client = start_client(&connector, config);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    sleep(TICK).await;

    let spawn_send = |text: &'static str| {
        let client = client.clone();
        tokio::spawn(async move { client.send_message(TARGET, text, SendOptions::default()).await })
    };
    // the worker holds the first message; the second fills the channel
    let first = spawn_send("first");
    sleep(TICK).await;
    let second = spawn_send("second");
    sleep(TICK).await;
    assert_eq!(client.queue_depth(), 2);

    let abandoned = tokio::time::timeout(
        TICK,
        client.send_message(TARGET, "abandoned", SendOptions::default()),
    )
    .await;
    assert!(abandoned.is_err(), "queue full");
    assert_eq!(client.queue_depth(), 2);

    assert!(connector.emit(TransportEvent::Ready));
    connecting.await.unwrap().unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(client.queue_depth(), 0);
    assert!(tokio::time::timeout(Duration::from_secs(1), client.wait_for_idle())
        .await
        .is_ok());
    let texts: Vec<String> = connector.sent().into_iter().map(|(_, text)| text).collect();
    assert_eq!(texts, vec!["first", "second"]);
}

// ============================================================================
// Facade
// ============================================================================

/// Admin notifications wait for the primary client, then go out in order
#[tokio::test(start_paused = true)]
async fn test_admin_notifications_flush_on_ready() {
    let dir = TempDir::new().unwrap();
    let connector = MockConnector::new(OpenScript::Emit(vec![]));
    let config = courier::GatewayConfig {
        admin_targets: vec!["0812 3456 7890".to_string()],
        ..test_config(&dir)
    };
    let shared: Arc<dyn Connector> = connector.clone();
    let gateway = GatewayFacade::new(config, shared).unwrap();
    assert_eq!(gateway.primary_client_id(), CLIENT_ID);

    gateway.notify_admins("first");
    gateway.notify_admins("second");
    assert_eq!(gateway.pending_admin_notifications(), 2);
    assert!(connector.sent().is_empty());

    let primary = gateway.primary().unwrap();
    let connecting = tokio::spawn(async move { primary.connect().await });
    sleep(TICK).await;
    assert!(connector.emit(TransportEvent::Ready));
    connecting.await.unwrap().unwrap();

    sleep(TICK).await;
    gateway.wait_for_all_queues().await;
    assert_eq!(gateway.pending_admin_notifications(), 0);
    assert_eq!(
        connector.sent(),
        vec![
            ("081234567890@c.us".to_string(), "first".to_string()),
            ("081234567890@c.us".to_string(), "second".to_string()),
        ]
    );

    gateway.notify_admins("third");
    sleep(TICK).await;
    gateway.wait_for_all_queues().await;
    assert_eq!(connector.sent().len(), 3);
    gateway.shutdown().await;
}
