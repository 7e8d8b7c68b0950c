//! Integration tests for the CLI-side Unix-socket IPC transport.
//!
//! Each test spins up a mock daemon behind a `UnixListener`, then exercises
//! `bdg::ipc::client` against it directly, independent of the real daemon
//! implementation.

use std::time::Duration;

use bdg::error::ExitCode;
use bdg::ipc::client;
use bdg::ipc::{ClientRequest, ClientResponse, FramedReader, FramedWriter, IpcError};
use bdg::session::BdgPaths;
use serde_json::json;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

/// Start a mock daemon that accepts one connection and responds to every
/// request with `ClientResponse::ok` carrying `reply`.
fn start_ok_server(paths: &BdgPaths, reply: serde_json::Value) -> JoinHandle<()> {
    let listener = UnixListener::bind(paths.socket_file()).unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (read_half, write_half) = stream.into_split();
            let mut reader = FramedReader::new(read_half);
            let mut writer = FramedWriter::new(write_half);
            while let Ok(Some(req)) = reader.read_frame::<ClientRequest>().await {
                let resp = ClientResponse::ok(req.command(), req.session_id.clone(), reply.clone());
                if writer.write_frame(&resp).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// Start a mock daemon that responds to every request with an error envelope.
fn start_err_server(paths: &BdgPaths, code: &'static str, message: &'static str) -> JoinHandle<()> {
    let listener = UnixListener::bind(paths.socket_file()).unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (read_half, write_half) = stream.into_split();
            let mut reader = FramedReader::new(read_half);
            let mut writer = FramedWriter::new(write_half);
            while let Ok(Some(req)) = reader.read_frame::<ClientRequest>().await {
                let resp = ClientResponse::err(req.command(), req.session_id.clone(), IpcError::new(code, message));
                if writer.write_frame(&resp).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// Start a mock daemon that accepts the connection and then never writes a
/// response, for timeout tests.
fn start_silent_server(paths: &BdgPaths) -> JoinHandle<()> {
    let listener = UnixListener::bind(paths.socket_file()).unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (read_half, _write_half) = stream.into_split();
            let mut reader = FramedReader::new(read_half);
            while reader.read_frame::<ClientRequest>().await.is_ok() {}
        }
    })
}

fn test_paths() -> (tempfile::TempDir, BdgPaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = BdgPaths::from_base(dir.path().to_path_buf());
    paths.ensure_base_dir().unwrap();
    (dir, paths)
}

#[tokio::test]
async fn call_round_trips_through_real_socket() {
    let (_dir, paths) = test_paths();
    let _server = start_ok_server(&paths, json!({"daemonPid": 4242}));

    let result = client::call(&paths, "handshake", json!({}), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result["daemonPid"], 4242);
}

#[tokio::test]
async fn call_maps_wire_error_codes_onto_exit_codes() {
    let (_dir, paths) = test_paths();
    let _server = start_err_server(&paths, "SESSION_ALREADY_RUNNING", "a session is already active");

    let err = client::call(&paths, "start_session", json!({}), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert_eq!(err.code, ExitCode::ResourceBusy);
    assert_eq!(err.message, "a session is already active");
}

#[tokio::test]
async fn call_maps_unknown_wire_code_to_general_error() {
    let (_dir, paths) = test_paths();
    let _server = start_err_server(&paths, "SOMETHING_NEW", "unrecognized");

    let err = client::call(&paths, "status", json!({}), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert_eq!(err.code, ExitCode::GeneralError);
}

#[tokio::test]
async fn call_times_out_against_silent_daemon() {
    let (_dir, paths) = test_paths();
    let _server = start_silent_server(&paths);

    let err = client::call(&paths, "peek", json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert_eq!(err.code, ExitCode::CdpTimeout);
}

#[tokio::test]
async fn call_fails_fast_when_no_daemon_listening() {
    let (_dir, paths) = test_paths();

    let err = client::call(&paths, "status", json!({}), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert_eq!(err.code, ExitCode::ConnectionError);
}

#[tokio::test]
async fn ensure_daemon_running_short_circuits_on_existing_handshake() {
    let (_dir, paths) = test_paths();
    let _server = start_ok_server(&paths, json!({"daemonPid": 99}));

    // A daemon is already answering the socket, so this must not attempt to
    // spawn a second one (which would fail: there is no real bdg binary at
    // the test's current_exe path pointed at this tempdir's BDG_HOME).
    client::ensure_daemon_running(&paths).await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_get_independent_connections() {
    let (_dir, paths) = test_paths();
    let listener = UnixListener::bind(paths.socket_file()).unwrap();
    let _server = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let (read_half, write_half) = stream.into_split();
                let mut reader = FramedReader::new(read_half);
                let mut writer = FramedWriter::new(write_half);
                while let Ok(Some(req)) = reader.read_frame::<ClientRequest>().await {
                    let resp = ClientResponse::ok(req.command(), req.session_id.clone(), req.params.clone());
                    if writer.write_frame(&resp).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let calls = (0..5).map(|i| {
        let paths = paths.clone();
        async move {
            client::call(&paths, "status", json!({"i": i}), Duration::from_secs(2))
                .await
                .unwrap()
        }
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result["i"], i);
    }
}
