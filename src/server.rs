use std::net::{IpAddr, SocketAddr};

use log::{error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::controller::PipelineHandle;
use crate::risk::RiskLevel;
use crate::store::ProfileStore;
use crate::summary::SummaryBrief;

/// Serves the operator query protocol: one UTF-8 command per connection on
/// the loopback channel, a JSON payload back, then the connection closes.
#[tokio::main]
pub async fn start_query_service_main(
    bind_address: IpAddr,
    port: u16,
    store: ProfileStore,
    handle: PipelineHandle,
    mut shutdown: oneshot::Receiver<()>,
) {
    let addr = SocketAddr::from((bind_address, port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("Could not bind query listener to {addr}: {err}");
            std::process::exit(1)
        }
    };
    eprintln!("Query service listening at {addr}");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("query listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = handle_connection(stream, peer, &store, &handle).await {
                            error!("query connection failed: {err}");
                        }
                    }
                    Err(err) => error!("accept failed: {err}"),
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: &ProfileStore,
    handle: &PipelineHandle,
) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let len = stream.read(&mut buf).await?;
    let command = String::from_utf8_lossy(&buf[..len]).trim().to_string();
    info!("request {command:?} from {peer}");

    let response = respond(&command, store, handle);
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Maps one command to its JSON payload.
fn respond(command: &str, store: &ProfileStore, handle: &PipelineHandle) -> String {
    match command {
        "modelled apps" => encode_briefs(current_briefs(handle)),
        "abnormal apps" => {
            let briefs = current_briefs(handle)
                .into_iter()
                .filter(|brief| brief.risk != RiskLevel::None)
                .collect();
            encode_briefs(briefs)
        }
        "abnormal apps --history" => serde_json::to_string(&store.read_anomalies())
            .expect("anomaly entries always serialize"),
        "modeller pause" => {
            handle.pause();
            status_payload(true)
        }
        "modeller continue" => {
            handle.resume();
            status_payload(false)
        }
        "modeller status" => status_payload(handle.is_paused()),
        _ => serde_json::to_string(&["Command not supported"])
            .expect("a fixed payload always serializes"),
    }
}

fn current_briefs(handle: &PipelineHandle) -> Vec<SummaryBrief> {
    let mut briefs: Vec<SummaryBrief> = handle
        .current_summaries()
        .iter()
        .map(|summary| summary.brief())
        .collect();
    briefs.sort_by(|a, b| a.app_name.cmp(&b.app_name));
    briefs
}

fn encode_briefs(briefs: Vec<SummaryBrief>) -> String {
    serde_json::to_string(&briefs).expect("summaries always serialize")
}

fn status_payload(paused: bool) -> String {
    let message = if paused {
        "Modelling paused."
    } else {
        "Modelling running."
    };
    serde_json::to_string(&[message]).expect("a fixed payload always serializes")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::detector::FrequencyDetector;
    use crate::profile::test_support::profile_with_history;
    use crate::timestamp::CANONICAL_FORMAT;

    const BASELINE_RSS: [u64; 10] = [100, 110, 95, 105, 120, 98, 102, 107, 99, 101];

    fn store(dir: &tempfile::TempDir) -> ProfileStore {
        ProfileStore::open(dir.path(), CANONICAL_FORMAT).unwrap()
    }

    fn handle_with_summaries() -> PipelineHandle {
        let detector = FrequencyDetector::new(10, 5, Vec::new());
        let quiet = detector.detect(&profile_with_history(&BASELINE_RSS, &[108]));
        let loud = detector.detect(&profile_with_history(&BASELINE_RSS, &[10000]));
        let handle = PipelineHandle::new();
        let mut current = vec![quiet, loud];
        current[0].app_name = "cron".to_string();
        current[1].app_name = "miner".to_string();
        *handle.current_summaries.lock().unwrap() = current;
        handle
    }

    #[test]
    fn unknown_commands_get_the_fixed_marker() {
        let dir = tempfile::tempdir().unwrap();
        let handle = PipelineHandle::new();
        assert_eq!(
            respond("frobnicate", &store(&dir), &handle),
            r#"["Command not supported"]"#
        );
    }

    #[test]
    fn modelled_apps_lists_everything_and_abnormal_filters() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with_summaries();
        let store = store(&dir);

        let modelled: Vec<SummaryBrief> =
            serde_json::from_str(&respond("modelled apps", &store, &handle)).unwrap();
        assert_eq!(modelled.len(), 2);
        assert_eq!(modelled[0].app_name, "cron");

        let abnormal: Vec<SummaryBrief> =
            serde_json::from_str(&respond("abnormal apps", &store, &handle)).unwrap();
        assert_eq!(abnormal.len(), 1);
        assert_eq!(abnormal[0].app_name, "miner");
        assert_eq!(abnormal[0].risk, crate::risk::RiskLevel::High);
    }

    #[test]
    fn pause_and_continue_toggle_the_flag_and_acknowledge() {
        let dir = tempfile::tempdir().unwrap();
        let handle = PipelineHandle::new();
        let store = store(&dir);

        assert_eq!(
            respond("modeller status", &store, &handle),
            r#"["Modelling running."]"#
        );
        assert_eq!(
            respond("modeller pause", &store, &handle),
            r#"["Modelling paused."]"#
        );
        assert!(handle.is_paused());
        assert_eq!(
            respond("modeller continue", &store, &handle),
            r#"["Modelling running."]"#
        );
        assert!(!handle.is_paused());
    }

    #[test]
    fn history_serves_the_anomaly_log() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with_summaries();
        let store = store(&dir);
        for summary in handle.current_summaries() {
            if summary.is_anomalous() {
                store.append_anomaly(&summary).unwrap();
            }
        }
        let payload = respond("abnormal apps --history", &store, &handle);
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["miner"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["miner"][0]["risk"], "high");
    }
}
