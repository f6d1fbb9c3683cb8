use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use stakeidx_indexer::{JobControl, JobError, ScanRequest};
use stakeidx_log::{self as logging, log_info, log_warn};
use stakeidx_primitives::ScanTarget;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::{status_report, Context};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_LOG_LINES: usize = 200;

pub async fn serve_admin(
    addr: SocketAddr,
    context: Arc<Context>,
    control: JobControl,
) -> Result<(), String> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| format!("admin bind failed: {err}"))?;
    log_info!("Admin API listening on http://{addr}");

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|err| format!("admin accept failed: {err}"))?;
        let context = Arc::clone(&context);
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, context, control).await {
                log_warn!("admin error: {err}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    context: Arc<Context>,
    control: JobControl,
) -> Result<(), String> {
    let mut buffer = vec![0u8; MAX_REQUEST_BYTES];
    let bytes_read = stream
        .read(&mut buffer)
        .await
        .map_err(|err| err.to_string())?;
    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let request_line = request.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or("/");
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    };

    let reply = tokio::task::spawn_blocking(move || route(&method, &path, &query, &context, &control))
        .await
        .map_err(|err| format!("admin handler failed: {err}"))?;
    let (status, body) = match reply {
        Ok(body) => ("200 OK", body),
        Err(failure) => (failure.status, error_body(&failure.message)),
    };
    let response = build_response(status, "application/json", &body);
    stream
        .write_all(&response)
        .await
        .map_err(|err| err.to_string())?;
    Ok(())
}

struct Failure {
    status: &'static str,
    message: String,
}

impl Failure {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: "400 Bad Request",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: "500 Internal Server Error",
            message: message.into(),
        }
    }
}

impl From<JobError> for Failure {
    fn from(err: JobError) -> Self {
        let status = match err {
            JobError::UnknownJob(_) => "404 Not Found",
            JobError::AlreadyRunning(_) => "409 Conflict",
            JobError::InvalidRequest(_) => "400 Bad Request",
            JobError::Failed(_) | JobError::ManagerStopped => "503 Service Unavailable",
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn route(
    method: &str,
    path: &str,
    query: &str,
    context: &Context,
    control: &JobControl,
) -> Result<String, Failure> {
    let params = parse_query(query);
    match (method, path) {
        ("GET", "/healthz") => json(&serde_json::json!({ "ok": true })),
        ("GET", "/jobs") => json(&control.list()?),
        ("GET", "/checkpoints") => json(&status_report(context).map_err(Failure::internal)?),
        ("GET", "/rpc") => json(&context.chain.metrics()),
        ("GET", "/store") => json(&store_json(context)),
        ("GET", "/logs") => {
            let limit = match param(&params, "limit") {
                Some(raw) => parse_param::<usize>("limit", raw)?,
                None => DEFAULT_LOG_LINES,
            };
            json(&logging::capture_snapshot(limit))
        }
        ("GET", path) if path.starts_with("/jobs/") => {
            let key = &path["/jobs/".len()..];
            json(&control.status(key)?)
        }
        ("POST", "/scan") => {
            let start = match param(&params, "start") {
                Some(raw) => parse_param::<u32>("start", raw)?,
                None => context.settings.first_stake_height,
            };
            let end = match param(&params, "end") {
                Some(raw) => ScanTarget::parse(raw)
                    .ok_or_else(|| Failure::bad_request(format!("invalid end '{raw}'")))?,
                None => ScanTarget::Tip,
            };
            let key = param(&params, "key")
                .map(str::to_string)
                .unwrap_or_else(|| format!("scan-{start}-{end}"));
            json(&control.start(ScanRequest::new(key, start, end))?)
        }
        ("POST", "/cancel") => {
            let key = param(&params, "key").ok_or_else(|| Failure::bad_request("missing key"))?;
            control.cancel(key)?;
            json(&serde_json::json!({ "cancelled": key }))
        }
        ("POST", "/gaps") => json(&control.gap_audit()?),
        ("POST", "/reconcile") => {
            let limit = match param(&params, "limit") {
                Some(raw) => parse_param::<usize>("limit", raw)?,
                None => context.config.reconcile_batch,
            };
            json(&control.reconcile(limit)?)
        }
        _ => Err(Failure {
            status: "404 Not Found",
            message: format!("no route for {method} {path}"),
        }),
    }
}

fn store_json(context: &Context) -> serde_json::Value {
    match context.ledger.store().fjall_telemetry_snapshot() {
        Some(stats) => serde_json::json!({
            "backend": "fjall",
            "writeBufferBytes": stats.write_buffer_bytes,
            "journalCount": stats.journal_count,
            "journalDiskSpaceBytes": stats.journal_disk_space_bytes,
            "activeCompactions": stats.active_compactions,
            "stakeEventSegments": stats.stake_event_segments,
            "utxoSegments": stats.utxo_segments,
        }),
        None => serde_json::json!({ "backend": "memory" }),
    }
}

fn json<T: Serialize>(value: &T) -> Result<String, Failure> {
    serde_json::to_string(value).map_err(|err| Failure::internal(err.to_string()))
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .rev()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn parse_param<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, Failure> {
    raw.parse()
        .map_err(|_| Failure::bad_request(format!("invalid {name} '{raw}'")))
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'+' => out.push(b' '),
            b'%' if idx + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[idx + 1..idx + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        idx += 2;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn build_response(status: &str, content_type: &str, body: &str) -> Vec<u8> {
    let mut response = String::new();
    response.push_str("HTTP/1.1 ");
    response.push_str(status);
    response.push_str("\r\nContent-Type: ");
    response.push_str(content_type);
    response.push_str("\r\nCache-Control: no-store\r\nConnection: close\r\nContent-Length: ");
    response.push_str(&body.len().to_string());
    response.push_str("\r\n\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_decodes_and_prefers_last_value() {
        let params = parse_query("key=my%20scan&start=10&start=20&flag");
        assert_eq!(param(&params, "key"), Some("my scan"));
        assert_eq!(param(&params, "start"), Some("20"));
        assert_eq!(param(&params, "flag"), Some(""));
        assert_eq!(param(&params, "missing"), None);
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn response_framing() {
        let response = String::from_utf8(build_response("200 OK", "application/json", "{}"))
            .expect("utf8");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 2\r\n"));
        assert!(response.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn job_errors_map_to_statuses() {
        assert_eq!(Failure::from(JobError::UnknownJob("x".into())).status, "404 Not Found");
        assert_eq!(Failure::from(JobError::AlreadyRunning("x".into())).status, "409 Conflict");
        assert_eq!(
            Failure::from(JobError::ManagerStopped).status,
            "503 Service Unavailable"
        );
    }
}
