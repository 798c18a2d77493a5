//! HTTP health probe implementation.

use std::error::Error as _;
use std::time::{Duration, Instant};

/// Outcome of a single health probe. Errors are normalized into the record
/// rather than propagated, so a failed check is still an appendable result.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status_code: Option<u16>,
    pub response_time_ms: i64,
    pub is_up: bool,
    pub error: Option<String>,
    pub final_url: Option<String>,
}

/// Run a health probe against the given URL.
///
/// Sends a HEAD request first; if the status is >= 400 retries once with GET,
/// since many servers reject HEAD. The deadline covers both requests, and the
/// recorded response time includes the retry.
pub async fn run_health_probe(url: &str, timeout: Duration) -> ProbeOutcome {
    // Jitter to avoid thundering herd across sites sharing a cadence.
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let client = match reqwest::Client::builder().build() {
        Ok(c) => c,
        Err(e) => {
            return ProbeOutcome {
                status_code: None,
                response_time_ms: 0,
                is_up: false,
                error: Some(format!("client setup failed: {}", e)),
                final_url: None,
            }
        }
    };

    let start = Instant::now();
    let result = tokio::time::timeout(timeout, send_with_retry(&client, url)).await;
    let response_time_ms = start.elapsed().as_millis() as i64;

    match result {
        Err(_) => ProbeOutcome {
            status_code: None,
            response_time_ms,
            is_up: false,
            error: Some(format!("timeout after {}s", timeout.as_secs())),
            final_url: None,
        },
        Ok(Err(e)) => ProbeOutcome {
            status_code: None,
            response_time_ms,
            is_up: false,
            error: Some(error_chain(&e)),
            final_url: None,
        },
        Ok(Ok(resp)) => {
            let code = resp.status().as_u16();
            ProbeOutcome {
                status_code: Some(code),
                response_time_ms,
                is_up: is_up_status(code),
                error: if is_up_status(code) {
                    None
                } else {
                    Some(format!("server error {}", code))
                },
                final_url: Some(resp.url().to_string()),
            }
        }
    }
}

async fn send_with_retry(
    client: &reqwest::Client,
    url: &str,
) -> Result<reqwest::Response, reqwest::Error> {
    let head = client.head(url).send().await;
    match head {
        Ok(resp) if resp.status().as_u16() >= 400 => client.get(url).send().await,
        other => other,
    }
}

/// A 4xx still means the server answered; only 5xx counts as down.
pub fn is_up_status(code: u16) -> bool {
    code < 500
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}
