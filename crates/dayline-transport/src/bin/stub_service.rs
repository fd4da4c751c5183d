//! Stand-in capability service used by integration tests.
//!
//! Speaks the real stdio protocol through [`ServiceHost`]. Behaviour is
//! chosen per operation; `STUB_MODE` changes startup:
//! - `exit`: exit immediately, so the handshake sees a closed channel
//! - `mute`: read requests but never answer, so the handshake times out

use std::time::Duration;

use dayline_transport::ServiceHost;
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match std::env::var("STUB_MODE").as_deref() {
        Ok("exit") => std::process::exit(2),
        Ok("mute") => {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while lines.next_line().await?.is_some() {}
            return Ok(());
        }
        _ => {}
    }

    let name = std::env::var("STUB_NAME").unwrap_or_else(|_| "stub".into());
    let delay_ms: u64 = std::env::var("STUB_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut host = ServiceHost::new(name, env!("CARGO_PKG_VERSION"));
    host.register("echo", "Return the arguments", json!({"type": "object"}), |args| async move {
        Ok(json!({ "echo": args }))
    })
    .register(
        "caption_image",
        "Fixed caption",
        json!({"type": "object", "properties": {"input": {"type": "object"}}}),
        move |_| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(json!({"caption": "a dog on a beach", "tags": ["dog", "beach"]}))
        },
    )
    .register(
        "extract_image_metadata",
        "EXIF with failed weather/address lookups",
        json!({"type": "object"}),
        |_| async {
            Ok(json!({
                "datetime": "2024:05:01 10:12:00",
                "gps": {"lat": 37.5665, "lon": 126.978},
                "address": Value::Null,
                "weather": Value::Null,
            }))
        },
    )
    .register("synthesize_dayline", "Fixed line", json!({"type": "object"}), |args| async move {
        let target = args["input"]["target_chars"].as_u64().unwrap_or(14);
        Ok(json!({"line": format!("beach walk day ({} chars)", target)}))
    })
    .register("text_only", "Plain text reply", json!({}), |_| async {
        Ok(Value::String("just words".into()))
    })
    .register("fail", "Operation-level error", json!({}), |_| async {
        Err("simulated failure".to_string())
    })
    .register("hang", "Never replies", json!({}), |_| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({}))
    })
    .register("crash", "Exit mid-call", json!({}), |_| async { exit_mid_call() });

    host.run_stdio().await
}

fn exit_mid_call() -> Result<Value, String> {
    std::process::exit(3)
}
