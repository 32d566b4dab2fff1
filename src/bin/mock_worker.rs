//! Reference worker speaking the bridge protocol.
//!
//! Used by the integration tests and for running the bridge without the
//! inference stack installed. Requests are handled concurrently, so a slow
//! action can be overtaken by a fast one issued after it.
//!
//! Actions:
//!
//! - `echo` - returns its parameters
//! - `fail` - returns `error` (parameter `message`)
//! - `sleep` - waits `ms` milliseconds, then echoes
//! - `split` - echoes, writing the response in two separate chunks
//! - `garbage` - writes a non-JSON line, then echoes
//! - `silent` - never answers
//! - `crash` - exits immediately with `code` (default 1)
//! - `pid` - returns the worker's process id
//! - `correlation` - returns the correlation id it was sent

use std::time::Duration;

use clap::Parser;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use curavox_bridge::ipc::{encode_response, StartupSignal};

#[derive(Parser)]
#[command(name = "mock-worker")]
struct Args {
    /// Operating mode; only `daemon` is supported
    #[arg(long, default_value = "daemon")]
    mode: String,

    /// Delay before sending the startup signal
    #[arg(long, default_value_t = 0)]
    delay_ready_ms: u64,
}

/// A chunk of stdout, optionally followed by a pause before the next one.
struct Output {
    bytes: String,
    pause: Option<Duration>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.mode != "daemon" {
        println!("{}", json!({"error": format!("Unsupported mode: {}", args.mode)}));
        std::process::exit(2);
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Output>();
    let writer = tokio::spawn(write_stdout(out_rx));

    if args.delay_ready_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.delay_ready_ms)).await;
    }
    let startup = serde_json::to_string(&StartupSignal::ready()).unwrap_or_default();
    let _ = out_tx.send(Output {
        bytes: format!("{}\n", startup),
        pause: None,
    });
    eprintln!("mock-worker: daemon mode started, listening on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(request)) => {
                tokio::spawn(handle(request, out_tx.clone()));
            }
            _ => eprintln!("mock-worker: invalid JSON received"),
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

async fn handle(mut request: Map<String, Value>, out: mpsc::UnboundedSender<Output>) {
    let id = match request.remove("correlationId") {
        Some(Value::String(id)) => id,
        _ => {
            eprintln!("mock-worker: request without correlationId");
            return;
        }
    };
    let action = request
        .remove("action")
        .and_then(|a| a.as_str().map(str::to_string))
        .unwrap_or_default();
    eprintln!("mock-worker: handling {}", action);

    let params = Value::Object(request);
    let send = |bytes: String, pause: Option<Duration>| {
        let _ = out.send(Output { bytes, pause });
    };

    match action.as_str() {
        "echo" => send(encode_response(&id, Ok(params)), None),
        "fail" => {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_string();
            send(encode_response(&id, Err(message)), None);
        }
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            send(encode_response(&id, Ok(params)), None);
        }
        "split" => {
            let response = encode_response(&id, Ok(params));
            let mid = response.len() / 2;
            let cut = (0..=mid).rev().find(|&i| response.is_char_boundary(i)).unwrap_or(0);
            send(response[..cut].to_string(), Some(Duration::from_millis(50)));
            send(response[cut..].to_string(), None);
        }
        "garbage" => {
            send("this is not json\n".to_string(), None);
            send(encode_response(&id, Ok(params)), None);
        }
        "silent" => {}
        "crash" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(1) as i32;
            eprintln!("mock-worker: crashing with code {}", code);
            std::process::exit(code);
        }
        "correlation" => send(
            encode_response(&id, Ok(json!({"correlationId": id}))),
            None,
        ),
        "pid" => send(
            encode_response(&id, Ok(json!({"pid": std::process::id()}))),
            None,
        ),
        other => send(
            encode_response(&id, Err(format!("Unknown action: {}", other))),
            None,
        ),
    }
}

async fn write_stdout(mut chunks: mpsc::UnboundedReceiver<Output>) {
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = chunks.recv().await {
        if stdout.write_all(chunk.bytes.as_bytes()).await.is_err() {
            return;
        }
        if stdout.flush().await.is_err() {
            return;
        }
        if let Some(pause) = chunk.pause {
            tokio::time::sleep(pause).await;
        }
    }
}
