use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const DEFAULT_DEVICE_ADDR: &str = "127.0.0.1:8889";
const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:8888";
const STATE_NAMES: &str = "IDLE, COLLECTING, PROCESSING";

fn state_name(collecting: bool) -> &'static str {
    if collecting {
        "COLLECTING"
    } else {
        "IDLE"
    }
}

fn status_text(collecting: bool) -> String {
    format!(
        "Current State: {}, Collecting: {}, Processing: NO",
        state_name(collecting),
        if collecting { "TRUE" } else { "FALSE" }
    )
}

/// Firmware-style answer to one server command.
fn answer(command: &str, collecting: &AtomicBool) -> Option<String> {
    match command {
        "START" => {
            collecting.store(true, Ordering::SeqCst);
            Some("OK: Collection started".to_string())
        }
        "STOP" => {
            collecting.store(false, Ordering::SeqCst);
            Some("OK: Collection stopped".to_string())
        }
        "STATUS" => Some(format!("OK: {}", status_text(collecting.load(Ordering::SeqCst)))),
        "STATES" => Some(format!("OK: States: {STATE_NAMES}")),
        _ => None,
    }
}

fn telemetry_payload() -> serde_json::Value {
    let mut rng = rand::thread_rng();
    serde_json::json!({
        "heartRate": rng.gen_range(60.0..100.0_f64).round(),
        "oxygenLevel": (rng.gen_range(95.0..100.0_f64) * 10.0).round() / 10.0,
        "actionClass": rng.gen_range(0..3),
        "confidence": (rng.gen_range(0.6..1.0_f64) * 100.0).round() / 100.0,
        "deviceState": "COLLECTING",
        "isCollecting": true,
    })
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let push_status = !args.iter().any(|a| a == "--no-status");
    let post_data = !args.iter().any(|a| a == "--no-data");
    let mut positional = args.iter().filter(|a| !a.starts_with("--"));
    let device_addr = positional
        .next()
        .cloned()
        .unwrap_or_else(|| DEFAULT_DEVICE_ADDR.to_string());
    let http_url = positional
        .next()
        .cloned()
        .unwrap_or_else(|| DEFAULT_HTTP_URL.to_string());

    println!("device-sim: connecting to {device_addr}");
    let stream = loop {
        match TcpStream::connect(&device_addr).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    };
    println!("device-sim: connected");

    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let collecting = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                break;
            }
            println!("-> {line}");
        }
    });

    out_tx.send("HELLO".to_string())?;

    if push_status {
        let status_tx = out_tx.clone();
        let collecting = collecting.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let line = format!("STATUS_INFO:{}", status_text(collecting.load(Ordering::SeqCst)));
                if status_tx.send(line).is_err() {
                    break;
                }
            }
        });
    }

    if post_data {
        let collecting = collecting.clone();
        let url = format!("{}/data", http_url.trim_end_matches('/'));
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if !collecting.load(Ordering::SeqCst) {
                    continue;
                }
                let body = telemetry_payload().to_string();
                let res = client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .send()
                    .await;
                match res {
                    Ok(resp) => println!("-> POST /data {}", resp.status()),
                    Err(err) => eprintln!("device-sim: data post failed: {err}"),
                }
            }
        });
    }

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        println!("<- {line}");
        if let Some(reply) = answer(&line, &collecting) {
            out_tx.send(reply)?;
        }
    }
    println!("device-sim: server closed the connection");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
