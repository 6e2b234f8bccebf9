//! Runs a simulated background-removal batch against a flaky fake API.
//!
//! `RUST_LOG=debug cargo run --example batch_progress` shows every retry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tower_batch_resilience::{
    init_tracing, operation_fn, ConfigBuilder, OperationError, RateLimitStrategy,
    ResilientClient, TracingProgress,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    // Every third request hits a 503, every image named "*corrupt*" is rejected.
    let requests = Arc::new(AtomicU32::new(0));
    let counter = requests.clone();
    let remove_background = operation_fn(move |name: String| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            if name.contains("corrupt") {
                return Err(OperationError::http(400, "image could not be decoded"));
            }
            if n % 3 == 2 {
                return Err(OperationError::http(503, "service temporarily unavailable"));
            }
            Ok(format!("PNG bytes for {name}").into_bytes())
        }
    });

    let out = std::env::temp_dir().join("batch_progress_demo");
    let config = ConfigBuilder::new()
        .max_retries(3)
        .base_delay(Duration::from_millis(200))
        .rate_limit(5.0)
        .rate_limit_strategy(RateLimitStrategy::Wait)
        .max_workers(3)
        .output(&out, "{index}_{name}")
        .build()?;
    let client = ResilientClient::new(remove_background, config)?;

    let inputs: Vec<String> = [
        "beach.jpg",
        "portrait.jpg",
        "corrupt_scan.jpg",
        "product_01.png",
        "product_02.png",
        "dog.jpg",
        "mountains.jpg",
        "logo.png",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let report = client.batch(inputs, Some(Arc::new(TracingProgress))).await?;

    println!("{report}");
    for item in &report {
        match item.error() {
            None => println!(
                "  [{}] {} -> {} ({} attempt(s))",
                item.index,
                item.input_name,
                item.output_path().map(|p| p.display().to_string()).unwrap_or_default(),
                item.attempts
            ),
            Some(e) => println!("  [{}] {} failed: {}", item.index, item.input_name, e),
        }
    }
    println!(
        "{} requests sent, statistics: {:?}",
        requests.load(Ordering::SeqCst),
        report.statistics()
    );
    Ok(())
}
