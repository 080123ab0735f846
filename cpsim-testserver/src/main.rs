use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use cpsim_testserver::{CsmsConfig, PATH_WS, TestServerStats};
use tokio::net::TcpListener;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let mut bind_addr: SocketAddr = "127.0.0.1:0".parse()?;
    let mut config = CsmsConfig::default();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--bind" => {
                let addr = args.next().ok_or_else(|| {
                    anyhow::anyhow!("--bind requires an address, e.g. 127.0.0.1:0")
                })?;
                bind_addr = addr.parse()?;
            }
            "--secret" => {
                config.shared_secret = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--secret requires a value"))?;
            }
            "--known-ids" => {
                let ids = args.next().ok_or_else(|| {
                    anyhow::anyhow!("--known-ids requires a comma-separated list")
                })?;
                let ids: HashSet<String> = ids
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                config.known_ids = Some(Arc::new(ids));
            }
            "-h" | "--help" => {
                eprintln!(
                    "cpsim-testserver\n\nUSAGE:\n  cpsim-testserver [--bind 127.0.0.1:0] [--secret <secret>] [--known-ids cs001,cs002]\n\nOUTPUT:\n  Prints WS_URL=<url> to stdout once ready. Charge points connect to <url>/<id>."
                );
                return Ok(());
            }
            other => {
                return Err(anyhow::anyhow!("unknown argument: {other}"));
            }
        }
    }

    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    let app = cpsim_testserver::router(config, TestServerStats::default());

    println!("WS_URL=ws://{addr}{PATH_WS}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
