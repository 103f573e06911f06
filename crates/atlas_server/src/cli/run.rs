//! `atlas run` - execute one card and print its Dossier.

use anyhow::{bail, Context, Result};
use atlas_engine::CancellationToken;
use atlas_protocol::RunStatus;
use atlas_server::EngineArgs;
use serde_json::Value;
use tracing::warn;

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Card name
    pub card: String,

    /// Input payload as a JSON object
    #[arg(long, default_value = "{}")]
    pub input: String,
}

pub async fn run(args: RunArgs, engine: &EngineArgs) -> Result<()> {
    let inputs: Value = serde_json::from_str(&args.input).context("--input is not valid JSON")?;
    let executor = engine.executor().await?;

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling after the current step");
                cancel.cancel();
            }
        })
    };

    let result = executor
        .execute_with_cancel(&args.card, inputs, &cancel)
        .await;
    watcher.abort();

    let dossier = result?;
    println!("{}", serde_json::to_string_pretty(&dossier)?);

    if dossier.status == RunStatus::Failed {
        let detail = dossier
            .error
            .map(|e| e.detail)
            .unwrap_or_else(|| "run failed".to_string());
        bail!("{}", detail);
    }
    Ok(())
}
