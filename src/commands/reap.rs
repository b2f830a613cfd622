//! Reap command handler.

use kvbridge::StoreConfig;
use kvbridge::cli::{ReapArgs, run_reap};

/// Runs `kvbridge reap` and prints the totals.
///
/// # Errors
///
/// Returns an error if no URI is configured, the store cannot be opened,
/// or a one-shot sweep fails.
pub async fn cmd_reap(
    args: ReapArgs,
    base: Option<StoreConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.store_config(base)?;
    let summary = run_reap(&args, config).await?;
    println!(
        "Removed {} expired entries in {} sweep(s).",
        summary.removed, summary.sweeps
    );
    Ok(())
}
