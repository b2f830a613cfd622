//! Migration command handler.

use kvbridge::cli::{MigrateArgs, run_migration};
use kvbridge::migration::MigrationReport;

/// Runs `kvbridge migrate`, printing the preview before the commit and the
/// outcome after it.
///
/// # Errors
///
/// Returns an error if the migration fails; nothing is committed then.
pub async fn cmd_migrate(args: MigrateArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Migrating legacy keys in table '{}'", args.table);
    println!("Dry run: {}", args.dry_run);
    println!();

    let report = run_migration(&args, print_preview).await?;

    if report.preview.is_empty() {
        return Ok(());
    }
    println!();
    if report.applied {
        println!("Migration complete: {} rows updated.", report.rows_updated);
    } else {
        println!("Dry run: changes rolled back.");
    }
    Ok(())
}

/// Prints the rows about to be rewritten and any conflicts.
fn print_preview(report: &MigrationReport) {
    if report.preview.is_empty() {
        println!("No legacy keys found.");
        return;
    }

    println!("Rows to rewrite ({}):", report.preview.len());
    for rewrite in &report.preview {
        println!("  {rewrite}");
    }

    if !report.conflicts.is_empty() {
        println!();
        println!("Conflicts ({}):", report.conflicts.len());
        for rewrite in &report.conflicts {
            println!("  {rewrite}");
        }
    }
}
