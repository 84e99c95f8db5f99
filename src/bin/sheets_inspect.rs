use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sheets_bridge::app;
use sheets_bridge::config;

#[derive(Parser, Debug)]
#[command(about = "List spreadsheets reachable with the stored Google token")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print the header row of this spreadsheet instead of the listing
    #[arg(long)]
    sheet_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let services = app::build(&cfg).await?;

    let token = services.tokens.ensure_valid_token().await?;
    let client = services.connector.connect(&token.access_token);

    match args.sheet_id {
        Some(sheet_id) => {
            println!("Sheet ID: {sheet_id}");
            println!("Columns:");
            for (i, label) in client.get_header_row(&sheet_id).await.into_iter().enumerate() {
                println!("  {i} -> {label}");
            }
        }
        None => {
            let files = client.list_spreadsheet_files().await;
            println!("Spreadsheets ({}):", files.len());
            for file in files {
                println!("  {} -> {}", file.id, file.name);
            }
        }
    }
    Ok(())
}
