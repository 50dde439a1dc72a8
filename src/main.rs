use academy_ledger::{
    config::{self, database},
    core::{context::LedgerContext, notification::LogDispatcher, redistribution},
    errors::{Error, Result},
};
use chrono::Utc;
use dotenvy::dotenv;
use std::{env, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file, env vars can also be set externally
    dotenv().ok();

    // 3. Parse the student id
    let student_id = env::args()
        .nth(1)
        .ok_or_else(|| Error::validation("usage: academy-ledger <student_id>"))?
        .parse::<i64>()
        .map_err(|e| Error::validation(format!("student_id must be an integer: {e}")))?;

    // 4. Load billing settings
    let app_config = config::billing::load_default_config()
        .inspect_err(|e| error!("Failed to load configuration: {}", e))?;

    // 5. Initialize database (the default SQLite file lives under data/)
    std::fs::create_dir_all("data")?;
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db).await?;
    info!("Database initialized successfully.");

    // 6. Build the package view
    let ctx = LedgerContext::new(db, Arc::new(LogDispatcher), app_config.billing);
    let view =
        redistribution::get_student_packages_with_classes_by_rounds(&ctx, student_id, Utc::now())
            .await?;
    println!("{}", serde_json::to_string_pretty(&view)?);

    Ok(())
}
