use anyhow::{Context, Result};
use rowbridge_repository::PostgresMappingStore;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let database_url = env::var("DATABASE_URL")
        .or_else(|_| env::var("ROWBRIDGE_DATABASE_URL"))
        .context("DATABASE_URL or ROWBRIDGE_DATABASE_URL must be set")?;
    let store = PostgresMappingStore::connect(&database_url, 5).await?;
    store.run_migrations().await?;
    Ok(())
}
