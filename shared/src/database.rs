use sea_orm::{Database, DatabaseConnection, DbErr};
use tracing::info;

pub async fn get_db_connection(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    info!("Connecting to database via Sea-ORM");
    Database::connect(database_url).await
}
