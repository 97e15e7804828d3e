use super::{fixtures::generate_test_users, Seed};
use crate::error::{DbKeeperError, Result};
use crate::store::DocumentStore;
use async_trait::async_trait;
use bson::doc;
use tracing::info;

const USER_COUNT: usize = 10;

pub struct Users;

#[async_trait]
impl Seed for Users {
    fn filename(&self) -> &'static str {
        "001_users"
    }

    fn environments(&self) -> &'static [&'static str] {
        &["development", "test"]
    }

    fn required(&self) -> bool {
        true
    }

    async fn seed(&self, db: &dyn DocumentStore) -> Result<()> {
        if db.count_documents("users", &doc! {}).await? > 0 {
            info!("Users already present, skipping");
            return Ok(());
        }

        let outcome = db.insert_many("users", generate_test_users(USER_COUNT)).await?;
        if outcome.inserted == 0 {
            return Err(DbKeeperError::Database(format!(
                "no users inserted: {}",
                outcome.errors.join("; ")
            )));
        }
        info!("Inserted {} user(s)", outcome.inserted);
        Ok(())
    }
}
