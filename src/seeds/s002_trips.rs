use super::{fixtures::generate_test_trips, Seed};
use crate::error::{DbKeeperError, Result};
use crate::store::{DocumentStore, FindOptions};
use async_trait::async_trait;
use bson::{doc, Bson};
use tracing::info;

const TRIP_COUNT: usize = 20;

pub struct Trips;

#[async_trait]
impl Seed for Trips {
    fn filename(&self) -> &'static str {
        "002_trips"
    }

    fn environments(&self) -> &'static [&'static str] {
        &["development", "test"]
    }

    async fn seed(&self, db: &dyn DocumentStore) -> Result<()> {
        if db.count_documents("trips", &doc! {}).await? > 0 {
            info!("Trips already present, skipping");
            return Ok(());
        }

        let options = FindOptions {
            projection: Some(doc! { "_id": 1 }),
            ..Default::default()
        };
        let user_ids: Vec<String> = db
            .find("users", &doc! {}, &options)
            .await?
            .iter()
            .filter_map(|user| match user.get("_id") {
                Some(Bson::ObjectId(id)) => Some(id.to_hex()),
                Some(Bson::String(id)) => Some(id.clone()),
                _ => None,
            })
            .collect();

        if user_ids.is_empty() {
            return Err(DbKeeperError::NotFound("no users to own seeded trips".to_string()));
        }

        let outcome = db.insert_many("trips", generate_test_trips(&user_ids, TRIP_COUNT)).await?;
        info!("Inserted {} trip(s) for {} user(s)", outcome.inserted, user_ids.len());
        Ok(())
    }
}
