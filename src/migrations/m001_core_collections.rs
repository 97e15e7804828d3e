use crate::error::Result;
use crate::migration::Migration;
use crate::store::DocumentStore;
use async_trait::async_trait;

const COLLECTIONS: &[&str] = &["users", "trips", "itineraries", "expenses"];

pub struct CoreCollections;

#[async_trait]
impl Migration for CoreCollections {
    fn filename(&self) -> &'static str {
        "001_core_collections"
    }

    fn source(&self) -> &'static str {
        include_str!("m001_core_collections.rs")
    }

    async fn up(&self, db: &dyn DocumentStore) -> Result<()> {
        for collection in COLLECTIONS {
            db.create_collection(collection).await?;
        }
        Ok(())
    }

    async fn down(&self, db: &dyn DocumentStore) -> Result<()> {
        for collection in COLLECTIONS.iter().rev() {
            db.drop_collection(collection).await?;
        }
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }
}
