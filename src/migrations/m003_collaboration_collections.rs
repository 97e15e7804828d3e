use crate::error::Result;
use crate::migration::Migration;
use crate::store::DocumentStore;
use async_trait::async_trait;

const COLLECTIONS: &[&str] = &["invitations", "notifications", "activities", "comments"];

pub struct CollaborationCollections;

#[async_trait]
impl Migration for CollaborationCollections {
    fn filename(&self) -> &'static str {
        "003_collaboration_collections"
    }

    fn source(&self) -> &'static str {
        include_str!("m003_collaboration_collections.rs")
    }

    async fn up(&self, db: &dyn DocumentStore) -> Result<()> {
        for collection in COLLECTIONS {
            db.create_collection(collection).await?;
        }
        Ok(())
    }

    async fn down(&self, db: &dyn DocumentStore) -> Result<()> {
        for collection in COLLECTIONS {
            db.drop_collection(collection).await?;
        }
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }
}
