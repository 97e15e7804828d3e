use crate::error::Result;
use crate::migration::Migration;
use crate::store::DocumentStore;
use async_trait::async_trait;
use bson::doc;
use tracing::info;

/// Backfills `preferences` on users created before the field existed.
/// Users who later edit their preferences cannot be told apart, so there is
/// no down migration.
pub struct UserPreferenceDefaults;

#[async_trait]
impl Migration for UserPreferenceDefaults {
    fn filename(&self) -> &'static str {
        "002_user_preference_defaults"
    }

    fn source(&self) -> &'static str {
        include_str!("m002_user_preference_defaults.rs")
    }

    async fn up(&self, db: &dyn DocumentStore) -> Result<()> {
        let updated = db
            .update_many(
                "users",
                &doc! { "preferences": { "$exists": false } },
                &doc! {
                    "preferences": {
                        "currency": "USD",
                        "timezone": "UTC",
                        "emailNotifications": true,
                    }
                },
            )
            .await?;
        info!("Backfilled preferences for {} user(s)", updated);
        Ok(())
    }
}
