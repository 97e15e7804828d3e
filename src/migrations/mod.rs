/*!
 * Compiled-in migration registry
 * New units are generated by `db-migrate create` and listed here in version order
 */

mod m001_core_collections;
mod m002_user_preference_defaults;
mod m003_collaboration_collections;

use crate::migration::Migration;
use std::sync::Arc;

pub fn registry() -> Vec<Arc<dyn Migration>> {
    vec![
        Arc::new(m001_core_collections::CoreCollections),
        Arc::new(m002_user_preference_defaults::UserPreferenceDefaults),
        Arc::new(m003_collaboration_collections::CollaborationCollections),
    ]
}
