use super::Seed;
use crate::error::Result;
use crate::store::DocumentStore;
use async_trait::async_trait;
use bson::{doc, oid::ObjectId, DateTime};
use chrono::{Duration, Utc};
use tracing::info;

const DEMO_EMAIL: &str = "demo@tripplanner.dev";

/// A single hand-written trip with itinerary and expenses for local demos.
pub struct DemoShowcase;

#[async_trait]
impl Seed for DemoShowcase {
    fn filename(&self) -> &'static str {
        "003_demo_showcase"
    }

    fn environments(&self) -> &'static [&'static str] {
        &["development"]
    }

    async fn seed(&self, db: &dyn DocumentStore) -> Result<()> {
        if db.count_documents("users", &doc! { "email": DEMO_EMAIL }).await? > 0 {
            info!("Demo showcase already present, skipping");
            return Ok(());
        }

        let user_id = ObjectId::new();
        let trip_id = ObjectId::new();
        let start = Utc::now() + Duration::days(30);
        let at = |days: i64| DateTime::from_millis((start + Duration::days(days)).timestamp_millis());

        db.insert_one(
            "users",
            doc! {
                "_id": user_id,
                "name": "Demo Traveller",
                "email": DEMO_EMAIL,
                "username": "demo",
                "preferences": { "currency": "EUR", "timezone": "Europe/Lisbon", "emailNotifications": false },
                "createdAt": DateTime::now(),
            },
        )
        .await?;

        db.insert_one(
            "trips",
            doc! {
                "_id": trip_id,
                "name": "Lisbon long weekend",
                "destination": "Lisbon, Portugal",
                "ownerId": user_id.to_hex(),
                "collaborators": [],
                "status": "booked",
                "startDate": at(0),
                "endDate": at(3),
                "budget": {
                    "total": 1200,
                    "currency": "EUR",
                    "breakdown": { "accommodation": 600, "transport": 250, "food": 250, "activities": 100 },
                },
                "createdAt": DateTime::now(),
            },
        )
        .await?;

        let trip = trip_id.to_hex();
        db.insert_many(
            "itineraries",
            vec![
                doc! { "tripId": trip.as_str(), "day": 1, "title": "Alfama walk and fado", "date": at(0) },
                doc! { "tripId": trip.as_str(), "day": 2, "title": "Sintra day trip", "date": at(1) },
                doc! { "tripId": trip.as_str(), "day": 3, "title": "Belém and pastéis", "date": at(2) },
            ],
        )
        .await?;

        db.insert_many(
            "expenses",
            vec![
                doc! { "tripId": trip.as_str(), "paidBy": user_id.to_hex(), "category": "accommodation", "amount": 600, "date": at(0) },
                doc! { "tripId": trip.as_str(), "paidBy": user_id.to_hex(), "category": "transport", "amount": 180, "date": at(1) },
            ],
        )
        .await?;

        info!("Inserted demo showcase trip {}", trip);
        Ok(())
    }
}
