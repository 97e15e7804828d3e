/*!
 * Fixture generators for seeds and tests
 * Documents are returned, not persisted
 */

use bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use chrono::{Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

const FIRST_NAMES: &[&str] = &["Ana", "Bruno", "Chen", "Dara", "Emeka", "Farah", "Goran", "Hana", "Ivo", "Jun"];
const LAST_NAMES: &[&str] = &["Silva", "Okafor", "Tanaka", "Novak", "Haddad", "Larsen", "Moreau", "Reyes"];
const DESTINATIONS: &[&str] = &[
    "Lisbon, Portugal",
    "Kyoto, Japan",
    "Oaxaca, Mexico",
    "Tbilisi, Georgia",
    "Cape Town, South Africa",
    "Hanoi, Vietnam",
    "Reykjavik, Iceland",
];
const STATUSES: &[&str] = &["planning", "booked", "in_progress", "completed"];
const CURRENCIES: &[&str] = &["USD", "EUR", "JPY", "GBP"];
const BUDGET_CATEGORIES: &[&str] = &["accommodation", "transport", "food", "activities"];

fn bson_date(at: chrono::DateTime<Utc>) -> DateTime {
    DateTime::from_millis(at.timestamp_millis())
}

/// `count` users with unique emails and usernames.
pub fn generate_test_users(count: usize) -> Vec<Document> {
    let mut rng = rand::thread_rng();
    let batch = &uuid::Uuid::new_v4().simple().to_string()[..8];

    (0..count)
        .map(|i| {
            let first = FIRST_NAMES.choose(&mut rng).copied().unwrap_or("Test");
            let last = LAST_NAMES.choose(&mut rng).copied().unwrap_or("User");
            let username = format!("{}.{}.{}{}", first, last, batch, i).to_lowercase();
            let joined = Utc::now() - Duration::days(rng.gen_range(1..=365));

            doc! {
                "_id": ObjectId::new(),
                "name": format!("{} {}", first, last),
                "email": format!("{}@example.com", username),
                "username": username,
                "preferences": {
                    "currency": CURRENCIES.choose(&mut rng).copied().unwrap_or("USD"),
                    "timezone": "UTC",
                    "emailNotifications": rng.gen_bool(0.7),
                },
                "createdAt": bson_date(joined),
            }
        })
        .collect()
}

/// `count` trips owned by and shared among `user_ids`. Empty when there are no users.
pub fn generate_test_trips(user_ids: &[String], count: usize) -> Vec<Document> {
    if user_ids.is_empty() {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();

    (0..count)
        .map(|_| {
            let owner = user_ids.choose(&mut rng).cloned().unwrap_or_default();
            let others: Vec<&String> = user_ids.iter().filter(|id| **id != owner).collect();
            let collaborator_count = rng.gen_range(0..=others.len().min(3));
            let collaborators: Vec<Bson> = others
                .choose_multiple(&mut rng, collaborator_count)
                .map(|id| Bson::String((*id).clone()))
                .collect();

            let start = Utc::now() + Duration::days(rng.gen_range(-90..=180));
            let end = start + Duration::days(rng.gen_range(1..=21));

            let mut breakdown = Document::new();
            let mut total: i64 = 0;
            for category in BUDGET_CATEGORIES {
                let amount: i64 = rng.gen_range(50..=2_000);
                total += amount;
                breakdown.insert(*category, amount);
            }

            let destination = DESTINATIONS.choose(&mut rng).copied().unwrap_or("Lisbon, Portugal");
            doc! {
                "_id": ObjectId::new(),
                "name": format!("Trip to {}", destination.split(',').next().unwrap_or(destination)),
                "destination": destination,
                "ownerId": owner,
                "collaborators": collaborators,
                "status": STATUSES.choose(&mut rng).copied().unwrap_or("planning"),
                "startDate": bson_date(start),
                "endDate": bson_date(end),
                "budget": {
                    "total": total,
                    "currency": CURRENCIES.choose(&mut rng).copied().unwrap_or("USD"),
                    "breakdown": breakdown,
                },
                "createdAt": bson_date(Utc::now()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_users_have_unique_emails() {
        let users = generate_test_users(25);
        let mut emails: Vec<&str> = users.iter().map(|u| u.get_str("email").unwrap()).collect();
        emails.sort();
        emails.dedup();
        assert_eq!(emails.len(), 25);
    }

    #[test]
    fn test_trips_are_internally_consistent() {
        let ids: Vec<String> = (0..5).map(|i| format!("user-{}", i)).collect();
        for trip in generate_test_trips(&ids, 50) {
            let budget = trip.get_document("budget").unwrap();
            let sum: i64 = budget
                .get_document("breakdown")
                .unwrap()
                .values()
                .map(|v| v.as_i64().unwrap())
                .sum();
            assert_eq!(sum, budget.get_i64("total").unwrap());

            assert!(trip.get_datetime("endDate").unwrap() > trip.get_datetime("startDate").unwrap());

            let owner = trip.get_str("ownerId").unwrap();
            assert!(ids.iter().any(|id| id == owner));
            for collaborator in trip.get_array("collaborators").unwrap() {
                let collaborator = collaborator.as_str().unwrap();
                assert_ne!(collaborator, owner);
                assert!(ids.iter().any(|id| id == collaborator));
            }
        }
    }

    #[test]
    fn test_no_trips_without_users() {
        assert!(generate_test_trips(&[], 3).is_empty());
    }
}
