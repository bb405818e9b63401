use rand::Rng;
use serde::{Deserialize, Serialize};

/// The payload delivered to the work queue. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Car {
    pub normalized_make: String,
    pub normalized_model: String,
    pub year: i64,
    pub price: f64,
    pub location: String,
}

/// (make, models) pairs the generator draws from. Makes and models are stored
/// pre-normalized (lowercase) so no normalization pass is needed downstream.
const CATALOG: &[(&str, &[&str])] = &[
    ("toyota", &["corolla", "camry", "rav4", "hilux", "yaris"]),
    ("volkswagen", &["golf", "passat", "tiguan", "polo", "arteon"]),
    ("ford", &["focus", "fiesta", "mustang", "kuga", "ranger"]),
    ("bmw", &["318i", "320d", "530e", "x3", "x5"]),
    ("mercedes-benz", &["a180", "c200", "e220", "glc", "gla"]),
    ("audi", &["a3", "a4", "a6", "q3", "q5"]),
    ("honda", &["civic", "accord", "cr-v", "jazz", "hr-v"]),
    ("hyundai", &["i20", "i30", "tucson", "kona", "santa fe"]),
    ("skoda", &["octavia", "fabia", "superb", "kodiaq", "karoq"]),
    ("volvo", &["v60", "s90", "xc40", "xc60", "xc90"]),
];

const LOCATIONS: &[&str] = &[
    "tallinn", "tartu", "parnu", "narva", "riga", "vilnius", "helsinki",
    "stockholm", "warsaw", "berlin",
];

impl Car {
    /// Builds a random car record from the fixed catalog.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let (make, models) = CATALOG[rng.gen_range(0..CATALOG.len())];
        let model = models[rng.gen_range(0..models.len())];
        // Price is drawn in cents to keep it representable exactly.
        let price_cents: i64 = rng.gen_range(500_000..=8_000_000);
        Car {
            normalized_make: make.to_string(),
            normalized_model: model.to_string(),
            year: rng.gen_range(2000..=2024),
            price: price_cents as f64 / 100.0,
            location: LOCATIONS[rng.gen_range(0..LOCATIONS.len())].to_string(),
        }
    }
}
