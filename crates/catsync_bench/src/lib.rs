//! Benchmark utilities.

use catsync_core::{ChangeType, EntityId, FieldMap, FieldValue};
use catsync_engine::QueuedChange;
use rand::Rng;

/// Generates a product-shaped field map with `extra` additional text fields.
pub fn product_fields(extra: usize) -> FieldMap {
    let mut rng = rand::thread_rng();
    let mut fields = FieldMap::new();
    fields.insert("sku".into(), FieldValue::Text(format!("SKU-{}", rng.gen::<u32>())));
    fields.insert("title".into(), FieldValue::Text("Stoneware Mug".into()));
    fields.insert("price".into(), FieldValue::Float(rng.gen_range(1.0..500.0)));
    fields.insert("inventory_quantity".into(), FieldValue::Int(rng.gen_range(0..1_000)));
    fields.insert("_import_run".into(), FieldValue::Text("r-19".into()));
    for n in 0..extra {
        fields.insert(format!("attr_{n}"), FieldValue::Text(format!("value-{n}")));
    }
    fields
}

/// Returns a candidate that changes roughly `ratio` of the visible fields.
pub fn edited(fields: &FieldMap, ratio: f64) -> FieldMap {
    let mut rng = rand::thread_rng();
    fields
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| {
            let value = if rng.gen_bool(ratio) {
                match value {
                    FieldValue::Float(v) => FieldValue::Float(v * 1.1),
                    FieldValue::Int(v) => FieldValue::Int(v + 1),
                    FieldValue::Text(s) => FieldValue::Text(format!("{s}!")),
                    other => other.clone(),
                }
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

/// Generates queued changes with a mix of change types.
pub fn queued_changes(count: usize) -> Vec<QueuedChange> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| QueuedChange {
            change_id: catsync_core::ChangeId::new(),
            entity_id: EntityId::new(),
            change_type: match rng.gen_range(0..10) {
                0 => ChangeType::Create,
                1 => ChangeType::Delete,
                _ => ChangeType::Update,
            },
        })
        .collect()
}
