//! Property-based test generators using proptest.

use catsync_core::{Entity, EntityId, FieldMap, FieldValue, Priority};
use proptest::prelude::*;

/// Visible field names drawn from a small pool so candidates overlap
/// with entities often.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["title", "price", "sku", "inventory", "vendor", "status"])
        .prop_map(str::to_string)
}

/// Internal bookkeeping field names.
pub fn internal_field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("_[a-z]{1,8}").expect("valid regex")
}

/// Non-null field values with finite floats.
pub fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        any::<bool>().prop_map(FieldValue::Bool),
        (-10_000i64..10_000).prop_map(FieldValue::Int),
        (0.0f64..10_000.0).prop_map(FieldValue::Float),
        "[A-Za-z0-9 ]{0,16}".prop_map(FieldValue::Text),
    ]
}

/// Field maps mixing visible and internal fields.
pub fn field_map_strategy() -> impl Strategy<Value = FieldMap> {
    (
        prop::collection::btree_map(field_name_strategy(), field_value_strategy(), 0..6),
        prop::collection::btree_map(internal_field_name_strategy(), field_value_strategy(), 0..2),
    )
        .prop_map(|(mut visible, internal)| {
            visible.extend(internal);
            visible
        })
}

/// Partial candidates; some values are `Null` to remove fields.
pub fn candidate_strategy() -> impl Strategy<Value = FieldMap> {
    prop::collection::btree_map(
        field_name_strategy(),
        prop_oneof![
            4 => field_value_strategy(),
            1 => Just(FieldValue::Null),
        ],
        0..5,
    )
}

/// Any priority.
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop::sample::select(Priority::ALL.to_vec())
}

/// Synced entities at an arbitrary version.
pub fn synced_entity_strategy() -> impl Strategy<Value = Entity> {
    (field_map_strategy(), 1u64..50, 0u32..1_000).prop_map(|(fields, version, n)| {
        Entity::new(EntityId::new(), fields)
            .with_external_id(format!("gid://prop/Product/{n}"))
            .with_version(version)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::{is_visible, validate_fields};

    proptest! {
        #[test]
        fn generated_maps_are_valid(fields in field_map_strategy()) {
            prop_assert!(validate_fields(&fields).is_ok());
        }

        #[test]
        fn candidates_only_touch_visible_fields(candidate in candidate_strategy()) {
            prop_assert!(candidate.keys().all(|k| is_visible(k)));
        }
    }
}
