//! Property tests for query evaluation.

use perch_engine::{Model, Params, Record, Store, StoreConfig};
use proptest::prelude::*;
use serde_json::{json, Value};

fn populated(rows: &[(u8, bool)]) -> Store {
    let mut store = Store::new(StoreConfig::new("rows", Model::new("Row")));
    for (i, (score, flag)) in rows.iter().enumerate() {
        store.add_or_update(
            Record::from_value(json!({"id": i, "score": score, "flag": flag})).unwrap(),
        );
    }
    store
}

fn ids(records: &[Record]) -> Vec<Value> {
    records
        .iter()
        .map(|r| r.field("id").cloned().unwrap_or(Value::Null))
        .collect()
}

proptest! {
    #[test]
    fn filtering_is_idempotent(rows in prop::collection::vec((0u8..10, any::<bool>()), 0..40), pivot in 0u8..10) {
        let store = populated(&rows);
        let params = Params::from_query(json!({"score": {"$gte": pivot}, "$sort": {"score": -1}}));

        let first = store.find_in_store(&params).unwrap();

        // Feed the result back through the same query
        let mut again = Store::new(StoreConfig::new("rows", Model::new("Row")));
        for record in &first.data {
            again.add_or_update(record.clone());
        }
        let second = again.find_in_store(&params).unwrap();

        prop_assert_eq!(first.total, second.total);
        prop_assert_eq!(ids(&first.data), ids(&second.data));
    }

    #[test]
    fn count_ignores_limit_and_skip(
        rows in prop::collection::vec((0u8..10, any::<bool>()), 0..40),
        limit in 0usize..20,
        skip in 0usize..20,
    ) {
        let store = populated(&rows);
        let bare = Params::from_query(json!({"flag": true}));
        let paged = Params::from_query(json!({"flag": true, "$limit": limit, "$skip": skip}));

        let expected = rows.iter().filter(|(_, flag)| *flag).count();
        prop_assert_eq!(store.count_in_store(&bare).unwrap(), expected);
        prop_assert_eq!(store.count_in_store(&paged).unwrap(), expected);
        prop_assert_eq!(store.find_in_store(&paged).unwrap().total, expected);
    }

    #[test]
    fn page_size_is_bounded(
        rows in prop::collection::vec((0u8..10, any::<bool>()), 0..40),
        limit in 0usize..20,
        skip in 0usize..50,
    ) {
        let store = populated(&rows);
        let result = store
            .find_in_store(&Params::from_query(json!({"$limit": limit, "$skip": skip})))
            .unwrap();

        prop_assert_eq!(result.total, rows.len());
        prop_assert_eq!(result.data.len(), rows.len().saturating_sub(skip).min(limit));
    }

    #[test]
    fn sort_output_is_ordered(rows in prop::collection::vec((0u8..10, any::<bool>()), 0..40)) {
        let store = populated(&rows);
        let result = store
            .find_in_store(&Params::from_query(json!({"$sort": {"score": 1}})))
            .unwrap();

        let scores: Vec<u64> = result
            .data
            .iter()
            .filter_map(|r| r.field("score").and_then(Value::as_u64))
            .collect();
        prop_assert!(scores.windows(2).all(|w| w[0] <= w[1]));
    }
}
