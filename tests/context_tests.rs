mod common;

use common::{ingest, key, nodes, policy, user_id};
use graphdao::prelude::*;
use graphdao::storage::PersistentStore;
use serde_json::json;
use std::collections::BTreeSet;
use tempfile::TempDir;

fn seeded() -> DataStack {
    let mut stack = common::stack();
    ingest(
        &mut stack,
        json!({
            "id": 1,
            "name": "Ann",
            "age": 30,
            "address": {"id": 100, "city": "Oslo"},
            "profiles": [{"id": 10}, {"id": 11}, {"id": 12}]
        }),
        "User",
    );
    stack
}

fn background(stack: &DataStack, policy: MergePolicy) -> ObjectContext {
    let mut ctx = stack.new_background_context();
    ctx.set_merge_policy(policy);
    ctx
}

#[test]
fn test_error_policy_rejects_stale_save() {
    let mut stack = seeded();
    let mut other = background(&stack, MergePolicy::Error);

    let view = stack.view_context();
    let user = user_id(view, 1);
    view.value(user, "name").unwrap();
    other.value(user, "name").unwrap();

    other.set_value(user, "name", "Bob").unwrap();
    other.save().unwrap();

    let view = stack.view_context();
    view.set_value(user, "age", 31).unwrap();
    assert!(matches!(
        view.save(),
        Err(DaoError::MergeConflict { ref entity, object }) if entity == "User" && object == user
    ));

    // A failed save keeps the pending change
    assert!(view.has_changes());
    assert_eq!(view.value(user, "age").unwrap(), Value::Integer(31));
    assert_eq!(stack.store().record(user).unwrap().unwrap().value("age"), &Value::Integer(30));
}

#[test]
fn test_property_object_trump_merges_changed_keys() {
    let mut stack = seeded();
    let mut other = background(&stack, MergePolicy::PropertyObjectTrump);
    stack
        .view_context()
        .set_merge_policy(MergePolicy::PropertyObjectTrump);

    let view = stack.view_context();
    let user = user_id(view, 1);
    view.set_value(user, "name", "From view").unwrap();
    view.set_value(user, "email", "ann@example.com").unwrap();

    other.set_value(user, "name", "From other").unwrap();
    other.set_value(user, "age", 40).unwrap();
    other.save().unwrap();

    stack.save_view().unwrap();

    let row = stack.store().record(user).unwrap().unwrap();
    assert_eq!(row.value("name"), &Value::from("From view"));
    assert_eq!(row.value("email"), &Value::from("ann@example.com"));
    assert_eq!(row.value("age"), &Value::Integer(40));

    let view = stack.view_context();
    assert_eq!(view.value(user, "age").unwrap(), Value::Integer(40));
    assert!(!view.has_changes());
}

#[test]
fn test_store_trump_keeps_committed_row() {
    let mut stack = seeded();
    let mut other = background(&stack, MergePolicy::Error);
    stack.view_context().set_merge_policy(MergePolicy::StoreTrump);

    let view = stack.view_context();
    let user = user_id(view, 1);
    view.set_value(user, "name", "Loser").unwrap();

    other.set_value(user, "name", "Winner").unwrap();
    other.save().unwrap();

    stack.save_view().unwrap();
    let view = stack.view_context();
    assert_eq!(view.value(user, "name").unwrap(), Value::from("Winner"));
    assert_eq!(
        stack.store().record(user).unwrap().unwrap().value("name"),
        &Value::from("Winner")
    );
}

fn upsert_into(ctx: &mut ObjectContext, document: serde_json::Value) {
    let policy = policy();
    JsonUpserter::new(&policy)
        .upsert(&mut Dao::new(ctx), &nodes(document), "User")
        .unwrap();
}

fn find(store: &PersistentStore, entity: &str, id: i64) -> ObjectId {
    let rows = store.rows().unwrap();
    rows.iter()
        .find(|(_, row)| row.entity == entity && row.value("id") == &Value::Integer(id))
        .map(|(object, _)| *object)
        .unwrap()
}

/// Every link in the store is matched by its inverse
fn assert_links_consistent(store: &PersistentStore) {
    let rows = store.rows().unwrap();
    for (id, row) in rows.iter() {
        match row.entity.as_str() {
            "User" => {
                for profile in row.to_many("profileSet") {
                    assert_eq!(rows[&profile].to_one("user"), Some(*id), "{profile}.user");
                }
                if let Some(address) = row.to_one("address") {
                    assert_eq!(rows[&address].to_one("resident"), Some(*id), "{address}.resident");
                }
            }
            "Profile" => {
                if let Some(user) = row.to_one("user") {
                    assert!(rows[&user].to_many("profileSet").contains(id), "{user}.profileSet");
                }
            }
            "Address" => {
                if let Some(user) = row.to_one("resident") {
                    assert_eq!(rows[&user].to_one("address"), Some(*id), "{user}.address");
                }
            }
            _ => {}
        }
    }
}

#[test]
fn test_concurrent_to_many_additions_both_land() {
    let mut stack = common::stack();
    ingest(&mut stack, json!({"id": 1, "profiles": [{"id": 10}]}), "User");
    let mut first = background(&stack, MergePolicy::PropertyObjectTrump);
    let mut second = background(&stack, MergePolicy::PropertyObjectTrump);

    upsert_into(&mut first, json!({"id": 1, "profiles": [{"id": 11}]}));
    upsert_into(&mut second, json!({"id": 1, "profiles": [{"id": 12}]}));
    first.save().unwrap();
    second.save().unwrap();

    let store = stack.store();
    let user = find(store, "User", 1);
    let expected: BTreeSet<ObjectId> = [10, 11, 12]
        .into_iter()
        .map(|id| find(store, "Profile", id))
        .collect();
    assert_eq!(store.record(user).unwrap().unwrap().to_many("profileSet"), expected);
    for profile in &expected {
        assert_eq!(store.record(*profile).unwrap().unwrap().to_one("user"), Some(user));
    }
    assert_links_consistent(store);

    // The later saver sees the merged set after its save
    assert_eq!(second.to_many(user, "profileSet").unwrap(), expected);
}

#[test]
fn test_concurrent_removal_and_addition_merge() {
    let mut stack = common::stack();
    ingest(&mut stack, json!({"id": 1, "profiles": [{"id": 10}, {"id": 11}]}), "User");
    let mut first = background(&stack, MergePolicy::PropertyObjectTrump);
    let mut second = background(&stack, MergePolicy::PropertyObjectTrump);

    let user = user_id(&mut first, 1);
    let ten = find(stack.store(), "Profile", 10);
    first.remove_from_many(user, "profileSet", ten).unwrap();
    upsert_into(&mut second, json!({"id": 1, "profiles": [{"id": 12}]}));
    first.save().unwrap();
    second.save().unwrap();

    let store = stack.store();
    let remaining: BTreeSet<ObjectId> = [11, 12]
        .into_iter()
        .map(|id| find(store, "Profile", id))
        .collect();
    assert_eq!(store.record(user).unwrap().unwrap().to_many("profileSet"), remaining);
    assert_eq!(store.record(ten).unwrap().unwrap().to_one("user"), None);
    assert_links_consistent(store);
}

#[test]
fn test_store_trump_still_links_new_children() {
    let mut stack = common::stack();
    ingest(&mut stack, json!({"id": 1, "name": "Ann", "profiles": [{"id": 10}]}), "User");
    let mut other = background(&stack, MergePolicy::Error);
    stack.view_context().set_merge_policy(MergePolicy::StoreTrump);

    upsert_into(
        stack.view_context(),
        json!({"id": 1, "name": "Loser", "profiles": [{"id": 12}]}),
    );
    let user = user_id(&mut other, 1);
    other.set_value(user, "name", "Winner").unwrap();
    other.save().unwrap();

    stack.save_view().unwrap();
    let store = stack.store();
    let row = store.record(user).unwrap().unwrap();
    assert_eq!(row.value("name"), &Value::from("Winner"));
    let child = find(store, "Profile", 12);
    assert!(row.to_many("profileSet").contains(&child));
    assert_eq!(store.record(child).unwrap().unwrap().to_one("user"), Some(user));
    assert_links_consistent(store);
}

#[test]
fn test_concurrent_to_one_moves_keep_inverses() {
    let mut stack = common::stack();
    ingest(
        &mut stack,
        json!([{"id": 1, "address": {"id": 100}}, {"id": 2}]),
        "User",
    );
    let mut first = background(&stack, MergePolicy::PropertyObjectTrump);
    let mut second = background(&stack, MergePolicy::PropertyObjectTrump);

    upsert_into(&mut first, json!({"id": 1, "address": {"id": 101}}));
    let ann = user_id(&mut second, 1);
    let bob = user_id(&mut second, 2);
    let old = second.to_one(ann, "address").unwrap().unwrap();
    second.set_to_one(bob, "address", Some(old)).unwrap();
    first.save().unwrap();
    second.save().unwrap();

    let store = stack.store();
    assert_eq!(store.record(bob).unwrap().unwrap().to_one("address"), Some(old));
    assert_eq!(store.record(old).unwrap().unwrap().to_one("resident"), Some(bob));
    assert_links_consistent(store);
}

#[test]
fn test_remote_changes_refresh_and_evict() {
    let mut stack = seeded();
    let mut other = stack.new_background_context();

    let view = stack.view_context();
    let user = user_id(view, 1);
    let address = view.to_one(user, "address").unwrap().unwrap();
    assert_eq!(view.value(address, "city").unwrap(), Value::from("Oslo"));

    other.set_value(user, "name", "Renamed").unwrap();
    other.delete(address).unwrap();
    other.save().unwrap();

    let view = stack.view_context();
    // Not merged yet: the registered copy is stale
    assert_eq!(view.value(user, "name").unwrap(), Value::from("Ann"));

    assert!(view.merge_remote_changes().unwrap() >= 1);
    assert_eq!(view.value(user, "name").unwrap(), Value::from("Renamed"));
    assert_eq!(view.to_one(user, "address").unwrap(), None);
    assert!(view.registered(address).is_none());
    assert!(matches!(
        view.value(address, "city"),
        Err(DaoError::ObjectNotFound(_))
    ));
}

#[test]
fn test_own_saves_are_not_merged_twice() {
    let mut stack = seeded();
    let view = stack.view_context();
    let user = user_id(view, 1);
    view.set_value(user, "age", 33).unwrap();
    stack.save_view().unwrap();

    assert_eq!(stack.view_context().merge_remote_changes().unwrap(), 0);
}

#[test]
fn test_dirty_objects_keep_pending_values_on_merge() {
    let mut stack = seeded();
    let mut other = stack.new_background_context();

    let view = stack.view_context();
    let user = user_id(view, 1);
    view.set_value(user, "age", 50).unwrap();

    other.set_value(user, "name", "Remote").unwrap();
    other.save().unwrap();

    let view = stack.view_context();
    view.merge_remote_changes().unwrap();
    assert_eq!(view.value(user, "age").unwrap(), Value::Integer(50));
    assert!(view.has_changes());
}

#[test]
fn test_batch_delete_propagates_to_other_contexts() {
    let mut stack = seeded();
    let mut other = stack.new_background_context();
    let user = user_id(&mut other, 1);
    assert_eq!(other.to_many(user, "profileSet").unwrap().len(), 3);

    let deleted = stack
        .view_context()
        .batch_delete("Profile", Some(&Predicate::gt("id", 10)))
        .unwrap();
    assert_eq!(deleted.len(), 2);

    let view = stack.view_context();
    assert_eq!(view.count("Profile", None).unwrap(), 1);
    assert_eq!(view.to_many(user, "profileSet").unwrap().len(), 1);
    assert_eq!(stack.store().count("Profile").unwrap(), 1);

    other.merge_remote_changes().unwrap();
    let remaining = other.to_many(user, "profileSet").unwrap();
    assert_eq!(remaining.len(), 1);
    let profile = *remaining.iter().next().unwrap();
    assert_eq!(other.value(profile, "id").unwrap(), Value::Integer(10));
}

#[test]
fn test_batch_delete_rebases_dirty_objects() {
    let mut stack = seeded();
    let view = stack.view_context();
    let user = user_id(view, 1);
    view.set_value(user, "age", 44).unwrap();

    view.batch_delete("Profile", None).unwrap();
    assert!(view.to_many(user, "profileSet").unwrap().is_empty());

    // The batch bumped the user row; the pending change still saves under Error
    stack.save_view().unwrap();
    let row = stack.store().record(user).unwrap().unwrap();
    assert_eq!(row.value("age"), &Value::Integer(44));
    assert!(row.to_many("profileSet").is_empty());
}

#[test]
fn test_lagging_context_refreshes_clean_objects() {
    let config = StackConfig::default().change_buffer(1);
    let mut stack = DataStack::open(config, common::catalog()).unwrap();
    ingest(&mut stack, json!({"id": 1, "name": "v0"}), "User");

    let mut other = stack.new_background_context();
    let user = user_id(&mut other, 1);
    assert_eq!(other.value(user, "name").unwrap(), Value::from("v0"));

    for round in 1..=3 {
        let view = stack.view_context();
        view.set_value(user, "name", format!("v{}", round)).unwrap();
        stack.save_view().unwrap();
    }

    assert!(other.merge_remote_changes().unwrap() >= 1);
    assert_eq!(other.value(user, "name").unwrap(), Value::from("v3"));
}

#[test]
fn test_binary_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data").join("graph.snapshot");
    let config = StackConfig::new(StoreKind::Binary(path.clone()));

    {
        let mut stack = DataStack::open(config.clone(), common::catalog()).unwrap();
        ingest(
            &mut stack,
            json!({"id": 1, "balance": "10.25", "profiles": [{"id": 10}], "tags": [{"label": "rust"}]}),
            "User",
        );
    }
    assert!(path.exists());

    let mut stack = DataStack::open(config, common::catalog()).unwrap();
    assert_eq!(stack.store().count("User").unwrap(), 1);
    assert_eq!(stack.store().count("Tag").unwrap(), 1);

    let view = stack.view_context();
    let user = user_id(view, 1);
    assert_eq!(
        view.value(user, "balance").unwrap(),
        Value::Decimal("10.25".parse().unwrap())
    );
    let profile = *view.to_many(user, "profileSet").unwrap().iter().next().unwrap();
    assert_eq!(view.to_one(profile, "user").unwrap(), Some(user));

    // New ids never collide with reloaded ones
    let fresh = view.insert("Tag").unwrap();
    assert!(fresh > user && fresh > profile);
}

#[test]
fn test_required_attribute_blocks_save() {
    let mut stack = common::stack();
    let view = stack.view_context();
    let user = view.insert("User").unwrap();
    view.set_value(user, "name", "No id").unwrap();

    assert!(matches!(
        view.save(),
        Err(DaoError::ConstraintViolation(_))
    ));
    assert!(view.has_changes());
    assert_eq!(stack.store().count("User").unwrap(), 0);

    let view = stack.view_context();
    view.set_value(user, "id", 9).unwrap();
    view.save().unwrap();
    assert_eq!(stack.store().count("User").unwrap(), 1);
}

#[test]
fn test_one_to_one_link_moves_between_owners() {
    let mut stack = common::stack();
    ingest(
        &mut stack,
        json!([
            {"id": 1, "address": {"id": 100}},
            {"id": 2}
        ]),
        "User",
    );

    let view = stack.view_context();
    let first = user_id(view, 1);
    let second = user_id(view, 2);
    let address = view.to_one(first, "address").unwrap().unwrap();

    view.set_to_one(second, "address", Some(address)).unwrap();
    assert_eq!(view.to_one(first, "address").unwrap(), None);
    assert_eq!(view.to_one(address, "resident").unwrap(), Some(second));

    stack.save_view().unwrap();
    let store = stack.store();
    assert_eq!(store.record(first).unwrap().unwrap().to_one("address"), None);
    assert_eq!(
        store.record(address).unwrap().unwrap().to_one("resident"),
        Some(second)
    );
}

#[test]
fn test_relationship_type_checks() {
    let mut stack = seeded();
    let view = stack.view_context();
    let user = user_id(view, 1);
    let address = view.to_one(user, "address").unwrap().unwrap();

    assert!(matches!(
        view.set_to_many(user, "profileSet", BTreeSet::from([address])),
        Err(DaoError::TypeMismatch(_))
    ));
    assert!(matches!(
        view.to_many(user, "address"),
        Err(DaoError::CardinalityMismatch { .. })
    ));
    assert!(matches!(
        view.to_one(user, "friends"),
        Err(DaoError::RelationshipNotFound { .. })
    ));
}

#[test]
fn test_rollback_discards_pending_work() {
    let mut stack = seeded();
    let view = stack.view_context();
    let user = user_id(view, 1);
    view.set_value(user, "name", "Draft").unwrap();
    let tag = view.insert("Tag").unwrap();

    view.rollback();
    assert!(!view.has_changes());
    assert_eq!(view.value(user, "name").unwrap(), Value::from("Ann"));
    assert!(matches!(view.value(tag, "label"), Err(DaoError::ObjectNotFound(_))));
}

#[test]
fn test_deleting_fetched_object_commits_removal() {
    let mut stack = seeded();
    let view = stack.view_context();
    let user = user_id(view, 1);
    let address = view.to_one(user, "address").unwrap().unwrap();

    view.delete(address).unwrap();
    assert_eq!(view.to_one(user, "address").unwrap(), None);
    assert!(matches!(view.value(address, "city"), Err(DaoError::ObjectDeleted(_))));
    assert_eq!(view.count("Address", None).unwrap(), 0);

    stack.save_view().unwrap();
    assert_eq!(stack.store().count("Address").unwrap(), 0);
    assert_eq!(stack.store().record(user).unwrap().unwrap().to_one("address"), None);
}

#[tokio::test]
async fn test_background_queue_sees_view_commits_after_merge() {
    let mut stack = seeded();
    let handle = stack.spawn_background_context();

    let user = handle
        .perform(|ctx| user_id(ctx, 1))
        .await
        .unwrap();

    let view = stack.view_context();
    view.set_value(user, "name", "Updated in view").unwrap();
    stack.save_view().unwrap();

    let name = handle
        .perform(move |ctx| {
            ctx.merge_remote_changes()?;
            ctx.value(user, "name")
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, Value::from("Updated in view"));
}

#[tokio::test]
async fn test_background_save_is_visible_in_store() {
    let stack = seeded();
    let handle = stack.spawn_background_context();

    let saved = handle
        .perform_dao(|dao| -> graphdao::Result<bool> {
            let (inserted, tag) = dao.create_or_fetch("Tag", &key("label", "async"))?;
            dao.context().set_value(tag, "label", "async")?;
            DataStack::save(dao.context())?;
            Ok(inserted)
        })
        .await
        .unwrap()
        .unwrap();

    assert!(saved);
    assert_eq!(stack.store().count("Tag").unwrap(), 1);
}
