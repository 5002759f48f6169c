#![allow(dead_code)]

use graphdao::prelude::*;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// User ->> Profile, User -> Address (one-to-one), User <<->> Tag
pub fn catalog() -> EntityCatalog {
    EntityCatalog::new()
        .with_entity(
            EntityDescriptor::new("User")
                .required("id", AttributeType::Integer)
                .attribute("name", AttributeType::Text)
                .attribute("email", AttributeType::Text)
                .attribute("age", AttributeType::Integer)
                .attribute("balance", AttributeType::Decimal)
                .to_many("profileSet", "Profile")
                .inverse("user")
                .to_one("address", "Address")
                .inverse("resident")
                .to_many("tags", "Tag")
                .inverse("users"),
        )
        .and_then(|c| {
            c.with_entity(
                EntityDescriptor::new("Profile")
                    .required("id", AttributeType::Integer)
                    .attribute("title", AttributeType::Text)
                    .to_one("user", "User")
                    .inverse("profileSet"),
            )
        })
        .and_then(|c| {
            c.with_entity(
                EntityDescriptor::new("Address")
                    .required("id", AttributeType::Integer)
                    .attribute("city", AttributeType::Text)
                    .to_one("resident", "User")
                    .inverse("address"),
            )
        })
        .and_then(|c| {
            c.with_entity(
                EntityDescriptor::new("Tag")
                    .required("label", AttributeType::Text)
                    .to_many("users", "User")
                    .inverse("tags"),
            )
        })
        .expect("fixture model is valid")
}

pub fn policy() -> PrimaryKeyTable {
    PrimaryKeyTable::new()
        .with_keys("User", ["id"])
        .with_keys("Profile", ["id"])
        .with_keys("Address", ["id"])
        .with_keys("Tag", ["label"])
        .with_rename("User", "profiles", "profileSet")
}

pub fn stack() -> DataStack {
    DataStack::in_memory(catalog()).expect("in-memory stack opens")
}

pub fn nodes(document: JsonValue) -> Vec<JsonNode> {
    match document {
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::Object(node) => node,
                other => panic!("fixture node is not an object: {}", other),
            })
            .collect(),
        JsonValue::Object(node) => vec![node],
        other => panic!("fixture document is not an object: {}", other),
    }
}

pub fn key(field: &str, value: impl Into<Value>) -> BTreeMap<String, Value> {
    let mut keys = BTreeMap::new();
    keys.insert(field.to_string(), value.into());
    keys
}

/// Upsert `document` as `root` into the view context and save it
pub fn ingest(stack: &mut DataStack, document: JsonValue, root: &str) -> Vec<ObjectId> {
    let policy = policy();
    let upserter = JsonUpserter::new(&policy);
    let ids = {
        let mut dao = Dao::new(stack.view_context());
        upserter
            .upsert(&mut dao, &nodes(document), root)
            .expect("fixture upsert succeeds")
    };
    stack.save_view().expect("fixture save succeeds");
    ids
}

pub fn user_id(ctx: &mut ObjectContext, id: i64) -> ObjectId {
    Dao::new(ctx)
        .fetch_by_unique_keys("User", &key("id", id))
        .unwrap()
        .expect("user exists")
}
