//! Integration tests for the in-memory storage backend.
//!
//! These tests drive the backend through the `DbClient`/`CrudOperations`
//! contract only, the way the enhancement layers use it.

use std::sync::Arc;

use bastion_core::error::{Error, StorageError};
use bastion_core::meta::{FieldInfo, ModelInfo, ReferentialAction, UniqueConstraint};
use bastion_core::{run_in_transaction, DbClient, ModelMeta, TransactionOptions};
use bastion_memory::MemoryDatabase;
use serde_json::json;

fn blog_schema() -> ModelMeta {
    ModelMeta::new(vec![
        ModelInfo::new("User")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("email", "String").unique())
            .field(FieldInfo::relation("posts", "Post").array().back_link("author"))
            .field(FieldInfo::relation("profile", "Profile").optional().back_link("user")),
        ModelInfo::new("Profile")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("bio", "String"))
            .field(
                FieldInfo::relation("user", "User")
                    .owner(&[("id", "userId")])
                    .back_link("profile")
                    .on_delete(ReferentialAction::Cascade),
            )
            .field(FieldInfo::foreign_key("userId", "Int", "user").unique()),
        ModelInfo::new("Post")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("title", "String"))
            .field(FieldInfo::scalar("published", "Boolean").default_value(json!(false)))
            .field(FieldInfo::scalar("views", "Int").default_value(json!(0)))
            .field(FieldInfo::scalar("updatedAt", "DateTime").updated_at())
            .field(
                FieldInfo::relation("author", "User")
                    .optional()
                    .owner(&[("id", "authorId")])
                    .back_link("posts"),
            )
            .field(FieldInfo::foreign_key("authorId", "Int", "author").optional()),
        ModelInfo::new("Membership")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("orgId", "Int"))
            .field(FieldInfo::scalar("userId", "Int"))
            .unique(UniqueConstraint::over(&["orgId", "userId"])),
    ])
    .unwrap()
}

fn database() -> MemoryDatabase {
    MemoryDatabase::new(Arc::new(blog_schema()))
}

#[tokio::test]
async fn test_nested_create_and_include() {
    let db = database();
    let users = db.model("User").unwrap();

    let user = users
        .create(json!({
            "data": {
                "email": "a@x.io",
                "posts": {"create": [{"title": "one"}, {"title": "two", "published": true}]},
                "profile": {"create": {"bio": "hi"}}
            },
            "include": {"posts": {"where": {"published": true}}, "profile": true}
        }))
        .await
        .unwrap();

    assert_eq!(user["email"], "a@x.io");
    assert_eq!(user["posts"].as_array().unwrap().len(), 1);
    assert_eq!(user["posts"][0]["title"], "two");
    assert_eq!(user["profile"]["bio"], "hi");
    assert_eq!(user["profile"]["userId"], user["id"]);
    assert_eq!(db.row_count("Post").await, 2);
}

#[tokio::test]
async fn test_filters_and_pagination() {
    let db = database();
    let posts = db.model("Post").unwrap();
    for (title, views) in [("a", 5), ("b", 1), ("c", 9), ("d", 3)] {
        posts
            .create(json!({"data": {"title": title, "views": views}}))
            .await
            .unwrap();
    }

    let found = posts
        .find_many(json!({
            "where": {"views": {"gte": 3}},
            "orderBy": {"views": "desc"},
            "skip": 1,
            "take": 2,
            "select": {"title": true}
        }))
        .await
        .unwrap();
    assert_eq!(found, vec![json!({"title": "a"}), json!({"title": "d"})]);

    let first = posts
        .find_first(json!({"where": {"OR": [{"title": "zzz"}, {"views": 1}]}}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["title"], "b");

    let none = posts
        .find_unique(json!({"where": {"id": 999}}))
        .await
        .unwrap();
    assert!(none.is_none());

    let err = posts
        .find_unique_or_throw(json!({"where": {"id": 999}}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_relation_filters() {
    let db = database();
    let users = db.model("User").unwrap();
    users
        .create(json!({"data": {"email": "a@x.io", "posts": {"create": [{"title": "p", "published": true}]}}}))
        .await
        .unwrap();
    users
        .create(json!({"data": {"email": "b@x.io", "posts": {"create": [{"title": "q"}]}}}))
        .await
        .unwrap();
    users
        .create(json!({"data": {"email": "c@x.io"}}))
        .await
        .unwrap();

    let some = users
        .find_many(json!({"where": {"posts": {"some": {"published": true}}}}))
        .await
        .unwrap();
    assert_eq!(some.len(), 1);

    // An empty collection satisfies `every`
    let every = users
        .find_many(json!({"where": {"posts": {"every": {"published": true}}}}))
        .await
        .unwrap();
    assert_eq!(every.len(), 2);

    let none = users
        .find_many(json!({"where": {"posts": {"none": {}}}}))
        .await
        .unwrap();
    assert_eq!(none.len(), 1);

    let authored = db
        .model("Post")
        .unwrap()
        .find_many(json!({"where": {"author": {"is": {"email": "b@x.io"}}}}))
        .await
        .unwrap();
    assert_eq!(authored.len(), 1);
    assert_eq!(authored[0]["title"], "q");
}

#[tokio::test]
async fn test_nested_update_operations() {
    let db = database();
    let users = db.model("User").unwrap();
    let posts = db.model("Post").unwrap();

    let user = users
        .create(json!({"data": {"email": "a@x.io", "posts": {"create": [{"title": "one"}, {"title": "two"}]}}}))
        .await
        .unwrap();
    let loose = posts
        .create(json!({"data": {"title": "loose"}}))
        .await
        .unwrap();

    let updated = users
        .update(json!({
            "where": {"id": user["id"]},
            "data": {
                "posts": {
                    "connect": {"id": loose["id"]},
                    "updateMany": {"where": {"title": {"startsWith": "o"}}, "data": {"views": {"increment": 2}}},
                    "delete": {"title": "two"}
                }
            },
            "include": {"posts": {"orderBy": {"title": "asc"}}}
        }))
        .await
        .unwrap();

    let titles: Vec<&str> = updated["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["loose", "one"]);
    assert_eq!(updated["posts"][1]["views"], 2);

    let updated = users
        .update(json!({
            "where": {"id": user["id"]},
            "data": {"posts": {"set": []}},
            "include": {"posts": true}
        }))
        .await
        .unwrap();
    assert!(updated["posts"].as_array().unwrap().is_empty());
    assert_eq!(db.row_count("Post").await, 2);
}

#[tokio::test]
async fn test_referential_actions() {
    let db = database();
    let users = db.model("User").unwrap();
    let user = users
        .create(json!({"data": {
            "email": "a@x.io",
            "posts": {"create": {"title": "kept"}},
            "profile": {"create": {"bio": "gone"}}
        }}))
        .await
        .unwrap();

    users
        .delete(json!({"where": {"id": user["id"]}}))
        .await
        .unwrap();

    // Profile cascades, the optional post reference is cleared
    assert_eq!(db.row_count("Profile").await, 0);
    let rows = db.rows("Post").await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0]["authorId"].is_null());
}

#[tokio::test]
async fn test_unique_constraints() {
    let db = database();
    let users = db.model("User").unwrap();
    users
        .create(json!({"data": {"email": "a@x.io"}}))
        .await
        .unwrap();
    let err = users
        .create(json!({"data": {"email": "a@x.io"}}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Storage(StorageError::UniqueConstraint { .. })
    ));

    let memberships = db.model("Membership").unwrap();
    memberships
        .create(json!({"data": {"orgId": 1, "userId": 2}}))
        .await
        .unwrap();
    let found = memberships
        .find_unique(json!({"where": {"orgId_userId": {"orgId": 1, "userId": 2}}}))
        .await
        .unwrap();
    assert!(found.is_some());
}

#[tokio::test]
async fn test_aggregations() {
    let db = database();
    let posts = db.model("Post").unwrap();
    for (title, views, published) in [("a", 5, true), ("b", 1, false), ("c", 9, true)] {
        posts
            .create(json!({"data": {"title": title, "views": views, "published": published}}))
            .await
            .unwrap();
    }

    let count = posts
        .count(json!({"where": {"published": true}}))
        .await
        .unwrap();
    assert_eq!(count, json!(2));

    let agg = posts
        .aggregate(json!({"_count": true, "_sum": {"views": true}, "_max": {"views": true}}))
        .await
        .unwrap();
    assert_eq!(agg["_count"], 3);
    assert_eq!(agg["_sum"]["views"], 15);
    assert_eq!(agg["_max"]["views"], 9);

    let groups = posts
        .group_by(json!({"by": ["published"], "_count": true, "orderBy": {"published": "asc"}}))
        .await
        .unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["published"], false);
    assert_eq!(groups[1]["_count"], 2);
}

#[tokio::test]
async fn test_transaction_rollback_and_commit() {
    let db: Arc<dyn DbClient> = Arc::new(database());

    let result = run_in_transaction(&db, &TransactionOptions::default(), |tx| async move {
        tx.model("User")?
            .create(json!({"data": {"email": "a@x.io"}}))
            .await?;
        tx.model("User")?
            .create(json!({"data": {"email": "a@x.io"}}))
            .await
    })
    .await;
    assert!(result.is_err());
    let count = db.model("User").unwrap().count(json!({})).await.unwrap();
    assert_eq!(count, json!(0));

    run_in_transaction(&db, &TransactionOptions::default(), |tx| async move {
        tx.model("User")?
            .create(json!({"data": {"email": "b@x.io"}}))
            .await
    })
    .await
    .unwrap();
    let count = db.model("User").unwrap().count(json!({})).await.unwrap();
    assert_eq!(count, json!(1));
}

#[tokio::test]
async fn test_transaction_timeout() {
    let db: Arc<dyn DbClient> = Arc::new(database());
    let options = TransactionOptions {
        timeout_ms: Some(10),
        ..Default::default()
    };
    let result = run_in_transaction(&db, &options, |tx| async move {
        tx.model("User")?
            .create(json!({"data": {"email": "slow@x.io"}}))
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        Ok(json!(null))
    })
    .await;
    assert!(matches!(
        result,
        Err(Error::Storage(StorageError::Transaction(_)))
    ));
    let count = db.model("User").unwrap().count(json!({})).await.unwrap();
    assert_eq!(count, json!(0));
}
