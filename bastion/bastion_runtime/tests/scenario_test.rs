//! End-to-end scenarios through every enhancement layer.

use std::sync::{Arc, Once};

use bastion_core::error::{ErrorKind, PolicyError};
use bastion_core::meta::{FieldInfo, ModelInfo};
use bastion_core::utils::logging::LogLevel;
use bastion_core::{DbClient, Error, ModelMeta, PolicyOperation, QueryContext, TransactionOptions};
use bastion_memory::MemoryDatabase;
use bastion_policy::{GuardContext, ModelPolicy, PermissionChecker, PolicyDef};
use bastion_runtime::{enhance, init_logging, EnhancedClient, EnhancementConfig, EnhancementKind, LoggingConfig};
use futures::FutureExt;
use serde_json::{json, Value};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        init_logging(&LoggingConfig {
            level: LogLevel::Debug,
            ansi: false,
        });
    });
}

fn schema() -> ModelMeta {
    ModelMeta::new(vec![
        ModelInfo::new("User")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("email", "String").unique())
            .field(FieldInfo::relation("posts", "Post").array().back_link("author"))
            .field(FieldInfo::relation("assets", "Asset").array().back_link("owner")),
        ModelInfo::new("Post")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("title", "String"))
            .field(FieldInfo::scalar("published", "Boolean").default_value(json!(false)))
            .field(
                FieldInfo::relation("author", "User")
                    .optional()
                    .owner(&[("id", "authorId")])
                    .back_link("posts"),
            )
            .field(FieldInfo::foreign_key("authorId", "Int", "author").optional()),
        ModelInfo::new("Asset")
            .delegate("assetType")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("assetType", "String"))
            .field(FieldInfo::scalar("updatedAt", "DateTime").updated_at())
            .field(
                FieldInfo::relation("owner", "User")
                    .optional()
                    .owner(&[("id", "ownerId")])
                    .back_link("assets"),
            )
            .field(FieldInfo::foreign_key("ownerId", "Int", "owner").optional()),
        ModelInfo::new("Video")
            .extends("Asset")
            .discriminated_by("videoType")
            .field(FieldInfo::scalar("id", "Int").id())
            .field(FieldInfo::scalar("duration", "Int"))
            .field(FieldInfo::scalar("videoType", "String")),
        ModelInfo::new("RatedVideo")
            .extends("Video")
            .field(FieldInfo::scalar("id", "Int").id())
            .field(FieldInfo::scalar("rating", "Int")),
    ])
    .unwrap()
    .with_auth_model("User")
}

fn owned_by(field: &'static str) -> impl Fn(&GuardContext<'_>) -> Value + Send + Sync + 'static {
    move |ctx| {
        if ctx.user.is_authenticated() {
            json!({ field: ctx.user_field("id") })
        } else {
            json!(false)
        }
    }
}

fn owned_asset() -> ModelPolicy {
    ModelPolicy::new()
        .guard(PolicyOperation::Read, owned_by("ownerId"))
        .guard(PolicyOperation::Create, owned_by("ownerId"))
        .guard(PolicyOperation::Update, owned_by("ownerId"))
        .guard(PolicyOperation::Delete, owned_by("ownerId"))
}

fn policy() -> PolicyDef {
    PolicyDef::new()
        .model(
            "User",
            ModelPolicy::new()
                .allow(PolicyOperation::Read)
                .allow(PolicyOperation::Create),
        )
        .model(
            "Post",
            ModelPolicy::new()
                .guard(PolicyOperation::Read, |ctx| {
                    if ctx.user.is_authenticated() {
                        json!({ "OR": [{ "published": true }, { "authorId": ctx.user_field("id") }] })
                    } else {
                        json!({ "published": true })
                    }
                })
                .guard(PolicyOperation::Create, owned_by("authorId"))
                .guard(PolicyOperation::Update, owned_by("authorId"))
                .guard(PolicyOperation::Delete, owned_by("authorId"))
                .checker(PolicyOperation::Read, PermissionChecker::Constant(true)),
        )
        .model("Asset", owned_asset())
        .model("Video", owned_asset())
        .model("RatedVideo", owned_asset())
}

struct Fixture {
    meta: Arc<ModelMeta>,
    policy: Arc<PolicyDef>,
    db: MemoryDatabase,
}

impl Fixture {
    async fn new() -> Self {
        init_tracing();
        let meta = Arc::new(schema());
        let db = MemoryDatabase::new(meta.clone());
        let users = db.model("User").unwrap();
        for email in ["u1@x.io", "u2@x.io"] {
            users.create(json!({ "data": { "email": email } })).await.unwrap();
        }
        Self {
            meta,
            policy: Arc::new(policy()),
            db,
        }
    }

    fn client(&self, context: QueryContext, config: &EnhancementConfig) -> EnhancedClient {
        enhance(
            Arc::new(self.db.clone()),
            self.meta.clone(),
            self.policy.clone(),
            context,
            config,
        )
    }

    fn as_user(&self, id: i64) -> EnhancedClient {
        let config = EnhancementConfig {
            log_queries: true,
            ..Default::default()
        };
        self.client(
            QueryContext::for_user(json!({ "id": id }), &self.meta).unwrap(),
            &config,
        )
    }

    fn anonymous(&self) -> EnhancedClient {
        self.client(QueryContext::anonymous(), &EnhancementConfig::default())
    }

    async fn level_counts(&self) -> (usize, usize, usize) {
        (
            self.db.row_count("Asset").await,
            self.db.row_count("Video").await,
            self.db.row_count("RatedVideo").await,
        )
    }
}

#[tokio::test]
async fn test_post_lifecycle() {
    let fx = Fixture::new().await;
    let u1 = fx.as_user(1);
    let u2 = fx.as_user(2);
    let anon = fx.anonymous();
    assert_eq!(u1.kinds(), &[EnhancementKind::Policy, EnhancementKind::Delegate]);

    let post = u1
        .model("Post")
        .unwrap()
        .create(json!({ "data": { "title": "draft", "author": { "connect": { "id": 1 } } } }))
        .await
        .unwrap();
    assert_eq!(post["authorId"], json!(1));
    assert!(anon.model("Post").unwrap().find_many(json!({})).await.unwrap().is_empty());

    let err = u2
        .model("Post")
        .unwrap()
        .update(json!({ "where": { "id": post["id"] }, "data": { "title": "stolen" } }))
        .await
        .unwrap_err();
    assert!(err.is_denied());

    u1.model("Post")
        .unwrap()
        .update(json!({ "where": { "id": post["id"] }, "data": { "published": true } }))
        .await
        .unwrap();
    let public = anon.model("Post").unwrap().find_many(json!({})).await.unwrap();
    assert_eq!(public.len(), 1);

    let err = u2
        .model("Post")
        .unwrap()
        .delete(json!({ "where": { "id": post["id"] } }))
        .await
        .unwrap_err();
    assert!(err.is_denied());
    let deleted = u1
        .model("Post")
        .unwrap()
        .delete(json!({ "where": { "id": post["id"] } }))
        .await
        .unwrap();
    assert_eq!(deleted["title"], json!("draft"));
    assert_eq!(fx.db.row_count("Post").await, 0);
}

#[tokio::test]
async fn test_hierarchy_under_policies() {
    let fx = Fixture::new().await;
    let u1 = fx.as_user(1);
    let u2 = fx.as_user(2);

    let created = u1
        .model("RatedVideo")
        .unwrap()
        .create(json!({ "data": { "duration": 100, "rating": 5, "ownerId": 1 } }))
        .await
        .unwrap();
    assert_eq!(created["duration"], json!(100));
    assert_eq!(created["rating"], json!(5));
    assert_eq!(created["assetType"], json!("Video"));
    assert_eq!(created["videoType"], json!("RatedVideo"));
    assert!(created.get("_txTag").is_none());
    assert!(created.get("delegate_aux_video").is_none());
    assert_eq!(fx.level_counts().await, (1, 1, 1));

    let asset = u1
        .model("Asset")
        .unwrap()
        .find_first(json!({ "where": { "id": created["id"] } }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(asset["rating"], json!(5));
    assert_eq!(asset["duration"], json!(100));

    // Guards on inherited fields apply to every level
    assert!(u2.model("RatedVideo").unwrap().find_many(json!({})).await.unwrap().is_empty());
    assert!(u2.model("Asset").unwrap().find_many(json!({})).await.unwrap().is_empty());

    let err = u2
        .model("RatedVideo")
        .unwrap()
        .create(json!({ "data": { "duration": 1, "rating": 1, "ownerId": 1 } }))
        .await
        .unwrap_err();
    assert!(err.is_denied());
    assert_eq!(fx.level_counts().await, (1, 1, 1));

    let err = u2
        .model("RatedVideo")
        .unwrap()
        .update(json!({ "where": { "id": created["id"] }, "data": { "duration": 1 } }))
        .await
        .unwrap_err();
    assert!(err.is_denied());

    let updated = u1
        .model("RatedVideo")
        .unwrap()
        .update(json!({ "where": { "id": created["id"] }, "data": { "duration": 90 } }))
        .await
        .unwrap();
    assert_eq!(updated["duration"], json!(90));

    let err = u1
        .model("Asset")
        .unwrap()
        .create(json!({ "data": { "ownerId": 1 } }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);

    u1.model("RatedVideo")
        .unwrap()
        .delete(json!({ "where": { "id": created["id"] } }))
        .await
        .unwrap();
    assert_eq!(fx.level_counts().await, (0, 0, 0));
}

#[tokio::test]
async fn test_transaction_spans_layers() {
    let fx = Fixture::new().await;
    let u1 = fx.as_user(1);

    let result = u1
        .transaction(
            TransactionOptions::default(),
            Box::new(|tx| {
                async move {
                    tx.model("Video")?
                        .create(json!({ "data": { "duration": 3, "ownerId": 1 } }))
                        .await?;
                    tx.model("Video")?
                        .create(json!({ "data": { "duration": 4, "ownerId": 2 } }))
                        .await
                }
                .boxed()
            }),
        )
        .await;
    assert!(matches!(result, Err(Error::Policy(PolicyError::Denied { .. }))));
    assert_eq!(fx.level_counts().await, (0, 0, 0));
}

#[tokio::test]
async fn test_permission_checks() {
    let fx = Fixture::new().await;
    let u1 = fx.as_user(1);
    assert!(u1.check("Post", PolicyOperation::Read, None).unwrap());

    let err = u1.check("Post", PolicyOperation::Create, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);

    let config = EnhancementConfig {
        kinds: vec![EnhancementKind::Delegate],
        ..Default::default()
    };
    let raw = fx.client(QueryContext::anonymous(), &config);
    assert_eq!(raw.kinds(), &[EnhancementKind::Delegate]);
    assert!(matches!(
        raw.check("Post", PolicyOperation::Read, None),
        Err(Error::Config(_))
    ));

    // Without policies every row is visible
    fx.db
        .model("Post")
        .unwrap()
        .create(json!({ "data": { "title": "hidden", "authorId": 2 } }))
        .await
        .unwrap();
    assert_eq!(raw.model("Post").unwrap().find_many(json!({})).await.unwrap().len(), 1);
    assert!(fx.anonymous().model("Post").unwrap().find_many(json!({})).await.unwrap().is_empty());
}
