use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::{Client as MongoClient, Collection, Database};

use crate::modules::bots::BotDocument;
use crate::modules::errors::StoreError;
use crate::modules::types::{ActivityLog, BotKind, Trade, User};

// -------------------- Persistence Contract --------------------
// One collection per bot kind plus its trade/log streams:
//   users, {kind}_bots, {kind}_bot_trades, {kind}_bot_logs
// All writes are atomic at document level; nothing here spans documents.

pub const USERS_COLLECTION: &str = "users";

/// Atomic `$set`/`$inc` patch against one bot document. Field names are the
/// persisted (camelCase) names; paths stay top-level.
#[derive(Clone, Debug, Default)]
pub struct BotPatch {
    set: Document,
    inc: Document,
}

impl BotPatch {
    pub fn new() -> Self {
        BotPatch::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.set.insert(field, value.into());
        self
    }

    /// Stamp a timestamp field with the current wall clock.
    pub fn set_now(self, field: &str) -> Self {
        self.set(field, bson_now())
    }

    pub fn inc(mut self, field: &str, by: impl Into<Bson>) -> Self {
        self.inc.insert(field, by.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty()
    }

    fn into_update(self) -> Document {
        let mut update = Document::new();
        if !self.set.is_empty() {
            update.insert("$set", self.set);
        }
        if !self.inc.is_empty() {
            update.insert("$inc", self.inc);
        }
        update
    }
}

/// Current time in the representation bot documents persist timestamps in.
pub fn bson_now() -> Bson {
    Bson::String(Utc::now().to_rfc3339())
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Bots eligible for scheduling: `isActive && isRunning`.
    async fn list_active_bots<B: BotDocument>(&self) -> Result<Vec<B>, StoreError>;

    /// Race-free re-read before acting on a bot.
    async fn get_bot<B: BotDocument>(&self, id: &str) -> Result<Option<B>, StoreError>;

    async fn update_bot<B: BotDocument>(&self, id: &str, patch: BotPatch)
        -> Result<(), StoreError>;

    /// Compare-and-set a boolean field from false to true. Returns whether
    /// this caller won the transition.
    async fn claim_flag<B: BotDocument>(&self, id: &str, field: &str)
        -> Result<bool, StoreError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    async fn insert_trade(&self, kind: BotKind, trade: &Trade) -> Result<(), StoreError>;

    async fn insert_log(&self, kind: BotKind, log: &ActivityLog) -> Result<(), StoreError>;

    /// Remove a bot together with its persisted logs. Trades are kept as the
    /// immutable audit stream.
    async fn delete_bot<B: BotDocument>(&self, id: &str) -> Result<(), StoreError>;
}

// -------------------- MongoDB Backend --------------------

pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let client = MongoClient::with_uri_str(uri).await?;
        Ok(MongoStore {
            db: client.database(db_name),
        })
    }

    fn bots<B: BotDocument>(&self) -> Collection<B> {
        self.db.collection(&format!("{}_bots", B::KIND))
    }

    fn trades(&self, kind: BotKind) -> Collection<Document> {
        self.db.collection(&format!("{kind}_bot_trades"))
    }

    fn logs(&self, kind: BotKind) -> Collection<Document> {
        self.db.collection(&format!("{kind}_bot_logs"))
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn list_active_bots<B: BotDocument>(&self) -> Result<Vec<B>, StoreError> {
        let cursor = self
            .bots::<B>()
            .find(doc! { "isActive": true, "isRunning": true })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn get_bot<B: BotDocument>(&self, id: &str) -> Result<Option<B>, StoreError> {
        Ok(self.bots::<B>().find_one(doc! { "_id": id }).await?)
    }

    async fn update_bot<B: BotDocument>(
        &self,
        id: &str,
        patch: BotPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        self.bots::<B>()
            .update_one(doc! { "_id": id }, patch.into_update())
            .await?;
        Ok(())
    }

    async fn claim_flag<B: BotDocument>(
        &self,
        id: &str,
        field: &str,
    ) -> Result<bool, StoreError> {
        let claimed = self
            .bots::<B>()
            .find_one_and_update(
                doc! { "_id": id, field: false },
                doc! { "$set": { field: true } },
            )
            .await?;
        Ok(claimed.is_some())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .db
            .collection::<User>(USERS_COLLECTION)
            .find_one(doc! { "_id": user_id })
            .await?)
    }

    async fn insert_trade(&self, kind: BotKind, trade: &Trade) -> Result<(), StoreError> {
        let document = bson::to_document(trade)?;
        self.trades(kind).insert_one(document).await?;
        Ok(())
    }

    async fn insert_log(&self, kind: BotKind, log: &ActivityLog) -> Result<(), StoreError> {
        let document = bson::to_document(log)?;
        self.logs(kind).insert_one(document).await?;
        Ok(())
    }

    async fn delete_bot<B: BotDocument>(&self, id: &str) -> Result<(), StoreError> {
        self.bots::<B>().delete_one(doc! { "_id": id }).await?;
        self.logs(B::KIND)
            .delete_many(doc! { "botId": id })
            .await?;
        Ok(())
    }
}

// -------------------- In-Memory Backend (tests) --------------------


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::modules::bots::{BuyWallBot, BuyWallLevel};
    use chrono::Utc;

    fn wall_bot(id: &str) -> BuyWallBot {
        BuyWallBot {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: "wall".to_string(),
            symbol: "GCBUSDT".to_string(),
            is_active: true,
            is_running: true,
            target_price: 0.03,
            buy_orders: vec![BuyWallLevel {
                price: 0.02,
                usdt_amount: 50.0,
            }],
            orders_placed: false,
            placed_orders: Vec::new(),
            total_refills: 0,
            last_checked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn list_active_filters_switches() {
        let store = MemoryStore::new();
        store.put_bot(&wall_bot("b1"));
        let mut paused = wall_bot("b2");
        paused.is_running = false;
        store.put_bot(&paused);

        let bots: Vec<BuyWallBot> = store.list_active_bots().await.unwrap();
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].id, "b1");
    }

    #[tokio::test]
    async fn patch_sets_and_increments() {
        let store = MemoryStore::new();
        store.put_bot(&wall_bot("b1"));

        let patch = BotPatch::new()
            .set("ordersPlaced", true)
            .inc("totalRefills", 2i64)
            .set_now("lastCheckedAt");
        store.update_bot::<BuyWallBot>("b1", patch).await.unwrap();
        store
            .update_bot::<BuyWallBot>("b1", BotPatch::new().inc("totalRefills", 1i64))
            .await
            .unwrap();

        let bot: BuyWallBot = store.get_bot("b1").await.unwrap().unwrap();
        assert!(bot.orders_placed);
        assert_eq!(bot.total_refills, 3);
        assert!(bot.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn claim_flag_has_single_winner() {
        let store = MemoryStore::new();
        store.put_bot(&wall_bot("b1"));

        let first = store
            .claim_flag::<BuyWallBot>("b1", "ordersPlaced")
            .await
            .unwrap();
        let second = store
            .claim_flag::<BuyWallBot>("b1", "ordersPlaced")
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn delete_cascades_logs_only_for_that_bot() {
        let store = MemoryStore::new();
        store.put_bot(&wall_bot("b1"));
        store.put_bot(&wall_bot("b2"));
        store
            .insert_log(
                BotKind::BuyWall,
                &ActivityLog::new("b1", crate::modules::types::LogLevel::Info, "placed", serde_json::Value::Null),
            )
            .await
            .unwrap();
        store
            .insert_log(
                BotKind::BuyWall,
                &ActivityLog::new("b2", crate::modules::types::LogLevel::Info, "placed", serde_json::Value::Null),
            )
            .await
            .unwrap();

        store.delete_bot::<BuyWallBot>("b1").await.unwrap();
        assert!(store.get_bot::<BuyWallBot>("b1").await.unwrap().is_none());
        let logs = store.logs.lock();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].1.bot_id, "b2");
    }

    #[test]
    fn empty_patch_produces_no_update() {
        assert!(BotPatch::new().is_empty());
        assert!(!BotPatch::new().set("a", 1i32).is_empty());
    }
}
