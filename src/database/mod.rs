use std::net::SocketAddr;

use bson::{Document, doc};
use futures_util::TryStreamExt;
use mongodb::{
    Client, Collection,
    options::{ClientOptions, FindOneOptions, FindOptions, UpdateOptions},
};
use tracing::info;

use crate::epoch_now;

pub const DATABASE_NAME: &str = "mc";
pub const SERVERS_COLLECTION: &str = "servers";

/// Handle on the document store. Cheap to clone; the driver pools
/// connections internally.
#[derive(Clone)]
pub struct Database {
    pub client: Client,
}

/// Filter/sort/page parameters for the catalog list query. The sort field
/// is whitelisted by the API layer before it gets here.
pub struct ServerQuery {
    pub filter: Document,
    pub projection: Document,
    pub sort_field: String,
    pub descending: bool,
    pub limit: i64,
    pub offset: u64,
}

impl Database {
    /// Connect and ping so a bad URI fails at startup instead of on the
    /// first probe.
    pub async fn connect(uri: &str) -> eyre::Result<Self> {
        let database = Self::connect_lazy(uri).await?;
        database
            .client
            .database(DATABASE_NAME)
            .run_command(doc! { "ping": 1 })
            .await?;
        info!("MongoDB connection: OK (database: {DATABASE_NAME}, collection: {SERVERS_COLLECTION})");
        Ok(database)
    }

    /// Build a handle without checking that the server is reachable.
    pub async fn connect_lazy(uri: &str) -> eyre::Result<Self> {
        let options = ClientOptions::parse(uri).await?;
        Ok(Self {
            client: Client::with_options(options)?,
        })
    }

    pub fn servers(&self) -> Collection<Document> {
        self.client
            .database(DATABASE_NAME)
            .collection(SERVERS_COLLECTION)
    }

    /// Upsert one probe observation, keyed by `host`. Returns true when the
    /// server wasn't in the catalog before.
    pub async fn upsert_server(&self, addr: SocketAddr, mut fields: Document) -> eyre::Result<bool> {
        let host = addr.to_string();
        fields.insert("host", host.clone());
        fields.insert("ip", addr.ip().to_string());
        fields.insert("port", addr.port() as i32);
        fields.insert("lastOnline", epoch_now() as i64);

        let result = self
            .servers()
            .update_one(
                doc! { "host": host },
                doc! {
                    "$set": fields,
                    "$setOnInsert": { "firstSeen": epoch_now() as i64 },
                },
            )
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await?;
        Ok(result.upserted_id.is_some())
    }

    pub async fn list_servers(&self, query: &ServerQuery) -> eyre::Result<(u64, Vec<Document>)> {
        let total = self
            .servers()
            .count_documents(query.filter.clone())
            .await?;

        let direction = if query.descending { -1 } else { 1 };
        let options = FindOptions::builder()
            .sort(doc! { query.sort_field.as_str(): direction })
            .projection(query.projection.clone())
            .skip(query.offset)
            .limit(query.limit)
            .build();
        let cursor = self
            .servers()
            .find(query.filter.clone())
            .with_options(options)
            .await?;
        let items = cursor.try_collect().await?;
        Ok((total, items))
    }

    pub async fn get_server(&self, host: &str) -> eyre::Result<Option<Document>> {
        let filter = doc! { "$or": [ { "host": host }, { "hostname": host } ] };
        let options = FindOneOptions::builder()
            .projection(doc! { "_id": 0 })
            .build();
        Ok(self
            .servers()
            .find_one(filter)
            .with_options(options)
            .await?)
    }
}
