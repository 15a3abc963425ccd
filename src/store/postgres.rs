use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::OutPoint;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

use super::{Error, ForwardingEvent, InterceptStore, InterceptionRecord, RegisteredPayment};
use crate::scid::ShortChannelId;

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Connect to `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pg_config = tokio_postgres::Config::from_str(database_url)?;
        let mgr_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool =
            Pool::builder(mgr).max_size(16).build().map_err(|e| Error::Pool(e.to_string()))?;

        {
            let client = pool.get().await.map_err(|e| Error::Pool(e.to_string()))?;
            migrate_database(&client).await?;
        }
        Ok(PostgresStore { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, Error> {
        self.pool.get().await.map_err(|e| Error::Pool(e.to_string()))
    }
}

async fn migrate_database(client: &tokio_postgres::Client) -> Result<(), Error> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS payments (
                payment_hash bytea PRIMARY KEY,
                payment_secret bytea NOT NULL,
                destination bytea NOT NULL,
                incoming_amount_msat bigint NOT NULL,
                outgoing_amount_msat bigint NOT NULL,
                channel_capacity_sat bigint NOT NULL,
                token text NOT NULL,
                created_at timestamptz NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS interceptions (
                payment_hash bytea PRIMARY KEY REFERENCES payments (payment_hash),
                channel_point text NOT NULL,
                scid_alias bigint NOT NULL,
                onion_blob bytea NOT NULL,
                outgoing_amount_msat bigint NOT NULL,
                incoming_amount_msat bigint NOT NULL,
                outgoing_expiry bigint NOT NULL,
                incoming_expiry bigint NOT NULL,
                created_at timestamptz NOT NULL
            );
            CREATE TABLE IF NOT EXISTS channel_opens (
                channel_point text PRIMARY KEY,
                scid bigint NOT NULL,
                opened_at timestamptz NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS forwarding_events (
                timestamp_ns bigint NOT NULL,
                chan_id_in bigint NOT NULL,
                chan_id_out bigint NOT NULL,
                amt_in_msat bigint NOT NULL,
                amt_out_msat bigint NOT NULL,
                PRIMARY KEY (timestamp_ns, chan_id_in, chan_id_out)
            );",
        )
        .await?;
    Ok(())
}

#[async_trait]
impl InterceptStore for PostgresStore {
    async fn lookup(&self, payment_hash: &[u8; 32]) -> Result<Option<InterceptionRecord>, Error> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT i.channel_point, i.scid_alias, i.onion_blob,
                        i.outgoing_amount_msat, i.incoming_amount_msat,
                        i.outgoing_expiry, i.incoming_expiry, p.token, i.created_at
                 FROM interceptions i
                 JOIN payments p USING (payment_hash)
                 WHERE i.payment_hash = $1",
                &[&payment_hash.as_slice()],
            )
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let channel_point: String = row.get(0);
        let channel_point = OutPoint::from_str(&channel_point)
            .map_err(|e| Error::Corrupt(format!("channel point {}: {}", channel_point, e)))?;
        let scid_alias: i64 = row.get(1);
        let outgoing_amount_msat: i64 = row.get(3);
        let incoming_amount_msat: i64 = row.get(4);
        let outgoing_expiry: i64 = row.get(5);
        let incoming_expiry: i64 = row.get(6);
        Ok(Some(InterceptionRecord {
            payment_hash: *payment_hash,
            channel_point,
            scid_alias: ShortChannelId(scid_alias as u64),
            onion_blob: row.get(2),
            outgoing_amount_msat: outgoing_amount_msat as u64,
            incoming_amount_msat: incoming_amount_msat as u64,
            outgoing_expiry: outgoing_expiry as u32,
            incoming_expiry: incoming_expiry as u32,
            token: row.get(7),
            created_at: row.get(8),
        }))
    }

    async fn lookup_registration(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<RegisteredPayment>, Error> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT payment_secret, destination, incoming_amount_msat,
                        outgoing_amount_msat, channel_capacity_sat, token
                 FROM payments WHERE payment_hash = $1",
                &[&payment_hash.as_slice()],
            )
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let destination: Vec<u8> = row.get(1);
        let destination = secp256k1::PublicKey::from_slice(&destination)
            .map_err(|e| Error::Corrupt(format!("destination pubkey: {}", e)))?;
        let incoming_amount_msat: i64 = row.get(2);
        let outgoing_amount_msat: i64 = row.get(3);
        let channel_capacity_sat: i64 = row.get(4);
        Ok(Some(RegisteredPayment {
            payment_hash: *payment_hash,
            payment_secret: row.get(0),
            destination,
            incoming_amount_msat: incoming_amount_msat as u64,
            outgoing_amount_msat: outgoing_amount_msat as u64,
            channel_capacity_sat: channel_capacity_sat as u64,
            token: row.get(5),
        }))
    }

    async fn insert(&self, rec: &InterceptionRecord) -> Result<(), Error> {
        let client = self.client().await?;
        // ON CONFLICT DO NOTHING RETURNING yields no row on a duplicate,
        // which is how the losing racer learns to adopt the winner.
        let rows = client
            .query(
                "INSERT INTO interceptions (payment_hash, channel_point, scid_alias,
                        onion_blob, outgoing_amount_msat, incoming_amount_msat,
                        outgoing_expiry, incoming_expiry, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT DO NOTHING
                 RETURNING payment_hash",
                &[
                    &rec.payment_hash.as_slice(),
                    &rec.channel_point.to_string(),
                    &(rec.scid_alias.0 as i64),
                    &rec.onion_blob,
                    &(rec.outgoing_amount_msat as i64),
                    &(rec.incoming_amount_msat as i64),
                    &(rec.outgoing_expiry as i64),
                    &(rec.incoming_expiry as i64),
                    &rec.created_at,
                ],
            )
            .await?;
        if rows.is_empty() {
            return Err(Error::Duplicate);
        }
        Ok(())
    }

    async fn register_payment(&self, reg: &RegisteredPayment) -> Result<(), Error> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO payments (payment_hash, payment_secret, destination,
                        incoming_amount_msat, outgoing_amount_msat,
                        channel_capacity_sat, token)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT DO NOTHING",
                &[
                    &reg.payment_hash.as_slice(),
                    &reg.payment_secret,
                    &reg.destination.serialize().as_slice(),
                    &(reg.incoming_amount_msat as i64),
                    &(reg.outgoing_amount_msat as i64),
                    &(reg.channel_capacity_sat as i64),
                    &reg.token,
                ],
            )
            .await?;
        Ok(())
    }

    async fn mark_channel_opened(
        &self,
        channel_point: &str,
        scid: ShortChannelId,
    ) -> Result<(), Error> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO channel_opens (channel_point, scid) VALUES ($1, $2)
                 ON CONFLICT (channel_point) DO UPDATE SET scid = $2",
                &[&channel_point, &(scid.0 as i64)],
            )
            .await?;
        Ok(())
    }

    async fn open_channel_points(&self) -> Result<HashMap<String, ShortChannelId>, Error> {
        let client = self.client().await?;
        let rows = client.query("SELECT channel_point, scid FROM channel_opens", &[]).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let scid: i64 = row.get(1);
                (row.get(0), ShortChannelId(scid as u64))
            })
            .collect())
    }

    async fn remove_channel_points(&self, channel_points: &[String]) -> Result<(), Error> {
        if channel_points.is_empty() {
            return Ok(());
        }
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM channel_opens WHERE channel_point = ANY($1)",
                &[&channel_points],
            )
            .await?;
        Ok(())
    }

    async fn insert_forwarding_events(&self, events: &[ForwardingEvent]) -> Result<(), Error> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare(
                "INSERT INTO forwarding_events (timestamp_ns, chan_id_in, chan_id_out,
                        amt_in_msat, amt_out_msat)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT DO NOTHING",
            )
            .await?;
        for ev in events {
            tx.execute(
                &stmt,
                &[
                    &(ev.timestamp_ns as i64),
                    &(ev.chan_id_in as i64),
                    &(ev.chan_id_out as i64),
                    &(ev.amt_in_msat as i64),
                    &(ev.amt_out_msat as i64),
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn last_forwarding_event(&self) -> Result<Option<u64>, Error> {
        let client = self.client().await?;
        let row =
            client.query_one("SELECT max(timestamp_ns) FROM forwarding_events", &[]).await?;
        let max: Option<i64> = row.get(0);
        Ok(max.map(|v| v as u64))
    }
}
