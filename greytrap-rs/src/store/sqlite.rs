//! SQLite store driver on sqlx.
//!
//! Key variants map onto three tables: `entries` holds grey tuples and
//! IP-keyed white/trap rows (empty helo/from/to mark the latter),
//! `spamtraps` holds trap mail addresses and `domains` permitted domains.
//! Suffix matching runs in SQL via `LIKE '%' || domain`.

use super::{Driver, GreyData, GreyTuple, Key, Val};
use crate::error::{GreytrapError, Result};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteQueryResult, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

pub struct SqliteDriver {
    path: String,
    pool: Option<SqlitePool>,
    txn: Option<Transaction<'static, Sqlite>>,
}

impl SqliteDriver {
    pub fn new(path: &str) -> Self {
        SqliteDriver {
            path: path.to_string(),
            pool: None,
            txn: None,
        }
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .as_ref()
            .ok_or_else(|| GreytrapError::Store("store not open".to_string()))
    }

    async fn execute<'q>(
        &mut self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<SqliteQueryResult> {
        match (&mut self.txn, &self.pool) {
            (Some(txn), _) => Ok(query.execute(&mut **txn).await?),
            (None, Some(pool)) => Ok(query.execute(pool).await?),
            (None, None) => Err(GreytrapError::Store("store not open".to_string())),
        }
    }

    async fn fetch_optional<'q>(
        &mut self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<Option<SqliteRow>> {
        match (&mut self.txn, &self.pool) {
            (Some(txn), _) => Ok(query.fetch_optional(&mut **txn).await?),
            (None, Some(pool)) => Ok(query.fetch_optional(pool).await?),
            (None, None) => Err(GreytrapError::Store("store not open".to_string())),
        }
    }

    async fn fetch_all<'q>(
        &mut self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<Vec<SqliteRow>> {
        match (&mut self.txn, &self.pool) {
            (Some(txn), _) => Ok(query.fetch_all(&mut **txn).await?),
            (None, Some(pool)) => Ok(query.fetch_all(pool).await?),
            (None, None) => Err(GreytrapError::Store("store not open".to_string())),
        }
    }

    async fn put_inner(&mut self, key: &Key, val: &Val) -> Result<()> {
        match key {
            Key::Tuple(gt) => {
                let gd = require_grey(val)?;
                let query = sqlx::query(
                    "INSERT OR REPLACE INTO entries \
                     (ip, helo, `from`, `to`, first, pass, expire, bcount, pcount) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&gt.ip)
                .bind(&gt.helo)
                .bind(&gt.from)
                .bind(&gt.to)
                .bind(gd.first)
                .bind(gd.pass)
                .bind(gd.expire)
                .bind(gd.bcount)
                .bind(gd.pcount);
                self.execute(query).await?;
            }
            Key::Ip(ip) => {
                let gd = require_grey(val)?;
                let query = sqlx::query(
                    "INSERT OR REPLACE INTO entries \
                     (ip, helo, `from`, `to`, first, pass, expire, bcount, pcount) \
                     VALUES (?, '', '', '', ?, ?, ?, ?, ?)",
                )
                .bind(ip)
                .bind(gd.first)
                .bind(gd.pass)
                .bind(gd.expire)
                .bind(gd.bcount)
                .bind(gd.pcount);
                self.execute(query).await?;
            }
            Key::Mail(addr) => {
                let query =
                    sqlx::query("INSERT OR IGNORE INTO spamtraps (address) VALUES (?)").bind(addr);
                self.execute(query).await?;
            }
            Key::Domain(domain) => {
                let query =
                    sqlx::query("INSERT OR IGNORE INTO domains (domain) VALUES (?)").bind(domain);
                self.execute(query).await?;
            }
            Key::DomainSuffix(_) => {
                return Err(GreytrapError::Store(
                    "domain-suffix keys are match-only".to_string(),
                ))
            }
        }

        Ok(())
    }

    async fn del_inner(&mut self, key: &Key) -> Result<()> {
        match key {
            Key::Tuple(gt) => {
                let query = sqlx::query(
                    "DELETE FROM entries WHERE ip = ? AND helo = ? AND `from` = ? AND `to` = ?",
                )
                .bind(&gt.ip)
                .bind(&gt.helo)
                .bind(&gt.from)
                .bind(&gt.to);
                self.execute(query).await?;
            }
            Key::Ip(ip) => {
                let query = sqlx::query(
                    "DELETE FROM entries WHERE ip = ? AND helo = '' AND `from` = '' AND `to` = ''",
                )
                .bind(ip);
                self.execute(query).await?;
            }
            Key::Mail(addr) => {
                let query = sqlx::query("DELETE FROM spamtraps WHERE address = ?").bind(addr);
                self.execute(query).await?;
            }
            Key::Domain(domain) => {
                let query = sqlx::query("DELETE FROM domains WHERE domain = ?").bind(domain);
                self.execute(query).await?;
            }
            Key::DomainSuffix(_) => {
                return Err(GreytrapError::Store(
                    "domain-suffix keys are match-only".to_string(),
                ))
            }
        }

        Ok(())
    }
}

fn require_grey(val: &Val) -> Result<GreyData> {
    val.grey()
        .copied()
        .ok_or_else(|| GreytrapError::Store("grey value required".to_string()))
}

fn grey_from_row(row: &SqliteRow) -> GreyData {
    GreyData {
        first: row.get(0),
        pass: row.get(1),
        expire: row.get(2),
        bcount: row.get(3),
        pcount: row.get(4),
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn open(&mut self, read_only: bool) -> Result<()> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(!read_only)
            .read_only(read_only);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        if !read_only {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS spamtraps (address TEXT PRIMARY KEY)",
            )
            .execute(&pool)
            .await?;
            sqlx::query("CREATE TABLE IF NOT EXISTS domains (domain TEXT PRIMARY KEY)")
                .execute(&pool)
                .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS entries ( \
                 ip TEXT NOT NULL, helo TEXT NOT NULL, \
                 `from` TEXT NOT NULL, `to` TEXT NOT NULL, \
                 first INTEGER, pass INTEGER, expire INTEGER, \
                 bcount INTEGER, pcount INTEGER, \
                 PRIMARY KEY (ip, helo, `from`, `to`))",
            )
            .execute(&pool)
            .await?;
        }

        self.pool = Some(pool);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.rollback().await?;
        }
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn put(&mut self, key: &Key, val: &Val) -> Result<()> {
        let result = self.put_inner(key, val).await;
        if result.is_err() && self.txn.is_some() {
            let _ = self.rollback_txn().await;
        }
        result
    }

    async fn get(&mut self, key: &Key) -> Result<Option<Val>> {
        match key {
            Key::Tuple(GreyTuple { ip, helo, from, to }) => {
                let query = sqlx::query(
                    "SELECT first, pass, expire, bcount, pcount FROM entries \
                     WHERE ip = ? AND helo = ? AND `from` = ? AND `to` = ? LIMIT 1",
                )
                .bind(ip)
                .bind(helo)
                .bind(from)
                .bind(to);
                let row = self.fetch_optional(query).await?;
                Ok(row.map(|r| Val::Grey(grey_from_row(&r))))
            }
            Key::Ip(ip) => {
                let query = sqlx::query(
                    "SELECT first, pass, expire, bcount, pcount FROM entries \
                     WHERE ip = ? AND helo = '' AND `from` = '' AND `to` = '' LIMIT 1",
                )
                .bind(ip);
                let row = self.fetch_optional(query).await?;
                Ok(row.map(|r| Val::Grey(grey_from_row(&r))))
            }
            Key::Mail(addr) => {
                let query = sqlx::query("SELECT address FROM spamtraps WHERE address = ? LIMIT 1")
                    .bind(addr);
                let row = self.fetch_optional(query).await?;
                Ok(row.map(|_| {
                    Val::Grey(GreyData {
                        pcount: -2,
                        ..Default::default()
                    })
                }))
            }
            Key::Domain(domain) => {
                let query =
                    sqlx::query("SELECT domain FROM domains WHERE domain = ? LIMIT 1").bind(domain);
                let row = self.fetch_optional(query).await?;
                Ok(row.map(|_| {
                    Val::Grey(GreyData {
                        pcount: -3,
                        ..Default::default()
                    })
                }))
            }
            Key::DomainSuffix(name) => {
                let query =
                    sqlx::query("SELECT domain FROM domains WHERE ? LIKE '%' || domain LIMIT 1")
                        .bind(name);
                let row = self.fetch_optional(query).await?;
                Ok(row.map(|r| Val::MatchSuffix(r.get(0))))
            }
        }
    }

    async fn del(&mut self, key: &Key) -> Result<()> {
        let result = self.del_inner(key).await;
        if result.is_err() && self.txn.is_some() {
            let _ = self.rollback_txn().await;
        }
        result
    }

    async fn start_txn(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(GreytrapError::Store("transaction already open".to_string()));
        }
        let txn = self.pool()?.begin().await?;
        self.txn = Some(txn);
        Ok(())
    }

    async fn commit_txn(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => Ok(txn.commit().await?),
            None => Err(GreytrapError::Store("no open transaction".to_string())),
        }
    }

    async fn rollback_txn(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => Ok(txn.rollback().await?),
            None => Err(GreytrapError::Store("no open transaction".to_string())),
        }
    }

    async fn entries(&mut self) -> Result<Vec<(Key, Val)>> {
        let mut out = Vec::new();

        let rows = self
            .fetch_all(sqlx::query(
                "SELECT ip, helo, `from`, `to`, first, pass, expire, bcount, pcount \
                 FROM entries ORDER BY ip, helo, `from`, `to`",
            ))
            .await?;
        for row in rows {
            let ip: String = row.get(0);
            let helo: String = row.get(1);
            let from: String = row.get(2);
            let to: String = row.get(3);
            let gd = GreyData {
                first: row.get(4),
                pass: row.get(5),
                expire: row.get(6),
                bcount: row.get(7),
                pcount: row.get(8),
            };

            let key = if helo.is_empty() && from.is_empty() && to.is_empty() {
                Key::Ip(ip)
            } else {
                Key::Tuple(GreyTuple { ip, helo, from, to })
            };
            out.push((key, Val::Grey(gd)));
        }

        let rows = self
            .fetch_all(sqlx::query("SELECT address FROM spamtraps ORDER BY address"))
            .await?;
        for row in rows {
            out.push((
                Key::Mail(row.get(0)),
                Val::Grey(GreyData {
                    pcount: -2,
                    ..Default::default()
                }),
            ));
        }

        let rows = self
            .fetch_all(sqlx::query("SELECT domain FROM domains ORDER BY domain"))
            .await?;
        for row in rows {
            out.push((
                Key::Domain(row.get(0)),
                Val::Grey(GreyData {
                    pcount: -3,
                    ..Default::default()
                }),
            ));
        }

        Ok(out)
    }
}
