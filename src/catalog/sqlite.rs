use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{MetashopError, Result};
use crate::types::{ProductId, ProductRecord, Retailer, UNKNOWN_PRICE};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS product_names (
    product_id INTEGER PRIMARY KEY,
    product_name TEXT NOT NULL UNIQUE,
    walmart_sku TEXT NOT NULL DEFAULT '',
    amazon_asin TEXT NOT NULL DEFAULT '',
    walmart_price REAL NOT NULL DEFAULT -1.0,
    amazon_price REAL NOT NULL DEFAULT -1.0
);
CREATE INDEX IF NOT EXISTS idx_product_walmart_sku ON product_names(walmart_sku);
CREATE INDEX IF NOT EXISTS idx_product_amazon_asin ON product_names(amazon_asin);
";

const SELECT_PRODUCT: &str = "SELECT product_id, product_name, walmart_sku, amazon_asin, walmart_price, amazon_price
     FROM product_names WHERE product_id = ?1";

/// SQLite-backed catalog. One connection, one lock per operation.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProductRecord> {
    Ok(ProductRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        walmart_sku: row.get(2)?,
        amazon_asin: row.get(3)?,
        walmart_price: row.get(4)?,
        amazon_price: row.get(5)?,
    })
}

impl Catalog for SqliteCatalog {
    fn get_product(&self, id: ProductId) -> Result<Option<ProductRecord>> {
        let conn = self.conn.lock();
        Ok(conn.query_row(SELECT_PRODUCT, [id], row_to_product).optional()?)
    }

    fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Option<ProductRecord>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SELECT_PRODUCT)?;
        let mut products = Vec::with_capacity(ids.len());
        for id in ids {
            products.push(stmt.query_row([id], row_to_product).optional()?);
        }
        Ok(products)
    }

    fn get_product_ids(&self, names: &[String]) -> Result<Vec<Option<ProductId>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT product_id FROM product_names WHERE product_name = ?1")?;
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            ids.push(stmt.query_row([name], |row| row.get(0)).optional()?);
        }
        Ok(ids)
    }

    fn insert_product(
        &self,
        name: &str,
        walmart_sku: &str,
        amazon_asin: &str,
    ) -> Result<ProductId> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO product_names (product_name, walmart_sku, amazon_asin, walmart_price, amazon_price)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, walmart_sku, amazon_asin, UNKNOWN_PRICE],
        );
        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                debug!(product_id = id, name, "inserted product");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(MetashopError::ProductExists {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_prices(&self, id: ProductId, walmart: f64, amazon: f64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE product_names SET walmart_price = ?1, amazon_price = ?2 WHERE product_id = ?3",
            params![walmart, amazon, id],
        )?;
        if rows == 0 {
            return Err(MetashopError::NotFound(format!("product {id}")));
        }
        Ok(())
    }

    fn remove_product(&self, id: ProductId) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM product_names WHERE product_id = ?1", [id])?;
        debug!(product_id = id, rows, "removed product");
        Ok(())
    }

    fn cached_price(&self, retailer: Retailer, external_id: &str) -> Result<Option<f64>> {
        let sql = match retailer {
            Retailer::Walmart => {
                "SELECT walmart_price FROM product_names WHERE walmart_sku = ?1 LIMIT 1"
            }
            Retailer::Amazon => {
                "SELECT amazon_price FROM product_names WHERE amazon_asin = ?1 LIMIT 1"
            }
        };
        let conn = self.conn.lock();
        let price: Option<f64> = conn
            .prepare_cached(sql)?
            .query_row([external_id], |row| row.get(0))
            .optional()?;
        Ok(price.filter(|p| *p >= 0.0))
    }

    fn product_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM product_names", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
